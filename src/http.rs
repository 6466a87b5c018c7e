//! Request and response types shared by the router, the executors and the
//! storage primitives.

use serde::{de, Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  /// State-changing methods are eligible for the write-replay queue.
  pub fn is_mutating(self) -> bool {
    matches!(self, Method::Post | Method::Put | Method::Patch | Method::Delete)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Some(Method::Get),
      "HEAD" => Some(Method::Head),
      "POST" => Some(Method::Post),
      "PUT" => Some(Method::Put),
      "PATCH" => Some(Method::Patch),
      "DELETE" => Some(Method::Delete),
      "OPTIONS" => Some(Method::Options),
      _ => None,
    }
  }
}

/// Method names on the wire are case-insensitive, like [`Method::parse`].
impl<'de> Deserialize<'de> for Method {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let name = String::deserialize(deserializer)?;
    Method::parse(&name)
      .ok_or_else(|| de::Error::custom(format!("unknown method '{}'", name)))
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How the client issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  Navigate,
  #[default]
  Cors,
  NoCors,
  SameOrigin,
}

/// Declared resource type of the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Video,
  Audio,
  Script,
  Style,
  #[default]
  Empty,
}

/// An outgoing request as seen by the engine.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub destination: Destination,
  /// Header names are stored lower-cased
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET with no headers.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      mode: RequestMode::Cors,
      destination: Destination::Empty,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::from_request(self)
  }
}

/// Canonical identity of a cached request.
///
/// Volatile headers are ignored. The `Range` header is part of the identity
/// so partial and full requests for one resource are cached apart. Fields are
/// private so every key goes through [`RequestKey::new`] and never carries a
/// fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: Url,
  range: Option<String>,
}

impl RequestKey {
  pub fn new(method: Method, mut url: Url, range: Option<String>) -> Self {
    url.set_fragment(None);
    Self { method, url, range }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url, None)
  }

  pub fn method(&self) -> Method {
    self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn range(&self) -> Option<&str> {
    self.range.as_deref()
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(
      request.method,
      request.url.clone(),
      request.header("range").map(String::from),
    )
  }

  /// Canonical text form, e.g. `GET https://host/a.mp4 bytes=0-99`.
  pub fn canonical(&self) -> String {
    match &self.range {
      Some(range) => format!("{} {} {}", self.method, self.url, range),
      None => format!("{} {}", self.method, self.url),
    }
  }

  /// SHA256 of the canonical form, for stable fixed-length storage keys.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical())
  }
}

/// A response payload plus headers. Never partially updated once cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// Synthetic acknowledgment returned when a write was queued for replay.
  pub fn queued() -> Self {
    Response::new(202, br#"{"queued":true}"#.to_vec())
      .with_header("content-type", "application/json")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}
