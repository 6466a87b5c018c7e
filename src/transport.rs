//! Network transport primitive.
//!
//! Only a [`TransportError`] means the network was unreachable. A reachable
//! server answering 4xx/5xx is a successful fetch as far as the engine is
//! concerned.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::http::{Method, Request, Response};

/// The request never produced a response (connectivity loss, abort, ...).
#[derive(Debug, Clone, Error)]
#[error("transport failure for {url}: {reason}")]
pub struct TransportError {
  pub url: String,
  pub reason: String,
}

impl TransportError {
  pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      reason: reason.into(),
    }
  }
}

#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
    Method::Options => reqwest::Method::OPTIONS,
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    let url = request.url.as_str();
    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| TransportError::new(url, e.to_string()))?;

    let status = resp.status().as_u16();
    let headers: BTreeMap<String, String> = resp
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    // A connection dropped mid-body is still a transport failure
    let body = resp
      .bytes()
      .await
      .map_err(|e| TransportError::new(url, e.to_string()))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
