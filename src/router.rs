//! Request classification.
//!
//! Rules are checked in a fixed priority order and the first match wins:
//! ignored schemes, mutating requests, navigation, API/JSON, images, media,
//! scripts/styles, then passthrough.

use crate::http::{Destination, Request, RequestMode};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "ogg"];
const ASSET_EXTENSIONS: &[&str] = &["js", "css"];

/// The strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Privileged/internal scheme; not intercepted at all
  Ignored,
  /// State-changing request; queued for replay on transport failure
  Replayable,
  /// Navigation: network first, offline document on failure
  NetworkFirst,
  /// API/JSON: network first, cached copy on failure
  NetworkFirstRevalidate,
  /// Images: cached copy now, refresh in the background, trimmed
  StaleWhileRevalidateImage,
  /// Scripts/styles: cached copy now, refresh in the background
  StaleWhileRevalidateAsset,
  /// Media: cache first, network only on miss
  CacheFirst,
  Passthrough,
}

/// Classifies requests by scheme, method, mode, destination and path.
#[derive(Debug, Clone)]
pub struct Router {
  api_prefix: String,
  ignored_schemes: Vec<String>,
}

impl Router {
  pub fn new(api_prefix: impl Into<String>, ignored_schemes: Vec<String>) -> Self {
    Self {
      api_prefix: api_prefix.into(),
      ignored_schemes,
    }
  }

  pub fn classify(&self, request: &Request) -> Route {
    let scheme = request.url.scheme();
    if self
      .ignored_schemes
      .iter()
      .any(|prefix| scheme.starts_with(prefix.as_str()))
    {
      return Route::Ignored;
    }

    if request.method.is_mutating() {
      return Route::Replayable;
    }

    if request.mode == RequestMode::Navigate {
      return Route::NetworkFirst;
    }

    let path = request.url.path();
    let wants_json = request
      .header("accept")
      .map(|accept| accept.contains("application/json"))
      .unwrap_or(false);
    if path.starts_with(&self.api_prefix) || wants_json {
      return Route::NetworkFirstRevalidate;
    }

    let extension = path_extension(path);
    let has_extension = |set: &[&str]| extension.map(|e| set.contains(&e)).unwrap_or(false);

    if request.destination == Destination::Image || has_extension(IMAGE_EXTENSIONS) {
      return Route::StaleWhileRevalidateImage;
    }

    if request.destination == Destination::Video || has_extension(VIDEO_EXTENSIONS) {
      return Route::CacheFirst;
    }

    if matches!(request.destination, Destination::Script | Destination::Style)
      || has_extension(ASSET_EXTENSIONS)
    {
      return Route::StaleWhileRevalidateAsset;
    }

    Route::Passthrough
  }
}

/// Extension of the last path segment, if any. Matching is case-sensitive.
fn path_extension(path: &str) -> Option<&str> {
  let segment = path.rsplit('/').next()?;
  segment.rsplit_once('.').map(|(_, ext)| ext)
}
