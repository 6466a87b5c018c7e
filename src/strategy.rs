//! Strategy executors.
//!
//! Each executor takes the region(s) for a request category and the
//! original request, and produces a [`Reply`]. Work that must outlive the
//! reply (background caching, revalidation) is spawned on the engine-owned
//! [`BackgroundTasks`] set, so it runs to completion after the caller has
//! its answer.

use color_eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{BoundedStore, RegionRegistry};
use crate::http::{Request, RequestKey, Response};
use crate::queue::WriteQueue;
use crate::transport::Transport;

/// Caller-visible outcome of handling one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
  Respond(Response),
  /// Nothing cached and nothing fetched; a normal outcome, not a fault
  Miss,
  /// Not intercepted; the caller goes to the network itself
  Ignored,
}

impl Reply {
  fn from_cached(cached: Option<Response>) -> Self {
    cached.map(Reply::Respond).unwrap_or(Reply::Miss)
  }

  pub fn response(&self) -> Option<&Response> {
    match self {
      Reply::Respond(resp) => Some(resp),
      _ => None,
    }
  }
}

/// Engine-owned set of fire-and-forget tasks.
#[derive(Default)]
pub struct BackgroundTasks {
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let handle = tokio::spawn(task);
    let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  /// Wait for every task spawned so far, including tasks spawned while
  /// waiting.
  pub async fn settle(&self) {
    loop {
      let batch = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
      if batch.is_empty() {
        return;
      }
      for handle in batch {
        if let Err(e) = handle.await {
          warn!(error = %e, "background task failed");
        }
      }
    }
  }
}

/// The four caching strategies plus passthrough and replayable writes.
#[derive(Clone)]
pub struct Strategies {
  transport: Arc<dyn Transport>,
  tasks: Arc<BackgroundTasks>,
}

impl Strategies {
  pub fn new(transport: Arc<dyn Transport>, tasks: Arc<BackgroundTasks>) -> Self {
    Self { transport, tasks }
  }

  /// Network first; on transport failure serve the offline document.
  ///
  /// Successful responses are cached in `runtime` in the background, without
  /// any trim.
  pub async fn network_first(
    &self,
    runtime: &BoundedStore,
    registry: &RegionRegistry,
    fallback: &RequestKey,
    request: &Request,
  ) -> Result<Reply> {
    match self.transport.fetch(request).await {
      Ok(resp) => {
        let region = runtime.clone();
        let key = request.key();
        let copy = resp.clone();
        self.tasks.spawn(async move {
          if let Err(e) = region.put(&key, &copy) {
            warn!(region = %region.name(), key = %key, error = %e, "failed to cache navigation");
          }
        });
        Ok(Reply::Respond(resp))
      }
      Err(e) => {
        info!(error = %e, "navigation offline, serving fallback");
        Ok(Reply::from_cached(registry.match_any(fallback)?))
      }
    }
  }

  /// Network first with store + trim; on transport failure serve whatever is
  /// cached for the key.
  pub async fn network_first_revalidate(
    &self,
    region: &BoundedStore,
    request: &Request,
  ) -> Result<Reply> {
    let key = request.key();
    match self.transport.fetch(request).await {
      Ok(resp) => {
        region.put(&key, &resp)?;
        region.enforce_capacity()?;
        Ok(Reply::Respond(resp))
      }
      Err(e) => {
        info!(error = %e, "api offline, serving cached copy");
        Ok(Reply::from_cached(region.get(&key)?))
      }
    }
  }

  /// Serve the cached copy now and always refresh from the network.
  ///
  /// On a miss the caller gets the in-flight network result instead. The
  /// refresh runs on the background set and is never cancelled by the
  /// reply. `bounded` trims the region after the refresh is stored.
  pub async fn stale_while_revalidate(
    &self,
    region: &BoundedStore,
    request: &Request,
    bounded: bool,
  ) -> Result<Reply> {
    let key = request.key();
    let cached = region.get(&key)?;

    let (tx, rx) = oneshot::channel();
    let transport = Arc::clone(&self.transport);
    let region = region.clone();
    let request = request.clone();
    self.tasks.spawn(async move {
      let resp = match transport.fetch(&request).await {
        Ok(resp) => resp,
        Err(e) => {
          debug!(error = %e, "revalidation failed");
          return;
        }
      };
      if let Err(e) = region.put(&key, &resp) {
        warn!(region = %region.name(), key = %key, error = %e, "failed to store revalidated response");
      }
      // Nobody waiting when the cached copy was served
      let _ = tx.send(resp);
      if bounded {
        if let Err(e) = region.enforce_capacity() {
          warn!(region = %region.name(), error = %e, "failed to trim region");
        }
      }
    });

    match cached {
      Some(stale) => Ok(Reply::Respond(stale)),
      None => Ok(rx.await.map(Reply::Respond).unwrap_or(Reply::Miss)),
    }
  }

  /// Cached copy if present, with no network call. On a miss fetch, store,
  /// trim, respond.
  pub async fn cache_first(&self, region: &BoundedStore, request: &Request) -> Result<Reply> {
    let key = request.key();
    if let Some(cached) = region.get(&key)? {
      return Ok(Reply::Respond(cached));
    }

    match self.transport.fetch(request).await {
      Ok(resp) => {
        region.put(&key, &resp)?;
        region.enforce_capacity()?;
        Ok(Reply::Respond(resp))
      }
      Err(e) => {
        info!(error = %e, "media offline and not cached");
        Ok(Reply::Miss)
      }
    }
  }

  /// Straight to the network. Transport failures surface to the caller.
  pub async fn passthrough(&self, request: &Request) -> Result<Reply> {
    let resp = self.transport.fetch(request).await?;
    Ok(Reply::Respond(resp))
  }

  /// Send a mutating request; on transport failure queue it and acknowledge.
  pub async fn replayable(&self, queue: &WriteQueue, request: &Request) -> Result<Reply> {
    match self.transport.fetch(request).await {
      Ok(resp) => Ok(Reply::Respond(resp)),
      Err(e) => match queue.enqueue(request)? {
        Some(_) => Ok(Reply::Respond(Response::queued())),
        None => Err(e.into()),
      },
    }
  }
}
