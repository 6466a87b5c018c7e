//! The caching-strategy engine: routes each request to an executor and
//! handles lifecycle, command and sync events.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{BlobStore, RegionRegistry, RegionRole};
use crate::config::Config;
use crate::http::{Request, RequestKey};
use crate::prefetch::{self, Command};
use crate::queue::{DrainReport, QueueStore, SyncRegistration, WriteQueue};
use crate::router::{Route, Router};
use crate::strategy::{BackgroundTasks, Reply, Strategies};
use crate::transport::Transport;

/// Cheap to clone; clones share regions, queue and background tasks.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<Inner>,
}

struct Inner {
  origin: Url,
  router: Router,
  registry: RegionRegistry,
  transport: Arc<dyn Transport>,
  strategies: Strategies,
  queue: WriteQueue,
  tasks: Arc<BackgroundTasks>,
  fallback: RequestKey,
  precache: Vec<Url>,
  periodic_tag: String,
  periodic_url: Url,
}

impl Engine {
  pub fn new(
    config: &Config,
    blobs: Arc<dyn BlobStore>,
    queue_store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
  ) -> Result<Self> {
    let registry = RegionRegistry::new(blobs, config.region_specs())?;
    let tasks = Arc::new(BackgroundTasks::default());
    let sync = Arc::new(SyncRegistration::new(config.replay.sync_tag.clone()));

    let precache = config
      .precache
      .iter()
      .map(|u| config.resolve(u))
      .collect::<Result<Vec<_>>>()?;

    let inner = Inner {
      origin: config.origin_url()?,
      router: Router::new(config.api_prefix.clone(), config.ignored_schemes.clone()),
      registry,
      strategies: Strategies::new(Arc::clone(&transport), Arc::clone(&tasks)),
      queue: WriteQueue::new(queue_store, Arc::clone(&transport), sync),
      transport,
      tasks,
      fallback: RequestKey::get(config.resolve(&config.offline_fallback)?),
      precache,
      periodic_tag: config.periodic_sync.tag.clone(),
      periodic_url: config.resolve(&config.periodic_sync.url)?,
    };

    Ok(Self {
      inner: Arc::new(inner),
    })
  }

  pub fn registry(&self) -> &RegionRegistry {
    &self.inner.registry
  }

  pub fn queue(&self) -> &WriteQueue {
    &self.inner.queue
  }

  pub fn sync(&self) -> &Arc<SyncRegistration> {
    self.inner.queue.sync()
  }

  /// Fetch every precache URL and store them all, or nothing.
  pub async fn install(&self) -> Result<usize> {
    let inner = &self.inner;
    let fetches = inner.precache.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let resp = inner
        .transport
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;
      if !resp.is_success() {
        return Err(eyre!("Failed to precache {}: status {}", url, resp.status));
      }
      Ok::<_, color_eyre::Report>((request.key(), resp))
    });

    let fetched = join_all(fetches)
      .await
      .into_iter()
      .collect::<Result<Vec<_>>>()?;

    let precache = inner.registry.get(RegionRole::Precache);
    for (key, resp) in &fetched {
      precache.put(key, resp)?;
    }

    info!(count = fetched.len(), region = %precache.name(), "installed precache");
    Ok(fetched.len())
  }

  /// Open the configured regions and delete every other region identity.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.inner.registry.open_all()?;
    let purged = self.inner.registry.purge_stale()?;
    info!(purged = purged.len(), "activated");
    Ok(purged)
  }

  /// Route a request and run its strategy.
  pub async fn handle_request(&self, request: Request) -> Result<Reply> {
    let inner = &self.inner;
    let route = inner.router.classify(&request);
    debug!(method = %request.method, url = %request.url, ?route, "routed request");

    let strategies = &inner.strategies;
    let registry = &inner.registry;
    match route {
      Route::Ignored => Ok(Reply::Ignored),
      Route::Replayable => strategies.replayable(&inner.queue, &request).await,
      Route::NetworkFirst => {
        strategies
          .network_first(
            registry.get(RegionRole::Runtime),
            registry,
            &inner.fallback,
            &request,
          )
          .await
      }
      Route::NetworkFirstRevalidate => {
        strategies
          .network_first_revalidate(registry.get(RegionRole::Api), &request)
          .await
      }
      Route::StaleWhileRevalidateImage => {
        strategies
          .stale_while_revalidate(registry.get(RegionRole::Images), &request, true)
          .await
      }
      Route::StaleWhileRevalidateAsset => {
        strategies
          .stale_while_revalidate(registry.get(RegionRole::Runtime), &request, false)
          .await
      }
      Route::CacheFirst => {
        strategies
          .cache_first(registry.get(RegionRole::Media), &request)
          .await
      }
      Route::Passthrough => strategies.passthrough(&request).await,
    }
  }

  /// Command channel. Unknown or malformed messages are ignored.
  pub async fn handle_message(&self, message: &serde_json::Value) -> usize {
    match Command::parse(message) {
      Some(Command::Prefetch { urls }) => {
        prefetch::prefetch(
          self.inner.registry.get(RegionRole::Runtime),
          &self.inner.transport,
          &self.inner.origin,
          &urls,
        )
        .await
      }
      None => {
        debug!("ignoring unknown message");
        0
      }
    }
  }

  /// Reconnect signal. Drains the write queue when the tag matches.
  pub async fn handle_sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != self.sync().tag() {
      debug!(tag, "ignoring sync for unknown tag");
      return Ok(None);
    }
    self.inner.queue.drain().await.map(Some)
  }

  /// Periodic refresh of the configured URL into the API region.
  pub async fn handle_periodic_sync(&self, tag: &str) -> Result<bool> {
    let inner = &self.inner;
    if tag != inner.periodic_tag {
      debug!(tag, "ignoring periodic sync for unknown tag");
      return Ok(false);
    }

    let request = Request::get(inner.periodic_url.clone());
    match inner.transport.fetch(&request).await {
      Ok(resp) => {
        let api = inner.registry.get(RegionRole::Api);
        api.put(&request.key(), &resp)?;
        api.enforce_capacity()?;
        Ok(true)
      }
      Err(e) => {
        warn!(error = %e, "periodic sync failed");
        Ok(false)
      }
    }
  }

  /// Wait for all background work spawned so far.
  pub async fn settle(&self) {
    self.inner.tasks.settle().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteBlobStore;
  use crate::http::{Destination, Method, RequestMode, Response};
  use crate::queue::SqliteQueueStore;
  use crate::transport::fake::FakeTransport;

  const ORIGIN: &str = "https://app.test/";

  struct Harness {
    engine: Engine,
    net: Arc<FakeTransport>,
    blobs: Arc<SqliteBlobStore>,
  }

  fn harness_with(config: Config) -> Harness {
    let net = Arc::new(FakeTransport::new());
    let blobs = Arc::new(SqliteBlobStore::open_in_memory().unwrap());
    let engine = Engine::new(
      &config,
      blobs.clone(),
      Arc::new(SqliteQueueStore::open_in_memory().unwrap()),
      net.clone(),
    )
    .unwrap();
    Harness { engine, net, blobs }
  }

  fn harness() -> Harness {
    harness_with(Config {
      origin: ORIGIN.to_string(),
      precache: vec!["/offline.html".to_string(), "/app.js".to_string()],
      ..Config::default()
    })
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn get(path: &str) -> Request {
    Request::get(url(path))
  }

  fn body(reply: &Reply) -> &[u8] {
    &reply.response().expect("expected a response").body
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let h = harness();
    h.net.respond(url("/offline.html").as_str(), Response::new(200, "offline"));
    h.net.set_unreachable(url("/app.js").as_str(), true);
    assert!(h.engine.install().await.is_err());
    assert!(h.engine.registry().get(RegionRole::Precache).is_empty().unwrap());

    h.net.set_unreachable(url("/app.js").as_str(), false);
    h.net.respond(url("/app.js").as_str(), Response::new(200, "js"));
    assert_eq!(h.engine.install().await.unwrap(), 2);
    assert_eq!(h.engine.registry().get(RegionRole::Precache).len().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_activate_purges_only_stale_regions() {
    let h = harness();
    let key = RequestKey::get(url("/a.png"));
    h.blobs.put("images-v5", &key, &Response::new(200, "old")).unwrap();
    h.blobs.put("runtime-v5", &key, &Response::new(200, "old")).unwrap();
    h.blobs.put("images-v6", &key, &Response::new(200, "kept")).unwrap();

    let mut purged = h.engine.activate().unwrap();
    purged.sort();

    assert_eq!(purged, vec!["images-v5", "runtime-v5"]);
    assert_eq!(h.blobs.region_names().unwrap().len(), 5);
    let images = h.engine.registry().get(RegionRole::Images);
    assert_eq!(images.get(&key).unwrap().unwrap().body, b"kept".to_vec());
  }

  #[tokio::test]
  async fn test_navigation_caches_in_background() {
    let h = harness();
    h.net.respond(url("/page").as_str(), Response::new(200, "page"));
    let nav = get("/page").with_mode(RequestMode::Navigate);

    let reply = h.engine.handle_request(nav.clone()).await.unwrap();
    assert_eq!(body(&reply), b"page");

    h.engine.settle().await;
    let runtime = h.engine.registry().get(RegionRole::Runtime);
    assert_eq!(runtime.get(&nav.key()).unwrap().unwrap().body, b"page".to_vec());
  }

  #[tokio::test]
  async fn test_navigation_offline_serves_fallback_document() {
    let h = harness();
    h.net.respond(url("/offline.html").as_str(), Response::new(200, "offline"));
    h.net.respond(url("/app.js").as_str(), Response::new(200, "js"));
    h.engine.install().await.unwrap();
    h.net.set_offline(true);

    for path in ["/", "/some/page", "/photo.png"] {
      let reply = h
        .engine
        .handle_request(get(path).with_mode(RequestMode::Navigate))
        .await
        .unwrap();
      assert_eq!(body(&reply), b"offline", "{}", path);
    }
  }

  #[tokio::test]
  async fn test_navigation_offline_without_fallback_is_a_miss() {
    let h = harness();
    h.net.set_offline(true);
    let reply = h
      .engine
      .handle_request(get("/").with_mode(RequestMode::Navigate))
      .await
      .unwrap();
    assert_eq!(reply, Reply::Miss);
  }

  #[tokio::test]
  async fn test_navigation_error_status_is_not_a_fallback() {
    let h = harness();
    h.net.respond(url("/broken").as_str(), Response::new(500, "oops"));
    let reply = h
      .engine
      .handle_request(get("/broken").with_mode(RequestMode::Navigate))
      .await
      .unwrap();
    assert_eq!(reply.response().unwrap().status, 500);
  }

  #[tokio::test]
  async fn test_api_network_first_then_cached_copy() {
    let h = harness();
    let api = url("/api/items");
    h.net.respond(api.as_str(), Response::new(200, "v1"));

    let reply = h.engine.handle_request(get("/api/items")).await.unwrap();
    assert_eq!(body(&reply), b"v1");

    h.net.set_offline(true);
    let reply = h.engine.handle_request(get("/api/items")).await.unwrap();
    assert_eq!(body(&reply), b"v1");

    let reply = h.engine.handle_request(get("/api/never-seen")).await.unwrap();
    assert_eq!(reply, Reply::Miss);
  }

  #[tokio::test]
  async fn test_api_region_is_trimmed_to_bound() {
    let h = harness_with(Config {
      origin: ORIGIN.to_string(),
      regions: crate::config::RegionsConfig {
        api: Some(3),
        ..Default::default()
      },
      ..Config::default()
    });
    for i in 0..6 {
      h.engine
        .handle_request(get(&format!("/api/items/{}", i)))
        .await
        .unwrap();
    }
    let api = h.engine.registry().get(RegionRole::Api);
    let keys = api.keys().unwrap();
    assert_eq!(
      keys,
      (3..6)
        .map(|i| RequestKey::get(url(&format!("/api/items/{}", i))))
        .collect::<Vec<_>>()
    );
  }

  #[tokio::test]
  async fn test_swr_serves_stale_then_fresh() {
    let h = harness();
    let img = url("/logo.png");
    h.net.respond(img.as_str(), Response::new(200, "v1"));
    let first = h.engine.handle_request(get("/logo.png")).await.unwrap();
    assert_eq!(body(&first), b"v1");
    h.engine.settle().await;

    h.net.respond(img.as_str(), Response::new(200, "v2"));
    let stale = h.engine.handle_request(get("/logo.png")).await.unwrap();
    assert_eq!(body(&stale), b"v1");

    h.engine.settle().await;
    let fresh = h.engine.handle_request(get("/logo.png")).await.unwrap();
    assert_eq!(body(&fresh), b"v2");
    h.engine.settle().await;
    assert_eq!(h.net.calls_to(img.as_str()).len(), 3);
  }

  #[tokio::test]
  async fn test_swr_miss_offline_is_a_miss() {
    let h = harness();
    h.net.set_offline(true);
    let reply = h.engine.handle_request(get("/logo.png")).await.unwrap();
    assert_eq!(reply, Reply::Miss);
  }

  #[tokio::test]
  async fn test_swr_images_trimmed_assets_not() {
    let h = harness_with(Config {
      origin: ORIGIN.to_string(),
      regions: crate::config::RegionsConfig {
        images: Some(2),
        runtime: Some(2),
        ..Default::default()
      },
      ..Config::default()
    });
    for i in 0..4 {
      h.engine
        .handle_request(get(&format!("/img/{}.png", i)))
        .await
        .unwrap();
      h.engine
        .handle_request(get(&format!("/js/{}.js", i)))
        .await
        .unwrap();
    }
    h.engine.settle().await;

    assert_eq!(h.engine.registry().get(RegionRole::Images).len().unwrap(), 2);
    assert_eq!(h.engine.registry().get(RegionRole::Runtime).len().unwrap(), 4);
  }

  #[tokio::test]
  async fn test_cache_first_hits_network_once() {
    let h = harness();
    let clip = url("/v/clip.mp4");
    h.net.respond(clip.as_str(), Response::new(200, "video"));

    let first = h.engine.handle_request(get("/v/clip.mp4")).await.unwrap();
    let second = h.engine.handle_request(get("/v/clip.mp4")).await.unwrap();

    assert_eq!(body(&first), b"video");
    assert_eq!(body(&second), b"video");
    assert_eq!(h.net.calls_to(clip.as_str()).len(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_range_requests_cached_separately() {
    let h = harness();
    let clip = url("/v/clip.mp4");
    h.net.respond(clip.as_str(), Response::new(206, "part"));

    let ranged = get("/v/clip.mp4")
      .with_destination(Destination::Video)
      .with_header("Range", "bytes=0-3");
    h.engine.handle_request(ranged.clone()).await.unwrap();
    h.engine.handle_request(ranged).await.unwrap();
    h.engine.handle_request(get("/v/clip.mp4")).await.unwrap();

    assert_eq!(h.net.calls_to(clip.as_str()).len(), 2);
    assert_eq!(h.engine.registry().get(RegionRole::Media).len().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_passthrough_surfaces_transport_failure() {
    let h = harness();
    h.net.respond(url("/feed.xml").as_str(), Response::new(200, "<rss/>"));
    let reply = h.engine.handle_request(get("/feed.xml")).await.unwrap();
    assert_eq!(body(&reply), b"<rss/>");

    h.net.set_offline(true);
    assert!(h.engine.handle_request(get("/feed.xml")).await.is_err());
    for region in RegionRole::ALL {
      assert!(h.engine.registry().get(region).is_empty().unwrap());
    }
  }

  #[tokio::test]
  async fn test_ignored_scheme_is_not_fetched() {
    let h = harness();
    let req = Request::get(Url::parse("chrome-extension://abc/x.js").unwrap());
    assert_eq!(h.engine.handle_request(req).await.unwrap(), Reply::Ignored);
    assert!(h.net.calls().is_empty());
  }

  #[tokio::test]
  async fn test_failed_write_is_queued_and_replayed_once() {
    let h = harness();
    let notes = url("/api/notes");
    let post = get("/api/notes")
      .with_method(Method::Post)
      .with_body(r#"{"text":"hello"}"#);

    h.net.set_offline(true);
    let reply = h.engine.handle_request(post).await.unwrap();
    assert_eq!(reply, Reply::Respond(Response::queued()));

    let pending = h.engine.queue().pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url, notes);
    assert_eq!(pending[0].body, serde_json::json!({ "text": "hello" }));
    assert!(h.engine.sync().is_pending());

    h.net.set_offline(false);
    h.net.respond(notes.as_str(), Response::new(201, "{}"));
    let before = h.net.calls_to(notes.as_str()).len();
    let report = h.engine.handle_sync("post-queue-sync").await.unwrap().unwrap();

    assert_eq!(report.delivered, 1);
    assert!(h.engine.queue().pending().unwrap().is_empty());
    let replays = &h.net.calls_to(notes.as_str())[before..];
    assert_eq!(replays.len(), 1);
    let sent: serde_json::Value =
      serde_json::from_slice(replays[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent, serde_json::json!({ "text": "hello" }));
  }

  #[tokio::test]
  async fn test_online_write_is_not_queued() {
    let h = harness();
    h.net.respond(url("/api/notes").as_str(), Response::new(400, "bad"));
    let post = get("/api/notes").with_method(Method::Post).with_body("{}");

    let reply = h.engine.handle_request(post).await.unwrap();
    assert_eq!(reply.response().unwrap().status, 400);
    assert!(h.engine.queue().pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unqueueable_write_surfaces_failure() {
    let h = harness();
    h.net.set_offline(true);
    let post = get("/form").with_method(Method::Post).with_body("a=1");
    assert!(h.engine.handle_request(post).await.is_err());
  }

  #[tokio::test]
  async fn test_sync_with_other_tag_is_ignored() {
    let h = harness();
    assert_eq!(h.engine.handle_sync("something-else").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_prefetch_command_populates_runtime_without_trim() {
    let h = harness_with(Config {
      origin: ORIGIN.to_string(),
      regions: crate::config::RegionsConfig {
        runtime: Some(1),
        ..Default::default()
      },
      ..Config::default()
    });
    h.net.respond(url("/a.js").as_str(), Response::new(200, "a"));
    h.net.respond(url("/b.css").as_str(), Response::new(200, "b"));

    let stored = h
      .engine
      .handle_message(&serde_json::json!({ "type": "PREFETCH", "urls": ["/a.js", "/b.css"] }))
      .await;

    assert_eq!(stored, 2);
    assert_eq!(h.engine.registry().get(RegionRole::Runtime).len().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_malformed_message_is_noop() {
    let h = harness();
    assert_eq!(h.engine.handle_message(&serde_json::json!({ "type": "PREFETCH" })).await, 0);
    assert_eq!(h.engine.handle_message(&serde_json::json!(42)).await, 0);
    assert!(h.net.calls().is_empty());
  }

  #[tokio::test]
  async fn test_periodic_sync_refreshes_api_region() {
    let h = harness();
    let latest = url("/api/latest");
    h.net.respond(latest.as_str(), Response::new(200, "latest"));

    assert!(h.engine.handle_periodic_sync("content-sync").await.unwrap());
    assert!(!h.engine.handle_periodic_sync("other").await.unwrap());

    let api = h.engine.registry().get(RegionRole::Api);
    assert_eq!(
      api.get(&RequestKey::get(latest)).unwrap().unwrap().body,
      b"latest".to_vec()
    );

    h.net.set_offline(true);
    assert!(!h.engine.handle_periodic_sync("content-sync").await.unwrap());
  }
}
