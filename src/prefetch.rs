//! Bulk population of a region from an explicit URL list.

use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::BoundedStore;
use crate::http::{Request, RequestMode};
use crate::transport::Transport;

/// Commands accepted on the message channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
  #[serde(rename = "PREFETCH")]
  Prefetch {
    #[serde(default)]
    urls: Vec<String>,
  },
}

impl Command {
  /// Parse a raw message. Anything that is not a known command is `None`.
  pub fn parse(message: &serde_json::Value) -> Option<Self> {
    serde_json::from_value(message.clone()).ok()
  }
}

/// Fetch every URL and store whatever arrives. Per-URL failures (bad URL,
/// transport failure, store failure) are swallowed. No trim is applied.
/// Returns how many responses were stored.
pub async fn prefetch(
  region: &BoundedStore,
  transport: &Arc<dyn Transport>,
  base: &Url,
  urls: &[String],
) -> usize {
  let fetches = urls.iter().map(|raw| async move {
    let url = match base.join(raw) {
      Ok(url) => url,
      Err(e) => {
        debug!(url = %raw, error = %e, "skipping unparsable prefetch url");
        return false;
      }
    };

    let request = Request::get(url).with_mode(RequestMode::NoCors);
    match transport.fetch(&request).await {
      Ok(resp) => match region.put(&request.key(), &resp) {
        Ok(()) => true,
        Err(e) => {
          debug!(url = %request.url, error = %e, "prefetch store failed");
          false
        }
      },
      Err(e) => {
        debug!(url = %request.url, error = %e, "prefetch fetch failed");
        false
      }
    }
  });

  let stored = join_all(fetches).await.into_iter().filter(|ok| *ok).count();
  info!(region = %region.name(), requested = urls.len(), stored, "prefetch complete");
  stored
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{BlobStore, RegionRole, RegionSpec, SqliteBlobStore};
  use crate::http::{RequestKey, Response};
  use crate::transport::fake::FakeTransport;

  #[test]
  fn test_parse_command() {
    let cmd = Command::parse(&serde_json::json!({ "type": "PREFETCH", "urls": ["/a", "/b"] }));
    assert_eq!(
      cmd,
      Some(Command::Prefetch {
        urls: vec!["/a".to_string(), "/b".to_string()]
      })
    );
  }

  #[test]
  fn test_malformed_commands_are_ignored() {
    assert_eq!(
      Command::parse(&serde_json::json!({ "type": "PREFETCH" })),
      Some(Command::Prefetch { urls: vec![] })
    );
    assert_eq!(Command::parse(&serde_json::json!({ "type": "OTHER" })), None);
    assert_eq!(Command::parse(&serde_json::json!("PREFETCH")), None);
    assert_eq!(Command::parse(&serde_json::json!({ "urls": ["/a"] })), None);
  }

  #[tokio::test]
  async fn test_failures_do_not_affect_siblings() {
    let store: Arc<dyn BlobStore> = Arc::new(SqliteBlobStore::open_in_memory().unwrap());
    let runtime = BoundedStore::new(store, RegionSpec::versioned(RegionRole::Runtime, "v6", None));
    let fake = Arc::new(FakeTransport::new());
    fake.respond("https://app.test/a.js", Response::new(200, "a"));
    fake.respond("https://cdn.test/b.css", Response::new(200, "b"));
    fake.set_unreachable("https://app.test/down", true);
    let transport: Arc<dyn Transport> = fake.clone();
    let base = Url::parse("https://app.test/").unwrap();

    let urls = vec![
      "/a.js".to_string(),
      "/down".to_string(),
      "https://cdn.test/b.css".to_string(),
      "http://[bad".to_string(),
    ];
    let stored = prefetch(&runtime, &transport, &base, &urls).await;

    assert_eq!(stored, 2);
    let a = RequestKey::get(Url::parse("https://app.test/a.js").unwrap());
    assert_eq!(runtime.get(&a).unwrap().unwrap().body, b"a".to_vec());
    assert!(fake
      .calls()
      .iter()
      .all(|r| r.mode == RequestMode::NoCors));
  }
}
