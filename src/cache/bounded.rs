//! Capacity-limited view over one region of a blob store.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::debug;

use super::region::{RegionRole, RegionSpec};
use super::storage::BlobStore;
use crate::http::{RequestKey, Response};

/// A named region with oldest-first eviction.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct BoundedStore {
  store: Arc<dyn BlobStore>,
  spec: Arc<RegionSpec>,
}

impl BoundedStore {
  pub fn new(store: Arc<dyn BlobStore>, spec: RegionSpec) -> Self {
    Self {
      store,
      spec: Arc::new(spec),
    }
  }

  pub fn name(&self) -> &str {
    &self.spec.name
  }

  pub fn role(&self) -> RegionRole {
    self.spec.role
  }

  pub fn capacity(&self) -> Option<usize> {
    self.spec.capacity
  }

  pub(crate) fn store(&self) -> &Arc<dyn BlobStore> {
    &self.store
  }

  pub fn open(&self) -> Result<()> {
    self.store.open_region(self.name())
  }

  pub fn get(&self, key: &RequestKey) -> Result<Option<Response>> {
    self.store.get(self.name(), key)
  }

  /// Store `response`, replacing any existing entry for `key`.
  pub fn put(&self, key: &RequestKey, response: &Response) -> Result<()> {
    self.store.put(self.name(), key, response)
  }

  pub fn delete(&self, key: &RequestKey) -> Result<bool> {
    self.store.delete(self.name(), key)
  }

  /// Keys, oldest first.
  pub fn keys(&self) -> Result<Vec<RequestKey>> {
    self.store.keys(self.name())
  }

  pub fn len(&self) -> Result<usize> {
    self.store.len(self.name())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Remove the oldest entry while the region holds more than `max_entries`.
  ///
  /// The size is re-read on every iteration so concurrent writers are
  /// tolerated: a racing delete just makes the next pass re-check. The loop
  /// only exits once the region is within bound, or with an error when the
  /// oldest entry cannot be removed. Returns the number of entries this call
  /// removed.
  pub fn trim(&self, max_entries: usize) -> Result<usize> {
    let mut evicted = 0;
    while self.len()? > max_entries {
      let Some(oldest) = self.store.oldest(self.name())? else {
        break;
      };
      if self.delete(&oldest)? {
        evicted += 1;
        continue;
      }
      // Someone else removed it unless it is still the oldest
      if self.store.oldest(self.name())?.as_ref() == Some(&oldest) {
        return Err(eyre!(
          "Failed to trim region {}: entry {} cannot be removed",
          self.name(),
          oldest
        ));
      }
    }

    if evicted > 0 {
      debug!(region = %self.name(), evicted, max_entries, "trimmed region");
    }
    Ok(evicted)
  }

  /// Trim to the configured capacity. No-op for unbounded regions.
  pub fn enforce_capacity(&self) -> Result<usize> {
    match self.capacity() {
      Some(max) => self.trim(max),
      None => Ok(0),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteBlobStore;
  use crate::http::Method;
  use url::Url;

  fn key(i: usize) -> RequestKey {
    RequestKey::get(Url::parse(&format!("https://app.test/img/{}.png", i)).unwrap())
  }

  fn region(capacity: Option<usize>) -> BoundedStore {
    let store: Arc<dyn BlobStore> = Arc::new(SqliteBlobStore::open_in_memory().unwrap());
    BoundedStore::new(
      store,
      RegionSpec::versioned(RegionRole::Images, "v6", capacity),
    )
  }

  #[test]
  fn test_trim_keeps_most_recent_entries() {
    let images = region(Some(3));
    for i in 0..7 {
      images.put(&key(i), &Response::new(200, format!("{}", i))).unwrap();
    }

    assert_eq!(images.enforce_capacity().unwrap(), 4);
    assert_eq!(images.keys().unwrap(), vec![key(4), key(5), key(6)]);
  }

  #[test]
  fn test_trim_is_idempotent() {
    let images = region(Some(2));
    for i in 0..5 {
      images.put(&key(i), &Response::new(200, "x")).unwrap();
    }
    images.trim(2).unwrap();
    let before = images.keys().unwrap();

    assert_eq!(images.trim(2).unwrap(), 0);
    assert_eq!(images.keys().unwrap(), before);
  }

  #[test]
  fn test_trim_to_zero_empties_region() {
    let images = region(Some(0));
    for i in 0..500 {
      images.put(&key(i), &Response::new(200, "x")).unwrap();
    }
    images.enforce_capacity().unwrap();
    assert!(images.is_empty().unwrap());
  }

  #[test]
  fn test_unbounded_region_is_never_trimmed() {
    let runtime = region(None);
    for i in 0..10 {
      runtime.put(&key(i), &Response::new(200, "x")).unwrap();
    }
    assert_eq!(runtime.enforce_capacity().unwrap(), 0);
    assert_eq!(runtime.len().unwrap(), 10);
  }

  #[test]
  fn test_replaced_entry_counts_as_newest() {
    let images = region(Some(2));
    images.put(&key(0), &Response::new(200, "a")).unwrap();
    images.put(&key(1), &Response::new(200, "b")).unwrap();
    images.put(&key(0), &Response::new(200, "a2")).unwrap();
    images.put(&key(2), &Response::new(200, "c")).unwrap();
    images.enforce_capacity().unwrap();

    assert_eq!(images.keys().unwrap(), vec![key(0), key(2)]);
  }

  /// Store whose deletes never take effect.
  struct StuckStore(SqliteBlobStore);

  impl BlobStore for StuckStore {
    fn open_region(&self, region: &str) -> Result<()> {
      self.0.open_region(region)
    }
    fn region_names(&self) -> Result<Vec<String>> {
      self.0.region_names()
    }
    fn delete_region(&self, region: &str) -> Result<bool> {
      self.0.delete_region(region)
    }
    fn get(&self, region: &str, key: &RequestKey) -> Result<Option<Response>> {
      self.0.get(region, key)
    }
    fn put(&self, region: &str, key: &RequestKey, response: &Response) -> Result<()> {
      self.0.put(region, key, response)
    }
    fn delete(&self, _region: &str, _key: &RequestKey) -> Result<bool> {
      Ok(false)
    }
    fn keys(&self, region: &str) -> Result<Vec<RequestKey>> {
      self.0.keys(region)
    }
    fn len(&self, region: &str) -> Result<usize> {
      self.0.len(region)
    }
    fn oldest(&self, region: &str) -> Result<Option<RequestKey>> {
      self.0.oldest(region)
    }
  }

  #[test]
  fn test_trim_fails_instead_of_spinning_on_undeletable_entry() {
    let inner = SqliteBlobStore::open_in_memory().unwrap();
    let store: Arc<dyn BlobStore> = Arc::new(StuckStore(inner));
    let images = BoundedStore::new(
      store,
      RegionSpec::versioned(RegionRole::Images, "v6", Some(0)),
    );
    images.put(&key(0), &Response::new(200, "x")).unwrap();

    assert!(images.enforce_capacity().is_err());
    assert_eq!(images.len().unwrap(), 1);
  }

  #[test]
  fn test_fragment_url_entry_is_trimmed() {
    let images = region(Some(0));
    let url = Url::parse("https://a.test/x.png#f").unwrap();
    images
      .put(&RequestKey::new(Method::Get, url, None), &Response::new(200, "x"))
      .unwrap();

    assert_eq!(images.enforce_capacity().unwrap(), 1);
    assert!(images.is_empty().unwrap());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_writers_never_leave_region_over_capacity() {
    let images = region(Some(5));
    let mut handles = Vec::new();
    for w in 0..4 {
      let images = images.clone();
      handles.push(tokio::spawn(async move {
        for i in 0..20 {
          images
            .put(&key(w * 100 + i), &Response::new(200, "x"))
            .unwrap();
          images.enforce_capacity().unwrap();
        }
      }));
    }
    for h in handles {
      h.await.unwrap();
    }

    assert!(images.len().unwrap() <= 5);
  }
}
