//! Region registry: the fixed set of named, capacity-bounded stores.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use super::bounded::BoundedStore;
use super::storage::BlobStore;
use crate::http::{RequestKey, Response};

/// Logical role of a region. Strategy code looks regions up by role, never
/// by identity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionRole {
  Precache,
  Runtime,
  Media,
  Images,
  Api,
}

impl RegionRole {
  /// Registry order; also the lookup order for cross-region matches.
  pub const ALL: [RegionRole; 5] = [
    RegionRole::Precache,
    RegionRole::Runtime,
    RegionRole::Media,
    RegionRole::Images,
    RegionRole::Api,
  ];

  fn index(self) -> usize {
    self as usize
  }

  pub fn prefix(self) -> &'static str {
    match self {
      RegionRole::Precache => "precache",
      RegionRole::Runtime => "runtime",
      RegionRole::Media => "media",
      RegionRole::Images => "images",
      RegionRole::Api => "api",
    }
  }
}

/// Name and capacity of one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
  pub role: RegionRole,
  pub name: String,
  /// Maximum entry count; `None` is unbounded
  pub capacity: Option<usize>,
}

impl RegionSpec {
  /// Identity is `<role prefix>-<version>`, e.g. `images-v6`.
  pub fn versioned(role: RegionRole, version: &str, capacity: Option<usize>) -> Self {
    Self {
      role,
      name: format!("{}-{}", role.prefix(), version),
      capacity,
    }
  }
}

/// Process-wide region set, built once at startup.
#[derive(Clone)]
pub struct RegionRegistry {
  regions: Vec<BoundedStore>,
}

impl RegionRegistry {
  /// Build the registry. Every role must appear exactly once.
  pub fn new(store: Arc<dyn BlobStore>, specs: Vec<RegionSpec>) -> Result<Self> {
    for role in RegionRole::ALL {
      let count = specs.iter().filter(|s| s.role == role).count();
      if count != 1 {
        return Err(eyre!(
          "Region {:?} must be configured exactly once (found {})",
          role,
          count
        ));
      }
    }

    let mut regions: Vec<BoundedStore> = specs
      .into_iter()
      .map(|spec| BoundedStore::new(Arc::clone(&store), spec))
      .collect();
    regions.sort_by_key(|r| r.role().index());

    Ok(Self { regions })
  }

  pub fn get(&self, role: RegionRole) -> &BoundedStore {
    // `new` guarantees one region per role, sorted by role
    &self.regions[role.index()]
  }

  pub fn names(&self) -> Vec<&str> {
    self.regions.iter().map(|r| r.name()).collect()
  }

  /// Open every configured region so it exists in the store.
  pub fn open_all(&self) -> Result<()> {
    for region in &self.regions {
      region.open()?;
    }
    Ok(())
  }

  /// Delete every region identity in the store that is not configured.
  /// Returns the names that were removed.
  pub fn purge_stale(&self) -> Result<Vec<String>> {
    let Some(first) = self.regions.first() else {
      return Ok(Vec::new());
    };
    let store = first.store();
    let current: HashSet<&str> = self.names().into_iter().collect();

    let mut purged = Vec::new();
    for name in store.region_names()? {
      if current.contains(name.as_str()) {
        continue;
      }
      if store.delete_region(&name)? {
        info!(region = %name, "purged stale region");
        purged.push(name);
      }
    }
    Ok(purged)
  }

  /// First match for `key` across all regions, in registry order.
  pub fn match_any(&self, key: &RequestKey) -> Result<Option<Response>> {
    for region in &self.regions {
      if let Some(found) = region.get(key)? {
        return Ok(Some(found));
      }
    }
    Ok(None)
  }
}
