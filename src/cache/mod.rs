//! Named response regions with bounded, oldest-first eviction.
//!
//! - `storage`: the blob store primitive (regions of key -> response)
//! - `bounded`: a capacity-limited view over one region, with `trim`
//! - `region`: the fixed registry of regions, looked up by role

mod bounded;
mod region;
mod storage;

pub use bounded::BoundedStore;
pub use region::{RegionRegistry, RegionRole, RegionSpec};
pub use storage::{BlobStore, SqliteBlobStore};
