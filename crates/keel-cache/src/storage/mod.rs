//! Region storage providers
//!
//! [`RegionStorage`] is the boundary exposed to external cache implementations. A provider
//! only needs per-operation atomicity: read-modify-write sequences are serialized per key by
//! the owning [`Region`](crate::Region).

pub mod memory;

pub use memory::*;

use crate::CacheResult;

/// Key-value store backing one cache region
pub trait RegionStorage: Send + Sync {
    /// Get the raw bytes stored under `key`
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store raw bytes under `key`, replacing any previous value
    fn put(&self, key: &str, value: Vec<u8>) -> CacheResult<()>;

    /// Remove `key`, returning whether a value was present
    fn remove(&self, key: &str) -> CacheResult<bool>;

    /// Remove every entry
    fn clear(&self) -> CacheResult<()>;

    /// Number of live entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
