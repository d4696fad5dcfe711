//! # keel-cache
//!
//! Second-level cache regions for the keel persistence runtime.
//!
//! ## Features
//!
//! - **Dehydrated entries**: regions only ever hold primitive, identifier-level
//!   state serialized at the storage boundary, never live object references
//! - **Four concurrency strategies**: read-only, nonstrict-read-write,
//!   read-write (soft locks) and transactional
//! - **Pluggable storage**: any key-value store implementing [`RegionStorage`]
//! - **Stale-load protection**: `put_from_load` never overwrites a newer entry
//!
//! ## Quick Start
//!
//! ```rust
//! use keel_cache::{AccessType, CacheEntry, CacheKey, RegionConfig, RegionFactory};
//! use serde_json::json;
//!
//! let factory = RegionFactory::new();
//! let access = factory
//!     .build_access("Order", AccessType::ReadWrite, RegionConfig::default())
//!     .unwrap();
//!
//! let key = CacheKey::new("Order", "i:42");
//! let tx_timestamp = factory.next_timestamp();
//! access
//!     .put_from_load(&key, CacheEntry::new(json!([120, "open"]), Some(1)), tx_timestamp, false)
//!     .unwrap();
//!
//! let cached = access.get(&key, factory.next_timestamp()).unwrap();
//! assert_eq!(cached.map(|e| e.version), Some(Some(1)));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod config;
pub mod region;
pub mod storage;
pub mod strategy;
pub mod timestamp;

pub use config::*;
pub use region::*;
pub use storage::*;
pub use strategy::*;
pub use timestamp::*;

/// Cache operation errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Cache configuration error: {0}")]
    Configuration(String),

    #[error("Attempted to update read-only region '{region}' for key {key}")]
    ReadOnlyViolation { region: String, key: String },

    #[error("Soft lock {lock_id} does not belong to key {key}")]
    LockMismatch { lock_id: u64, key: String },
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Key of a region entry: the cached kind plus a canonical identifier rendering.
///
/// The identifier is kept as an opaque string so that regions stay independent of
/// any particular identifier type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    kind: String,
    id: String,
}

impl CacheKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Flat key handed to the storage provider
    pub fn storage_key(&self) -> String {
        format!("{}#{}", self.kind, self.id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Dehydrated state stored in a region, plus the version it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Disassembled attribute values
    pub state: serde_json::Value,
    /// Business version of the source row, when the kind is versioned
    pub version: Option<u64>,
}

impl CacheEntry {
    pub fn new(state: serde_json::Value, version: Option<u64>) -> Self {
        Self { state, version }
    }

    /// Whether `self` may replace an entry holding `existing`.
    ///
    /// Unversioned state never replaces a present entry: without a version there is no
    /// way to tell which of the two is newer.
    pub fn supersedes(&self, existing: Option<u64>) -> bool {
        match (existing, self.version) {
            (Some(current), Some(incoming)) => current < incoming,
            _ => false,
        }
    }
}

/// Region statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub stale_puts: u64,
    pub entries: u64,
}

impl RegionStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_rendering() {
        let key = CacheKey::new("Order", "i:42");
        assert_eq!(key.storage_key(), "Order#i:42");
        assert_eq!(key.to_string(), "Order#i:42");
        assert_eq!(key.kind(), "Order");
        assert_eq!(key.id(), "i:42");
    }

    #[test]
    fn test_entry_supersedes_only_older_versions() {
        let v2 = CacheEntry::new(json!([1]), Some(2));
        assert!(v2.supersedes(Some(1)));
        assert!(!v2.supersedes(Some(2)));
        assert!(!v2.supersedes(Some(3)));

        let unversioned = CacheEntry::new(json!([1]), None);
        assert!(!unversioned.supersedes(Some(1)));
        assert!(!unversioned.supersedes(None));
    }

    #[test]
    fn test_hit_ratio() {
        let stats = RegionStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_ratio(), 0.75);
        assert_eq!(RegionStats::default().hit_ratio(), 0.0);
    }
}
