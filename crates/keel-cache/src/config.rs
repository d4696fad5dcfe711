//! Region configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration applied to a single cache region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// How long a read-write soft lock stays valid before it is considered expired
    pub lock_timeout: Duration,

    /// Maximum number of entries kept by the in-memory storage
    pub max_entries: Option<usize>,

    /// Time to live for stored entries
    pub ttl: Option<Duration>,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            max_entries: Some(10_000),
            ttl: None,
        }
    }
}

impl RegionConfig {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn max_entries_limit(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn unlimited_entries(mut self) -> Self {
        self.max_entries = None;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
