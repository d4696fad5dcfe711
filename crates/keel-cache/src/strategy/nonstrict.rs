//! Nonstrict read-write strategy
//!
//! Writers never lock: an update invalidates the entry inside the transaction and again once
//! it completes. A reader that loads between the store commit and the second invalidation
//! can repopulate the region with the pre-commit state, so readers may observe stale state
//! for at most that window.

use crate::region::Region;
use crate::{CacheKey, CacheResult};
use std::sync::Arc;

#[derive(Debug)]
pub struct NonstrictReadWriteAccess {
    region: Arc<Region>,
}

impl NonstrictReadWriteAccess {
    pub fn new(region: Arc<Region>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub(crate) fn update(&self, key: &CacheKey) -> CacheResult<bool> {
        self.evict(key)?;
        Ok(false)
    }

    pub(crate) fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        if self.region.remove(key)? {
            tracing::debug!("Invalidated {} in '{}'", key, self.region.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{AccessType, CacheEntry, CacheKey, RegionConfig, RegionFactory};
    use serde_json::json;

    #[test]
    fn test_update_invalidates() {
        let factory = RegionFactory::new();
        let access = factory
            .build_access("Tag", AccessType::NonstrictReadWrite, RegionConfig::default())
            .unwrap();
        let key = CacheKey::new("Tag", "i:3");

        access
            .put_from_load(&key, CacheEntry::new(json!(["rust"]), Some(1)), 0, false)
            .unwrap();
        assert!(access.lock(&key, Some(1)).unwrap().is_none());

        let written = access
            .update(&key, None, CacheEntry::new(json!(["rustlang"]), Some(2)), 1)
            .unwrap();
        assert!(!written);
        assert!(access.get(&key, factory.next_timestamp()).unwrap().is_none());

        // a stale reload inside the window is accepted, the post-completion release clears it
        access
            .put_from_load(&key, CacheEntry::new(json!(["rust"]), Some(1)), 0, false)
            .unwrap();
        access.release(&key, None).unwrap();
        assert!(access.get(&key, factory.next_timestamp()).unwrap().is_none());
    }
}
