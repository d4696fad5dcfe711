//! Read-only strategy: entries are written once and never updated

use super::new_item;
use crate::region::Region;
use crate::{CacheEntry, CacheError, CacheKey, CacheResult};
use std::sync::Arc;

#[derive(Debug)]
pub struct ReadOnlyAccess {
    region: Arc<Region>,
}

impl ReadOnlyAccess {
    pub fn new(region: Arc<Region>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub(crate) fn put_from_load(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<bool> {
        let _guard = self.region.guard(key);
        if self.region.read(key)?.is_some() {
            return Ok(false);
        }
        self.region.write(key, &new_item(&self.region, entry))?;
        Ok(true)
    }

    pub(crate) fn update(&self, key: &CacheKey) -> CacheResult<bool> {
        Err(CacheError::ReadOnlyViolation {
            region: self.region.name().to_string(),
            key: key.to_string(),
        })
    }

    pub(crate) fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        self.region.remove(key).map(|_| ())
    }
}
