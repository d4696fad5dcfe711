//! Transactional strategy
//!
//! Writes are staged per transaction and reach the region only when the transaction commits,
//! so other transactions never read uncommitted state. A rollback discards the staged writes.

use super::{new_item, TransactionId};
use crate::region::Region;
use crate::{CacheEntry, CacheKey, CacheResult};
use dashmap::DashMap;
use std::sync::Arc;

/// `None` stages a removal
type StagedWrites = Vec<(CacheKey, Option<CacheEntry>)>;

#[derive(Debug)]
pub struct TransactionalAccess {
    region: Arc<Region>,
    staged: DashMap<TransactionId, StagedWrites>,
}

impl TransactionalAccess {
    pub fn new(region: Arc<Region>) -> Self {
        Self {
            region,
            staged: DashMap::new(),
        }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Number of transactions with staged writes
    pub fn pending_transactions(&self) -> usize {
        self.staged.len()
    }

    pub(crate) fn update(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        tx: TransactionId,
    ) -> CacheResult<bool> {
        self.stage(key, Some(entry), tx);
        Ok(true)
    }

    pub(crate) fn remove(&self, key: &CacheKey, tx: TransactionId) -> CacheResult<()> {
        self.stage(key, None, tx);
        Ok(())
    }

    pub(crate) fn after_completion(&self, tx: TransactionId, committed: bool) -> CacheResult<()> {
        let Some((_, writes)) = self.staged.remove(&tx) else {
            return Ok(());
        };

        if !committed {
            tracing::debug!(
                "Discarding {} cache writes of transaction {} in '{}'",
                writes.len(),
                tx,
                self.region.name()
            );
            return Ok(());
        }

        for (key, entry) in writes {
            let _guard = self.region.guard(&key);
            match entry {
                Some(entry) => self.region.write(&key, &new_item(&self.region, entry))?,
                None => {
                    self.region.remove(&key)?;
                }
            }
        }
        Ok(())
    }

    fn stage(&self, key: &CacheKey, entry: Option<CacheEntry>, tx: TransactionId) {
        self.staged
            .entry(tx)
            .or_default()
            .push((key.clone(), entry));
    }
}
