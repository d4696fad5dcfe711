//! Read-write strategy with soft locks
//!
//! A writer replaces the entry with a lock marker before it touches the store. Readers that
//! find the marker miss and go to the store; loads may only replace the marker once every
//! writer has released it and their transaction started after the release, or once the
//! lock has timed out.

use super::{new_item, SoftLock};
use crate::region::{Region, SoftLockEntry, StoredValue};
use crate::{CacheEntry, CacheKey, CacheResult, Timestamp};
use std::sync::Arc;

#[derive(Debug)]
pub struct ReadWriteAccess {
    region: Arc<Region>,
}

impl ReadWriteAccess {
    pub fn new(region: Arc<Region>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub(crate) fn get(
        &self,
        key: &CacheKey,
        tx_timestamp: Timestamp,
    ) -> CacheResult<Option<CacheEntry>> {
        match self.region.read(key)? {
            Some(StoredValue::Item(item)) if tx_timestamp > item.timestamp => {
                Ok(Some(CacheEntry::new(item.state, item.version)))
            }
            Some(StoredValue::Lock(_)) => {
                tracing::debug!("{} is locked in '{}', reading from store", key, self.region.name());
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn put_from_load(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        tx_timestamp: Timestamp,
        minimal_put: bool,
    ) -> CacheResult<bool> {
        let _guard = self.region.guard(key);
        let writeable = match self.region.read(key)? {
            None => true,
            Some(StoredValue::Item(_)) if minimal_put => false,
            Some(StoredValue::Item(existing)) => entry.supersedes(existing.version),
            Some(StoredValue::Lock(lock)) => lock.is_writeable(tx_timestamp, entry.version),
        };

        if writeable {
            self.region.write(key, &new_item(&self.region, entry))?;
        }
        Ok(writeable)
    }

    /// Lock `key` for a writer. A second writer joins the live lock and shares its id, so
    /// the entry stays locked until every holder has released it.
    pub(crate) fn lock(&self, key: &CacheKey, version: Option<u64>) -> CacheResult<SoftLock> {
        let _guard = self.region.guard(key);
        let timeout = self.region.lock_deadline();

        let entry = match self.region.read(key)? {
            Some(StoredValue::Lock(mut existing)) if existing.multiplicity > 0 => {
                tracing::warn!(
                    "{} locked concurrently in '{}' ({} holders)",
                    key,
                    self.region.name(),
                    existing.multiplicity + 1
                );
                existing.timeout = timeout;
                existing.multiplicity += 1;
                existing.concurrent = true;
                existing
            }
            Some(StoredValue::Lock(unlocked)) => SoftLockEntry {
                lock_id: self.region.next_lock_id(),
                timeout,
                unlock_timestamp: 0,
                multiplicity: 1,
                concurrent: false,
                version: unlocked.version.or(version),
            },
            Some(StoredValue::Item(item)) => SoftLockEntry {
                lock_id: self.region.next_lock_id(),
                timeout,
                unlock_timestamp: 0,
                multiplicity: 1,
                concurrent: false,
                version: item.version,
            },
            None => SoftLockEntry {
                lock_id: self.region.next_lock_id(),
                timeout,
                unlock_timestamp: 0,
                multiplicity: 1,
                concurrent: false,
                version,
            },
        };

        let lock_id = entry.lock_id;
        self.region.write(key, &StoredValue::Lock(entry))?;
        Ok(SoftLock::new(key.clone(), lock_id))
    }

    /// Write the committed state, provided the caller is the only holder of the lock on `key`.
    /// A lock that was ever shared is released instead; the entry reloads once all holders are gone.
    pub(crate) fn update(
        &self,
        key: &CacheKey,
        lock: Option<&SoftLock>,
        entry: CacheEntry,
    ) -> CacheResult<bool> {
        if let Some(lock) = lock {
            lock.check_key(key)?;
        }

        let _guard = self.region.guard(key);
        match (self.region.read(key)?, lock) {
            (Some(StoredValue::Lock(existing)), Some(lock)) if existing.lock_id == lock.lock_id() => {
                if existing.concurrent {
                    self.decrement(key, existing)?;
                    Ok(false)
                } else {
                    self.region.write(key, &new_item(&self.region, entry))?;
                    Ok(true)
                }
            }
            _ => {
                self.handle_lock_expiry(key)?;
                Ok(false)
            }
        }
    }

    pub(crate) fn release(&self, key: &CacheKey, lock: Option<&SoftLock>) -> CacheResult<()> {
        if let Some(lock) = lock {
            lock.check_key(key)?;
        }

        let _guard = self.region.guard(key);
        match (self.region.read(key)?, lock) {
            (Some(StoredValue::Lock(existing)), Some(lock)) if existing.lock_id == lock.lock_id() => {
                self.decrement(key, existing)
            }
            (Some(StoredValue::Lock(existing)), None) if existing.multiplicity > 0 => {
                self.decrement(key, existing)
            }
            _ => self.handle_lock_expiry(key),
        }
    }

    /// Entity deletion keeps an existing lock in place; release clears it after completion
    pub(crate) fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        let _guard = self.region.guard(key);
        match self.region.read(key)? {
            Some(StoredValue::Lock(_)) => Ok(()),
            Some(StoredValue::Item(_)) => self.region.remove(key).map(|_| ()),
            None => Ok(()),
        }
    }

    fn decrement(&self, key: &CacheKey, mut lock: SoftLockEntry) -> CacheResult<()> {
        lock.multiplicity = lock.multiplicity.saturating_sub(1);
        if lock.multiplicity == 0 {
            lock.unlock_timestamp = self.region.next_timestamp();
        }
        self.region.write(key, &StoredValue::Lock(lock))
    }

    /// The caller's lock is gone, which means it timed out and someone else got in.
    /// Leave an unlocked marker so that only loads starting from now repopulate the entry.
    fn handle_lock_expiry(&self, key: &CacheKey) -> CacheResult<()> {
        tracing::warn!(
            "Soft lock on {} in '{}' expired or was replaced",
            key,
            self.region.name()
        );
        let now = self.region.next_timestamp();
        let marker = SoftLockEntry {
            lock_id: self.region.next_lock_id(),
            timeout: now,
            unlock_timestamp: now,
            multiplicity: 0,
            concurrent: false,
            version: None,
        };
        self.region.write(key, &StoredValue::Lock(marker))
    }
}
