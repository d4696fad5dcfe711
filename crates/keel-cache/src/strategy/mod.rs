//! Cache concurrency strategies
//!
//! Every region is bound to exactly one strategy when it is built. The strategies form a
//! closed set, so [`RegionAccess`] dispatches with a plain `match` instead of trait objects.
//!
//! Call protocol used by the persistence runtime when it writes an entity:
//!
//! 1. [`RegionAccess::lock`] before the statement runs
//! 2. [`RegionAccess::update`] / [`RegionAccess::remove`] inside the transaction, unless the
//!    strategy [writes after commit](AccessType::writes_after_commit)
//! 3. after completion: [`RegionAccess::update`] (committed, write-after-commit strategies) or
//!    [`RegionAccess::release`], then [`RegionAccess::after_completion`]

pub mod nonstrict;
pub mod read_only;
pub mod read_write;
pub mod transactional;

pub use nonstrict::NonstrictReadWriteAccess;
pub use read_only::ReadOnlyAccess;
pub use read_write::ReadWriteAccess;
pub use transactional::TransactionalAccess;

use crate::region::{Item, Region, StoredValue};
use crate::{CacheEntry, CacheError, CacheKey, CacheResult, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Identifier of the transaction on whose behalf a write is made
pub type TransactionId = u64;

/// Concurrency strategy of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessType {
    ReadOnly,
    NonstrictReadWrite,
    ReadWrite,
    Transactional,
}

impl AccessType {
    pub fn external_name(&self) -> &'static str {
        match self {
            AccessType::ReadOnly => "read-only",
            AccessType::NonstrictReadWrite => "nonstrict-read-write",
            AccessType::ReadWrite => "read-write",
            AccessType::Transactional => "transactional",
        }
    }

    /// Whether entity updates reach the region only once the transaction has committed
    pub fn writes_after_commit(&self) -> bool {
        matches!(self, AccessType::ReadWrite)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.external_name())
    }
}

impl FromStr for AccessType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read-only" | "read_only" => Ok(AccessType::ReadOnly),
            "nonstrict-read-write" | "nonstrict_read_write" => {
                Ok(AccessType::NonstrictReadWrite)
            }
            "read-write" | "read_write" => Ok(AccessType::ReadWrite),
            "transactional" => Ok(AccessType::Transactional),
            other => Err(CacheError::Configuration(format!(
                "Unknown cache access type '{}'",
                other
            ))),
        }
    }
}

/// Token handed out by [`RegionAccess::lock`] and consumed by `update` / `release`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftLock {
    key: CacheKey,
    lock_id: u64,
}

impl SoftLock {
    pub(crate) fn new(key: CacheKey, lock_id: u64) -> Self {
        Self { key, lock_id }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    pub(crate) fn check_key(&self, key: &CacheKey) -> CacheResult<()> {
        if &self.key == key {
            Ok(())
        } else {
            Err(CacheError::LockMismatch {
                lock_id: self.lock_id,
                key: key.to_string(),
            })
        }
    }
}

/// Strategy-bound access to one region
#[derive(Debug)]
pub enum RegionAccess {
    ReadOnly(ReadOnlyAccess),
    NonstrictReadWrite(NonstrictReadWriteAccess),
    ReadWrite(ReadWriteAccess),
    Transactional(TransactionalAccess),
}

impl RegionAccess {
    pub fn access_type(&self) -> AccessType {
        match self {
            RegionAccess::ReadOnly(_) => AccessType::ReadOnly,
            RegionAccess::NonstrictReadWrite(_) => AccessType::NonstrictReadWrite,
            RegionAccess::ReadWrite(_) => AccessType::ReadWrite,
            RegionAccess::Transactional(_) => AccessType::Transactional,
        }
    }

    pub fn region(&self) -> &Arc<Region> {
        match self {
            RegionAccess::ReadOnly(access) => access.region(),
            RegionAccess::NonstrictReadWrite(access) => access.region(),
            RegionAccess::ReadWrite(access) => access.region(),
            RegionAccess::Transactional(access) => access.region(),
        }
    }

    /// Look up `key` for a transaction that started at `tx_timestamp`
    pub fn get(&self, key: &CacheKey, tx_timestamp: Timestamp) -> CacheResult<Option<CacheEntry>> {
        let entry = match self {
            RegionAccess::ReadWrite(access) => access.get(key, tx_timestamp)?,
            _ => read_item(self.region(), key)?,
        };

        let region = self.region();
        if entry.is_some() {
            region.record_hit();
        } else {
            region.record_miss();
        }
        Ok(entry)
    }

    /// Populate the region with state just read from the store.
    ///
    /// Returns `false` when the put was discarded because the region already holds newer
    /// (or, with `minimal_put`, any) state for `key`.
    pub fn put_from_load(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        tx_timestamp: Timestamp,
        minimal_put: bool,
    ) -> CacheResult<bool> {
        let written = match self {
            RegionAccess::ReadOnly(access) => access.put_from_load(key, entry)?,
            RegionAccess::NonstrictReadWrite(access) => {
                put_if_newer(access.region(), key, entry, minimal_put)?
            }
            RegionAccess::ReadWrite(access) => {
                access.put_from_load(key, entry, tx_timestamp, minimal_put)?
            }
            RegionAccess::Transactional(access) => {
                put_if_newer(access.region(), key, entry, minimal_put)?
            }
        };

        let region = self.region();
        if written {
            region.record_put();
        } else {
            region.record_stale_put();
            tracing::debug!("Discarded put-from-load for {} in '{}'", key, region.name());
        }
        Ok(written)
    }

    /// Lock `key` ahead of a write. Only read-write regions hand out tokens.
    pub fn lock(&self, key: &CacheKey, version: Option<u64>) -> CacheResult<Option<SoftLock>> {
        match self {
            RegionAccess::ReadWrite(access) => access.lock(key, version).map(Some),
            _ => Ok(None),
        }
    }

    /// Write new state for `key` after the entity was updated
    pub fn update(
        &self,
        key: &CacheKey,
        lock: Option<&SoftLock>,
        entry: CacheEntry,
        tx: TransactionId,
    ) -> CacheResult<bool> {
        match self {
            RegionAccess::ReadOnly(access) => access.update(key),
            RegionAccess::NonstrictReadWrite(access) => access.update(key),
            RegionAccess::ReadWrite(access) => access.update(key, lock, entry),
            RegionAccess::Transactional(access) => access.update(key, entry, tx),
        }
    }

    /// Give up a lock without writing new state
    pub fn release(&self, key: &CacheKey, lock: Option<&SoftLock>) -> CacheResult<()> {
        match self {
            RegionAccess::ReadOnly(access) => access.evict(key),
            RegionAccess::NonstrictReadWrite(access) => access.evict(key),
            RegionAccess::ReadWrite(access) => access.release(key, lock),
            RegionAccess::Transactional(_) => Ok(()),
        }
    }

    /// Drop `key` because the entity was deleted
    pub fn remove(&self, key: &CacheKey, tx: TransactionId) -> CacheResult<()> {
        match self {
            RegionAccess::ReadOnly(access) => access.evict(key),
            RegionAccess::NonstrictReadWrite(access) => access.evict(key),
            RegionAccess::ReadWrite(access) => access.remove(key),
            RegionAccess::Transactional(access) => access.remove(key, tx),
        }
    }

    pub fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        self.region().remove(key).map(|_| ())
    }

    pub fn evict_all(&self) -> CacheResult<()> {
        self.region().clear()
    }

    /// Transaction outcome notification
    pub fn after_completion(&self, tx: TransactionId, committed: bool) -> CacheResult<()> {
        match self {
            RegionAccess::Transactional(access) => access.after_completion(tx, committed),
            _ => Ok(()),
        }
    }
}

fn read_item(region: &Region, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
    Ok(match region.read(key)? {
        Some(StoredValue::Item(item)) => Some(CacheEntry::new(item.state, item.version)),
        _ => None,
    })
}

pub(crate) fn new_item(region: &Region, entry: CacheEntry) -> StoredValue {
    StoredValue::Item(Item {
        state: entry.state,
        version: entry.version,
        timestamp: region.next_timestamp(),
    })
}

/// Shared put-from-load rule for strategies without soft locks
fn put_if_newer(
    region: &Region,
    key: &CacheKey,
    entry: CacheEntry,
    minimal_put: bool,
) -> CacheResult<bool> {
    let _guard = region.guard(key);
    let writeable = match region.read(key)? {
        None => true,
        Some(_) if minimal_put => false,
        Some(StoredValue::Item(existing)) => entry.supersedes(existing.version),
        Some(StoredValue::Lock(_)) => false,
    };

    if writeable {
        region.write(key, &new_item(region, entry))?;
    }
    Ok(writeable)
}
