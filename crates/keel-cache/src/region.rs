//! Cache regions and the factory that owns them
//!
//! A [`Region`] wraps one [`RegionStorage`] and adds what the concurrency strategies need
//! on top of plain key-value access: typed (de)serialization of stored values, striped
//! per-key guards for read-modify-write sequences, shared timestamps and counters.

use crate::strategy::{
    AccessType, NonstrictReadWriteAccess, ReadOnlyAccess, ReadWriteAccess, RegionAccess,
    TransactionalAccess,
};
use crate::{
    CacheError, CacheKey, CacheResult, MemoryStorage, RegionConfig, RegionStats, RegionStorage,
    Timestamp, Timestamper,
};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const KEY_LOCK_STRIPES: usize = 64;

/// Value as persisted in region storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum StoredValue {
    Item(Item),
    Lock(SoftLockEntry),
}

/// Readable cached state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Item {
    pub state: serde_json::Value,
    pub version: Option<u64>,
    pub timestamp: Timestamp,
}

/// Marker left in place of an item while writers hold it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SoftLockEntry {
    pub lock_id: u64,
    pub timeout: Timestamp,
    pub unlock_timestamp: Timestamp,
    pub multiplicity: u32,
    pub concurrent: bool,
    pub version: Option<u64>,
}

impl SoftLockEntry {
    /// Whether a load started at `tx_timestamp` may replace this lock with `version`
    pub fn is_writeable(&self, tx_timestamp: Timestamp, version: Option<u64>) -> bool {
        if tx_timestamp > self.timeout {
            return true;
        }
        if self.multiplicity > 0 {
            return false;
        }
        match (self.version, version) {
            (Some(locked), Some(incoming)) => locked < incoming,
            _ => tx_timestamp > self.unlock_timestamp,
        }
    }
}

#[derive(Debug, Default)]
struct RegionCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    stale_puts: AtomicU64,
}

/// A named cache region
pub struct Region {
    name: String,
    storage: Arc<dyn RegionStorage>,
    config: RegionConfig,
    timestamper: Arc<Timestamper>,
    key_locks: Vec<Mutex<()>>,
    next_lock_id: AtomicU64,
    counters: RegionCounters,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("entries", &self.storage.len())
            .finish()
    }
}

impl Region {
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn RegionStorage>,
        config: RegionConfig,
        timestamper: Arc<Timestamper>,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            config,
            timestamper,
            key_locks: (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            next_lock_id: AtomicU64::new(1),
            counters: RegionCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn next_timestamp(&self) -> Timestamp {
        self.timestamper.next()
    }

    pub(crate) fn lock_deadline(&self) -> Timestamp {
        self.timestamper.deadline(self.config.lock_timeout)
    }

    pub(crate) fn next_lock_id(&self) -> u64 {
        self.next_lock_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Serialize read-modify-write sequences on `key`.
    ///
    /// Guards are striped, so unrelated keys only contend when they hash to the same stripe.
    pub(crate) fn guard(&self, key: &CacheKey) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.key_locks.len();
        self.key_locks[stripe].lock()
    }

    pub(crate) fn read(&self, key: &CacheKey) -> CacheResult<Option<StoredValue>> {
        match self.storage.get(&key.storage_key())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn write(&self, key: &CacheKey, value: &StoredValue) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.storage.put(&key.storage_key(), bytes)
    }

    pub(crate) fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        self.storage.remove(&key.storage_key())
    }

    pub fn clear(&self) -> CacheResult<()> {
        self.storage.clear()
    }

    pub fn contains(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(matches!(self.read(key)?, Some(StoredValue::Item(_))))
    }

    pub(crate) fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self) {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_put(&self) {
        self.counters.stale_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RegionStats {
        RegionStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            stale_puts: self.counters.stale_puts.load(Ordering::Relaxed),
            entries: self.storage.len() as u64,
        }
    }
}

/// Builds regions and hands out strategy-bound access to them.
///
/// All regions of one factory share a [`Timestamper`], so lock deadlines and transaction
/// timestamps are comparable across regions.
pub struct RegionFactory {
    timestamper: Arc<Timestamper>,
    accesses: DashMap<String, Arc<RegionAccess>>,
}

impl Default for RegionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionFactory {
    pub fn new() -> Self {
        Self {
            timestamper: Arc::new(Timestamper::new()),
            accesses: DashMap::new(),
        }
    }

    pub fn next_timestamp(&self) -> Timestamp {
        self.timestamper.next()
    }

    /// Build (or return the existing) region `name` backed by in-memory storage
    pub fn build_access(
        &self,
        name: &str,
        access_type: AccessType,
        config: RegionConfig,
    ) -> CacheResult<Arc<RegionAccess>> {
        let storage: Arc<dyn RegionStorage> = Arc::new(MemoryStorage::new(&config));
        self.build_access_with_storage(name, access_type, config, storage)
    }

    /// Build (or return the existing) region `name` on top of a caller supplied storage
    pub fn build_access_with_storage(
        &self,
        name: &str,
        access_type: AccessType,
        config: RegionConfig,
        storage: Arc<dyn RegionStorage>,
    ) -> CacheResult<Arc<RegionAccess>> {
        if let Some(existing) = self.accesses.get(name) {
            if existing.access_type() != access_type {
                return Err(CacheError::Configuration(format!(
                    "Region '{}' already configured as {} (requested {})",
                    name,
                    existing.access_type(),
                    access_type
                )));
            }
            return Ok(existing.clone());
        }

        let region = Arc::new(Region::new(
            name,
            storage,
            config,
            self.timestamper.clone(),
        ));
        let access = Arc::new(match access_type {
            AccessType::ReadOnly => RegionAccess::ReadOnly(ReadOnlyAccess::new(region)),
            AccessType::NonstrictReadWrite => {
                RegionAccess::NonstrictReadWrite(NonstrictReadWriteAccess::new(region))
            }
            AccessType::ReadWrite => RegionAccess::ReadWrite(ReadWriteAccess::new(region)),
            AccessType::Transactional => {
                RegionAccess::Transactional(TransactionalAccess::new(region))
            }
        });

        tracing::debug!("Built {} cache region '{}'", access_type, name);

        let entry = self.accesses.entry(name.to_string()).or_insert(access);
        Ok(entry.value().clone())
    }

    pub fn access(&self, name: &str) -> Option<Arc<RegionAccess>> {
        self.accesses.get(name).map(|entry| entry.value().clone())
    }

    pub fn region_names(&self) -> Vec<String> {
        self.accesses.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Evict every entry from every region
    pub fn evict_all(&self) -> CacheResult<()> {
        for entry in self.accesses.iter() {
            entry.value().evict_all()?;
        }
        Ok(())
    }

    pub fn stats(&self, name: &str) -> Option<RegionStats> {
        self.access(name).map(|access| access.region().stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn region() -> Region {
        Region::new(
            "Order",
            Arc::new(MemoryStorage::new(&RegionConfig::default())),
            RegionConfig::default(),
            Arc::new(Timestamper::new()),
        )
    }

    #[test]
    fn test_region_stores_typed_values() {
        let region = region();
        let key = CacheKey::new("Order", "i:1");
        let item = StoredValue::Item(Item {
            state: json!(["open"]),
            version: Some(3),
            timestamp: region.next_timestamp(),
        });

        region.write(&key, &item).unwrap();
        assert_eq!(region.read(&key).unwrap(), Some(item));
        assert!(region.contains(&key).unwrap());

        assert!(region.remove(&key).unwrap());
        assert!(region.read(&key).unwrap().is_none());
    }

    #[test]
    fn test_unlocked_soft_lock_writeability() {
        let lock = SoftLockEntry {
            lock_id: 1,
            timeout: 1_000,
            unlock_timestamp: 500,
            multiplicity: 0,
            concurrent: false,
            version: None,
        };
        assert!(!lock.is_writeable(400, None));
        assert!(lock.is_writeable(600, None));
        assert!(lock.is_writeable(2_000, None));

        let held = SoftLockEntry {
            multiplicity: 1,
            ..lock.clone()
        };
        assert!(!held.is_writeable(600, None));
        assert!(held.is_writeable(2_000, None));

        let versioned = SoftLockEntry {
            version: Some(4),
            ..lock
        };
        assert!(versioned.is_writeable(100, Some(5)));
        assert!(!versioned.is_writeable(900, Some(4)));
    }

    #[test]
    fn test_factory_reuses_regions_and_rejects_conflicts() {
        let factory = RegionFactory::new();
        let first = factory
            .build_access("Order", AccessType::ReadWrite, RegionConfig::default())
            .unwrap();
        let second = factory
            .build_access("Order", AccessType::ReadWrite, RegionConfig::default())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let conflict =
            factory.build_access("Order", AccessType::ReadOnly, RegionConfig::default());
        assert!(matches!(conflict, Err(CacheError::Configuration(_))));
        assert_eq!(factory.region_names(), vec!["Order".to_string()]);
    }
}
