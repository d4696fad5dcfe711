//! In-memory region storage with TTL and oldest-first eviction

use crate::{CacheResult, RegionConfig, RegionStorage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Entry in the memory storage
#[derive(Debug, Clone)]
struct StoredBytes {
    data: Vec<u8>,
    created_at: Instant,
    expires_at: Option<Instant>,
}

impl StoredBytes {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            data,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |exp| Instant::now() > exp)
    }
}

/// Region storage kept in process memory
#[derive(Debug)]
pub struct MemoryStorage {
    entries: DashMap<String, StoredBytes>,
    max_entries: Option<usize>,
    ttl: Option<Duration>,
    evictions: AtomicU64,
}

impl MemoryStorage {
    pub fn new(config: &RegionConfig) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: config.max_entries,
            ttl: config.ttl,
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of entries dropped to honour `max_entries`
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    /// Evict the oldest entries until there is room for one more
    fn make_room(&self) {
        let Some(max_entries) = self.max_entries else {
            return;
        };
        if self.entries.len() < max_entries {
            return;
        }

        self.purge_expired();

        while self.entries.len() >= max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().created_at)
                .map(|entry| entry.key().clone());

            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }
}

impl RegionStorage for MemoryStorage {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.data.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> CacheResult<()> {
        if !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries
            .insert(key.to_string(), StoredBytes::new(value, self.ttl));
        Ok(())
    }

    fn remove(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn clear(&self) -> CacheResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_basic_operations() {
        let storage = MemoryStorage::new(&RegionConfig::default());

        storage.put("Order#i:1", b"value".to_vec()).unwrap();
        assert_eq!(storage.get("Order#i:1").unwrap(), Some(b"value".to_vec()));
        assert_eq!(storage.len(), 1);

        assert!(storage.remove("Order#i:1").unwrap());
        assert!(!storage.remove("Order#i:1").unwrap());
        assert!(storage.get("Order#i:1").unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_memory_storage_ttl() {
        let config = RegionConfig::default().with_ttl(Duration::from_millis(20));
        let storage = MemoryStorage::new(&config);

        storage.put("k", b"v".to_vec()).unwrap();
        assert!(storage.get("k").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(storage.get("k").unwrap().is_none());
        assert_eq!(storage.len(), 0);
    }

    #[test]
    fn test_memory_storage_evicts_oldest() {
        let config = RegionConfig::default().max_entries_limit(2);
        let storage = MemoryStorage::new(&config);

        storage.put("a", b"1".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        storage.put("b", b"2".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        storage.put("c", b"3".to_vec()).unwrap();

        assert_eq!(storage.len(), 2);
        assert!(storage.get("a").unwrap().is_none());
        assert!(storage.get("b").unwrap().is_some());
        assert!(storage.get("c").unwrap().is_some());
        assert_eq!(storage.evictions(), 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let config = RegionConfig::default().max_entries_limit(1);
        let storage = MemoryStorage::new(&config);

        storage.put("a", b"1".to_vec()).unwrap();
        storage.put("a", b"2".to_vec()).unwrap();
        assert_eq!(storage.get("a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(storage.evictions(), 0);
    }
}
