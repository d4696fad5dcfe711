//! Persistence unit statistics
//!
//! Counters are shared by every context of a unit and updated with relaxed atomics. When
//! statistics are disabled the `record_*` calls are no-ops.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Statistics {
    enabled: bool,
    entity_loads: AtomicU64,
    entity_fetches: AtomicU64,
    collection_loads: AtomicU64,
    collection_fetches: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_puts: AtomicU64,
    statements: AtomicU64,
    entity_updates: AtomicU64,
    entity_deletes: AtomicU64,
    flushes: AtomicU64,
    optimistic_failures: AtomicU64,
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Instances materialized from any source
    pub entity_loads: u64,
    /// Instances materialized from store rows
    pub entity_fetches: u64,
    pub collection_loads: u64,
    pub collection_fetches: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_puts: u64,
    /// Statements sent to the data-access layer
    pub statements: u64,
    pub entity_updates: u64,
    pub entity_deletes: u64,
    pub flushes: u64,
    pub optimistic_failures: u64,
}

impl StatisticsSnapshot {
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

macro_rules! recorders {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $method(&self) {
                if self.enabled {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            }
        )*
    };
}

impl Statistics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    recorders! {
        record_entity_load => entity_loads,
        record_entity_fetch => entity_fetches,
        record_collection_load => collection_loads,
        record_collection_fetch => collection_fetches,
        record_cache_hit => cache_hits,
        record_cache_miss => cache_misses,
        record_cache_put => cache_puts,
        record_statement => statements,
        record_entity_update => entity_updates,
        record_entity_delete => entity_deletes,
        record_flush => flushes,
        record_optimistic_failure => optimistic_failures,
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            entity_loads: self.entity_loads.load(Ordering::Relaxed),
            entity_fetches: self.entity_fetches.load(Ordering::Relaxed),
            collection_loads: self.collection_loads.load(Ordering::Relaxed),
            collection_fetches: self.collection_fetches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_puts: self.cache_puts.load(Ordering::Relaxed),
            statements: self.statements.load(Ordering::Relaxed),
            entity_updates: self.entity_updates.load(Ordering::Relaxed),
            entity_deletes: self.entity_deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            optimistic_failures: self.optimistic_failures.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        for counter in [
            &self.entity_loads,
            &self.entity_fetches,
            &self.collection_loads,
            &self.collection_fetches,
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_puts,
            &self.statements,
            &self.entity_updates,
            &self.entity_deletes,
            &self.flushes,
            &self.optimistic_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Statistics::new(true);
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_statement();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.statements, 1);
        assert!((snapshot.cache_hit_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);

        stats.clear();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_disabled_statistics_do_not_count() {
        let stats = Statistics::new(false);
        stats.record_entity_load();
        assert_eq!(stats.snapshot().entity_loads, 0);
        assert_eq!(stats.snapshot().cache_hit_ratio(), 0.0);
    }
}
