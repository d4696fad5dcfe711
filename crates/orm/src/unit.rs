//! Persistence unit
//!
//! Everything that outlives a single unit of work: the metamodel, configuration, cache
//! regions, the standard plan cache, statistics and the default data access. Contexts are
//! opened from a unit and share all of it.

use crate::backends::DataAccess;
use crate::config::PersistenceConfig;
use crate::context::PersistenceContext;
use crate::error::OrmResult;
use crate::metamodel::{CollectionDescriptor, EntityDescriptor, Metamodel};
use crate::plan::PlanCache;
use crate::stats::Statistics;
use keel_cache::{RegionAccess, RegionConfig, RegionFactory};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct PersistenceUnit {
    metamodel: Arc<Metamodel>,
    config: PersistenceConfig,
    regions: Arc<RegionFactory>,
    data_access: Arc<dyn DataAccess>,
    plans: PlanCache,
    statistics: Statistics,
    next_context: AtomicU64,
}

impl PersistenceUnit {
    /// Build a unit with its own region factory
    pub fn new(
        metamodel: Metamodel,
        config: PersistenceConfig,
        data_access: Arc<dyn DataAccess>,
    ) -> OrmResult<Arc<Self>> {
        Self::with_regions(
            Arc::new(metamodel),
            config,
            data_access,
            Arc::new(RegionFactory::new()),
        )
    }

    /// Build a unit on top of an existing region factory.
    ///
    /// Units sharing a factory share cache regions, as separate processes would share a
    /// distributed cache.
    pub fn with_regions(
        metamodel: Arc<Metamodel>,
        config: PersistenceConfig,
        data_access: Arc<dyn DataAccess>,
        regions: Arc<RegionFactory>,
    ) -> OrmResult<Arc<Self>> {
        config.validate()?;

        if config.second_level_cache_enabled {
            let region_config = RegionConfig::default().with_lock_timeout(config.lock_timeout());
            for entity in metamodel.entities() {
                if let (Some(settings), Some(region)) = (entity.cache(), entity.cache_region()) {
                    regions.build_access(region, settings.access, region_config.clone())?;
                }
            }
            for collection in metamodel.collections() {
                if let (Some(settings), Some(region)) =
                    (collection.cache(), collection.cache_region())
                {
                    regions.build_access(region, settings.access, region_config.clone())?;
                }
            }
        }

        tracing::info!(
            "Persistence unit ready: {} entities, {} collections, {} cache regions",
            metamodel.entities().count(),
            metamodel.collections().count(),
            regions.region_names().len()
        );

        Ok(Arc::new(Self {
            metamodel,
            statistics: Statistics::new(config.statistics_enabled),
            config,
            regions,
            data_access,
            plans: PlanCache::new(),
            next_context: AtomicU64::new(1),
        }))
    }

    /// Open a context on the unit's data access
    pub fn open_context(self: &Arc<Self>) -> PersistenceContext {
        self.open_context_with(self.data_access.clone())
    }

    /// Open a context on a dedicated data access, e.g. one connection per unit of work
    pub fn open_context_with(self: &Arc<Self>, data_access: Arc<dyn DataAccess>) -> PersistenceContext {
        let id = self.next_context.fetch_add(1, Ordering::Relaxed);
        PersistenceContext::open(id, self.clone(), data_access)
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn regions(&self) -> &Arc<RegionFactory> {
        &self.regions
    }

    pub fn plans(&self) -> &PlanCache {
        &self.plans
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Region of a cached entity kind, when caching is enabled
    pub fn entity_region(&self, entity: &EntityDescriptor) -> Option<Arc<RegionAccess>> {
        if !self.config.second_level_cache_enabled {
            return None;
        }
        entity.cache_region().and_then(|name| self.regions.access(name))
    }

    /// Region of a cached collection role, when caching is enabled
    pub fn collection_region(&self, collection: &CollectionDescriptor) -> Option<Arc<RegionAccess>> {
        if !self.config.second_level_cache_enabled {
            return None;
        }
        collection
            .cache_region()
            .and_then(|name| self.regions.access(name))
    }

    /// Collections of `collection` initialized per statement
    pub(crate) fn collection_batch_size(&self, collection: &CollectionDescriptor) -> usize {
        collection
            .batch_fetch_size()
            .unwrap_or(self.config.default_batch_fetch_size)
            .max(1)
    }

    /// Proxies of `entity` initialized per statement
    pub(crate) fn entity_batch_size(&self, entity: &EntityDescriptor) -> usize {
        entity
            .batch_fetch_size()
            .unwrap_or(self.config.default_batch_fetch_size)
            .max(1)
    }
}
