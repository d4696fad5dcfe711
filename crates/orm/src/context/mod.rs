//! Persistence context - the first-level cache
//!
//! One context per unit of work. It guarantees at most one managed instance and at most one
//! proxy per `(kind, id)`, both referring to the same identity, and owns the snapshots that
//! dirty checking compares against on flush.

pub(crate) mod shared;

pub(crate) use shared::{not_managed, ContextShared, Lookup};

use crate::backends::DataAccess;
use crate::config::CacheMode;
use crate::error::{OrmError, OrmResult};
use crate::flush::{self, FlushSummary};
use crate::influencers::{EntityGraph, FilterInstance, LoadQueryInfluencers};
use crate::instance::{EntityInstance, ManagedEntity};
use crate::loader::{self, dehydrate};
use crate::metamodel::{EntityDescriptor, EntityKey, Identifier};
use crate::plan::Criteria;
use crate::proxy::EntityProxy;
use crate::unit::PersistenceUnit;
use std::fmt;
use std::sync::Arc;

/// Status of an instance relative to a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Managed,
    /// Managed without a snapshot; never dirty-checked
    ReadOnly,
    /// Scheduled for deletion on the next flush
    Removed,
    /// Not (or no longer) held by the context
    Detached,
}

/// What a context holds for a key
#[derive(Debug, Clone)]
pub enum EntitySlot {
    Managed(ManagedEntity),
    Proxy(EntityProxy),
}

impl EntitySlot {
    pub fn key(&self) -> &EntityKey {
        match self {
            EntitySlot::Managed(entity) => entity.key(),
            EntitySlot::Proxy(proxy) => proxy.key(),
        }
    }

    /// Resolve to the managed instance, initializing a proxy if necessary
    pub async fn into_entity(self) -> OrmResult<ManagedEntity> {
        match self {
            EntitySlot::Managed(entity) => Ok(entity),
            EntitySlot::Proxy(proxy) => proxy.initialize().await,
        }
    }
}

/// Handle to one persistence context
pub struct PersistenceContext {
    shared: Arc<ContextShared>,
}

impl fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("id", &self.shared.id())
            .field("open", &self.is_open())
            .finish()
    }
}

impl PersistenceContext {
    pub(crate) fn open(id: u64, unit: Arc<PersistenceUnit>, data_access: Arc<dyn DataAccess>) -> Self {
        tracing::info!("Opened persistence context {}", id);
        Self {
            shared: Arc::new(ContextShared::new(id, unit, data_access)),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    pub fn unit(&self) -> &Arc<PersistenceUnit> {
        self.shared.unit()
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }

    fn key_for(&self, kind: &str, id: Identifier) -> OrmResult<(Arc<EntityDescriptor>, EntityKey)> {
        let entity = self.shared.metamodel().entity(kind)?.clone();
        if id.kind() != entity.identifier().kind {
            return Err(OrmError::Configuration(format!(
                "{} is identified by {:?} values, got {}",
                kind,
                entity.identifier().kind,
                id
            )));
        }
        let key = EntityKey::new(entity.name(), id);
        Ok((entity, key))
    }

    /// Load an instance by identifier; `None` when no row exists
    pub async fn find(&self, kind: &str, id: impl Into<Identifier>) -> OrmResult<Option<ManagedEntity>> {
        let (_, key) = self.key_for(kind, id.into())?;
        self.shared.ensure_open(|| format!("load {}", key))?;
        loader::load_entity(&self.shared, &key, false).await
    }

    /// Load an instance without a snapshot; it is never dirty-checked
    pub async fn find_read_only(
        &self,
        kind: &str,
        id: impl Into<Identifier>,
    ) -> OrmResult<Option<ManagedEntity>> {
        let (_, key) = self.key_for(kind, id.into())?;
        self.shared.ensure_open(|| format!("load {}", key))?;
        loader::load_entity(&self.shared, &key, true).await
    }

    /// Load several instances of one kind, in request order
    pub async fn find_many<I>(&self, kind: &str, ids: I) -> OrmResult<Vec<Option<ManagedEntity>>>
    where
        I: IntoIterator,
        I::Item: Into<Identifier>,
    {
        let mut keys = Vec::new();
        for id in ids {
            keys.push(self.key_for(kind, id.into())?.1.id);
        }
        self.shared.ensure_open(|| format!("load {} instances of {}", keys.len(), kind))?;
        loader::load_many(&self.shared, kind, &keys, false).await
    }

    /// Uninitialized proxy for `(kind, id)`; no statement runs until it is accessed
    pub fn get_reference(&self, kind: &str, id: impl Into<Identifier>) -> OrmResult<EntityProxy> {
        let (_, key) = self.key_for(kind, id.into())?;
        self.shared.reference(key)
    }

    /// The managed instance when present, otherwise the unique proxy
    pub fn get_or_create(&self, kind: &str, id: impl Into<Identifier>) -> OrmResult<EntitySlot> {
        let (_, key) = self.key_for(kind, id.into())?;
        match self.shared.lookup(&key)? {
            Lookup::Managed(entity) => Ok(EntitySlot::Managed(entity)),
            _ => Ok(EntitySlot::Proxy(self.shared.reference(key)?)),
        }
    }

    /// Register an instance whose state the caller already holds.
    ///
    /// Fails with a duplicate-identity error when the context already has an entry for the key.
    pub fn register_managed(
        &self,
        kind: &str,
        id: impl Into<Identifier>,
        instance: EntityInstance,
    ) -> OrmResult<ManagedEntity> {
        let (entity, key) = self.key_for(kind, id.into())?;
        let state = dehydrate::dehydrate(&entity, &instance);
        let (managed, created) = self.shared.register_loaded(&entity, key.id.clone(), state, false)?;
        if !created {
            return Err(OrmError::DuplicateIdentity {
                kind: key.kind,
                id: key.id.to_string(),
                count: 2,
            });
        }
        Ok(managed)
    }

    /// Whether a non-removed instance is registered for `(kind, id)`
    pub fn is_managed(&self, kind: &str, id: impl Into<Identifier>) -> OrmResult<bool> {
        let key = EntityKey::new(kind, id);
        let state = self.shared.lock_open(|| format!("look up {}", key))?;
        Ok(state
            .entries
            .get(&key)
            .is_some_and(|entry| entry.status != EntityStatus::Removed))
    }

    /// Status of `entity` in this context
    pub fn status(&self, entity: &ManagedEntity) -> EntityStatus {
        let state = self.shared.lock();
        match state.entries.get(entity.key()) {
            Some(entry) if entry.entity.ptr_eq(entity) && !self.shared.is_closed() => entry.status,
            _ => EntityStatus::Detached,
        }
    }

    /// Whether `entity` is this context's instance for its key
    pub fn contains(&self, entity: &ManagedEntity) -> bool {
        !matches!(self.status(entity), EntityStatus::Detached | EntityStatus::Removed)
    }

    /// Remove `(kind, id)` from the context, detaching its proxy and owned collections.
    ///
    /// Pending changes of the instance are discarded.
    pub fn evict(&self, kind: &str, id: impl Into<Identifier>) -> OrmResult<bool> {
        let key = EntityKey::new(kind, id);
        let mut state = self.shared.lock_open(|| format!("evict {}", key))?;
        let evicted = state.detach(&key).is_some();
        if evicted {
            tracing::debug!("Evicted {} from context {}", key, self.id());
        }
        Ok(evicted)
    }

    /// Detach everything the context holds; the context stays open
    pub fn clear(&self) -> OrmResult<()> {
        let mut state = self.shared.lock_open(|| "clear".to_string())?;
        state.detach_all();
        Ok(())
    }

    pub fn entity_count(&self) -> OrmResult<usize> {
        let state = self.shared.lock_open(|| "count entities".to_string())?;
        Ok(state.entries.len())
    }

    /// Run a criteria query under the enabled filters
    pub async fn query(&self, criteria: &Criteria) -> OrmResult<Vec<ManagedEntity>> {
        self.shared
            .ensure_open(|| format!("query {}", criteria.kind()))?;
        loader::query(&self.shared, criteria).await
    }

    /// Overwrite the state of `entity` with the store's current row
    pub async fn refresh(&self, entity: &ManagedEntity) -> OrmResult<()> {
        self.shared.ensure_open(|| format!("refresh {}", entity.key()))?;
        loader::refresh(&self.shared, entity).await
    }

    /// Switch an instance between read-only and dirty-checked
    pub fn set_read_only(&self, entity: &ManagedEntity, read_only: bool) -> OrmResult<()> {
        let mut state = self
            .shared
            .lock_open(|| format!("change read-only state of {}", entity.key()))?;
        let entry = state
            .entries
            .get_mut(entity.key())
            .filter(|entry| entry.entity.ptr_eq(entity) && entry.status != EntityStatus::Removed)
            .ok_or_else(|| not_managed(self.id(), entity.key()))?;

        if read_only {
            entry.status = EntityStatus::ReadOnly;
            entry.snapshot = None;
        } else if entry.status == EntityStatus::ReadOnly {
            entry.status = EntityStatus::Managed;
            entry.snapshot = Some(entity.with_state(|instance| {
                dehydrate::dehydrate(entity.descriptor(), instance)
            }));
        }
        Ok(())
    }

    /// Schedule `entity` for deletion on the next flush
    pub fn remove(&self, entity: &ManagedEntity) -> OrmResult<()> {
        let mut state = self.shared.lock_open(|| format!("remove {}", entity.key()))?;
        let entry = state
            .entries
            .get_mut(entity.key())
            .filter(|entry| entry.entity.ptr_eq(entity))
            .ok_or_else(|| not_managed(self.id(), entity.key()))?;
        entry.status = EntityStatus::Removed;
        Ok(())
    }

    /// Write pending changes; runs in its own transaction when none is active
    pub async fn flush(&self) -> OrmResult<FlushSummary> {
        flush::flush(&self.shared).await
    }

    pub async fn begin(&self) -> OrmResult<()> {
        flush::begin(&self.shared).await
    }

    /// Flush, commit, then complete the cache side of the transaction
    pub async fn commit(&self) -> OrmResult<FlushSummary> {
        flush::commit(&self.shared).await
    }

    pub async fn rollback(&self) -> OrmResult<()> {
        flush::rollback(&self.shared).await
    }

    pub fn in_transaction(&self) -> bool {
        self.shared.lock().transaction.is_some()
    }

    /// Enable a filter defined in the metamodel
    pub fn enable_filter(&self, filter: FilterInstance) -> OrmResult<()> {
        let definition = self.shared.metamodel().filter(filter.name())?;
        filter.validate(definition)?;
        let mut state = self.shared.lock_open(|| format!("enable filter {}", filter.name()))?;
        state.influencers.enable_filter(filter);
        Ok(())
    }

    /// Whether `name` was enabled
    pub fn disable_filter(&self, name: &str) -> OrmResult<bool> {
        let mut state = self.shared.lock_open(|| format!("disable filter {}", name))?;
        Ok(state.influencers.disable_filter(name))
    }

    pub fn enable_fetch_profile(&self, name: &str) -> OrmResult<()> {
        let profile = self.shared.metamodel().fetch_profile(name)?.clone();
        let mut state = self.shared.lock_open(|| format!("enable fetch profile {}", name))?;
        state.influencers.enable_fetch_profile(profile);
        Ok(())
    }

    pub fn disable_fetch_profile(&self, name: &str) -> OrmResult<bool> {
        let mut state = self.shared.lock_open(|| format!("disable fetch profile {}", name))?;
        Ok(state.influencers.disable_fetch_profile(name))
    }

    /// Install (or clear) the entity graph; its nodes must be associations of its root
    pub fn set_entity_graph(&self, graph: Option<EntityGraph>) -> OrmResult<()> {
        if let Some(graph) = &graph {
            let root = self.shared.metamodel().entity(graph.root())?;
            for node in graph.attribute_nodes() {
                if !root.lookup(node)?.is_association() {
                    return Err(OrmError::Configuration(format!(
                        "Entity graph node {}.{} is not an association",
                        graph.root(),
                        node
                    )));
                }
            }
        }
        let mut state = self.shared.lock_open(|| "set the entity graph".to_string())?;
        state.influencers.set_entity_graph(graph);
        Ok(())
    }

    pub fn influencers(&self) -> LoadQueryInfluencers {
        self.shared.influencers()
    }

    pub fn set_cache_mode(&self, mode: CacheMode) -> OrmResult<()> {
        let mut state = self.shared.lock_open(|| format!("switch to cache mode {:?}", mode))?;
        state.cache_mode = mode;
        Ok(())
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.shared.cache_mode()
    }

    /// Close the context. An active transaction is rolled back first; every proxy and
    /// collection handed out fails from now on. Closing twice is a no-op.
    pub async fn close(&self) -> OrmResult<()> {
        if self.shared.is_closed() {
            return Ok(());
        }
        let rolled_back = if self.in_transaction() {
            flush::rollback(&self.shared).await
        } else {
            Ok(())
        };
        if self.shared.close() {
            tracing::info!("Closed persistence context {}", self.id());
        }
        rolled_back
    }
}
