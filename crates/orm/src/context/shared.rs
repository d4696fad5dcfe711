//! State shared between a context handle, its managed instances and its proxies
//!
//! Instances and proxies hold a `Weak` back-reference; the context owns them through its
//! maps. Every map access goes through one mutex that is never held across an await.

use super::EntityStatus;
use crate::backends::{DataAccess, DatabaseRow, SqlDialect};
use crate::config::CacheMode;
use crate::error::{OrmError, OrmResult};
use crate::flush::TransactionState;
use crate::influencers::LoadQueryInfluencers;
use crate::instance::ManagedEntity;
use crate::loader::dehydrate::{version_of, DehydratedState};
use crate::loader::hydrate::{self, Assembled};
use crate::metamodel::{
    CollectionDescriptor, CollectionKey, EntityDescriptor, EntityKey, Identifier, Loadable,
    Metamodel,
};
use crate::plan::{LoadPlan, PlanBuilder, PlanShape, Statement};
use crate::proxy::{EntityProxy, PersistentCollection};
use crate::unit::PersistenceUnit;
use keel_cache::Timestamp;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identity map entry
pub(crate) struct EntityEntry {
    pub entity: ManagedEntity,
    pub status: EntityStatus,
    /// Load-time state for dirty checking; `None` for read-only instances
    pub snapshot: Option<DehydratedState>,
    pub version: Option<u64>,
}

pub(crate) struct ContextState {
    pub entries: HashMap<EntityKey, EntityEntry>,
    pub proxies: HashMap<EntityKey, EntityProxy>,
    pub collections: HashMap<CollectionKey, PersistentCollection>,
    pub influencers: LoadQueryInfluencers,
    pub cache_mode: CacheMode,
    pub transaction: Option<TransactionState>,
    /// Start of the current unit of work, as seen by read-write regions
    pub tx_timestamp: Timestamp,
}

impl ContextState {
    /// Drop the entry for `key` and detach its proxy and owned collections
    pub(crate) fn detach(&mut self, key: &EntityKey) -> Option<EntityEntry> {
        let entry = self.entries.remove(key);
        if let Some(proxy) = self.proxies.remove(key) {
            proxy.detach();
        }
        let owned: Vec<CollectionKey> = self
            .collections
            .iter()
            .filter(|(owned, handle)| owned.owner == key.id && handle.descriptor().owner() == key.kind)
            .map(|(owned, _)| owned.clone())
            .collect();
        for owned in owned {
            if let Some(handle) = self.collections.remove(&owned) {
                handle.detach();
            }
        }
        entry
    }

    /// Detach every handle and forget every entry
    pub(crate) fn detach_all(&mut self) {
        for proxy in self.proxies.values() {
            proxy.detach();
        }
        for collection in self.collections.values() {
            collection.detach();
        }
        self.entries.clear();
        self.proxies.clear();
        self.collections.clear();
    }
}

/// Result of an identity-map lookup
pub(crate) enum Lookup {
    Managed(ManagedEntity),
    Removed,
    Missing,
}

pub struct ContextShared {
    id: u64,
    unit: Arc<PersistenceUnit>,
    data_access: Arc<dyn DataAccess>,
    closed: AtomicBool,
    state: Mutex<ContextState>,
}

impl ContextShared {
    pub(crate) fn new(id: u64, unit: Arc<PersistenceUnit>, data_access: Arc<dyn DataAccess>) -> Self {
        let state = ContextState {
            entries: HashMap::new(),
            proxies: HashMap::new(),
            collections: HashMap::new(),
            influencers: LoadQueryInfluencers::new(),
            cache_mode: unit.config().default_cache_mode,
            transaction: None,
            tx_timestamp: unit.regions().next_timestamp(),
        };
        Self {
            id,
            unit,
            data_access,
            closed: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn unit(&self) -> &Arc<PersistenceUnit> {
        &self.unit
    }

    pub(crate) fn metamodel(&self) -> &Metamodel {
        self.unit.metamodel()
    }

    pub(crate) fn data_access(&self) -> &Arc<dyn DataAccess> {
        &self.data_access
    }

    pub(crate) fn dialect(&self) -> SqlDialect {
        self.data_access.dialect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self, operation: impl FnOnce() -> String) -> OrmResult<()> {
        if self.is_closed() {
            Err(OrmError::closed(self.id, operation()))
        } else {
            Ok(())
        }
    }

    /// Lock the state of an open context. Close flips the flag under the same lock, so a
    /// registration either completes before close or fails.
    pub(crate) fn lock_open(
        &self,
        operation: impl FnOnce() -> String,
    ) -> OrmResult<MutexGuard<'_, ContextState>> {
        let state = self.state.lock();
        self.ensure_open(operation)?;
        Ok(state)
    }

    /// Lock regardless of the closed flag; transaction completion still has to run
    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock()
    }

    pub(crate) fn cache_mode(&self) -> CacheMode {
        self.state.lock().cache_mode
    }

    pub(crate) fn tx_timestamp(&self) -> Timestamp {
        self.state.lock().tx_timestamp
    }

    pub(crate) fn influencers(&self) -> LoadQueryInfluencers {
        self.state.lock().influencers.clone()
    }

    pub(crate) fn lookup(&self, key: &EntityKey) -> OrmResult<Lookup> {
        let state = self.lock_open(|| format!("look up {}", key))?;
        Ok(match state.entries.get(key) {
            Some(entry) if entry.status == EntityStatus::Removed => Lookup::Removed,
            Some(entry) => Lookup::Managed(entry.entity.clone()),
            None => Lookup::Missing,
        })
    }

    /// Managed (not removed) instance for `key`
    pub(crate) fn managed(&self, key: &EntityKey) -> Option<ManagedEntity> {
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| entry.status != EntityStatus::Removed)
            .map(|entry| entry.entity.clone())
    }

    /// The unique proxy for `key`, created on first request
    pub(crate) fn reference(self: &Arc<Self>, key: EntityKey) -> OrmResult<EntityProxy> {
        let mut state = self.lock_open(|| format!("create a proxy for {}", key))?;
        let managed = state
            .entries
            .get(&key)
            .filter(|entry| entry.status != EntityStatus::Removed)
            .map(|entry| entry.entity.clone());
        let proxy = state
            .proxies
            .entry(key.clone())
            .or_insert_with(|| EntityProxy::new(key, self))
            .clone();
        if let Some(entity) = managed {
            proxy.resolve(entity);
        }
        Ok(proxy)
    }

    /// The unique collection handle for `key`, created on first request
    pub(crate) fn collection(self: &Arc<Self>, key: &CollectionKey) -> OrmResult<PersistentCollection> {
        let descriptor = self.metamodel().collection(&key.role)?.clone();
        let mut state = self.lock_open(|| format!("access collection {}#{}", key.role, key.owner))?;
        Ok(state
            .collections
            .entry(key.clone())
            .or_insert_with(|| PersistentCollection::new(key.clone(), descriptor, self))
            .clone())
    }

    /// Register state read from the store or the cache.
    ///
    /// An existing entry wins: its instance is returned unchanged and the flag is `false`.
    pub(crate) fn register_loaded(
        self: &Arc<Self>,
        entity: &Arc<EntityDescriptor>,
        id: Identifier,
        state: DehydratedState,
        read_only: bool,
    ) -> OrmResult<(ManagedEntity, bool)> {
        let key = EntityKey::new(entity.name(), id.clone());
        let assembled = hydrate::assemble(entity, &id, &state)?;

        let mut context = self.lock_open(|| format!("register {}", key))?;
        if let Some(existing) = context.entries.get(&key) {
            return Ok((existing.entity.clone(), false));
        }

        self.adopt_handles(&mut context, &assembled)?;
        let managed = ManagedEntity::new(key.clone(), entity.clone(), self, assembled.instance);
        let version = version_of(entity, &state);
        context.entries.insert(
            key.clone(),
            EntityEntry {
                entity: managed.clone(),
                status: if read_only {
                    EntityStatus::ReadOnly
                } else {
                    EntityStatus::Managed
                },
                snapshot: (!read_only).then_some(state),
                version,
            },
        );
        if let Some(proxy) = context.proxies.get(&key) {
            proxy.resolve(managed.clone());
        }
        drop(context);

        self.unit.statistics().record_entity_load();
        Ok((managed, true))
    }

    /// Replace the state of an already managed instance (refresh)
    pub(crate) fn replace_loaded(
        self: &Arc<Self>,
        managed: &ManagedEntity,
        state: DehydratedState,
    ) -> OrmResult<()> {
        let entity = managed.descriptor().clone();
        let assembled = hydrate::assemble(&entity, managed.id(), &state)?;

        let mut context = self.lock_open(|| format!("refresh {}", managed.key()))?;
        self.adopt_handles(&mut context, &assembled)?;
        for collection in &assembled.collections {
            if let Some(handle) = context.collections.get(collection) {
                handle.reset();
            }
        }
        let entry = context
            .entries
            .get_mut(managed.key())
            .ok_or_else(|| not_managed(self.id, managed.key()))?;
        entry.version = version_of(&entity, &state);
        if entry.status != EntityStatus::ReadOnly {
            entry.snapshot = Some(state);
        }
        managed.replace_state(assembled.instance);
        Ok(())
    }

    /// Create the proxies and collection handles an assembled instance points at
    fn adopt_handles(self: &Arc<Self>, context: &mut ContextState, assembled: &Assembled) -> OrmResult<()> {
        for reference in &assembled.references {
            if !context.entries.contains_key(reference) && !context.proxies.contains_key(reference) {
                context
                    .proxies
                    .insert(reference.clone(), EntityProxy::new(reference.clone(), self));
            }
        }
        for collection in &assembled.collections {
            if !context.collections.contains_key(collection) {
                let descriptor = self.metamodel().collection(&collection.role)?.clone();
                context.collections.insert(
                    collection.clone(),
                    PersistentCollection::new(collection.clone(), descriptor, self),
                );
            }
        }
        Ok(())
    }

    /// Identifiers of uninitialized proxies of `entity`, for batch fetching
    pub(crate) fn pending_proxies(&self, entity: &EntityDescriptor, except: &Identifier, limit: usize) -> Vec<Identifier> {
        if limit == 0 {
            return Vec::new();
        }
        let state = self.state.lock();
        let mut ids: Vec<Identifier> = state
            .proxies
            .iter()
            .filter(|(key, proxy)| {
                key.kind == entity.name()
                    && &key.id != except
                    && proxy.is_pending()
                    && !state.entries.contains_key(*key)
            })
            .map(|(key, _)| key.id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit);
        ids
    }

    /// Owners of uninitialized collections of `collection`'s role, for batch fetching
    pub(crate) fn pending_collections(
        &self,
        collection: &CollectionDescriptor,
        except: &Identifier,
        limit: usize,
    ) -> Vec<Identifier> {
        if limit == 0 {
            return Vec::new();
        }
        let state = self.state.lock();
        let mut owners: Vec<Identifier> = state
            .collections
            .iter()
            .filter(|(key, handle)| {
                key.role == collection.role() && &key.owner != except && handle.is_pending()
            })
            .map(|(key, _)| key.owner.clone())
            .collect();
        owners.sort();
        owners.truncate(limit);
        owners
    }

    /// Standard plan when `loadable` is unaffected by the current influencers, a dedicated
    /// plan otherwise
    pub(crate) fn plan<L>(
        &self,
        loadable: &L,
        shape: PlanShape,
        build: impl Fn(PlanBuilder<'_>) -> OrmResult<LoadPlan>,
    ) -> OrmResult<Arc<LoadPlan>>
    where
        L: Loadable + ?Sized,
    {
        let influencers = self.influencers();
        let metamodel = self.metamodel();
        let dialect = self.dialect();
        if loadable.is_affected_by_influencers(&influencers) {
            return build(PlanBuilder::new(metamodel, &influencers, dialect)).map(Arc::new);
        }
        let standard = LoadQueryInfluencers::new();
        self.unit
            .plans()
            .get_or_build(loadable.root_path_name(), shape, dialect, || {
                build(PlanBuilder::new(metamodel, &standard, dialect))
            })
    }

    pub(crate) async fn fetch(&self, statement: &Statement) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        self.ensure_open(|| "execute a query".to_string())?;
        tracing::debug!("Context {} fetch: {}", self.id, statement.sql);
        self.unit.statistics().record_statement();
        self.data_access.fetch_all(statement).await
    }

    pub(crate) async fn execute(&self, statement: &Statement) -> OrmResult<u64> {
        self.ensure_open(|| "execute a statement".to_string())?;
        tracing::debug!("Context {} execute: {}", self.id, statement.sql);
        self.unit.statistics().record_statement();
        self.data_access.execute(statement).await
    }

    /// Mark the context closed and invalidate every handle it gave out.
    ///
    /// Returns `false` when it was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for proxy in state.proxies.values() {
            proxy.invalidate();
        }
        for collection in state.collections.values() {
            collection.invalidate();
        }
        state.entries.clear();
        state.proxies.clear();
        state.collections.clear();
        true
    }
}

pub(crate) fn not_managed(context: u64, key: &EntityKey) -> OrmError {
    OrmError::Configuration(format!(
        "{} is not managed by persistence context {}",
        key, context
    ))
}
