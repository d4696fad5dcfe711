//! Entity and collection loading
//!
//! Every load resolves through three tiers: the context's identity map, the second-level
//! cache region of the loadable, then the store. Hydrated instances are registered with
//! the context as soon as their row is read, before any association is followed, so cycles
//! in the object graph resolve to the entry that is already there.
//!
//! Eager associations discovered while hydrating are queued on a [`Pending`] worklist and
//! drained after the triggering load, which keeps the load path iterative.

pub mod dehydrate;
pub mod hydrate;

use crate::config::CacheMode;
use crate::context::{ContextShared, Lookup};
use crate::error::{OrmError, OrmResult};
use crate::instance::ManagedEntity;
use crate::metamodel::{
    AttributeType, CollectionDescriptor, CollectionKey, EntityDescriptor, EntityKey, FetchMode,
    Identifier, Loadable, Metamodel,
};
use crate::plan::{Criteria, EntityProjection, LoadPlan, PlanBuilder, PlanShape};
use crate::backends::DatabaseRow;
use dehydrate::{DehydratedState, DehydratedValue};
use keel_cache::CacheKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

pub(crate) fn entity_cache_key(entity: &EntityDescriptor, id: &Identifier) -> CacheKey {
    CacheKey::new(entity.name(), id.cache_id())
}

pub(crate) fn collection_cache_key(collection: &CollectionDescriptor, owner: &Identifier) -> CacheKey {
    CacheKey::new(collection.role(), owner.cache_id())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Work {
    Entity(EntityKey),
    Collection(CollectionKey),
}

/// Eager associations waiting to be loaded
#[derive(Debug, Default)]
pub(crate) struct Pending {
    queue: VecDeque<Work>,
    queued: HashSet<Work>,
}

impl Pending {
    fn push(&mut self, work: Work) {
        if self.queued.insert(work.clone()) {
            self.queue.push_back(work);
        }
    }

    fn pop(&mut self) -> Option<Work> {
        self.queue.pop_front()
    }

    /// Queue the eager associations of an instance about to be registered
    fn eager_associations(
        &mut self,
        metamodel: &Metamodel,
        entity: &EntityDescriptor,
        id: &Identifier,
        state: &DehydratedState,
    ) -> OrmResult<()> {
        for (attribute, value) in entity.attributes().iter().zip(state) {
            match (attribute.attribute_type(), value) {
                (
                    AttributeType::ManyToOne {
                        target,
                        fetch: FetchMode::Eager { .. },
                    },
                    DehydratedValue::Reference(Some(target_id)),
                ) => self.push(Work::Entity(EntityKey::new(target.clone(), target_id.clone()))),
                (AttributeType::OneToMany { role }, _) => {
                    if !metamodel.collection(role)?.fetch_mode().is_lazy() {
                        self.push(Work::Collection(CollectionKey::new(role.clone(), id.clone())));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

async fn drain(context: &Arc<ContextShared>, pending: &mut Pending) -> OrmResult<()> {
    while let Some(work) = pending.pop() {
        match work {
            Work::Entity(key) => {
                resolve_entity(context, &key, false, pending).await?;
            }
            Work::Collection(key) => {
                resolve_collection(context, &key, pending).await?;
            }
        }
    }
    Ok(())
}

/// Load one instance by identity; `None` when no row exists
pub(crate) async fn load_entity(
    context: &Arc<ContextShared>,
    key: &EntityKey,
    read_only: bool,
) -> OrmResult<Option<ManagedEntity>> {
    let mut pending = Pending::default();
    let entity = resolve_entity(context, key, read_only, &mut pending).await?;
    drain(context, &mut pending).await?;
    Ok(entity)
}

/// Load several instances of one kind, in request order
pub(crate) async fn load_many(
    context: &Arc<ContextShared>,
    kind: &str,
    ids: &[Identifier],
    read_only: bool,
) -> OrmResult<Vec<Option<ManagedEntity>>> {
    let entity = context.metamodel().entity(kind)?.clone();
    let mut pending = Pending::default();
    let loaded = resolve_many(context, &entity, ids, read_only, &mut pending).await?;
    drain(context, &mut pending).await?;
    Ok(loaded)
}

/// Initialize one collection, batching other pending collections of the same role
pub(crate) async fn initialize_collection(
    context: &Arc<ContextShared>,
    key: &CollectionKey,
) -> OrmResult<()> {
    let mut pending = Pending::default();
    resolve_collection(context, key, &mut pending).await?;
    drain(context, &mut pending).await
}

/// Run a criteria query; instances already managed are returned as they are
pub(crate) async fn query(
    context: &Arc<ContextShared>,
    criteria: &Criteria,
) -> OrmResult<Vec<ManagedEntity>> {
    let metamodel = context.metamodel();
    let entity = metamodel.entity(criteria.kind())?.clone();
    let influencers = context.influencers();
    let plan = PlanBuilder::new(metamodel, &influencers, context.dialect()).criteria(&entity, criteria)?;

    let rows = context.fetch(&plan.bind(Vec::new())?).await?;
    let mut pending = Pending::default();
    let roots = register_rows(context, &plan, &rows, criteria.is_read_only(), &mut pending)?;
    drain(context, &mut pending).await?;

    Ok(roots.iter().filter_map(|key| context.managed(key)).collect())
}

/// Reload the state of a managed instance from the store
pub(crate) async fn refresh(context: &Arc<ContextShared>, managed: &ManagedEntity) -> OrmResult<()> {
    match context.lookup(managed.key())? {
        Lookup::Managed(current) if current.ptr_eq(managed) => {}
        _ => return Err(crate::context::not_managed(context.id(), managed.key())),
    }

    let entity = managed.descriptor().clone();
    let plan = context.plan(entity.as_ref(), PlanShape::ById, |builder| {
        builder.entity_by_ids(&entity, 1)
    })?;
    let rows = context
        .fetch(&plan.bind(vec![managed.id().to_database_value()])?)
        .await?;
    check_unique(&entity, &plan, &rows)?;

    let metamodel = context.metamodel();
    let mut state = None;
    let mut pending = Pending::default();
    for row in &rows {
        let row = row.as_ref();
        if state.is_none() && hydrate::read_id(&entity, &plan.root, row)?.as_ref() == Some(managed.id()) {
            state = Some(hydrate::read_state(metamodel, &entity, &plan.root, row)?);
        }
        for joined in &plan.joined {
            register_joined(context, metamodel, &joined.projection, row, &mut pending)?;
        }
    }
    let Some(state) = state else {
        context
            .lock_open(|| format!("refresh {}", managed.key()))?
            .detach(managed.key());
        return Err(OrmError::ObjectNotFound {
            kind: entity.name().to_string(),
            id: managed.id().to_string(),
        });
    };

    let entry = cache_entry_for(context, &entity, &state)?;
    context.replace_loaded(managed, state)?;
    if let Some(entry) = entry {
        put_entity(context, &entity, managed.id(), entry, false)?;
    }
    tracing::debug!("Refreshed {}", managed.key());
    drain(context, &mut pending).await
}

/// Number of elements of one collection, by count query
pub(crate) async fn collection_size(
    context: &Arc<ContextShared>,
    collection: &CollectionDescriptor,
    owner: &Identifier,
) -> OrmResult<usize> {
    let plan = context.plan(collection, PlanShape::Count, |builder| {
        builder.collection_count(collection)
    })?;
    let rows = context.fetch(&plan.bind(vec![owner.to_database_value()])?).await?;
    let count = match rows.first() {
        Some(row) => row.get_by_name("count")?.as_i64().unwrap_or(0),
        None => 0,
    };
    Ok(count.max(0) as usize)
}

/// Whether one collection holds an element, by existence query
pub(crate) async fn collection_contains(
    context: &Arc<ContextShared>,
    collection: &CollectionDescriptor,
    owner: &Identifier,
    element: &Identifier,
) -> OrmResult<bool> {
    let plan = context.plan(collection, PlanShape::Exists, |builder| {
        builder.collection_exists(collection)
    })?;
    let rows = context
        .fetch(&plan.bind(vec![owner.to_database_value(), element.to_database_value()])?)
        .await?;
    Ok(!rows.is_empty())
}

async fn resolve_entity(
    context: &Arc<ContextShared>,
    key: &EntityKey,
    read_only: bool,
    pending: &mut Pending,
) -> OrmResult<Option<ManagedEntity>> {
    match context.lookup(key)? {
        Lookup::Managed(entity) => return Ok(Some(entity)),
        Lookup::Removed => return Ok(None),
        Lookup::Missing => {}
    }

    let entity = context.metamodel().entity(&key.kind)?.clone();
    if let Some(managed) = from_cache(context, &entity, &key.id, read_only, pending)? {
        return Ok(Some(managed));
    }

    let batch = context.unit().entity_batch_size(&entity);
    let mut ids = vec![key.id.clone()];
    for candidate in context.pending_proxies(&entity, &key.id, batch - 1) {
        if from_cache(context, &entity, &candidate, false, pending)?.is_none() {
            ids.push(candidate);
        }
    }

    fetch_entities(context, &entity, &ids, read_only, pending).await?;
    Ok(context.managed(key))
}

async fn resolve_many(
    context: &Arc<ContextShared>,
    entity: &Arc<EntityDescriptor>,
    ids: &[Identifier],
    read_only: bool,
    pending: &mut Pending,
) -> OrmResult<Vec<Option<ManagedEntity>>> {
    let mut missing: Vec<Identifier> = Vec::new();
    for id in ids {
        let key = EntityKey::new(entity.name(), id.clone());
        if !matches!(context.lookup(&key)?, Lookup::Missing) || missing.contains(id) {
            continue;
        }
        if from_cache(context, entity, id, read_only, pending)?.is_none() {
            missing.push(id.clone());
        }
    }

    if !missing.is_empty() {
        fetch_entities(context, entity, &missing, read_only, pending).await?;
    }

    Ok(ids
        .iter()
        .map(|id| context.managed(&EntityKey::new(entity.name(), id.clone())))
        .collect())
}

/// Register a cached instance of `entity`, if the region holds one the context may read
fn from_cache(
    context: &Arc<ContextShared>,
    entity: &Arc<EntityDescriptor>,
    id: &Identifier,
    read_only: bool,
    pending: &mut Pending,
) -> OrmResult<Option<ManagedEntity>> {
    let Some(region) = context.unit().entity_region(entity) else {
        return Ok(None);
    };
    if !context.cache_mode().is_get_enabled() {
        return Ok(None);
    }

    let stats = context.unit().statistics();
    let cache_key = entity_cache_key(entity, id);
    let Some(cached) = region.get(&cache_key, context.tx_timestamp())? else {
        stats.record_cache_miss();
        tracing::debug!("Cache miss for {}", cache_key);
        return Ok(None);
    };
    stats.record_cache_hit();
    tracing::debug!("Cache hit for {}", cache_key);

    let state = dehydrate::from_cache_entry(entity, &cached)?;
    pending.eager_associations(context.metamodel(), entity, id, &state)?;
    let (managed, _) = context.register_loaded(entity, id.clone(), state, read_only)?;
    Ok(Some(managed))
}

async fn fetch_entities(
    context: &Arc<ContextShared>,
    entity: &Arc<EntityDescriptor>,
    ids: &[Identifier],
    read_only: bool,
    pending: &mut Pending,
) -> OrmResult<Vec<EntityKey>> {
    let shape = if ids.len() == 1 {
        PlanShape::ById
    } else {
        PlanShape::ByIds(ids.len())
    };
    let plan = context.plan(entity.as_ref(), shape, |builder| {
        builder.entity_by_ids(entity, ids.len())
    })?;
    let statement = plan.bind(ids.iter().map(Identifier::to_database_value).collect())?;
    let rows = context.fetch(&statement).await?;
    register_rows(context, &plan, &rows, read_only, pending)
}

/// Without a joined collection every root identifier may appear in one row only
fn check_unique(
    entity: &EntityDescriptor,
    plan: &LoadPlan,
    rows: &[Box<dyn DatabaseRow>],
) -> OrmResult<()> {
    if plan.collection.is_some() {
        return Ok(());
    }
    let mut counts: HashMap<Identifier, usize> = HashMap::new();
    for row in rows {
        if let Some(id) = hydrate::read_id(entity, &plan.root, row.as_ref())? {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    match counts.into_iter().filter(|(_, count)| *count > 1).min() {
        Some((id, count)) => Err(OrmError::DuplicateIdentity {
            kind: entity.name().to_string(),
            id: id.to_string(),
            count,
        }),
        None => Ok(()),
    }
}

/// Hydrate and register every entity in `rows`; returns root keys in first-seen order
fn register_rows(
    context: &Arc<ContextShared>,
    plan: &LoadPlan,
    rows: &[Box<dyn DatabaseRow>],
    read_only: bool,
    pending: &mut Pending,
) -> OrmResult<Vec<EntityKey>> {
    let metamodel = context.metamodel();
    let entity = metamodel.entity(&plan.root.kind)?.clone();
    check_unique(&entity, plan, rows)?;

    let mut roots: Vec<EntityKey> = Vec::new();
    let mut seen: HashSet<Identifier> = HashSet::new();
    let mut groups: HashMap<Identifier, Vec<EntityKey>> = HashMap::new();

    for row in rows {
        let row = row.as_ref();
        let Some(id) = hydrate::read_id(&entity, &plan.root, row)? else {
            continue;
        };
        if seen.insert(id.clone()) {
            let key = EntityKey::new(entity.name(), id.clone());
            if matches!(context.lookup(&key)?, Lookup::Missing) {
                let state = hydrate::read_state(metamodel, &entity, &plan.root, row)?;
                register_fetched(context, &entity, id.clone(), state, read_only, pending)?;
            }
            roots.push(key);
        }

        for joined in &plan.joined {
            register_joined(context, metamodel, &joined.projection, row, pending)?;
        }

        if let Some(collection) = &plan.collection {
            let element = register_joined(context, metamodel, &collection.projection, row, pending)?;
            for joined in &collection.joined {
                register_joined(context, metamodel, &joined.projection, row, pending)?;
            }
            let group = groups.entry(id).or_default();
            if let Some(element) = element {
                if !group.contains(&element) {
                    group.push(element);
                }
            }
        }
    }

    if let Some(joined) = &plan.collection {
        let collection = metamodel.collection(&joined.role)?.clone();
        for root in &roots {
            let elements = groups.remove(&root.id).unwrap_or_default();
            complete_collection(context, &collection, &root.id, elements, true)?;
        }
    }

    Ok(roots)
}

/// Register the entity of a joined projection unless the context already has it
fn register_joined(
    context: &Arc<ContextShared>,
    metamodel: &Metamodel,
    projection: &EntityProjection,
    row: &dyn DatabaseRow,
    pending: &mut Pending,
) -> OrmResult<Option<EntityKey>> {
    let entity = metamodel.entity(&projection.kind)?.clone();
    let Some(id) = hydrate::read_id(&entity, projection, row)? else {
        return Ok(None);
    };
    let key = EntityKey::new(entity.name(), id.clone());
    if matches!(context.lookup(&key)?, Lookup::Missing) {
        let state = hydrate::read_state(metamodel, &entity, projection, row)?;
        register_fetched(context, &entity, id, state, false, pending)?;
    }
    Ok(Some(key))
}

/// Register state read from the store and offer it to the cache region
fn register_fetched(
    context: &Arc<ContextShared>,
    entity: &Arc<EntityDescriptor>,
    id: Identifier,
    state: DehydratedState,
    read_only: bool,
    pending: &mut Pending,
) -> OrmResult<ManagedEntity> {
    pending.eager_associations(context.metamodel(), entity, &id, &state)?;
    let entry = cache_entry_for(context, entity, &state)?;
    let (managed, created) = context.register_loaded(entity, id.clone(), state, read_only)?;
    if created {
        context.unit().statistics().record_entity_fetch();
        if let Some(entry) = entry {
            let minimal_put = context.cache_mode() != CacheMode::Refresh;
            put_entity(context, entity, &id, entry, minimal_put)?;
        }
    }
    Ok(managed)
}

/// Cache entry for `state` when the context would put it
fn cache_entry_for(
    context: &ContextShared,
    entity: &EntityDescriptor,
    state: &DehydratedState,
) -> OrmResult<Option<keel_cache::CacheEntry>> {
    if context.unit().entity_region(entity).is_none() || !context.cache_mode().is_put_enabled() {
        return Ok(None);
    }
    dehydrate::to_cache_entry(entity, state).map(Some)
}

fn put_entity(
    context: &ContextShared,
    entity: &EntityDescriptor,
    id: &Identifier,
    entry: keel_cache::CacheEntry,
    minimal_put: bool,
) -> OrmResult<()> {
    let Some(region) = context.unit().entity_region(entity) else {
        return Ok(());
    };
    let written = region.put_from_load(
        &entity_cache_key(entity, id),
        entry,
        context.tx_timestamp(),
        minimal_put,
    )?;
    if written {
        context.unit().statistics().record_cache_put();
    }
    Ok(())
}

async fn resolve_collection(
    context: &Arc<ContextShared>,
    key: &CollectionKey,
    pending: &mut Pending,
) -> OrmResult<()> {
    let handle = context.collection(key)?;
    if handle.is_initialized() {
        return Ok(());
    }
    let collection = handle.descriptor().clone();
    let metamodel = context.metamodel();
    let element = metamodel.entity(collection.element())?.clone();
    let filtered = collection.is_affected_by_enabled_filters(&context.influencers());

    if !filtered {
        if let Some(ids) = collection_from_cache(context, &collection, &key.owner)? {
            resolve_many(context, &element, &ids, false, pending).await?;
            let elements = ids
                .into_iter()
                .map(|id| EntityKey::new(element.name(), id))
                .collect();
            if handle.complete(elements) {
                context.unit().statistics().record_collection_load();
            }
            return Ok(());
        }
    }

    let batch = context.unit().collection_batch_size(&collection);
    let mut owners = vec![key.owner.clone()];
    owners.extend(context.pending_collections(&collection, &key.owner, batch - 1));

    let plan = context.plan(collection.as_ref(), PlanShape::ByOwners(owners.len()), |builder| {
        builder.collection_by_owners(&collection, owners.len())
    })?;
    let statement = plan.bind(owners.iter().map(Identifier::to_database_value).collect())?;
    let rows = context.fetch(&statement).await?;
    context.unit().statistics().record_collection_fetch();

    let owner_kind = metamodel.entity(collection.owner())?.identifier().kind;
    let owner_label = plan.owner_label.as_deref().ok_or_else(|| {
        OrmError::Query(format!("Plan for {} has no owner column", collection.role()))
    })?;

    let mut groups: HashMap<Identifier, Vec<EntityKey>> = HashMap::new();
    for row in &rows {
        let row = row.as_ref();
        let Some(owner) = Identifier::from_database_value(owner_kind, &row.get_by_name(owner_label)?)?
        else {
            continue;
        };
        let Some(element_key) = register_joined(context, metamodel, &plan.root, row, pending)? else {
            continue;
        };
        for joined in &plan.joined {
            register_joined(context, metamodel, &joined.projection, row, pending)?;
        }
        let group = groups.entry(owner).or_default();
        if !group.contains(&element_key) {
            group.push(element_key);
        }
    }

    tracing::debug!(
        "Initialized {} collection(s) of {} with one statement",
        owners.len(),
        collection.role()
    );
    for owner in owners {
        let elements = groups.remove(&owner).unwrap_or_default();
        complete_collection(context, &collection, &owner, elements, !filtered)?;
    }
    Ok(())
}

fn collection_from_cache(
    context: &ContextShared,
    collection: &CollectionDescriptor,
    owner: &Identifier,
) -> OrmResult<Option<Vec<Identifier>>> {
    let Some(region) = context.unit().collection_region(collection) else {
        return Ok(None);
    };
    if !context.cache_mode().is_get_enabled() {
        return Ok(None);
    }

    let stats = context.unit().statistics();
    match region.get(&collection_cache_key(collection, owner), context.tx_timestamp())? {
        Some(entry) => {
            stats.record_cache_hit();
            Ok(Some(dehydrate::collection_elements(&entry)?))
        }
        None => {
            stats.record_cache_miss();
            Ok(None)
        }
    }
}

/// Hand loaded elements to the collection handle and, when allowed, to the cache region
fn complete_collection(
    context: &Arc<ContextShared>,
    collection: &CollectionDescriptor,
    owner: &Identifier,
    elements: Vec<EntityKey>,
    cacheable: bool,
) -> OrmResult<()> {
    let handle = context.collection(&CollectionKey::new(collection.role(), owner.clone()))?;
    let ids: Vec<Identifier> = elements.iter().map(|key| key.id.clone()).collect();
    if !handle.complete(elements) {
        return Ok(());
    }
    context.unit().statistics().record_collection_load();

    let mode = context.cache_mode();
    if !cacheable || !mode.is_put_enabled() {
        return Ok(());
    }
    if let Some(region) = context.unit().collection_region(collection) {
        let written = region.put_from_load(
            &collection_cache_key(collection, owner),
            dehydrate::collection_entry(&ids)?,
            context.tx_timestamp(),
            mode != CacheMode::Refresh,
        )?;
        if written {
            context.unit().statistics().record_cache_put();
        }
    }
    Ok(())
}
