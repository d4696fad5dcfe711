//! Flush and transaction completion
//!
//! Dirty managed instances become version-checked `UPDATE`s and removed instances become
//! `DELETE`s. The second-level cache is coordinated per region strategy: read-write regions
//! are soft-locked before the statement and written once the store has committed; the
//! other strategies act inside the transaction and settle in [`complete`].

use crate::backends::DatabaseValue;
use crate::context::{ContextShared, EntityStatus};
use crate::error::{OrmError, OrmResult};
use crate::instance::{ManagedEntity, PropertyValue};
use crate::loader::dehydrate::{self, DehydratedState, DehydratedValue};
use crate::loader::{collection_cache_key, entity_cache_key};
use crate::metamodel::{AttributeType, ComparisonOp, EntityDescriptor, EntityKey, Identifier};
use crate::plan::{DeleteSpec, Operand, Predicate, Statement, UpdateSpec};
use keel_cache::{AccessType, CacheEntry, CacheError, CacheKey, RegionAccess, SoftLock, TransactionId};
use serde::Serialize;
use std::sync::Arc;

/// Cache work deferred to transaction completion
struct Completion {
    region: Arc<RegionAccess>,
    key: CacheKey,
    lock: Option<SoftLock>,
    /// State to write after commit; `None` for deletions
    entry: Option<CacheEntry>,
}

pub(crate) struct TransactionState {
    id: TransactionId,
    completions: Vec<Completion>,
    regions: Vec<Arc<RegionAccess>>,
}

impl TransactionState {
    fn new(id: TransactionId) -> Self {
        Self {
            id,
            completions: Vec::new(),
            regions: Vec::new(),
        }
    }

    fn record(&mut self, completion: Completion) {
        if !self
            .regions
            .iter()
            .any(|region| Arc::ptr_eq(region, &completion.region))
        {
            self.regions.push(completion.region.clone());
        }
        self.completions.push(completion);
    }
}

/// What one flush wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub updated: usize,
    pub deleted: usize,
}

enum Action {
    Update {
        entity: ManagedEntity,
        state: DehydratedState,
        previous: DehydratedState,
        version: Option<u64>,
    },
    Delete {
        entity: ManagedEntity,
        version: Option<u64>,
    },
}

impl Action {
    fn entity(&self) -> &ManagedEntity {
        match self {
            Action::Update { entity, .. } | Action::Delete { entity, .. } => entity,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Action::Update { .. } => 0,
            Action::Delete { .. } => 1,
        }
    }
}

pub(crate) async fn begin(context: &Arc<ContextShared>) -> OrmResult<()> {
    let active = context
        .lock_open(|| "begin a transaction".to_string())?
        .transaction
        .is_some();
    if active {
        return Err(OrmError::Configuration(format!(
            "Persistence context {} already has an active transaction",
            context.id()
        )));
    }

    context.data_access().begin().await?;

    let id = context.unit().regions().next_timestamp();
    let mut state = context.lock();
    state.transaction = Some(TransactionState::new(id));
    state.tx_timestamp = id;
    tracing::debug!("Context {} began transaction {}", context.id(), id);
    Ok(())
}

pub(crate) async fn commit(context: &Arc<ContextShared>) -> OrmResult<FlushSummary> {
    let summary = match flush_actions(context).await {
        Ok(summary) => summary,
        Err(err) => {
            if let Err(rollback_err) = rollback(context).await {
                tracing::warn!(
                    "Rollback after failed flush of context {} failed: {}",
                    context.id(),
                    rollback_err
                );
            }
            return Err(err);
        }
    };

    match context.data_access().commit().await {
        Ok(()) => {
            complete(context, true)?;
            tracing::info!(
                "Context {} committed: {} updated, {} deleted",
                context.id(),
                summary.updated,
                summary.deleted
            );
            Ok(summary)
        }
        Err(err) => {
            complete(context, false)?;
            Err(err)
        }
    }
}

/// Roll back the store, release every soft lock and detach the context's instances,
/// whose state no longer matches the store
pub(crate) async fn rollback(context: &Arc<ContextShared>) -> OrmResult<()> {
    if context.lock().transaction.is_none() {
        return Err(no_transaction(context));
    }
    let result = context.data_access().rollback().await;
    complete(context, false)?;
    context.lock().detach_all();
    tracing::info!("Context {} rolled back", context.id());
    result
}

/// Flush inside the active transaction, or in a transaction of its own
pub(crate) async fn flush(context: &Arc<ContextShared>) -> OrmResult<FlushSummary> {
    let active = context
        .lock_open(|| "flush".to_string())?
        .transaction
        .is_some();
    if active {
        flush_actions(context).await
    } else {
        begin(context).await?;
        commit(context).await
    }
}

fn no_transaction(context: &ContextShared) -> OrmError {
    OrmError::Configuration(format!(
        "Persistence context {} has no active transaction",
        context.id()
    ))
}

/// Settle the cache side of the transaction and start a new unit of work
fn complete(context: &ContextShared, committed: bool) -> OrmResult<()> {
    let Some(transaction) = context.lock().transaction.take() else {
        return Ok(());
    };

    let mut first_error: Option<CacheError> = None;
    for completion in transaction.completions {
        let Completion {
            region,
            key,
            lock,
            entry,
        } = completion;
        let result = match entry {
            Some(entry) if committed && region.access_type().writes_after_commit() => region
                .update(&key, lock.as_ref(), entry, transaction.id)
                .map(|written| {
                    if !written {
                        tracing::debug!("Skipped cache write for {}: lock was taken over", key);
                    }
                }),
            _ => region.release(&key, lock.as_ref()),
        };
        if let Err(err) = result {
            first_error.get_or_insert(err);
        }
    }
    for region in &transaction.regions {
        if let Err(err) = region.after_completion(transaction.id, committed) {
            first_error.get_or_insert(err);
        }
    }

    context.lock().tx_timestamp = context.unit().regions().next_timestamp();
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn flush_actions(context: &Arc<ContextShared>) -> OrmResult<FlushSummary> {
    let transaction = context
        .lock_open(|| "flush".to_string())?
        .transaction
        .as_ref()
        .map(|transaction| transaction.id);
    let Some(transaction) = transaction else {
        return Err(no_transaction(context));
    };

    let actions = collect_actions(context)?;
    check_read_only_regions(context, &actions)?;

    let mut summary = FlushSummary::default();
    for action in actions {
        match action {
            Action::Update {
                entity,
                state,
                previous,
                version,
            } => {
                update_entity(context, transaction, &entity, state, &previous, version).await?;
                summary.updated += 1;
            }
            Action::Delete { entity, version } => {
                delete_entity(context, transaction, &entity, version).await?;
                summary.deleted += 1;
            }
        }
    }

    context.unit().statistics().record_flush();
    if summary != FlushSummary::default() {
        tracing::info!(
            "Flushed context {}: {} updated, {} deleted",
            context.id(),
            summary.updated,
            summary.deleted
        );
    }
    Ok(summary)
}

/// Dirty and removed instances, updates first, each group in key order
fn collect_actions(context: &ContextShared) -> OrmResult<Vec<Action>> {
    let state = context.lock_open(|| "flush".to_string())?;
    let mut actions = Vec::new();
    for entry in state.entries.values() {
        match entry.status {
            EntityStatus::Managed => {
                let Some(snapshot) = &entry.snapshot else {
                    continue;
                };
                let current = entry
                    .entity
                    .with_state(|instance| dehydrate::dehydrate(entry.entity.descriptor(), instance));
                if &current != snapshot {
                    actions.push(Action::Update {
                        entity: entry.entity.clone(),
                        state: current,
                        previous: snapshot.clone(),
                        version: entry.version,
                    });
                }
            }
            EntityStatus::Removed => actions.push(Action::Delete {
                entity: entry.entity.clone(),
                version: entry.version,
            }),
            EntityStatus::ReadOnly | EntityStatus::Detached => {}
        }
    }
    actions.sort_by(|a, b| {
        a.rank()
            .cmp(&b.rank())
            .then_with(|| a.entity().key().cmp(b.entity().key()))
    });
    Ok(actions)
}

/// Updates of instances cached in read-only regions fail before any statement runs
fn check_read_only_regions(context: &ContextShared, actions: &[Action]) -> OrmResult<()> {
    for action in actions {
        let Action::Update { entity, .. } = action else {
            continue;
        };
        if let Some(region) = context.unit().entity_region(entity.descriptor()) {
            if region.access_type() == AccessType::ReadOnly {
                return Err(CacheError::ReadOnlyViolation {
                    region: region.region().name().to_string(),
                    key: entity_cache_key(entity.descriptor(), entity.id()).to_string(),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// `id = ?` plus the optimistic version check
fn identity_predicates(
    entity: &EntityDescriptor,
    id: &Identifier,
    version: Option<u64>,
    parameters: &mut Vec<DatabaseValue>,
) -> Vec<Predicate> {
    let mut predicates = vec![Predicate {
        alias: entity.table().to_string(),
        column: entity.identifier().column.clone(),
        op: ComparisonOp::Eq,
        operand: Operand::Param(parameters.len()),
    }];
    parameters.push(id.to_database_value());

    if let Some(column) = entity.version_attribute().and_then(|attribute| attribute.column()) {
        match version {
            Some(version) => {
                predicates.push(Predicate {
                    alias: entity.table().to_string(),
                    column: column.to_string(),
                    op: ComparisonOp::Eq,
                    operand: Operand::Param(parameters.len()),
                });
                parameters.push(DatabaseValue::Int64(version as i64));
            }
            None => predicates.push(Predicate {
                alias: entity.table().to_string(),
                column: column.to_string(),
                op: ComparisonOp::IsNull,
                operand: Operand::None,
            }),
        }
    }
    predicates
}

fn assignments(
    entity: &EntityDescriptor,
    state: &DehydratedState,
    parameters: &mut Vec<DatabaseValue>,
) -> Vec<(String, Operand)> {
    let mut assignments = Vec::new();
    let mut assign = |column: &str, value: DatabaseValue| {
        assignments.push((column.to_string(), Operand::Param(parameters.len())));
        parameters.push(value);
    };

    for (attribute, value) in entity.attributes().iter().zip(state) {
        match (attribute.attribute_type(), value) {
            (AttributeType::Basic, DehydratedValue::Basic(value)) => {
                if let Some(column) = attribute.column() {
                    assign(column, value.clone());
                }
            }
            (AttributeType::ManyToOne { .. }, DehydratedValue::Reference(target)) => {
                if let Some(column) = attribute.column() {
                    let value = target
                        .as_ref()
                        .map(Identifier::to_database_value)
                        .unwrap_or(DatabaseValue::Null);
                    assign(column, value);
                }
            }
            (AttributeType::Embedded(component), DehydratedValue::Component(values)) => {
                for (member, value) in component.members().iter().zip(values) {
                    if let Some(column) = member.column() {
                        assign(column, value.clone());
                    }
                }
            }
            _ => {}
        }
    }
    assignments
}

async fn update_entity(
    context: &Arc<ContextShared>,
    transaction: TransactionId,
    entity: &ManagedEntity,
    mut state: DehydratedState,
    previous: &DehydratedState,
    version: Option<u64>,
) -> OrmResult<()> {
    let descriptor = entity.descriptor().clone();
    let next_version = match descriptor.version_index() {
        Some(index) => {
            let next = version.unwrap_or(0) + 1;
            if let Some(slot) = state.get_mut(index) {
                *slot = DehydratedValue::Basic(DatabaseValue::Int64(next as i64));
            }
            Some(next)
        }
        None => None,
    };

    let region = context.unit().entity_region(&descriptor);
    let cache_key = entity_cache_key(&descriptor, entity.id());
    let lock = match &region {
        Some(region) => region.lock(&cache_key, version)?,
        None => None,
    };

    let mut parameters = Vec::new();
    let spec = UpdateSpec {
        table: descriptor.table().to_string(),
        assignments: assignments(&descriptor, &state, &mut parameters),
        predicates: identity_predicates(&descriptor, entity.id(), version, &mut parameters),
    };
    let statement = Statement::update(spec, parameters, context.dialect());
    let affected = context.execute(&statement).await;
    check_affected(context, entity.key(), affected, region.as_deref(), &cache_key, lock.as_ref())?;

    if let (Some(version), Some(attribute)) = (next_version, descriptor.version_attribute()) {
        entity.set_property(
            attribute.name(),
            PropertyValue::Basic(DatabaseValue::Int64(version as i64)),
        )?;
    }

    if let Some(region) = region {
        let entry = dehydrate::to_cache_entry(&descriptor, &state)?;
        if !region.access_type().writes_after_commit() {
            region.update(&cache_key, lock.as_ref(), entry.clone(), transaction)?;
        }
        record_completion(
            context,
            Completion {
                region,
                key: cache_key,
                lock,
                entry: Some(entry),
            },
        )?;
    }

    {
        let mut context_state = context.lock_open(|| format!("flush {}", entity.key()))?;
        if let Some(entry) = context_state.entries.get_mut(entity.key()) {
            entry.version = next_version;
            entry.snapshot = Some(state.clone());
        }
    }

    evict_membership(context, &descriptor, &[previous, &state])?;
    context.unit().statistics().record_entity_update();
    tracing::debug!("Updated {} (version {:?})", entity.key(), next_version);
    Ok(())
}

async fn delete_entity(
    context: &Arc<ContextShared>,
    transaction: TransactionId,
    entity: &ManagedEntity,
    version: Option<u64>,
) -> OrmResult<()> {
    let descriptor = entity.descriptor().clone();
    let region = context.unit().entity_region(&descriptor);
    let cache_key = entity_cache_key(&descriptor, entity.id());
    let lock = match &region {
        Some(region) => region.lock(&cache_key, version)?,
        None => None,
    };

    let mut parameters = Vec::new();
    let spec = DeleteSpec {
        table: descriptor.table().to_string(),
        predicates: identity_predicates(&descriptor, entity.id(), version, &mut parameters),
    };
    let statement = Statement::delete(spec, parameters, context.dialect());
    let affected = context.execute(&statement).await;
    check_affected(context, entity.key(), affected, region.as_deref(), &cache_key, lock.as_ref())?;

    if let Some(region) = region {
        region.remove(&cache_key, transaction)?;
        record_completion(
            context,
            Completion {
                region,
                key: cache_key,
                lock,
                entry: None,
            },
        )?;
    }

    let state = entity.with_state(|instance| dehydrate::dehydrate(&descriptor, instance));
    context
        .lock_open(|| format!("flush {}", entity.key()))?
        .detach(entity.key());

    let metamodel = context.metamodel();
    for collection in metamodel
        .collections()
        .filter(|collection| collection.owner() == descriptor.name())
    {
        if let Some(region) = context.unit().collection_region(collection) {
            region.evict(&collection_cache_key(collection, entity.id()))?;
        }
    }
    evict_membership(context, &descriptor, &[&state])?;

    context.unit().statistics().record_entity_delete();
    tracing::debug!("Deleted {}", entity.key());
    Ok(())
}

/// Zero affected rows means another transaction changed or deleted the row first
fn check_affected(
    context: &ContextShared,
    key: &EntityKey,
    affected: OrmResult<u64>,
    region: Option<&RegionAccess>,
    cache_key: &CacheKey,
    lock: Option<&SoftLock>,
) -> OrmResult<()> {
    let failure = match affected {
        Ok(0) => {
            context.unit().statistics().record_optimistic_failure();
            OrmError::StaleState {
                kind: key.kind.clone(),
                id: key.id.to_string(),
            }
        }
        Ok(_) => return Ok(()),
        Err(err) => err,
    };
    if let Some(region) = region {
        region.release(cache_key, lock)?;
    }
    Err(failure)
}

fn record_completion(context: &ContextShared, completion: Completion) -> OrmResult<()> {
    let mut state = context.lock();
    match state.transaction.as_mut() {
        Some(transaction) => {
            transaction.record(completion);
            Ok(())
        }
        None => {
            drop(state);
            completion
                .region
                .release(&completion.key, completion.lock.as_ref())?;
            Err(no_transaction(context))
        }
    }
}

/// Evict cached collections that may list an element in any of `states`
fn evict_membership(
    context: &ContextShared,
    element: &EntityDescriptor,
    states: &[&DehydratedState],
) -> OrmResult<()> {
    let metamodel = context.metamodel();
    for collection in metamodel
        .collections()
        .filter(|collection| collection.element() == element.name())
    {
        let Some(region) = context.unit().collection_region(collection) else {
            continue;
        };
        let owner_index = element.attributes().iter().position(|attribute| {
            matches!(attribute.attribute_type(), AttributeType::ManyToOne { .. })
                && attribute.column() == Some(collection.key_column())
        });
        let Some(index) = owner_index else {
            region.evict_all()?;
            continue;
        };
        for state in states {
            if let Some(DehydratedValue::Reference(Some(owner))) = state.get(index) {
                region.evict(&collection_cache_key(collection, owner))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metamodel::{AttributeDescriptor, ComponentDescriptor};

    fn parcel() -> EntityDescriptor {
        EntityDescriptor::new("Parcel", "parcels")
            .basic("label", "label")
            .version("version", "version")
            .attribute(AttributeDescriptor::many_to_one("depot", "Depot", "depot_id"))
            .attribute(AttributeDescriptor::embedded(
                "size",
                ComponentDescriptor::new("Size")
                    .member("width", "width")
                    .member("height", "height"),
            ))
            .attribute(AttributeDescriptor::computed("weight"))
    }

    #[test]
    fn test_update_assigns_every_persistent_column() {
        let entity = parcel();
        let state = vec![
            DehydratedValue::Basic(DatabaseValue::from("fragile")),
            DehydratedValue::Basic(DatabaseValue::Int64(4)),
            DehydratedValue::Reference(None),
            DehydratedValue::Component(vec![DatabaseValue::Int64(2), DatabaseValue::Int64(3)]),
            DehydratedValue::Transient,
        ];
        let mut parameters = Vec::new();
        let columns: Vec<String> = assignments(&entity, &state, &mut parameters)
            .into_iter()
            .map(|(column, _)| column)
            .collect();

        assert_eq!(columns, ["label", "version", "depot_id", "width", "height"]);
        assert_eq!(parameters[2], DatabaseValue::Null);
        assert_eq!(parameters[4], DatabaseValue::Int64(3));
    }

    #[test]
    fn test_version_check_predicates() {
        let entity = parcel();
        let mut parameters = vec![DatabaseValue::from("already bound")];
        let predicates = identity_predicates(&entity, &Identifier::Int(8), Some(4), &mut parameters);

        assert_eq!(predicates.len(), 2);
        assert_eq!(predicates[0].operand, Operand::Param(1));
        assert_eq!(predicates[1].column, "version");
        assert_eq!(parameters[2], DatabaseValue::Int64(4));

        let mut parameters = Vec::new();
        let predicates = identity_predicates(&entity, &Identifier::Int(8), None, &mut parameters);
        assert_eq!(predicates[1].op, ComparisonOp::IsNull);
        assert_eq!(parameters.len(), 1);
    }
}
