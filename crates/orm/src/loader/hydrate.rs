//! Row reading and instance assembly

use super::dehydrate::{DehydratedState, DehydratedValue};
use crate::backends::{DatabaseRow, DatabaseValue};
use crate::error::{OrmError, OrmResult};
use crate::instance::{ComponentValue, EntityInstance, PropertyValue};
use crate::metamodel::{
    AttributeType, CollectionKey, EntityDescriptor, EntityKey, Identifier, Metamodel,
};
use crate::plan::{AttributeColumns, EntityProjection};

/// Identifier of the `projection` entity in `row`; `None` when a left join found nothing
pub(crate) fn read_id(
    entity: &EntityDescriptor,
    projection: &EntityProjection,
    row: &dyn DatabaseRow,
) -> OrmResult<Option<Identifier>> {
    Identifier::from_database_value(
        entity.identifier().kind,
        &row.get_by_name(&projection.id_label)?,
    )
}

/// Disassembled state of the `projection` entity in `row`
pub(crate) fn read_state(
    metamodel: &Metamodel,
    entity: &EntityDescriptor,
    projection: &EntityProjection,
    row: &dyn DatabaseRow,
) -> OrmResult<DehydratedState> {
    entity
        .attributes()
        .iter()
        .zip(&projection.attributes)
        .map(|(attribute, columns)| {
            let value = match columns {
                AttributeColumns::Basic(label) => DehydratedValue::Basic(row.get_by_name(label)?),
                AttributeColumns::Component(labels) => DehydratedValue::Component(
                    labels
                        .iter()
                        .map(|label| row.get_by_name(label))
                        .collect::<OrmResult<_>>()?,
                ),
                AttributeColumns::Reference(label) => {
                    let AttributeType::ManyToOne { target, .. } = attribute.attribute_type() else {
                        return Err(OrmError::Hydration(format!(
                            "{}.{} is projected as a reference",
                            entity.name(),
                            attribute.name()
                        )));
                    };
                    let kind = metamodel.entity(target)?.identifier().kind;
                    DehydratedValue::Reference(Identifier::from_database_value(
                        kind,
                        &row.get_by_name(label)?,
                    )?)
                }
                AttributeColumns::Collection => DehydratedValue::Collection,
                AttributeColumns::Transient => DehydratedValue::Transient,
            };

            if !attribute.is_nullable() && is_null(&value) {
                return Err(OrmError::Hydration(format!(
                    "{}.{} is not nullable but the row holds null",
                    entity.name(),
                    attribute.name()
                )));
            }
            Ok(value)
        })
        .collect()
}

fn is_null(value: &DehydratedValue) -> bool {
    matches!(
        value,
        DehydratedValue::Basic(DatabaseValue::Null) | DehydratedValue::Reference(None)
    )
}

/// An assembled instance plus the association handles it points at
#[derive(Debug)]
pub(crate) struct Assembled {
    pub instance: EntityInstance,
    pub references: Vec<EntityKey>,
    pub collections: Vec<CollectionKey>,
}

/// Write `state` into a fresh instance through each attribute's accessor
pub(crate) fn assemble(
    entity: &EntityDescriptor,
    id: &Identifier,
    state: &DehydratedState,
) -> OrmResult<Assembled> {
    if state.len() != entity.attributes().len() {
        return Err(OrmError::Hydration(format!(
            "State of {}#{} has {} values, expected {}",
            entity.name(),
            id,
            state.len(),
            entity.attributes().len()
        )));
    }

    let mut assembled = Assembled {
        instance: EntityInstance::new(entity.attributes().len()),
        references: Vec::new(),
        collections: Vec::new(),
    };

    for (attribute, value) in entity.attributes().iter().zip(state) {
        let property = match (attribute.attribute_type(), value) {
            (AttributeType::Basic, DehydratedValue::Basic(v)) => PropertyValue::Basic(v.clone()),
            (AttributeType::Embedded(component), DehydratedValue::Component(values)) => {
                let mut target = ComponentValue::new(component.members().len());
                for (member, v) in component.members().iter().zip(values) {
                    member
                        .access()
                        .write(&mut target, PropertyValue::Basic(v.clone()));
                }
                PropertyValue::Component(target)
            }
            (AttributeType::ManyToOne { target, .. }, DehydratedValue::Reference(reference)) => {
                let key = reference
                    .as_ref()
                    .map(|target_id| EntityKey::new(target.clone(), target_id.clone()));
                if let Some(key) = &key {
                    assembled.references.push(key.clone());
                }
                PropertyValue::Entity(key)
            }
            (AttributeType::OneToMany { role }, DehydratedValue::Collection) => {
                let key = CollectionKey::new(role.clone(), id.clone());
                assembled.collections.push(key.clone());
                PropertyValue::Collection(key)
            }
            (_, DehydratedValue::Transient) if !attribute.is_persistent() => continue,
            (_, other) => {
                return Err(OrmError::Hydration(format!(
                    "{}.{} cannot hold {:?}",
                    entity.name(),
                    attribute.name(),
                    other
                )))
            }
        };
        attribute.access().write(&mut assembled.instance, property);
    }

    Ok(assembled)
}
