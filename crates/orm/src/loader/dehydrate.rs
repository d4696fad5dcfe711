//! Disassembled entity state
//!
//! The same representation serves as the second-level cache entry (serialized to JSON) and
//! as the load-time snapshot that flush compares against for dirty checking.

use crate::backends::DatabaseValue;
use crate::error::{OrmError, OrmResult};
use crate::instance::{EntityInstance, PropertyValue};
use crate::metamodel::{AttributeType, EntityDescriptor, Identifier};
use keel_cache::CacheEntry;
use serde::{Deserialize, Serialize};

/// One attribute of a disassembled instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DehydratedValue {
    Basic(DatabaseValue),
    Component(Vec<DatabaseValue>),
    Reference(Option<Identifier>),
    Collection,
    Transient,
}

/// Disassembled instance, one value per attribute in declaration order
pub type DehydratedState = Vec<DehydratedValue>;

/// Read every attribute of `instance` through its accessor
pub fn dehydrate(entity: &EntityDescriptor, instance: &EntityInstance) -> DehydratedState {
    entity
        .attributes()
        .iter()
        .map(|attribute| {
            if !attribute.is_persistent() {
                return DehydratedValue::Transient;
            }
            match (attribute.attribute_type(), attribute.access().read(instance)) {
                (AttributeType::Basic, PropertyValue::Basic(value)) => DehydratedValue::Basic(value),
                (AttributeType::Basic, _) => DehydratedValue::Basic(DatabaseValue::Null),
                (AttributeType::Embedded(component), PropertyValue::Component(value)) => {
                    DehydratedValue::Component(
                        component
                            .members()
                            .iter()
                            .map(|member| match member.access().read(&value) {
                                PropertyValue::Basic(v) => v,
                                _ => DatabaseValue::Null,
                            })
                            .collect(),
                    )
                }
                (AttributeType::Embedded(component), _) => {
                    DehydratedValue::Component(vec![DatabaseValue::Null; component.members().len()])
                }
                (AttributeType::ManyToOne { .. }, PropertyValue::Entity(key)) => {
                    DehydratedValue::Reference(key.map(|k| k.id))
                }
                (AttributeType::ManyToOne { .. }, _) => DehydratedValue::Reference(None),
                (AttributeType::OneToMany { .. }, _) => DehydratedValue::Collection,
                _ => DehydratedValue::Transient,
            }
        })
        .collect()
}

/// Version recorded in `state`, when the kind is versioned
pub fn version_of(entity: &EntityDescriptor, state: &DehydratedState) -> Option<u64> {
    match state.get(entity.version_index()?)? {
        DehydratedValue::Basic(value) => value.as_i64().map(|v| v.max(0) as u64),
        _ => None,
    }
}

pub fn to_cache_entry(entity: &EntityDescriptor, state: &DehydratedState) -> OrmResult<CacheEntry> {
    Ok(CacheEntry::new(
        serde_json::to_value(state)?,
        version_of(entity, state),
    ))
}

pub fn from_cache_entry(entity: &EntityDescriptor, entry: &CacheEntry) -> OrmResult<DehydratedState> {
    let state: DehydratedState = serde_json::from_value(entry.state.clone())?;
    if state.len() != entity.attributes().len() {
        return Err(OrmError::Hydration(format!(
            "Cached state of {} has {} attributes, expected {}",
            entity.name(),
            state.len(),
            entity.attributes().len()
        )));
    }
    Ok(state)
}

/// Element identifiers of a cached collection
pub fn collection_entry(elements: &[Identifier]) -> OrmResult<CacheEntry> {
    Ok(CacheEntry::new(serde_json::to_value(elements)?, None))
}

pub fn collection_elements(entry: &CacheEntry) -> OrmResult<Vec<Identifier>> {
    Ok(serde_json::from_value(entry.state.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PropertyHolder;
    use crate::metamodel::{AttributeDescriptor, ComponentDescriptor, EntityKey, Metamodel};

    fn order() -> Metamodel {
        Metamodel::builder()
            .entity(EntityDescriptor::new("Customer", "customers"))
            .entity(
                EntityDescriptor::new("Order", "orders")
                    .basic("total", "total")
                    .version("version", "version")
                    .attribute(AttributeDescriptor::embedded(
                        "shipping",
                        ComponentDescriptor::new("Address")
                            .member("city", "ship_city")
                            .member("zip", "ship_zip"),
                    ))
                    .attribute(AttributeDescriptor::many_to_one(
                        "customer",
                        "Customer",
                        "customer_id",
                    ))
                    .attribute(AttributeDescriptor::computed("label")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_dehydrate_reads_through_accessors() {
        let metamodel = order();
        let entity = metamodel.entity("Order").unwrap();
        let mut instance = EntityInstance::new(entity.attributes().len());
        instance.set_slot(0, PropertyValue::Basic(DatabaseValue::Int64(120)));
        instance.set_slot(1, PropertyValue::Basic(DatabaseValue::Int64(3)));
        entity
            .lookup("customer")
            .unwrap()
            .access()
            .write(&mut instance, PropertyValue::Entity(Some(EntityKey::new("Customer", 7i64))));

        let state = dehydrate(entity, &instance);
        assert_eq!(state[0], DehydratedValue::Basic(DatabaseValue::Int64(120)));
        assert_eq!(
            state[2],
            DehydratedValue::Component(vec![DatabaseValue::Null, DatabaseValue::Null])
        );
        assert_eq!(state[3], DehydratedValue::Reference(Some(Identifier::Int(7))));
        assert_eq!(state[4], DehydratedValue::Transient);
        assert_eq!(version_of(entity, &state), Some(3));
    }

    #[test]
    fn test_cache_entry_carries_version() {
        let metamodel = order();
        let entity = metamodel.entity("Order").unwrap();
        let state = vec![
            DehydratedValue::Basic(DatabaseValue::Float64(19.5)),
            DehydratedValue::Basic(DatabaseValue::Int64(4)),
            DehydratedValue::Component(vec!["Wellington".into(), DatabaseValue::Null]),
            DehydratedValue::Reference(None),
            DehydratedValue::Transient,
        ];

        let entry = to_cache_entry(entity, &state).unwrap();
        assert_eq!(entry.version, Some(4));
        assert_eq!(from_cache_entry(entity, &entry).unwrap(), state);

        let truncated = CacheEntry::new(serde_json::json!([]), None);
        assert!(matches!(
            from_cache_entry(entity, &truncated),
            Err(OrmError::Hydration(_))
        ));
    }
}
