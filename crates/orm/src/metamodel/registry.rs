//! Metamodel registry - validated, immutable descriptors for one persistence unit

use std::collections::HashMap;
use std::sync::Arc;

use super::collection::CollectionDescriptor;
use super::entity::{AttributeType, ComponentDescriptor, EntityDescriptor};
use super::filter::{FetchProfile, FilterDefinition};
use crate::access::{PropertyAccess, PropertyAccessKind};
use crate::error::{OrmError, OrmResult};

/// Every descriptor of a persistence unit, with accessors resolved.
///
/// Built once at startup and shared by reference; never mutated afterwards.
#[derive(Debug, Default)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityDescriptor>>,
    collections: HashMap<String, Arc<CollectionDescriptor>>,
    filters: HashMap<String, FilterDefinition>,
    fetch_profiles: HashMap<String, FetchProfile>,
}

impl Metamodel {
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    pub fn entity(&self, name: &str) -> OrmResult<&Arc<EntityDescriptor>> {
        self.entities
            .get(name)
            .ok_or_else(|| OrmError::UnknownLoadable(name.to_string()))
    }

    pub fn collection(&self, role: &str) -> OrmResult<&Arc<CollectionDescriptor>> {
        self.collections
            .get(role)
            .ok_or_else(|| OrmError::UnknownLoadable(role.to_string()))
    }

    pub fn filter(&self, name: &str) -> OrmResult<&FilterDefinition> {
        self.filters
            .get(name)
            .ok_or_else(|| OrmError::Configuration(format!("Unknown filter '{}'", name)))
    }

    pub fn fetch_profile(&self, name: &str) -> OrmResult<&FetchProfile> {
        self.fetch_profiles
            .get(name)
            .ok_or_else(|| OrmError::Configuration(format!("Unknown fetch profile '{}'", name)))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.values()
    }

    pub fn collections(&self) -> impl Iterator<Item = &Arc<CollectionDescriptor>> {
        self.collections.values()
    }
}

/// Collects descriptors and validates them into a [`Metamodel`]
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    entities: Vec<EntityDescriptor>,
    collections: Vec<CollectionDescriptor>,
    filters: Vec<FilterDefinition>,
    fetch_profiles: Vec<FetchProfile>,
}

impl MetamodelBuilder {
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities.push(descriptor);
        self
    }

    pub fn collection(mut self, descriptor: CollectionDescriptor) -> Self {
        self.collections.push(descriptor);
        self
    }

    pub fn filter(mut self, definition: FilterDefinition) -> Self {
        self.filters.push(definition);
        self
    }

    pub fn fetch_profile(mut self, profile: FetchProfile) -> Self {
        self.fetch_profiles.push(profile);
        self
    }

    /// Validate cross references and resolve every attribute's accessor
    pub fn build(self) -> OrmResult<Metamodel> {
        let mut filters = HashMap::new();
        for filter in self.filters {
            if filters.insert(filter.name().to_string(), filter.clone()).is_some() {
                return Err(duplicate("filter", filter.name()));
            }
        }

        let mut collections = HashMap::new();
        for collection in self.collections {
            let role = collection.role().to_string();
            if collections.contains_key(&role) {
                return Err(duplicate("collection role", &role));
            }
            check_filters(&role, collection.filters(), &filters)?;
            collections.insert(role, collection);
        }

        let mut entities = HashMap::new();
        for mut entity in self.entities {
            let name = entity.name().to_string();
            if entities.contains_key(&name) {
                return Err(duplicate("entity", &name));
            }
            check_filters(&name, entity.filters(), &filters)?;
            resolve_accessors(&mut entity)?;
            entities.insert(name, entity);
        }

        for entity in entities.values() {
            check_associations(entity, &entities, &collections)?;
        }
        for collection in collections.values() {
            check_collection(collection, &entities)?;
        }

        let mut fetch_profiles = HashMap::new();
        for profile in self.fetch_profiles {
            for (kind, association) in profile.fetches() {
                let entity = entities.get(kind).ok_or_else(|| {
                    OrmError::Configuration(format!(
                        "Fetch profile '{}' names unknown entity '{}'",
                        profile.name(),
                        kind
                    ))
                })?;
                let is_association = entity
                    .lookup(association)
                    .map(|a| a.is_association())
                    .unwrap_or(false);
                if !is_association {
                    return Err(OrmError::Configuration(format!(
                        "Fetch profile '{}' names '{}.{}', which is not an association",
                        profile.name(),
                        kind,
                        association
                    )));
                }
            }
            if fetch_profiles.contains_key(profile.name()) {
                return Err(duplicate("fetch profile", profile.name()));
            }
            fetch_profiles.insert(profile.name().to_string(), profile);
        }

        tracing::debug!(
            "Built metamodel with {} entities and {} collection roles",
            entities.len(),
            collections.len()
        );

        Ok(Metamodel {
            entities: entities
                .into_iter()
                .map(|(name, entity)| (name, Arc::new(entity)))
                .collect(),
            collections: collections
                .into_iter()
                .map(|(role, collection)| (role, Arc::new(collection)))
                .collect(),
            filters,
            fetch_profiles,
        })
    }
}

fn duplicate(what: &str, name: &str) -> OrmError {
    OrmError::Configuration(format!("Duplicate {} '{}'", what, name))
}

fn check_filters(
    owner: &str,
    names: &[String],
    filters: &HashMap<String, FilterDefinition>,
) -> OrmResult<()> {
    match names.iter().find(|name| !filters.contains_key(*name)) {
        Some(name) => Err(OrmError::Configuration(format!(
            "{} declares unknown filter '{}'",
            owner, name
        ))),
        None => Ok(()),
    }
}

fn interpret(owner: &str, attribute: &str, name: &str) -> OrmResult<PropertyAccessKind> {
    PropertyAccessKind::interpret(name).ok_or_else(|| {
        OrmError::Configuration(format!(
            "{}.{} names unknown access strategy '{}'",
            owner, attribute, name
        ))
    })
}

fn resolve_component(
    owner: &str,
    default_access: &str,
    component: &mut ComponentDescriptor,
) -> OrmResult<()> {
    let component_name = component.name().to_string();
    for (slot, member) in component.members_mut().iter_mut().enumerate() {
        if !matches!(member.attribute_type(), AttributeType::Basic) {
            return Err(OrmError::Configuration(format!(
                "{}.{} members must be basic attributes ('{}' is not)",
                owner,
                component_name,
                member.name()
            )));
        }
        let kind = interpret(owner, member.name(), member.access_name().unwrap_or(default_access))?;
        let access = PropertyAccess::resolve(kind, slot, member.name(), member.accessors())
            .map_err(OrmError::Configuration)?;
        member.set_access(access);
    }
    Ok(())
}

fn resolve_accessors(entity: &mut EntityDescriptor) -> OrmResult<()> {
    let owner = entity.name().to_string();
    let default_access = entity.default_access_name().to_string();
    interpret(&owner, "*", &default_access)?;

    // Direct attributes first; component paths reuse their component's accessor.
    for (slot, attribute) in entity.attributes_mut().iter_mut().enumerate() {
        if matches!(attribute.attribute_type(), AttributeType::ComponentPath { .. }) {
            continue;
        }
        if let AttributeType::Embedded(component) = attribute.attribute_type_mut() {
            resolve_component(&owner, &default_access, component)?;
        }

        let kind = interpret(
            &owner,
            attribute.name(),
            attribute.access_name().unwrap_or(&default_access),
        )?;
        if matches!(attribute.attribute_type(), AttributeType::Computed) && kind != PropertyAccessKind::Noop {
            return Err(OrmError::Configuration(format!(
                "{}.{} is computed and must use noop access",
                owner,
                attribute.name()
            )));
        }
        if attribute.is_persistent() && kind == PropertyAccessKind::Noop {
            return Err(OrmError::Configuration(format!(
                "{}.{} is persistent and cannot use noop access",
                owner,
                attribute.name()
            )));
        }
        let access = PropertyAccess::resolve(kind, slot, attribute.name(), attribute.accessors())
            .map_err(OrmError::Configuration)?;
        attribute.set_access(access);
    }

    let mut paths = Vec::new();
    for (index, attribute) in entity.attributes().iter().enumerate() {
        let AttributeType::ComponentPath { component, member } = attribute.attribute_type() else {
            continue;
        };
        let holder = entity.lookup(component)?;
        let AttributeType::Embedded(descriptor) = holder.attribute_type() else {
            return Err(OrmError::Configuration(format!(
                "{}.{} refers to '{}', which is not embedded",
                owner,
                attribute.name(),
                component
            )));
        };
        let member_access = descriptor
            .member_index(member)
            .and_then(|i| descriptor.members().get(i))
            .map(|m| m.access().clone())
            .ok_or_else(|| {
                OrmError::Configuration(format!(
                    "{}.{} has no member '{}'",
                    owner, component, member
                ))
            })?;
        paths.push((
            index,
            PropertyAccess::Embedded {
                component: Box::new(holder.access().clone()),
                member: Box::new(member_access),
            },
        ));
    }
    for (index, access) in paths {
        entity.attributes_mut()[index].set_access(access);
    }

    Ok(())
}

fn check_associations(
    entity: &EntityDescriptor,
    entities: &HashMap<String, EntityDescriptor>,
    collections: &HashMap<String, CollectionDescriptor>,
) -> OrmResult<()> {
    for attribute in entity.attributes() {
        match attribute.attribute_type() {
            AttributeType::ManyToOne { target, .. } => {
                if !entities.contains_key(target) {
                    return Err(OrmError::Configuration(format!(
                        "{}.{} targets unknown entity '{}'",
                        entity.name(),
                        attribute.name(),
                        target
                    )));
                }
            }
            AttributeType::OneToMany { role } => {
                let collection = collections.get(role).ok_or_else(|| {
                    OrmError::Configuration(format!(
                        "{}.{} refers to unknown collection role '{}'",
                        entity.name(),
                        attribute.name(),
                        role
                    ))
                })?;
                if collection.owner() != entity.name() || collection.attribute() != attribute.name() {
                    return Err(OrmError::Configuration(format!(
                        "Collection role '{}' is not owned by {}.{}",
                        role,
                        entity.name(),
                        attribute.name()
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_collection(
    collection: &CollectionDescriptor,
    entities: &HashMap<String, EntityDescriptor>,
) -> OrmResult<()> {
    let owner = entities.get(collection.owner()).ok_or_else(|| {
        OrmError::Configuration(format!(
            "Collection role '{}' has unknown owner '{}'",
            collection.role(),
            collection.owner()
        ))
    })?;
    if !entities.contains_key(collection.element()) {
        return Err(OrmError::Configuration(format!(
            "Collection role '{}' has unknown element kind '{}'",
            collection.role(),
            collection.element()
        )));
    }
    let declared = owner
        .lookup(collection.attribute())
        .map(|a| matches!(a.attribute_type(), AttributeType::OneToMany { role } if role == collection.role()))
        .unwrap_or(false);
    if !declared {
        return Err(OrmError::Configuration(format!(
            "{} does not declare collection '{}'",
            owner.name(),
            collection.attribute()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{EntityInstance, PropertyValue};
    use crate::metamodel::{AttributeDescriptor, ComparisonOp};
    use crate::backends::DatabaseValue;

    fn customer() -> EntityDescriptor {
        EntityDescriptor::new("Customer", "customers")
            .basic("name", "name")
            .attribute(AttributeDescriptor::embedded(
                "address",
                ComponentDescriptor::new("Address")
                    .member("street", "street")
                    .member("city", "city"),
            ))
            .attribute(AttributeDescriptor::component_path("city", "address", "city"))
            .attribute(AttributeDescriptor::computed("label"))
            .attribute(AttributeDescriptor::one_to_many("orders", "Customer.orders"))
    }

    fn order() -> EntityDescriptor {
        EntityDescriptor::new("Order", "orders")
            .basic("total", "total")
            .attribute(AttributeDescriptor::many_to_one("customer", "Customer", "customer_id"))
    }

    fn orders() -> CollectionDescriptor {
        CollectionDescriptor::new("Customer", "orders", "Order", "customer_id")
    }

    #[test]
    fn test_builds_valid_metamodel() {
        let metamodel = Metamodel::builder()
            .entity(customer())
            .entity(order())
            .collection(orders())
            .fetch_profile(FetchProfile::new("with-customer").fetch("Order", "customer"))
            .build()
            .unwrap();

        assert!(metamodel.entity("Order").is_ok());
        assert!(metamodel.collection("Customer.orders").is_ok());
        assert!(metamodel.fetch_profile("with-customer").is_ok());
        assert!(matches!(
            metamodel.entity("Nope"),
            Err(OrmError::UnknownLoadable(_))
        ));
    }

    #[test]
    fn test_component_path_reads_through_component() {
        let metamodel = Metamodel::builder()
            .entity(customer())
            .entity(order())
            .collection(orders())
            .build()
            .unwrap();
        let customer = metamodel.entity("Customer").unwrap();

        let mut instance = EntityInstance::new(customer.attributes().len());
        let city = customer.lookup("city").unwrap();
        assert!(matches!(city.access(), PropertyAccess::Embedded { .. }));

        city.access()
            .write(&mut instance, PropertyValue::Basic(DatabaseValue::from("Dunedin")));
        let address = customer.lookup("address").unwrap().access().read(&instance);
        let address = address.as_component().unwrap();
        let member = &customer.lookup("address").unwrap();
        let AttributeType::Embedded(component) = member.attribute_type() else {
            panic!("address is embedded");
        };
        let city_member = &component.members()[1];
        assert_eq!(
            city_member.access().read(address),
            PropertyValue::Basic(DatabaseValue::from("Dunedin"))
        );
        assert!(customer.lookup("label").unwrap().access().is_noop());
    }

    #[test]
    fn test_rejects_unknown_access_strategy() {
        let bad = EntityDescriptor::new("Tag", "tags")
            .attribute(AttributeDescriptor::basic("label", "label").with_access("bytecode"));
        let err = Metamodel::builder().entity(bad).build().unwrap_err();
        assert!(err.to_string().contains("bytecode"));
    }

    #[test]
    fn test_rejects_property_access_without_accessors() {
        let bad = EntityDescriptor::new("Tag", "tags")
            .attribute(AttributeDescriptor::basic("label", "label").with_access("property"));
        assert!(Metamodel::builder().entity(bad).build().is_err());
    }

    #[test]
    fn test_rejects_dangling_references() {
        assert!(Metamodel::builder().entity(order()).build().is_err());
        assert!(Metamodel::builder()
            .entity(customer())
            .entity(order())
            .build()
            .is_err());

        let filtered = order().filter("missing");
        assert!(Metamodel::builder()
            .entity(customer())
            .entity(filtered)
            .collection(orders())
            .build()
            .is_err());
    }

    #[test]
    fn test_rejects_fetch_profile_on_basic_attribute() {
        let result = Metamodel::builder()
            .entity(customer())
            .entity(order())
            .collection(orders())
            .filter(FilterDefinition::new("min", "total", ComparisonOp::Ge, "min"))
            .fetch_profile(FetchProfile::new("bad").fetch("Order", "total"))
            .build();
        assert!(result.is_err());
    }
}
