//! Materialized entity state
//!
//! Associations are stored as keys ([`EntityKey`], [`CollectionKey`]) rather than as handles
//! to other instances; they are resolved through the owning persistence context on access.
//! Object graphs with cycles therefore never form reference cycles in memory.

use crate::backends::DatabaseValue;
use crate::context::ContextShared;
use crate::error::{OrmError, OrmResult};
use crate::metamodel::{AttributeType, CollectionKey, EntityDescriptor, EntityKey, Identifier};
use crate::proxy::{EntityProxy, PersistentCollection};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Value of one attribute of a materialized instance
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Basic(DatabaseValue),
    Component(ComponentValue),
    Entity(Option<EntityKey>),
    Collection(CollectionKey),
}

impl Default for PropertyValue {
    fn default() -> Self {
        PropertyValue::Basic(DatabaseValue::Null)
    }
}

impl PropertyValue {
    pub fn as_basic(&self) -> Option<&DatabaseValue> {
        match self {
            PropertyValue::Basic(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_component(&self) -> Option<&ComponentValue> {
        match self {
            PropertyValue::Component(component) => Some(component),
            _ => None,
        }
    }
}

impl From<DatabaseValue> for PropertyValue {
    fn from(value: DatabaseValue) -> Self {
        PropertyValue::Basic(value)
    }
}

/// Storage an accessor reads from and writes to
pub trait PropertyHolder {
    fn slot(&self, index: usize) -> Option<&PropertyValue>;
    fn set_slot(&mut self, index: usize, value: PropertyValue);
    fn entry(&self, key: &str) -> Option<&PropertyValue>;
    fn set_entry(&mut self, key: &str, value: PropertyValue);
}

/// Positional slots plus a keyed map, shared by instances and components
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slots {
    fields: Vec<PropertyValue>,
    map: BTreeMap<String, PropertyValue>,
}

impl Slots {
    pub fn with_capacity(slots: usize) -> Self {
        Self {
            fields: vec![PropertyValue::default(); slots],
            map: BTreeMap::new(),
        }
    }
}

impl PropertyHolder for Slots {
    fn slot(&self, index: usize) -> Option<&PropertyValue> {
        self.fields.get(index)
    }

    fn set_slot(&mut self, index: usize, value: PropertyValue) {
        if index >= self.fields.len() {
            self.fields.resize(index + 1, PropertyValue::default());
        }
        self.fields[index] = value;
    }

    fn entry(&self, key: &str) -> Option<&PropertyValue> {
        self.map.get(key)
    }

    fn set_entry(&mut self, key: &str, value: PropertyValue) {
        self.map.insert(key.to_string(), value);
    }
}

/// Value of an embedded attribute
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentValue {
    slots: Slots,
}

impl ComponentValue {
    pub fn new(members: usize) -> Self {
        Self {
            slots: Slots::with_capacity(members),
        }
    }
}

impl PropertyHolder for ComponentValue {
    fn slot(&self, index: usize) -> Option<&PropertyValue> {
        self.slots.slot(index)
    }

    fn set_slot(&mut self, index: usize, value: PropertyValue) {
        self.slots.set_slot(index, value)
    }

    fn entry(&self, key: &str) -> Option<&PropertyValue> {
        self.slots.entry(key)
    }

    fn set_entry(&mut self, key: &str, value: PropertyValue) {
        self.slots.set_entry(key, value)
    }
}

/// Attribute storage of one entity instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityInstance {
    slots: Slots,
}

impl EntityInstance {
    pub fn new(attributes: usize) -> Self {
        Self {
            slots: Slots::with_capacity(attributes),
        }
    }
}

impl PropertyHolder for EntityInstance {
    fn slot(&self, index: usize) -> Option<&PropertyValue> {
        self.slots.slot(index)
    }

    fn set_slot(&mut self, index: usize, value: PropertyValue) {
        self.slots.set_slot(index, value)
    }

    fn entry(&self, key: &str) -> Option<&PropertyValue> {
        self.slots.entry(key)
    }

    fn set_entry(&mut self, key: &str, value: PropertyValue) {
        self.slots.set_entry(key, value)
    }
}

struct EntityCell {
    key: EntityKey,
    descriptor: Arc<EntityDescriptor>,
    context_id: u64,
    context: Weak<ContextShared>,
    state: RwLock<EntityInstance>,
}

/// Handle to an instance managed by a persistence context.
///
/// Clones share the same instance; [`ManagedEntity::ptr_eq`] tests instance identity.
#[derive(Clone)]
pub struct ManagedEntity {
    inner: Arc<EntityCell>,
}

impl fmt::Debug for ManagedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedEntity")
            .field("key", &self.inner.key)
            .finish()
    }
}

impl ManagedEntity {
    pub(crate) fn new(
        key: EntityKey,
        descriptor: Arc<EntityDescriptor>,
        context: &Arc<ContextShared>,
        instance: EntityInstance,
    ) -> Self {
        Self {
            inner: Arc::new(EntityCell {
                key,
                descriptor,
                context_id: context.id(),
                context: Arc::downgrade(context),
                state: RwLock::new(instance),
            }),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.inner.key
    }

    pub fn kind(&self) -> &str {
        &self.inner.key.kind
    }

    pub fn id(&self) -> &Identifier {
        &self.inner.key.id
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.inner.descriptor
    }

    pub fn ptr_eq(&self, other: &ManagedEntity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read an attribute through its accessor
    pub fn get(&self, attribute: &str) -> OrmResult<PropertyValue> {
        let attr = self.inner.descriptor.lookup(attribute)?;
        let state = self.inner.state.read();
        Ok(attr.access().read(&*state))
    }

    /// Read a basic attribute
    pub fn value(&self, attribute: &str) -> OrmResult<DatabaseValue> {
        match self.get(attribute)? {
            PropertyValue::Basic(value) => Ok(value),
            other => Err(OrmError::Hydration(format!(
                "{}.{} is not a basic attribute (found {:?})",
                self.kind(),
                attribute,
                other
            ))),
        }
    }

    /// Write a basic attribute
    pub fn set(&self, attribute: &str, value: impl Into<DatabaseValue>) -> OrmResult<()> {
        self.set_property(attribute, PropertyValue::Basic(value.into()))
    }

    /// Write any attribute through its accessor
    pub fn set_property(&self, attribute: &str, value: PropertyValue) -> OrmResult<()> {
        let attr = self.inner.descriptor.lookup(attribute)?;
        let mut state = self.inner.state.write();
        attr.access().write(&mut *state, value);
        Ok(())
    }

    /// Point a many-to-one attribute at another entity (or at nothing)
    pub fn set_reference(&self, attribute: &str, target: Option<&Identifier>) -> OrmResult<()> {
        let attr = self.inner.descriptor.lookup(attribute)?;
        let AttributeType::ManyToOne { target: kind, .. } = attr.attribute_type() else {
            return Err(OrmError::Configuration(format!(
                "{}.{} is not a many-to-one association",
                self.kind(),
                attribute
            )));
        };
        let key = target.map(|id| EntityKey::new(kind.clone(), id.clone()));
        self.set_property(attribute, PropertyValue::Entity(key))
    }

    /// Current business version, when the kind is versioned
    pub fn version(&self) -> Option<u64> {
        let attr = self.inner.descriptor.version_attribute()?;
        let state = self.inner.state.read();
        match attr.access().read(&*state) {
            PropertyValue::Basic(value) => value.as_i64().map(|v| v.max(0) as u64),
            _ => None,
        }
    }

    /// Proxy for the target of a many-to-one attribute
    pub fn reference(&self, attribute: &str) -> OrmResult<Option<EntityProxy>> {
        let key = match self.get(attribute)? {
            PropertyValue::Entity(key) => key,
            _ => {
                return Err(OrmError::Configuration(format!(
                    "{}.{} is not a many-to-one association",
                    self.kind(),
                    attribute
                )))
            }
        };

        match key {
            Some(key) => Ok(Some(self.context()?.reference(key)?)),
            None => Ok(None),
        }
    }

    /// Collection held by a one-to-many attribute
    pub fn collection(&self, attribute: &str) -> OrmResult<PersistentCollection> {
        match self.get(attribute)? {
            PropertyValue::Collection(key) => self.context()?.collection(&key),
            _ => Err(OrmError::Configuration(format!(
                "{}.{} is not a collection",
                self.kind(),
                attribute
            ))),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&EntityInstance) -> R) -> R {
        f(&self.inner.state.read())
    }

    pub(crate) fn replace_state(&self, instance: EntityInstance) {
        *self.inner.state.write() = instance;
    }

    fn context(&self) -> OrmResult<Arc<ContextShared>> {
        self.inner
            .context
            .upgrade()
            .ok_or_else(|| {
                OrmError::closed(self.inner.context_id, format!("navigate from {}", self.key()))
            })
    }
}
