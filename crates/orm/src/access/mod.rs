//! Property accessors
//!
//! An accessor is chosen once per attribute when the metamodel is built, from a small fixed
//! vocabulary of external names, and never re-evaluated per call.

use crate::instance::{ComponentValue, PropertyHolder, PropertyValue};
use std::fmt;

/// Reads an attribute from its holder
pub type Getter = fn(&dyn PropertyHolder) -> PropertyValue;

/// Writes an attribute into its holder
pub type Setter = fn(&mut dyn PropertyHolder, PropertyValue);

/// A user supplied accessor pair
#[derive(Clone, Copy)]
pub struct AccessorPair {
    pub getter: Getter,
    pub setter: Setter,
}

impl AccessorPair {
    pub fn new(getter: Getter, setter: Setter) -> Self {
        Self { getter, setter }
    }
}

impl fmt::Debug for AccessorPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessorPair")
    }
}

/// Built-in access strategies, by external name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyAccessKind {
    /// Accessor pair
    Property,
    /// Direct slot storage
    Field,
    /// Accessor pair when one is supplied, slot storage otherwise
    Mixed,
    /// Keyed by attribute name
    Map,
    /// Through an embedded component's own accessor
    Embedded,
    /// Computed attributes that are never stored
    Noop,
}

impl PropertyAccessKind {
    pub const ALL: [PropertyAccessKind; 6] = [
        PropertyAccessKind::Property,
        PropertyAccessKind::Field,
        PropertyAccessKind::Mixed,
        PropertyAccessKind::Map,
        PropertyAccessKind::Embedded,
        PropertyAccessKind::Noop,
    ];

    pub fn external_name(&self) -> &'static str {
        match self {
            PropertyAccessKind::Property => "property",
            PropertyAccessKind::Field => "field",
            PropertyAccessKind::Mixed => "mixed",
            PropertyAccessKind::Map => "map",
            PropertyAccessKind::Embedded => "embedded",
            PropertyAccessKind::Noop => "noop",
        }
    }

    /// Look up a strategy by its exact external name
    pub fn interpret(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.external_name() == name)
    }
}

impl fmt::Display for PropertyAccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.external_name())
    }
}

/// Resolved accessor of one attribute
#[derive(Debug, Clone)]
pub enum PropertyAccess {
    Field {
        slot: usize,
    },
    Property {
        pair: AccessorPair,
    },
    Map {
        key: String,
    },
    Embedded {
        component: Box<PropertyAccess>,
        member: Box<PropertyAccess>,
    },
    Noop,
}

impl PropertyAccess {
    /// Resolve a non-embedded strategy for the attribute at `slot`.
    ///
    /// Embedded access needs the component's accessors and is assembled by the metamodel
    /// builder instead.
    pub fn resolve(
        kind: PropertyAccessKind,
        slot: usize,
        name: &str,
        pair: Option<AccessorPair>,
    ) -> Result<Self, String> {
        match (kind, pair) {
            (PropertyAccessKind::Property, Some(pair)) | (PropertyAccessKind::Mixed, Some(pair)) => {
                Ok(PropertyAccess::Property { pair })
            }
            (PropertyAccessKind::Property, None) => Err(format!(
                "attribute '{}' uses property access but has no accessor pair",
                name
            )),
            (PropertyAccessKind::Field, _) | (PropertyAccessKind::Mixed, None) => {
                Ok(PropertyAccess::Field { slot })
            }
            (PropertyAccessKind::Map, _) => Ok(PropertyAccess::Map {
                key: name.to_string(),
            }),
            (PropertyAccessKind::Noop, _) => Ok(PropertyAccess::Noop),
            (PropertyAccessKind::Embedded, _) => Err(format!(
                "attribute '{}' uses embedded access but names no component path",
                name
            )),
        }
    }

    pub fn read(&self, holder: &dyn PropertyHolder) -> PropertyValue {
        match self {
            PropertyAccess::Field { slot } => holder.slot(*slot).cloned().unwrap_or_default(),
            PropertyAccess::Property { pair } => (pair.getter)(holder),
            PropertyAccess::Map { key } => holder.entry(key).cloned().unwrap_or_default(),
            PropertyAccess::Embedded { component, member } => match component.read(holder) {
                PropertyValue::Component(value) => member.read(&value),
                _ => PropertyValue::default(),
            },
            PropertyAccess::Noop => PropertyValue::default(),
        }
    }

    pub fn write(&self, holder: &mut dyn PropertyHolder, value: PropertyValue) {
        match self {
            PropertyAccess::Field { slot } => holder.set_slot(*slot, value),
            PropertyAccess::Property { pair } => (pair.setter)(holder, value),
            PropertyAccess::Map { key } => holder.set_entry(key, value),
            PropertyAccess::Embedded { component, member } => {
                let mut target = match component.read(holder) {
                    PropertyValue::Component(existing) => existing,
                    _ => ComponentValue::default(),
                };
                member.write(&mut target, value);
                component.write(holder, PropertyValue::Component(target));
            }
            PropertyAccess::Noop => {}
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, PropertyAccess::Noop)
    }
}
