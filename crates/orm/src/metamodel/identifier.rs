//! Identifiers and identity keys

use crate::backends::DatabaseValue;
use crate::error::{OrmError, OrmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declared type of an identifier attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdKind {
    Int,
    Text,
    Uuid,
}

/// Identifier value of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl Identifier {
    pub fn kind(&self) -> IdKind {
        match self {
            Identifier::Int(_) => IdKind::Int,
            Identifier::Text(_) => IdKind::Text,
            Identifier::Uuid(_) => IdKind::Uuid,
        }
    }

    /// Canonical rendering used in cache keys, unique across identifier types
    pub fn cache_id(&self) -> String {
        match self {
            Identifier::Int(i) => format!("i:{}", i),
            Identifier::Text(s) => format!("t:{}", s),
            Identifier::Uuid(u) => format!("u:{}", u),
        }
    }

    pub fn to_database_value(&self) -> DatabaseValue {
        match self {
            Identifier::Int(i) => DatabaseValue::Int64(*i),
            Identifier::Text(s) => DatabaseValue::String(s.clone()),
            Identifier::Uuid(u) => DatabaseValue::Uuid(*u),
        }
    }

    /// Read an identifier of type `kind` from a column value; `None` for SQL null
    pub fn from_database_value(kind: IdKind, value: &DatabaseValue) -> OrmResult<Option<Self>> {
        let id = match (kind, value) {
            (_, DatabaseValue::Null) => return Ok(None),
            (IdKind::Int, DatabaseValue::Int32(i)) => Identifier::Int(*i as i64),
            (IdKind::Int, DatabaseValue::Int64(i)) => Identifier::Int(*i),
            (IdKind::Text, DatabaseValue::String(s)) => Identifier::Text(s.clone()),
            (IdKind::Uuid, DatabaseValue::Uuid(u)) => Identifier::Uuid(*u),
            (IdKind::Uuid, DatabaseValue::String(s)) => Identifier::Uuid(
                Uuid::parse_str(s).map_err(|e| OrmError::Hydration(e.to_string()))?,
            ),
            (kind, other) => {
                return Err(OrmError::Hydration(format!(
                    "Cannot read {:?} identifier from {:?}",
                    kind, other
                )))
            }
        };
        Ok(Some(id))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Int(i) => write!(f, "{}", i),
            Identifier::Text(s) => f.write_str(s),
            Identifier::Uuid(u) => write!(f, "{}", u),
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Identifier::Int(value)
    }
}

impl From<i32> for Identifier {
    fn from(value: i32) -> Self {
        Identifier::Int(value as i64)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::Text(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Identifier::Text(value)
    }
}

impl From<Uuid> for Identifier {
    fn from(value: Uuid) -> Self {
        Identifier::Uuid(value)
    }
}

/// Identity of an entity within a context: kind name plus identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: String,
    pub id: Identifier,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, id: impl Into<Identifier>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Identity of a collection: role name plus owner identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionKey {
    pub role: String,
    pub owner: Identifier,
}

impl CollectionKey {
    pub fn new(role: impl Into<String>, owner: impl Into<Identifier>) -> Self {
        Self {
            role: role.into(),
            owner: owner.into(),
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_ids_are_type_qualified() {
        assert_eq!(Identifier::Int(42).cache_id(), "i:42");
        assert_eq!(Identifier::from("42").cache_id(), "t:42");
        assert_ne!(Identifier::Int(42).cache_id(), Identifier::from("42").cache_id());
    }

    #[test]
    fn test_read_from_column() {
        assert_eq!(
            Identifier::from_database_value(IdKind::Int, &DatabaseValue::Int32(7)).unwrap(),
            Some(Identifier::Int(7))
        );
        assert_eq!(
            Identifier::from_database_value(IdKind::Text, &DatabaseValue::Null).unwrap(),
            None
        );
        assert!(Identifier::from_database_value(IdKind::Int, &DatabaseValue::from("x")).is_err());

        let uuid = Uuid::new_v4();
        assert_eq!(
            Identifier::from_database_value(IdKind::Uuid, &DatabaseValue::String(uuid.to_string()))
                .unwrap(),
            Some(Identifier::Uuid(uuid))
        );
    }

    #[test]
    fn test_key_display() {
        assert_eq!(EntityKey::new("Order", 42i64).to_string(), "Order#42");
        assert_eq!(
            CollectionKey::new("Customer.orders", 7i64).to_string(),
            "Customer.orders#7"
        );
    }
}
