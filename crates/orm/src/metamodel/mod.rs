//! Metamodel - descriptors of entity kinds and collection roles
//!
//! Descriptors are assembled with builder methods, then validated once by
//! [`MetamodelBuilder::build`], which also resolves every attribute's accessor.

pub mod collection;
pub mod entity;
pub mod filter;
pub mod identifier;
pub mod loadable;
pub mod registry;

pub use collection::CollectionDescriptor;
pub use entity::{
    AttributeDescriptor, AttributeType, CacheSettings, ComponentDescriptor, EntityDescriptor,
    FetchMode, IdDescriptor,
};
pub use filter::{ComparisonOp, FetchProfile, FilterDefinition};
pub use identifier::{CollectionKey, EntityKey, IdKind, Identifier};
pub use loadable::Loadable;
pub use registry::{Metamodel, MetamodelBuilder};
