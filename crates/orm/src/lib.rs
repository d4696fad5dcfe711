//! # keel-orm: entity loading with two-tier caching
//!
//! Loads entity instances through a per-unit-of-work persistence context (the identity map),
//! an optional shared second-level cache ([`keel_cache`]) and finally the store, in that
//! order. Associations are served by lazy proxies and collections bound to their context;
//! flush writes dirty state back with optimistic version checks and keeps cache regions
//! consistent according to each region's concurrency strategy.
//!
//! ```ignore
//! let unit = PersistenceUnit::new(metamodel, PersistenceConfig::default(), data_access)?;
//! let context = unit.open_context();
//! let order = context.find("Order", 42).await?;
//! context.close().await?;
//! ```

pub mod access;
pub mod backends;
pub mod config;
pub mod context;
pub mod error;
pub mod flush;
pub mod influencers;
pub mod instance;
pub mod loader;
pub mod metamodel;
pub mod plan;
pub mod proxy;
pub mod stats;
pub mod unit;

pub use access::{AccessorPair, PropertyAccess, PropertyAccessKind};
pub use backends::{DataAccess, DatabaseRow, DatabaseValue, MemoryDatabase, PostgresDataAccess, SqlDialect};
pub use config::{CacheMode, ConfigError, PersistenceConfig};
pub use context::{EntitySlot, EntityStatus, PersistenceContext};
pub use error::{OrmError, OrmResult};
pub use flush::FlushSummary;
pub use influencers::{EntityGraph, FilterInstance, LoadQueryInfluencers};
pub use instance::{ComponentValue, EntityInstance, ManagedEntity, PropertyHolder, PropertyValue};
pub use metamodel::{
    AttributeDescriptor, AttributeType, CollectionDescriptor, CollectionKey, ComparisonOp,
    ComponentDescriptor, EntityDescriptor, EntityKey, FetchMode, FetchProfile, FilterDefinition,
    IdKind, Identifier, Loadable, Metamodel, MetamodelBuilder,
};
pub use plan::Criteria;
pub use proxy::{EntityProxy, PersistentCollection, ProxyStatus};
pub use stats::{Statistics, StatisticsSnapshot};
pub use unit::PersistenceUnit;

pub use keel_cache::{AccessType, CacheEntry, CacheError, CacheKey, RegionAccess, RegionConfig, RegionFactory};
