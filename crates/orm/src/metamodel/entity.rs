//! Entity descriptors

use super::identifier::IdKind;
use super::loadable::Loadable;
use crate::access::{AccessorPair, PropertyAccess};
use crate::error::{OrmError, OrmResult};
use crate::influencers::LoadQueryInfluencers;
use keel_cache::AccessType;

/// When an association is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// On first access through a proxy
    #[default]
    Lazy,
    /// Together with the owner, either joined into the owner's statement or by an
    /// immediate follow-up load
    Eager { join: bool },
}

impl FetchMode {
    pub const JOIN: FetchMode = FetchMode::Eager { join: true };
    pub const SELECT: FetchMode = FetchMode::Eager { join: false };

    pub fn is_lazy(&self) -> bool {
        matches!(self, FetchMode::Lazy)
    }

    pub fn is_join(&self) -> bool {
        matches!(self, FetchMode::Eager { join: true })
    }
}

/// Second-level cache settings of an entity kind or collection role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub access: AccessType,
    pub region: Option<String>,
}

impl CacheSettings {
    pub fn new(access: AccessType) -> Self {
        Self {
            access,
            region: None,
        }
    }

    /// Region name, defaulting to the loadable's own name
    pub fn region_name<'a>(&'a self, loadable: &'a str) -> &'a str {
        self.region.as_deref().unwrap_or(loadable)
    }
}

/// Members of an embedded attribute
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    name: String,
    members: Vec<AttributeDescriptor>,
}

impl ComponentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    /// Add a basic member stored in `column`
    pub fn member(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.members.push(AttributeDescriptor::basic(name, column));
        self
    }

    /// Add a member with a preconfigured descriptor
    pub fn with_member(mut self, member: AttributeDescriptor) -> Self {
        self.members.push(member);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[AttributeDescriptor] {
        &self.members
    }

    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name == name)
    }

    pub(crate) fn members_mut(&mut self) -> &mut [AttributeDescriptor] {
        &mut self.members
    }
}

/// Shape of an attribute
#[derive(Debug, Clone)]
pub enum AttributeType {
    Basic,
    Embedded(ComponentDescriptor),
    ManyToOne { target: String, fetch: FetchMode },
    OneToMany { role: String },
    /// Read through an embedded attribute's member; never stored on its own
    ComponentPath { component: String, member: String },
    /// Derived in memory; never stored
    Computed,
}

#[derive(Debug, Clone)]
pub struct AttributeDescriptor {
    name: String,
    column: Option<String>,
    attribute_type: AttributeType,
    nullable: bool,
    access_name: Option<String>,
    accessors: Option<AccessorPair>,
    access: PropertyAccess,
}

impl AttributeDescriptor {
    fn with_type(name: impl Into<String>, column: Option<String>, attribute_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            column,
            attribute_type,
            nullable: true,
            access_name: None,
            accessors: None,
            access: PropertyAccess::Noop,
        }
    }

    pub fn basic(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::with_type(name, Some(column.into()), AttributeType::Basic)
    }

    pub fn embedded(name: impl Into<String>, component: ComponentDescriptor) -> Self {
        Self::with_type(name, None, AttributeType::Embedded(component))
    }

    /// Single-valued association held through foreign key `column`
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self::with_type(
            name,
            Some(column.into()),
            AttributeType::ManyToOne {
                target: target.into(),
                fetch: FetchMode::Lazy,
            },
        )
    }

    /// Collection-valued association described by the collection `role`
    pub fn one_to_many(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self::with_type(name, None, AttributeType::OneToMany { role: role.into() })
    }

    /// Alias for `member` of the embedded attribute `component`
    pub fn component_path(
        name: impl Into<String>,
        component: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut attribute = Self::with_type(
            name,
            None,
            AttributeType::ComponentPath {
                component: component.into(),
                member: member.into(),
            },
        );
        attribute.access_name = Some("embedded".to_string());
        attribute
    }

    pub fn computed(name: impl Into<String>) -> Self {
        let mut attribute = Self::with_type(name, None, AttributeType::Computed);
        attribute.access_name = Some("noop".to_string());
        attribute
    }

    /// Select the access strategy by external name
    pub fn with_access(mut self, name: impl Into<String>) -> Self {
        self.access_name = Some(name.into());
        self
    }

    pub fn with_accessors(mut self, pair: AccessorPair) -> Self {
        self.accessors = Some(pair);
        self
    }

    pub fn with_fetch(mut self, mode: FetchMode) -> Self {
        if let AttributeType::ManyToOne { fetch, .. } = &mut self.attribute_type {
            *fetch = mode;
        }
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn attribute_type(&self) -> &AttributeType {
        &self.attribute_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn access(&self) -> &PropertyAccess {
        &self.access
    }

    /// Whether the attribute's value is part of the persistent state
    pub fn is_persistent(&self) -> bool {
        !matches!(
            self.attribute_type,
            AttributeType::ComponentPath { .. } | AttributeType::Computed
        )
    }

    pub fn is_association(&self) -> bool {
        matches!(
            self.attribute_type,
            AttributeType::ManyToOne { .. } | AttributeType::OneToMany { .. }
        )
    }

    pub(crate) fn access_name(&self) -> Option<&str> {
        self.access_name.as_deref()
    }

    pub(crate) fn accessors(&self) -> Option<AccessorPair> {
        self.accessors
    }

    pub(crate) fn set_access(&mut self, access: PropertyAccess) {
        self.access = access;
    }

    pub(crate) fn attribute_type_mut(&mut self) -> &mut AttributeType {
        &mut self.attribute_type
    }
}

/// Identifier attribute of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdDescriptor {
    pub name: String,
    pub column: String,
    pub kind: IdKind,
}

/// Static description of one entity kind
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    name: String,
    table: String,
    id: IdDescriptor,
    attributes: Vec<AttributeDescriptor>,
    version: Option<usize>,
    cache: Option<CacheSettings>,
    filters: Vec<String>,
    batch_size: Option<usize>,
    default_access: String,
}

impl EntityDescriptor {
    /// Entity `name` stored in `table` with an integer `id` column
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id: IdDescriptor {
                name: "id".to_string(),
                column: "id".to_string(),
                kind: IdKind::Int,
            },
            attributes: Vec::new(),
            version: None,
            cache: None,
            filters: Vec::new(),
            batch_size: None,
            default_access: "field".to_string(),
        }
    }

    pub fn id(mut self, name: impl Into<String>, column: impl Into<String>, kind: IdKind) -> Self {
        self.id = IdDescriptor {
            name: name.into(),
            column: column.into(),
            kind,
        };
        self
    }

    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn basic(self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.attribute(AttributeDescriptor::basic(name, column))
    }

    /// Add the optimistic version attribute
    pub fn version(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.version = Some(self.attributes.len());
        self.attribute(AttributeDescriptor::basic(name, column).not_null())
    }

    pub fn cached(mut self, access: AccessType) -> Self {
        self.cache = Some(CacheSettings::new(access));
        self
    }

    pub fn cached_in(mut self, access: AccessType, region: impl Into<String>) -> Self {
        self.cache = Some(CacheSettings {
            access,
            region: Some(region.into()),
        });
        self
    }

    /// Declare that the named filter restricts queries of this kind
    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filters.push(name.into());
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Access strategy of attributes that do not name one
    pub fn default_access(mut self, name: impl Into<String>) -> Self {
        self.default_access = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn identifier(&self) -> &IdDescriptor {
        &self.id
    }

    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Look up an attribute by name
    pub fn lookup(&self, name: &str) -> OrmResult<&AttributeDescriptor> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| {
                OrmError::Configuration(format!("{} has no attribute '{}'", self.name, name))
            })
    }

    pub fn version_attribute(&self) -> Option<&AttributeDescriptor> {
        self.version.and_then(|index| self.attributes.get(index))
    }

    pub fn version_index(&self) -> Option<usize> {
        self.version
    }

    pub fn cache(&self) -> Option<&CacheSettings> {
        self.cache.as_ref()
    }

    pub fn cache_region(&self) -> Option<&str> {
        self.cache.as_ref().map(|c| c.region_name(&self.name))
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn batch_fetch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub(crate) fn default_access_name(&self) -> &str {
        &self.default_access
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut Vec<AttributeDescriptor> {
        &mut self.attributes
    }
}

impl Loadable for EntityDescriptor {
    fn root_path_name(&self) -> &str {
        &self.name
    }

    fn is_affected_by_enabled_filters(&self, influencers: &LoadQueryInfluencers) -> bool {
        self.filters.iter().any(|f| influencers.is_filter_enabled(f))
    }

    fn is_affected_by_entity_graph(&self, influencers: &LoadQueryInfluencers) -> bool {
        influencers
            .entity_graph()
            .map_or(false, |graph| graph.root() == self.name)
    }

    fn is_affected_by_enabled_fetch_profiles(&self, influencers: &LoadQueryInfluencers) -> bool {
        influencers
            .enabled_fetch_profiles()
            .any(|profile| profile.applies_to(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influencers::{EntityGraph, FilterInstance};
    use crate::metamodel::FetchProfile;

    fn order() -> EntityDescriptor {
        EntityDescriptor::new("Order", "orders")
            .basic("total", "total")
            .version("version", "version")
            .attribute(AttributeDescriptor::many_to_one("customer", "Customer", "customer_id"))
            .filter("open")
    }

    #[test]
    fn test_attribute_lookup() {
        let order = order();
        assert_eq!(order.attribute_index("customer"), Some(2));
        assert_eq!(order.version_attribute().map(|a| a.name()), Some("version"));
        assert!(order.lookup("missing").is_err());
        assert!(!order.lookup("version").unwrap().is_nullable());
    }

    #[test]
    fn test_persistent_attributes() {
        let path = AttributeDescriptor::component_path("city", "address", "city");
        assert!(!path.is_persistent());
        assert_eq!(path.access_name(), Some("embedded"));
        assert!(!AttributeDescriptor::computed("label").is_persistent());
        assert!(AttributeDescriptor::one_to_many("lines", "Order.lines").is_association());
    }

    #[test]
    fn test_fetch_override_applies_to_many_to_one_only() {
        let eager = AttributeDescriptor::many_to_one("customer", "Customer", "customer_id")
            .with_fetch(FetchMode::JOIN);
        assert!(matches!(
            eager.attribute_type(),
            AttributeType::ManyToOne { fetch, .. } if fetch.is_join()
        ));
    }

    #[test]
    fn test_cache_region_defaults_to_entity_name() {
        let order = order().cached(AccessType::ReadWrite);
        assert_eq!(order.cache_region(), Some("Order"));

        let shared = self::order().cached_in(AccessType::ReadWrite, "sales");
        assert_eq!(shared.cache_region(), Some("sales"));
    }

    #[test]
    fn test_influence() {
        let order = order();
        let mut influencers = LoadQueryInfluencers::new();
        assert!(!order.is_affected_by_influencers(&influencers));

        influencers.enable_filter(FilterInstance::new("other"));
        assert!(!order.is_affected_by_influencers(&influencers));

        influencers.enable_filter(FilterInstance::new("open"));
        assert!(order.is_affected_by_enabled_filters(&influencers));

        let mut influencers = LoadQueryInfluencers::new();
        influencers.set_entity_graph(Some(EntityGraph::new("Order").with_attribute("customer")));
        assert!(order.is_affected_by_entity_graph(&influencers));

        let mut influencers = LoadQueryInfluencers::new();
        influencers.enable_fetch_profile(FetchProfile::new("p").fetch("Order", "customer"));
        assert!(order.is_affected_by_enabled_fetch_profiles(&influencers));
    }
}
