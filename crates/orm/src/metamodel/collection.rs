//! Collection descriptors

use super::entity::{CacheSettings, FetchMode};
use super::loadable::Loadable;
use crate::influencers::LoadQueryInfluencers;
use keel_cache::AccessType;

/// Static description of one collection role.
///
/// Collections are one-to-many: elements are rows of the element kind's table whose
/// `key_column` holds the owner's identifier.
#[derive(Debug, Clone)]
pub struct CollectionDescriptor {
    role: String,
    owner: String,
    attribute: String,
    element: String,
    key_column: String,
    id_column: Option<String>,
    order_column: Option<String>,
    filters: Vec<String>,
    cache: Option<CacheSettings>,
    batch_size: Option<usize>,
    fetch: FetchMode,
    extra_lazy: bool,
}

impl CollectionDescriptor {
    /// Collection held by `owner.attribute`, with role name `"{owner}.{attribute}"`
    pub fn new(
        owner: impl Into<String>,
        attribute: impl Into<String>,
        element: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        let owner = owner.into();
        let attribute = attribute.into();
        Self {
            role: format!("{}.{}", owner, attribute),
            owner,
            attribute,
            element: element.into(),
            key_column: key_column.into(),
            id_column: None,
            order_column: None,
            filters: Vec::new(),
            cache: None,
            batch_size: None,
            fetch: FetchMode::Lazy,
            extra_lazy: false,
        }
    }

    pub fn identified_by(mut self, column: impl Into<String>) -> Self {
        self.id_column = Some(column.into());
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_column = Some(column.into());
        self
    }

    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filters.push(name.into());
        self
    }

    pub fn cached(mut self, access: AccessType) -> Self {
        self.cache = Some(CacheSettings::new(access));
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn fetch(mut self, mode: FetchMode) -> Self {
        self.fetch = mode;
        self
    }

    /// Answer `size` and `contains` with dedicated statements instead of initializing
    pub fn extra_lazy(mut self) -> Self {
        self.extra_lazy = true;
        self
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn element(&self) -> &str {
        &self.element
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn id_column(&self) -> Option<&str> {
        self.id_column.as_deref()
    }

    pub fn order_column(&self) -> Option<&str> {
        self.order_column.as_deref()
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn cache(&self) -> Option<&CacheSettings> {
        self.cache.as_ref()
    }

    pub fn cache_region(&self) -> Option<&str> {
        self.cache.as_ref().map(|c| c.region_name(&self.role))
    }

    pub fn batch_fetch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn fetch_mode(&self) -> FetchMode {
        self.fetch
    }

    pub fn is_extra_lazy(&self) -> bool {
        self.extra_lazy
    }
}

impl Loadable for CollectionDescriptor {
    fn root_path_name(&self) -> &str {
        &self.role
    }

    fn is_affected_by_enabled_filters(&self, influencers: &LoadQueryInfluencers) -> bool {
        self.filters.iter().any(|f| influencers.is_filter_enabled(f))
    }

    fn is_affected_by_entity_graph(&self, influencers: &LoadQueryInfluencers) -> bool {
        influencers.entity_graph().map_or(false, |graph| {
            graph.includes(&self.owner, &self.attribute) || graph.root() == self.element
        })
    }

    fn is_affected_by_enabled_fetch_profiles(&self, influencers: &LoadQueryInfluencers) -> bool {
        influencers.enabled_fetch_profiles().any(|profile| {
            profile.fetches_association(&self.owner, &self.attribute)
                || profile.applies_to(&self.element)
        })
    }
}
