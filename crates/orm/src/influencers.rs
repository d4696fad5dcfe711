//! Load query influencers
//!
//! Enabled filters, fetch profiles and the active entity graph of one persistence context.
//! The loader only ever sees a snapshot taken at the start of a load.

use crate::backends::DatabaseValue;
use crate::error::{OrmError, OrmResult};
use crate::metamodel::{FetchProfile, FilterDefinition};
use std::collections::{BTreeMap, BTreeSet};

/// An enabled filter and its parameter bindings
#[derive(Debug, Clone, PartialEq)]
pub struct FilterInstance {
    name: String,
    parameters: BTreeMap<String, DatabaseValue>,
}

impl FilterInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter(&self, name: &str) -> Option<&DatabaseValue> {
        self.parameters.get(name)
    }

    /// Check that every parameter the definition needs is bound
    pub fn validate(&self, definition: &FilterDefinition) -> OrmResult<()> {
        match definition.parameter() {
            Some(param) if !self.parameters.contains_key(param) => {
                Err(OrmError::Configuration(format!(
                    "Filter '{}' requires parameter '{}'",
                    self.name, param
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Associations to join-fetch for one root kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityGraph {
    root: String,
    attribute_nodes: BTreeSet<String>,
}

impl EntityGraph {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            attribute_nodes: BTreeSet::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute_nodes.insert(attribute.into());
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn includes(&self, kind: &str, attribute: &str) -> bool {
        self.root == kind && self.attribute_nodes.contains(attribute)
    }

    pub fn attribute_nodes(&self) -> impl Iterator<Item = &str> {
        self.attribute_nodes.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadQueryInfluencers {
    enabled_filters: BTreeMap<String, FilterInstance>,
    enabled_fetch_profiles: BTreeMap<String, FetchProfile>,
    entity_graph: Option<EntityGraph>,
}

impl LoadQueryInfluencers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_filter(&mut self, filter: FilterInstance) {
        self.enabled_filters.insert(filter.name.clone(), filter);
    }

    pub fn disable_filter(&mut self, name: &str) -> bool {
        self.enabled_filters.remove(name).is_some()
    }

    pub fn is_filter_enabled(&self, name: &str) -> bool {
        self.enabled_filters.contains_key(name)
    }

    pub fn enabled_filter(&self, name: &str) -> Option<&FilterInstance> {
        self.enabled_filters.get(name)
    }

    pub fn has_enabled_filters(&self) -> bool {
        !self.enabled_filters.is_empty()
    }

    pub fn enable_fetch_profile(&mut self, profile: FetchProfile) {
        self.enabled_fetch_profiles
            .insert(profile.name().to_string(), profile);
    }

    pub fn disable_fetch_profile(&mut self, name: &str) -> bool {
        self.enabled_fetch_profiles.remove(name).is_some()
    }

    pub fn is_fetch_profile_enabled(&self, name: &str) -> bool {
        self.enabled_fetch_profiles.contains_key(name)
    }

    pub fn enabled_fetch_profiles(&self) -> impl Iterator<Item = &FetchProfile> {
        self.enabled_fetch_profiles.values()
    }

    pub fn has_enabled_fetch_profiles(&self) -> bool {
        !self.enabled_fetch_profiles.is_empty()
    }

    pub fn set_entity_graph(&mut self, graph: Option<EntityGraph>) {
        self.entity_graph = graph;
    }

    pub fn entity_graph(&self) -> Option<&EntityGraph> {
        self.entity_graph.as_ref()
    }

    /// Nothing enabled: every loadable can use its standard plans
    pub fn is_empty(&self) -> bool {
        !self.has_enabled_filters()
            && !self.has_enabled_fetch_profiles()
            && self.entity_graph.is_none()
    }
}
