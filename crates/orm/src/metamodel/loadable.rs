//! Common contract of everything the loader can resolve by identity

use crate::influencers::LoadQueryInfluencers;

/// An entity kind or a collection role.
///
/// Loaders keep one standard plan per loadable and only build a dedicated plan when the
/// current influencers change what a load of this loadable has to fetch.
pub trait Loadable {
    /// Name the loadable is addressed by: the entity name or the collection role
    fn root_path_name(&self) -> &str;

    fn is_affected_by_enabled_filters(&self, influencers: &LoadQueryInfluencers) -> bool;

    fn is_affected_by_entity_graph(&self, influencers: &LoadQueryInfluencers) -> bool;

    fn is_affected_by_enabled_fetch_profiles(&self, influencers: &LoadQueryInfluencers) -> bool;

    fn is_affected_by_influencers(&self, influencers: &LoadQueryInfluencers) -> bool {
        if influencers.is_empty() {
            return false;
        }
        self.is_affected_by_enabled_filters(influencers)
            || self.is_affected_by_entity_graph(influencers)
            || self.is_affected_by_enabled_fetch_profiles(influencers)
    }
}
