//! Query plans
//!
//! Translates load requests into structured, rendered statements. Plans of loadables that
//! the current influencers do not affect are built once per persistence unit and cached.

pub mod builder;
pub mod criteria;
pub mod statement;

pub use builder::{
    AttributeColumns, EntityProjection, JoinedCollection, JoinedEntity, LoadPlan, PlanBuilder,
    PlanShape,
};
pub use criteria::{Criteria, Restriction};
pub use statement::{
    ColumnRef, DeleteSpec, Join, Operand, OrderTerm, Predicate, Projection, SelectSpec,
    Statement, StatementSpec, UpdateSpec,
};

use crate::backends::SqlDialect;
use crate::error::OrmResult;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    loadable: String,
    shape: PlanShape,
    dialect: SqlDialect,
}

/// Standard plans shared by every context of a persistence unit
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: DashMap<PlanKey, Arc<LoadPlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached plan for `(loadable, shape, dialect)`, built with `build` on first use
    pub fn get_or_build(
        &self,
        loadable: &str,
        shape: PlanShape,
        dialect: SqlDialect,
        build: impl FnOnce() -> OrmResult<LoadPlan>,
    ) -> OrmResult<Arc<LoadPlan>> {
        let key = PlanKey {
            loadable: loadable.to_string(),
            shape,
            dialect,
        };
        if let Some(plan) = self.plans.get(&key) {
            return Ok(plan.value().clone());
        }

        let plan = Arc::new(build()?);
        Ok(self.plans.entry(key).or_insert(plan).value().clone())
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influencers::LoadQueryInfluencers;
    use crate::metamodel::{EntityDescriptor, Metamodel};

    #[test]
    fn test_plans_are_built_once() {
        let metamodel = Metamodel::builder()
            .entity(EntityDescriptor::new("Tag", "tags").basic("label", "label"))
            .build()
            .unwrap();
        let influencers = LoadQueryInfluencers::new();
        let tag = metamodel.entity("Tag").unwrap();
        let cache = PlanCache::new();

        let mut builds = 0;
        for _ in 0..3 {
            cache
                .get_or_build("Tag", PlanShape::ById, SqlDialect::PostgreSQL, || {
                    builds += 1;
                    PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
                        .entity_by_ids(tag, 1)
                })
                .unwrap();
        }
        assert_eq!(builds, 1);
        assert_eq!(cache.len(), 1);
    }
}
