//! Load plan construction
//!
//! Columns are labelled `{alias}_{column}` so that rows of joined selects can be read back
//! per table without ambiguity.

use super::criteria::Criteria;
use super::statement::{ColumnRef, Join, Operand, OrderTerm, Predicate, Projection, SelectSpec, Statement};
use crate::backends::{DatabaseValue, SqlDialect};
use crate::error::{OrmError, OrmResult};
use crate::influencers::LoadQueryInfluencers;
use crate::metamodel::{
    AttributeType, CollectionDescriptor, ComparisonOp, EntityDescriptor, FetchMode, Loadable,
    Metamodel,
};

/// Where each attribute of an entity is found in a result row
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeColumns {
    Basic(String),
    Component(Vec<String>),
    Reference(String),
    Collection,
    Transient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityProjection {
    pub kind: String,
    pub alias: String,
    pub id_label: String,
    pub attributes: Vec<AttributeColumns>,
}

/// Many-to-one target fetched in the same statement as its owner
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedEntity {
    pub attribute: usize,
    pub projection: EntityProjection,
}

/// Collection fetched in the same statement as its owner
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedCollection {
    pub role: String,
    pub projection: EntityProjection,
    pub joined: Vec<JoinedEntity>,
}

/// Shape of a plan; together with the loadable name it keys the standard plan cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanShape {
    ById,
    ByIds(usize),
    ByOwners(usize),
    Count,
    Exists,
    Criteria,
}

/// Prepared select for one loadable
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub shape: PlanShape,
    pub loadable: String,
    pub select: SelectSpec,
    /// Root entity, or the element entity of a collection plan
    pub root: EntityProjection,
    pub joined: Vec<JoinedEntity>,
    pub collection: Option<JoinedCollection>,
    /// Label of the owner key column in collection plans
    pub owner_label: Option<String>,
    sql: String,
    runtime_parameters: usize,
    fixed_parameters: Vec<DatabaseValue>,
}

impl LoadPlan {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn runtime_parameters(&self) -> usize {
        self.runtime_parameters
    }

    /// Bind runtime values (identifiers, owner keys) to produce an executable statement
    pub fn bind(&self, values: Vec<DatabaseValue>) -> OrmResult<Statement> {
        if values.len() != self.runtime_parameters {
            return Err(OrmError::Query(format!(
                "Plan for {} expects {} parameters, got {}",
                self.loadable,
                self.runtime_parameters,
                values.len()
            )));
        }
        let mut parameters = values;
        parameters.extend(self.fixed_parameters.iter().cloned());
        Ok(Statement {
            sql: self.sql.clone(),
            spec: super::statement::StatementSpec::Select(self.select.clone()),
            parameters,
        })
    }
}

/// Builds plans for one metamodel under one set of influencers
pub struct PlanBuilder<'a> {
    metamodel: &'a Metamodel,
    influencers: &'a LoadQueryInfluencers,
    dialect: SqlDialect,
    next_alias: usize,
    fixed: Vec<DatabaseValue>,
    runtime: usize,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        metamodel: &'a Metamodel,
        influencers: &'a LoadQueryInfluencers,
        dialect: SqlDialect,
    ) -> Self {
        Self {
            metamodel,
            influencers,
            dialect,
            next_alias: 0,
            fixed: Vec::new(),
            runtime: 0,
        }
    }

    /// Load `count` instances of `entity` by identifier
    pub fn entity_by_ids(mut self, entity: &EntityDescriptor, count: usize) -> OrmResult<LoadPlan> {
        let shape = if count == 1 {
            PlanShape::ById
        } else {
            PlanShape::ByIds(count)
        };
        self.runtime = count;

        let alias = self.alias();
        let mut select = SelectSpec::new(entity.table(), &alias);
        let root = self.project(&mut select, entity, &alias);
        let joined = self.join_references(&mut select, entity, &alias)?;
        let collection = self.join_collection(&mut select, entity, &alias)?;
        select.predicates.push(Predicate {
            alias: alias.clone(),
            column: entity.identifier().column.clone(),
            op: if count == 1 { ComparisonOp::Eq } else { ComparisonOp::In },
            operand: if count == 1 {
                Operand::Param(0)
            } else {
                Operand::List { start: 0, count }
            },
        });
        if collection.is_some() {
            select.order_by.push(OrderTerm {
                alias: alias.clone(),
                column: entity.identifier().column.clone(),
                descending: false,
            });
        }

        Ok(self.finish(shape, entity.name(), select, root, joined, collection, None))
    }

    /// Load the elements of `count` collections of one role, keyed by owner
    pub fn collection_by_owners(
        mut self,
        collection: &CollectionDescriptor,
        count: usize,
    ) -> OrmResult<LoadPlan> {
        self.runtime = count;
        let element = self.metamodel.entity(collection.element())?.clone();

        let alias = self.alias();
        let mut select = SelectSpec::new(element.table(), &alias);
        let root = self.project(&mut select, &element, &alias);
        let owner_label = format!("{}__owner", alias);
        select.columns.push(ColumnRef {
            alias: alias.clone(),
            column: collection.key_column().to_string(),
            label: owner_label.clone(),
        });
        let joined = self.join_references(&mut select, &element, &alias)?;

        select.predicates.push(Predicate {
            alias: alias.clone(),
            column: collection.key_column().to_string(),
            op: if count == 1 { ComparisonOp::Eq } else { ComparisonOp::In },
            operand: if count == 1 {
                Operand::Param(0)
            } else {
                Operand::List { start: 0, count }
            },
        });
        self.apply_filters(&mut select, &alias, collection.filters())?;
        select.order_by.push(OrderTerm {
            alias: alias.clone(),
            column: collection
                .order_column()
                .unwrap_or(&element.identifier().column)
                .to_string(),
            descending: false,
        });

        Ok(self.finish(
            PlanShape::ByOwners(count),
            collection.role(),
            select,
            root,
            joined,
            None,
            Some(owner_label),
        ))
    }

    /// `SELECT COUNT(*)` over one owner's elements
    pub fn collection_count(self, collection: &CollectionDescriptor) -> OrmResult<LoadPlan> {
        self.probe(collection, Projection::Count)
    }

    /// Whether one owner's collection holds a given element identifier
    pub fn collection_exists(self, collection: &CollectionDescriptor) -> OrmResult<LoadPlan> {
        self.probe(collection, Projection::Exists)
    }

    fn probe(mut self, collection: &CollectionDescriptor, projection: Projection) -> OrmResult<LoadPlan> {
        let element = self.metamodel.entity(collection.element())?.clone();
        let alias = self.alias();
        let mut select = SelectSpec::new(element.table(), &alias);
        select.projection = projection;

        select.predicates.push(Predicate {
            alias: alias.clone(),
            column: collection.key_column().to_string(),
            op: ComparisonOp::Eq,
            operand: Operand::Param(0),
        });
        self.runtime = 1;
        if projection == Projection::Exists {
            select.predicates.push(Predicate {
                alias: alias.clone(),
                column: element.identifier().column.clone(),
                op: ComparisonOp::Eq,
                operand: Operand::Param(1),
            });
            self.runtime = 2;
        }
        self.apply_filters(&mut select, &alias, collection.filters())?;

        let root = EntityProjection {
            kind: element.name().to_string(),
            alias: alias.clone(),
            id_label: format!("{}_{}", alias, element.identifier().column),
            attributes: Vec::new(),
        };
        let shape = match projection {
            Projection::Count => PlanShape::Count,
            _ => PlanShape::Exists,
        };
        Ok(self.finish(shape, collection.role(), select, root, Vec::new(), None, None))
    }

    /// Criteria query with the entity's enabled filters applied
    pub fn criteria(mut self, entity: &EntityDescriptor, criteria: &Criteria) -> OrmResult<LoadPlan> {
        let alias = self.alias();
        let mut select = SelectSpec::new(entity.table(), &alias);
        let root = self.project(&mut select, entity, &alias);
        let joined = self.join_references(&mut select, entity, &alias)?;
        let collection = if criteria.max_results().is_none() {
            self.join_collection(&mut select, entity, &alias)?
        } else {
            None
        };

        for restriction in criteria.restrictions() {
            let column = restriction_column(entity, &restriction.attribute)?;
            let operand = self.fixed_operand(restriction.op, &restriction.value);
            select.predicates.push(Predicate {
                alias: alias.clone(),
                column,
                op: restriction.op,
                operand,
            });
        }
        self.apply_filters(&mut select, &alias, entity.filters())?;

        for (attribute, descending) in criteria.ordering() {
            select.order_by.push(OrderTerm {
                alias: alias.clone(),
                column: restriction_column(entity, attribute)?,
                descending: *descending,
            });
        }
        if collection.is_some() {
            select.order_by.push(OrderTerm {
                alias: alias.clone(),
                column: entity.identifier().column.clone(),
                descending: false,
            });
        }
        select.limit = criteria.max_results();

        Ok(self.finish(PlanShape::Criteria, entity.name(), select, root, joined, collection, None))
    }

    fn finish(
        self,
        shape: PlanShape,
        loadable: &str,
        select: SelectSpec,
        root: EntityProjection,
        joined: Vec<JoinedEntity>,
        collection: Option<JoinedCollection>,
        owner_label: Option<String>,
    ) -> LoadPlan {
        let sql = select.render(self.dialect);
        tracing::debug!("Built {:?} plan for {}: {}", shape, loadable, sql);
        LoadPlan {
            shape,
            loadable: loadable.to_string(),
            select,
            root,
            joined,
            collection,
            owner_label,
            sql,
            runtime_parameters: self.runtime,
            fixed_parameters: self.fixed,
        }
    }

    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    fn project(&self, select: &mut SelectSpec, entity: &EntityDescriptor, alias: &str) -> EntityProjection {
        let mut push = |column: &str| {
            let label = format!("{}_{}", alias, column);
            select.columns.push(ColumnRef {
                alias: alias.to_string(),
                column: column.to_string(),
                label: label.clone(),
            });
            label
        };

        let id_label = push(&entity.identifier().column);
        let attributes = entity
            .attributes()
            .iter()
            .map(|attribute| match (attribute.attribute_type(), attribute.column()) {
                (AttributeType::Basic, Some(column)) => AttributeColumns::Basic(push(column)),
                (AttributeType::ManyToOne { .. }, Some(column)) => {
                    AttributeColumns::Reference(push(column))
                }
                (AttributeType::Embedded(component), _) => AttributeColumns::Component(
                    component
                        .members()
                        .iter()
                        .filter_map(|m| m.column())
                        .map(&mut push)
                        .collect(),
                ),
                (AttributeType::OneToMany { .. }, _) => AttributeColumns::Collection,
                _ => AttributeColumns::Transient,
            })
            .collect();

        EntityProjection {
            kind: entity.name().to_string(),
            alias: alias.to_string(),
            id_label,
            attributes,
        }
    }

    fn fetches_by_join(&self, kind: &str, attribute: &str, fetch: FetchMode) -> bool {
        fetch.is_join()
            || self
                .influencers
                .entity_graph()
                .map_or(false, |graph| graph.includes(kind, attribute))
            || self
                .influencers
                .enabled_fetch_profiles()
                .any(|profile| profile.fetches_association(kind, attribute))
    }

    fn join_references(
        &mut self,
        select: &mut SelectSpec,
        entity: &EntityDescriptor,
        alias: &str,
    ) -> OrmResult<Vec<JoinedEntity>> {
        let mut joined = Vec::new();
        for (index, attribute) in entity.attributes().iter().enumerate() {
            let (AttributeType::ManyToOne { target, fetch }, Some(column)) =
                (attribute.attribute_type(), attribute.column())
            else {
                continue;
            };
            if !self.fetches_by_join(entity.name(), attribute.name(), *fetch) {
                continue;
            }

            let target = self.metamodel.entity(target)?.clone();
            let target_alias = self.alias();
            select.joins.push(Join {
                table: target.table().to_string(),
                alias: target_alias.clone(),
                left_alias: alias.to_string(),
                left_column: column.to_string(),
                right_column: target.identifier().column.clone(),
            });
            let projection = self.project(select, &target, &target_alias);
            joined.push(JoinedEntity {
                attribute: index,
                projection,
            });
        }
        Ok(joined)
    }

    /// Join at most one collection; a second collection join would multiply rows
    fn join_collection(
        &mut self,
        select: &mut SelectSpec,
        entity: &EntityDescriptor,
        alias: &str,
    ) -> OrmResult<Option<JoinedCollection>> {
        for attribute in entity.attributes() {
            let AttributeType::OneToMany { role } = attribute.attribute_type() else {
                continue;
            };
            let collection = self.metamodel.collection(role)?.clone();
            if !self.fetches_by_join(entity.name(), attribute.name(), collection.fetch_mode()) {
                continue;
            }
            if collection.is_affected_by_enabled_filters(self.influencers) {
                continue;
            }

            let element = self.metamodel.entity(collection.element())?.clone();
            let element_alias = self.alias();
            select.joins.push(Join {
                table: element.table().to_string(),
                alias: element_alias.clone(),
                left_alias: alias.to_string(),
                left_column: entity.identifier().column.clone(),
                right_column: collection.key_column().to_string(),
            });
            let projection = self.project(select, &element, &element_alias);
            let joined = self.join_references(select, &element, &element_alias)?;
            return Ok(Some(JoinedCollection {
                role: role.clone(),
                projection,
                joined,
            }));
        }
        Ok(None)
    }

    fn apply_filters(&mut self, select: &mut SelectSpec, alias: &str, names: &[String]) -> OrmResult<()> {
        for name in names {
            let Some(instance) = self.influencers.enabled_filter(name) else {
                continue;
            };
            let definition = self.metamodel.filter(name)?;
            instance.validate(definition)?;

            let value = definition
                .parameter()
                .and_then(|param| instance.parameter(param))
                .cloned()
                .unwrap_or(DatabaseValue::Null);
            let operand = self.fixed_operand(definition.op(), &value);
            select.predicates.push(Predicate {
                alias: alias.to_string(),
                column: definition.column().to_string(),
                op: definition.op(),
                operand,
            });
        }
        Ok(())
    }

    /// Register a value bound at plan build time, after all runtime parameters
    fn fixed_operand(&mut self, op: ComparisonOp, value: &DatabaseValue) -> Operand {
        if !op.takes_parameter() {
            return Operand::None;
        }
        let start = self.runtime + self.fixed.len();
        match (op, value) {
            (ComparisonOp::In, DatabaseValue::Array(values)) => {
                self.fixed.extend(values.iter().cloned());
                Operand::List {
                    start,
                    count: values.len(),
                }
            }
            _ => {
                self.fixed.push(value.clone());
                Operand::Param(start)
            }
        }
    }
}

fn restriction_column(entity: &EntityDescriptor, attribute: &str) -> OrmResult<String> {
    if attribute == entity.identifier().name {
        return Ok(entity.identifier().column.clone());
    }
    let descriptor = entity.lookup(attribute)?;
    match (descriptor.attribute_type(), descriptor.column()) {
        (AttributeType::Basic, Some(column)) | (AttributeType::ManyToOne { .. }, Some(column)) => {
            Ok(column.to_string())
        }
        _ => Err(OrmError::Query(format!(
            "{}.{} cannot be used in a restriction",
            entity.name(),
            attribute
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influencers::{EntityGraph, FilterInstance};
    use crate::metamodel::{AttributeDescriptor, FilterDefinition};

    fn metamodel() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityDescriptor::new("Customer", "customers")
                    .basic("name", "name")
                    .attribute(AttributeDescriptor::one_to_many("orders", "Customer.orders")),
            )
            .entity(
                EntityDescriptor::new("Order", "orders")
                    .basic("total", "total")
                    .version("version", "version")
                    .attribute(AttributeDescriptor::many_to_one(
                        "customer",
                        "Customer",
                        "customer_id",
                    ))
                    .filter("minTotal"),
            )
            .collection(
                CollectionDescriptor::new("Customer", "orders", "Order", "customer_id")
                    .filter("minTotal"),
            )
            .filter(FilterDefinition::new("minTotal", "total", ComparisonOp::Ge, "min"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_by_id_plan() {
        let metamodel = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let order = metamodel.entity("Order").unwrap();

        let plan = PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .entity_by_ids(order, 1)
            .unwrap();
        assert_eq!(plan.shape, PlanShape::ById);
        assert_eq!(
            plan.sql(),
            "SELECT t0.id AS t0_id, t0.total AS t0_total, t0.version AS t0_version, \
             t0.customer_id AS t0_customer_id FROM orders t0 WHERE t0.id = $1"
        );
        assert_eq!(plan.root.attributes[2], AttributeColumns::Reference("t0_customer_id".into()));

        let statement = plan.bind(vec![DatabaseValue::Int64(42)]).unwrap();
        assert_eq!(statement.parameters, vec![DatabaseValue::Int64(42)]);
        assert!(plan.bind(vec![]).is_err());
    }

    #[test]
    fn test_entity_graph_adds_joins() {
        let metamodel = metamodel();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.set_entity_graph(Some(EntityGraph::new("Order").with_attribute("customer")));

        let order = metamodel.entity("Order").unwrap();
        let plan = PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .entity_by_ids(order, 2)
            .unwrap();
        assert_eq!(plan.joined.len(), 1);
        assert_eq!(plan.joined[0].projection.alias, "t1");
        assert!(plan.sql().contains("LEFT JOIN customers t1 ON t1.id = t0.customer_id"));
        assert!(plan.sql().ends_with("WHERE t0.id IN ($1, $2)"));
    }

    #[test]
    fn test_collection_join_groups_by_root() {
        let metamodel = metamodel();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.set_entity_graph(Some(EntityGraph::new("Customer").with_attribute("orders")));

        let customer = metamodel.entity("Customer").unwrap();
        let plan = PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .entity_by_ids(customer, 1)
            .unwrap();
        let collection = plan.collection.as_ref().unwrap();
        assert_eq!(collection.role, "Customer.orders");
        assert!(plan.sql().contains("LEFT JOIN orders t1 ON t1.customer_id = t0.id"));
        assert!(plan.sql().ends_with("ORDER BY t0.id"));
    }

    #[test]
    fn test_filters_apply_to_collection_loads() {
        let metamodel = metamodel();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.enable_filter(FilterInstance::new("minTotal").with_parameter("min", 50i64));

        let orders = metamodel.collection("Customer.orders").unwrap();
        let plan = PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .collection_by_owners(orders, 2)
            .unwrap();
        assert!(plan.sql().contains("WHERE t0.customer_id IN ($1, $2) AND t0.total >= $3"));

        let statement = plan
            .bind(vec![DatabaseValue::Int64(1), DatabaseValue::Int64(2)])
            .unwrap();
        assert_eq!(statement.parameters.len(), 3);
        assert_eq!(statement.parameters[2], DatabaseValue::Int64(50));
    }

    #[test]
    fn test_filter_without_parameter_is_rejected() {
        let metamodel = metamodel();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.enable_filter(FilterInstance::new("minTotal"));

        let orders = metamodel.collection("Customer.orders").unwrap();
        assert!(PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .collection_by_owners(orders, 1)
            .is_err());
    }

    #[test]
    fn test_probe_plans() {
        let metamodel = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let orders = metamodel.collection("Customer.orders").unwrap();

        let count = PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .collection_count(orders)
            .unwrap();
        assert_eq!(
            count.sql(),
            "SELECT COUNT(*) AS count FROM orders t0 WHERE t0.customer_id = $1"
        );

        let exists = PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .collection_exists(orders)
            .unwrap();
        assert_eq!(exists.runtime_parameters(), 2);
        assert!(exists.sql().ends_with("AND t0.id = $2 LIMIT 1"));
    }

    #[test]
    fn test_criteria_plan() {
        let metamodel = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let order = metamodel.entity("Order").unwrap();

        let criteria = Criteria::new("Order")
            .eq("customer", 7i64)
            .in_list("total", [10i64, 20])
            .order_by_desc("total")
            .limit(5);
        let plan = PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .criteria(order, &criteria)
            .unwrap();
        assert!(plan.sql().contains("WHERE t0.customer_id = $1 AND t0.total IN ($2, $3)"));
        assert!(plan.sql().ends_with("ORDER BY t0.total DESC LIMIT 5"));
        assert_eq!(plan.bind(vec![]).unwrap().parameters.len(), 3);

        let bad = Criteria::new("Order").eq("nope", 1i64);
        assert!(PlanBuilder::new(&metamodel, &influencers, SqlDialect::PostgreSQL)
            .criteria(order, &bad)
            .is_err());
    }
}
