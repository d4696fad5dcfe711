//! Structured statements
//!
//! Every statement carries both its rendered SQL and the structure it was rendered from,
//! so SQL backends execute the text while the in-memory backend evaluates the structure.

use crate::backends::{DatabaseValue, SqlDialect};
use crate::metamodel::ComparisonOp;

/// Right-hand side of a predicate or assignment
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand (`IS NULL`, `IS NOT NULL`)
    None,
    /// One bound parameter
    Param(usize),
    /// `count` consecutive bound parameters starting at `start`
    List { start: usize, count: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub alias: String,
    pub column: String,
    pub op: ComparisonOp,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
    pub label: String,
}

/// `LEFT JOIN table alias ON alias.right_column = left_alias.left_column`
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub alias: String,
    pub left_alias: String,
    pub left_column: String,
    pub right_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub alias: String,
    pub column: String,
    pub descending: bool,
}

/// What a select returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// The labelled columns of every matching row
    Rows,
    /// One row with a `count` column
    Count,
    /// At most one row with a `present` column
    Exists,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectSpec {
    pub table: String,
    pub alias: String,
    pub joins: Vec<Join>,
    pub columns: Vec<ColumnRef>,
    pub predicates: Vec<Predicate>,
    pub order_by: Vec<OrderTerm>,
    pub projection: Projection,
    pub limit: Option<usize>,
}

impl SelectSpec {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
            joins: Vec::new(),
            columns: Vec::new(),
            predicates: Vec::new(),
            order_by: Vec::new(),
            projection: Projection::Rows,
            limit: None,
        }
    }

    pub fn render(&self, dialect: SqlDialect) -> String {
        let mut sql = String::from("SELECT ");
        match self.projection {
            Projection::Rows => {
                let columns: Vec<String> = self
                    .columns
                    .iter()
                    .map(|c| format!("{}.{} AS {}", c.alias, c.column, c.label))
                    .collect();
                sql.push_str(&columns.join(", "));
            }
            Projection::Count => sql.push_str("COUNT(*) AS count"),
            Projection::Exists => sql.push_str("1 AS present"),
        }

        sql.push_str(&format!(" FROM {} {}", self.table, self.alias));
        for join in &self.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} {} ON {}.{} = {}.{}",
                join.table, join.alias, join.alias, join.right_column, join.left_alias, join.left_column
            ));
        }

        let conditions: Vec<String> = self
            .predicates
            .iter()
            .map(|p| render_predicate(Some(&p.alias), &p.column, p.op, &p.operand, dialect))
            .collect();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        if !self.order_by.is_empty() {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|t| {
                    format!(
                        "{}.{}{}",
                        t.alias,
                        t.column,
                        if t.descending { " DESC" } else { "" }
                    )
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }

        let limit = match self.projection {
            Projection::Exists => Some(1),
            _ => self.limit,
        };
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql
    }
}

/// Single-table `UPDATE`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSpec {
    pub table: String,
    pub assignments: Vec<(String, Operand)>,
    pub predicates: Vec<Predicate>,
}

impl UpdateSpec {
    pub fn render(&self, dialect: SqlDialect) -> String {
        let assignments: Vec<String> = self
            .assignments
            .iter()
            .map(|(column, operand)| format!("{} = {}", column, render_operand(operand, dialect)))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", self.table, assignments.join(", "));
        push_where(&mut sql, &self.predicates, dialect);
        sql
    }
}

/// Single-table `DELETE`
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteSpec {
    pub table: String,
    pub predicates: Vec<Predicate>,
}

impl DeleteSpec {
    pub fn render(&self, dialect: SqlDialect) -> String {
        let mut sql = format!("DELETE FROM {}", self.table);
        push_where(&mut sql, &self.predicates, dialect);
        sql
    }
}

fn push_where(sql: &mut String, predicates: &[Predicate], dialect: SqlDialect) {
    let conditions: Vec<String> = predicates
        .iter()
        .map(|p| render_predicate(None, &p.column, p.op, &p.operand, dialect))
        .collect();
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
}

fn render_operand(operand: &Operand, dialect: SqlDialect) -> String {
    match operand {
        Operand::None => String::new(),
        Operand::Param(index) => dialect.parameter_placeholder(*index),
        Operand::List { start, count } => {
            let placeholders: Vec<String> = (*start..start + count)
                .map(|i| dialect.parameter_placeholder(i))
                .collect();
            format!("({})", placeholders.join(", "))
        }
    }
}

fn render_predicate(
    alias: Option<&str>,
    column: &str,
    op: ComparisonOp,
    operand: &Operand,
    dialect: SqlDialect,
) -> String {
    let target = match alias {
        Some(alias) => format!("{}.{}", alias, column),
        None => column.to_string(),
    };
    if op.takes_parameter() {
        format!("{} {} {}", target, op.as_sql(), render_operand(operand, dialect))
    } else {
        format!("{} {}", target, op.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementSpec {
    Select(SelectSpec),
    Update(UpdateSpec),
    Delete(DeleteSpec),
}

/// Executable statement: rendered SQL, its structure and bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub spec: StatementSpec,
    pub parameters: Vec<DatabaseValue>,
}

impl Statement {
    pub fn select(spec: SelectSpec, parameters: Vec<DatabaseValue>, dialect: SqlDialect) -> Self {
        Self {
            sql: spec.render(dialect),
            spec: StatementSpec::Select(spec),
            parameters,
        }
    }

    pub fn update(spec: UpdateSpec, parameters: Vec<DatabaseValue>, dialect: SqlDialect) -> Self {
        Self {
            sql: spec.render(dialect),
            spec: StatementSpec::Update(spec),
            parameters,
        }
    }

    pub fn delete(spec: DeleteSpec, parameters: Vec<DatabaseValue>, dialect: SqlDialect) -> Self {
        Self {
            sql: spec.render(dialect),
            spec: StatementSpec::Delete(spec),
            parameters,
        }
    }

    /// Value bound at `index`
    pub fn parameter(&self, index: usize) -> Option<&DatabaseValue> {
        self.parameters.get(index)
    }
}
