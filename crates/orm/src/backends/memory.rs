//! In-memory backend
//!
//! Evaluates the structure of statements against tables of column maps. Used by tests and
//! demos; supports the single-level left joins, predicates, ordering and projections that
//! load plans produce, plus single-table updates and deletes.

use super::core::*;
use crate::error::{OrmError, OrmResult};
use crate::metamodel::ComparisonOp;
use crate::plan::{DeleteSpec, Operand, Predicate, Projection, SelectSpec, Statement, StatementSpec, UpdateSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

type Record = BTreeMap<String, DatabaseValue>;
type Tables = BTreeMap<String, Vec<Record>>;

#[derive(Default)]
struct MemoryState {
    tables: Tables,
    snapshot: Option<Tables>,
}

/// Tables held in memory, with statement counters
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<MemoryState>,
    selects: AtomicU64,
    writes: AtomicU64,
    log: Mutex<Vec<String>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row outside of any statement accounting
    pub fn insert<K, V>(&self, table: &str, row: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<DatabaseValue>,
    {
        let record = row
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(record);
    }

    /// Change one column of every row where `key_column = key`, bypassing statement
    /// accounting. Simulates a write by another process.
    pub fn set_column(
        &self,
        table: &str,
        key_column: &str,
        key: impl Into<DatabaseValue>,
        column: &str,
        value: impl Into<DatabaseValue>,
    ) -> usize {
        let key = key.into();
        let value = value.into();
        let mut state = self.state.lock();
        let Some(rows) = state.tables.get_mut(table) else {
            return 0;
        };
        let mut changed = 0;
        for row in rows.iter_mut() {
            if row.get(key_column).and_then(|v| v.compare(&key)) == Some(Ordering::Equal) {
                row.insert(column.to_string(), value.clone());
                changed += 1;
            }
        }
        changed
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// Value of `column` in the row where `key_column = key`
    pub fn column_value(
        &self,
        table: &str,
        key_column: &str,
        key: impl Into<DatabaseValue>,
        column: &str,
    ) -> Option<DatabaseValue> {
        let key = key.into();
        let state = self.state.lock();
        state.tables.get(table)?.iter().find_map(|row| {
            (row.get(key_column).and_then(|v| v.compare(&key)) == Some(Ordering::Equal))
                .then(|| row.get(column).cloned().unwrap_or(DatabaseValue::Null))
        })
    }

    /// Selects plus writes executed so far
    pub fn statement_count(&self) -> u64 {
        self.select_count() + self.write_count()
    }

    pub fn select_count(&self) -> u64 {
        self.selects.load(AtomicOrdering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(AtomicOrdering::Relaxed)
    }

    /// SQL of every statement executed so far, in order
    pub fn executed_sql(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().snapshot.is_some()
    }

    fn record(&self, statement: &Statement) {
        tracing::debug!("memory: {}", statement.sql);
        self.log.lock().push(statement.sql.clone());
    }
}

fn parameter(statement: &Statement, index: usize) -> OrmResult<&DatabaseValue> {
    statement.parameter(index).ok_or_else(|| {
        OrmError::Query(format!(
            "Statement has no parameter {} ({})",
            index + 1,
            statement.sql
        ))
    })
}

fn satisfies(
    value: &DatabaseValue,
    op: ComparisonOp,
    operand: &Operand,
    statement: &Statement,
) -> OrmResult<bool> {
    let equal = |other: &DatabaseValue| value.compare(other) == Some(Ordering::Equal);
    let result = match (op, operand) {
        (ComparisonOp::IsNull, _) => value.is_null(),
        (ComparisonOp::IsNotNull, _) => !value.is_null(),
        (ComparisonOp::In, Operand::List { start, count }) => {
            let mut found = false;
            for index in *start..start + count {
                found |= equal(parameter(statement, index)?);
            }
            found
        }
        (op, Operand::Param(index)) => {
            let ordering = value.compare(parameter(statement, *index)?);
            match (op, ordering) {
                (_, None) => false,
                (ComparisonOp::Eq | ComparisonOp::In, Some(o)) => o == Ordering::Equal,
                (ComparisonOp::Ne, Some(o)) => o != Ordering::Equal,
                (ComparisonOp::Lt, Some(o)) => o == Ordering::Less,
                (ComparisonOp::Le, Some(o)) => o != Ordering::Greater,
                (ComparisonOp::Gt, Some(o)) => o == Ordering::Greater,
                (ComparisonOp::Ge, Some(o)) => o != Ordering::Less,
                (ComparisonOp::IsNull | ComparisonOp::IsNotNull, Some(_)) => false,
            }
        }
        (op, operand) => {
            return Err(OrmError::Query(format!(
                "Operator {} cannot take operand {:?}",
                op, operand
            )))
        }
    };
    Ok(result)
}

fn column(record: Option<&Record>, name: &str) -> DatabaseValue {
    record
        .and_then(|r| r.get(name))
        .cloned()
        .unwrap_or(DatabaseValue::Null)
}

/// Nulls sort first
fn compare_values(a: &DatabaseValue, b: &DatabaseValue) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

static NO_ROWS: Vec<Record> = Vec::new();

fn table<'t>(tables: &'t Tables, name: &str) -> &'t [Record] {
    tables.get(name).map_or(&NO_ROWS[..], Vec::as_slice)
}

fn evaluate_select(tables: &Tables, spec: &SelectSpec, statement: &Statement) -> OrmResult<Vec<Row>> {
    let mut combined: Vec<HashMap<&str, Option<&Record>>> = table(tables, &spec.table)
        .iter()
        .map(|record| HashMap::from([(spec.alias.as_str(), Some(record))]))
        .collect();

    for join in &spec.joins {
        let mut next = Vec::new();
        for row in combined {
            let key = column(row.get(join.left_alias.as_str()).copied().flatten(), &join.left_column);
            let mut matched = false;
            if !key.is_null() {
                for candidate in table(tables, &join.table) {
                    if column(Some(candidate), &join.right_column).compare(&key) == Some(Ordering::Equal) {
                        let mut extended = row.clone();
                        extended.insert(join.alias.as_str(), Some(candidate));
                        next.push(extended);
                        matched = true;
                    }
                }
            }
            if !matched {
                let mut extended = row;
                extended.insert(join.alias.as_str(), None);
                next.push(extended);
            }
        }
        combined = next;
    }

    let mut filtered = Vec::new();
    for row in combined {
        let mut keep = true;
        for predicate in &spec.predicates {
            let value = column(row.get(predicate.alias.as_str()).copied().flatten(), &predicate.column);
            if !satisfies(&value, predicate.op, &predicate.operand, statement)? {
                keep = false;
                break;
            }
        }
        if keep {
            filtered.push(row);
        }
    }

    filtered.sort_by(|a, b| {
        for term in &spec.order_by {
            let left = column(a.get(term.alias.as_str()).copied().flatten(), &term.column);
            let right = column(b.get(term.alias.as_str()).copied().flatten(), &term.column);
            let ordering = compare_values(&left, &right);
            let ordering = if term.descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    if let Some(limit) = spec.limit {
        filtered.truncate(limit);
    }

    Ok(match spec.projection {
        Projection::Count => vec![Row::new(
            vec!["count".to_string()],
            vec![DatabaseValue::Int64(filtered.len() as i64)],
        )],
        Projection::Exists => filtered
            .first()
            .map(|_| Row::new(vec!["present".to_string()], vec![DatabaseValue::Int32(1)]))
            .into_iter()
            .collect(),
        Projection::Rows => filtered
            .iter()
            .map(|row| {
                let labels = spec.columns.iter().map(|c| c.label.clone()).collect();
                let values = spec
                    .columns
                    .iter()
                    .map(|c| column(row.get(c.alias.as_str()).copied().flatten(), &c.column))
                    .collect();
                Row::new(labels, values)
            })
            .collect(),
    })
}

fn record_matches(record: &Record, predicates: &[Predicate], statement: &Statement) -> OrmResult<bool> {
    for predicate in predicates {
        if !satisfies(&column(Some(record), &predicate.column), predicate.op, &predicate.operand, statement)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate_update(tables: &mut Tables, spec: &UpdateSpec, statement: &Statement) -> OrmResult<u64> {
    let Some(rows) = tables.get_mut(&spec.table) else {
        return Ok(0);
    };
    let mut affected = 0;
    for record in rows.iter_mut() {
        if !record_matches(record, &spec.predicates, statement)? {
            continue;
        }
        for (name, operand) in &spec.assignments {
            let value = match operand {
                Operand::Param(index) => parameter(statement, *index)?.clone(),
                _ => DatabaseValue::Null,
            };
            record.insert(name.clone(), value);
        }
        affected += 1;
    }
    Ok(affected)
}

fn evaluate_delete(tables: &mut Tables, spec: &DeleteSpec, statement: &Statement) -> OrmResult<u64> {
    let Some(rows) = tables.get_mut(&spec.table) else {
        return Ok(0);
    };
    let mut kept = Vec::with_capacity(rows.len());
    let mut affected = 0;
    for record in rows.drain(..) {
        if record_matches(&record, &spec.predicates, statement)? {
            affected += 1;
        } else {
            kept.push(record);
        }
    }
    *rows = kept;
    Ok(affected)
}

#[async_trait]
impl DataAccess for MemoryDatabase {
    async fn fetch_all(&self, statement: &Statement) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        let StatementSpec::Select(spec) = &statement.spec else {
            return Err(OrmError::Query(format!("Not a select: {}", statement.sql)));
        };
        self.selects.fetch_add(1, AtomicOrdering::Relaxed);
        self.record(statement);

        let state = self.state.lock();
        let rows = evaluate_select(&state.tables, spec, statement)?;
        Ok(rows
            .into_iter()
            .map(|row| Box::new(row) as Box<dyn DatabaseRow>)
            .collect())
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<u64> {
        self.writes.fetch_add(1, AtomicOrdering::Relaxed);
        self.record(statement);

        let mut state = self.state.lock();
        match &statement.spec {
            StatementSpec::Update(spec) => evaluate_update(&mut state.tables, spec, statement),
            StatementSpec::Delete(spec) => evaluate_delete(&mut state.tables, spec, statement),
            StatementSpec::Select(_) => Err(OrmError::Query(format!(
                "Use fetch_all for selects: {}",
                statement.sql
            ))),
        }
    }

    async fn begin(&self) -> OrmResult<()> {
        let mut state = self.state.lock();
        if state.snapshot.is_some() {
            return Err(OrmError::Database("Transaction already open".to_string()));
        }
        state.snapshot = Some(state.tables.clone());
        Ok(())
    }

    async fn commit(&self) -> OrmResult<()> {
        self.state
            .lock()
            .snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| OrmError::Database("No open transaction".to_string()))
    }

    async fn rollback(&self) -> OrmResult<()> {
        let mut state = self.state.lock();
        let snapshot = state
            .snapshot
            .take()
            .ok_or_else(|| OrmError::Database("No open transaction".to_string()))?;
        state.tables = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ColumnRef, Join, OrderTerm};
    use crate::backends::SqlDialect;

    fn database() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.insert("customers", [("id", DatabaseValue::Int64(1)), ("name", "Ada".into())]);
        for (id, total, customer) in [(10i64, 50i64, 1i64), (11, 150, 1), (12, 70, 2)] {
            db.insert(
                "orders",
                [
                    ("id", DatabaseValue::Int64(id)),
                    ("total", DatabaseValue::Int64(total)),
                    ("customer_id", DatabaseValue::Int64(customer)),
                ],
            );
        }
        db
    }

    fn orders_with_customer() -> SelectSpec {
        let mut spec = SelectSpec::new("orders", "t0");
        for (alias, col) in [("t0", "id"), ("t0", "total"), ("t1", "name")] {
            spec.columns.push(ColumnRef {
                alias: alias.into(),
                column: col.into(),
                label: format!("{}_{}", alias, col),
            });
        }
        spec.joins.push(Join {
            table: "customers".into(),
            alias: "t1".into(),
            left_alias: "t0".into(),
            left_column: "customer_id".into(),
            right_column: "id".into(),
        });
        spec.order_by.push(OrderTerm {
            alias: "t0".into(),
            column: "total".into(),
            descending: true,
        });
        spec
    }

    #[tokio::test]
    async fn test_left_join_and_ordering() {
        let db = database();
        let statement = Statement::select(orders_with_customer(), vec![], SqlDialect::PostgreSQL);
        let rows = db.fetch_all(&statement).await.unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get_by_name("t0_total").unwrap(), DatabaseValue::Int64(150));
        assert_eq!(rows[0].get_by_name("t1_name").unwrap(), DatabaseValue::from("Ada"));
        // customer 2 does not exist: the left join yields nulls
        assert_eq!(rows[1].get_by_name("t0_id").unwrap(), DatabaseValue::Int64(12));
        assert_eq!(rows[1].get_by_name("t1_name").unwrap(), DatabaseValue::Null);
        assert_eq!(db.select_count(), 1);
    }

    #[tokio::test]
    async fn test_predicates_and_projections() {
        let db = database();
        let mut spec = orders_with_customer();
        spec.predicates.push(Predicate {
            alias: "t0".into(),
            column: "id".into(),
            op: ComparisonOp::In,
            operand: Operand::List { start: 0, count: 2 },
        });
        spec.predicates.push(Predicate {
            alias: "t0".into(),
            column: "total".into(),
            op: ComparisonOp::Ge,
            operand: Operand::Param(2),
        });
        spec.projection = Projection::Count;
        let params = vec![
            DatabaseValue::Int64(10),
            DatabaseValue::Int32(11),
            DatabaseValue::Int64(100),
        ];
        let count = Statement::select(spec.clone(), params.clone(), SqlDialect::PostgreSQL);
        let rows = db.fetch_all(&count).await.unwrap();
        assert_eq!(rows[0].get_by_name("count").unwrap(), DatabaseValue::Int64(1));

        spec.projection = Projection::Exists;
        let params = vec![
            DatabaseValue::Int64(10),
            DatabaseValue::Int64(11),
            DatabaseValue::Int64(1000),
        ];
        let exists = Statement::select(spec, params, SqlDialect::PostgreSQL);
        assert!(db.fetch_all(&exists).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_delete_and_rollback() {
        let db = database();
        db.begin().await.unwrap();

        let update = UpdateSpec {
            table: "orders".into(),
            assignments: vec![("total".into(), Operand::Param(0))],
            predicates: vec![Predicate {
                alias: String::new(),
                column: "id".into(),
                op: ComparisonOp::Eq,
                operand: Operand::Param(1),
            }],
        };
        let statement = Statement::update(
            update,
            vec![DatabaseValue::Int64(99), DatabaseValue::Int64(10)],
            SqlDialect::PostgreSQL,
        );
        assert_eq!(db.execute(&statement).await.unwrap(), 1);
        assert_eq!(
            db.column_value("orders", "id", 10i64, "total"),
            Some(DatabaseValue::Int64(99))
        );

        let delete = DeleteSpec {
            table: "orders".into(),
            predicates: vec![Predicate {
                alias: String::new(),
                column: "customer_id".into(),
                op: ComparisonOp::Eq,
                operand: Operand::Param(0),
            }],
        };
        let statement = Statement::delete(delete, vec![DatabaseValue::Int64(1)], SqlDialect::PostgreSQL);
        assert_eq!(db.execute(&statement).await.unwrap(), 2);
        assert_eq!(db.row_count("orders"), 1);

        db.rollback().await.unwrap();
        assert_eq!(db.row_count("orders"), 3);
        assert_eq!(
            db.column_value("orders", "id", 10i64, "total"),
            Some(DatabaseValue::Int64(50))
        );
        assert_eq!(db.write_count(), 2);
        assert!(db.commit().await.is_err());
    }
}
