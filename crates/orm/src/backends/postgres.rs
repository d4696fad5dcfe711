//! PostgreSQL Backend Implementation
//!
//! Executes rendered statements through sqlx. One data access owns at most one open
//! transaction; statements run inside it while it is open and on the pool otherwise.

use super::core::*;
use crate::error::{OrmError, OrmResult};
use crate::plan::Statement;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, Pool, Postgres, Row as SqlxRow, Transaction, TypeInfo, ValueRef};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Data access over a PostgreSQL pool
pub struct PostgresDataAccess {
    pool: Arc<Pool<Postgres>>,
    transaction: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PostgresDataAccess {
    pub fn new(pool: Arc<Pool<Postgres>>) -> Self {
        Self {
            pool,
            transaction: Mutex::new(None),
        }
    }

    /// Connect a new pool to `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> OrmResult<Self> {
        if !database_url.starts_with("postgresql://") && !database_url.starts_with("postgres://") {
            return Err(OrmError::Configuration(
                "Invalid PostgreSQL URL scheme".to_string(),
            ));
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| OrmError::Database(format!("Failed to create PostgreSQL pool: {}", e)))?;

        tracing::info!("Connected PostgreSQL pool ({} connections max)", max_connections);
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn pool(&self) -> &Arc<Pool<Postgres>> {
        &self.pool
    }
}

fn prepare<'q>(statement: &'q Statement) -> OrmResult<sqlx::query::Query<'q, Postgres, PgArguments>> {
    let mut query = sqlx::query(&statement.sql);
    for param in &statement.parameters {
        query = bind_database_value(query, param)?;
    }
    Ok(query)
}

#[async_trait]
impl DataAccess for PostgresDataAccess {
    async fn fetch_all(&self, statement: &Statement) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        let query = prepare(statement)?;
        let mut transaction = self.transaction.lock().await;
        let rows = match transaction.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await,
            None => query.fetch_all(&*self.pool).await,
        }
        .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
            .collect())
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<u64> {
        let query = prepare(statement)?;
        let mut transaction = self.transaction.lock().await;
        let result = match transaction.as_mut() {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&*self.pool).await,
        }
        .map_err(|e| OrmError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn begin(&self) -> OrmResult<()> {
        let mut transaction = self.transaction.lock().await;
        if transaction.is_some() {
            return Err(OrmError::Database("Transaction already open".to_string()));
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OrmError::Database(format!("Failed to begin transaction: {}", e)))?;
        *transaction = Some(tx);
        Ok(())
    }

    async fn commit(&self) -> OrmResult<()> {
        let tx = self
            .transaction
            .lock()
            .await
            .take()
            .ok_or_else(|| OrmError::Database("No open transaction".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| OrmError::Database(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(&self) -> OrmResult<()> {
        let tx = self
            .transaction
            .lock()
            .await
            .take()
            .ok_or_else(|| OrmError::Database("No open transaction".to_string()))?;
        tx.rollback()
            .await
            .map_err(|e| OrmError::Database(format!("Transaction rollback failed: {}", e)))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }
}

/// PostgreSQL row implementation
pub struct PostgresRow {
    row: PgRow,
}

impl PostgresRow {
    pub fn new(row: PgRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for PostgresRow {
    fn get_by_index(&self, index: usize) -> OrmResult<DatabaseValue> {
        postgres_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> OrmResult<DatabaseValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| OrmError::Query(format!("Column '{}' not found", name)))?;

        postgres_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }

    fn column_names(&self) -> Vec<String> {
        self.row
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect()
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: sqlx::query::Query<'a, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> OrmResult<sqlx::query::Query<'a, Postgres, PgArguments>> {
    match value {
        DatabaseValue::Null => Ok(query.bind(Option::<String>::None)),
        DatabaseValue::Bool(b) => Ok(query.bind(*b)),
        DatabaseValue::Int32(i) => Ok(query.bind(*i)),
        DatabaseValue::Int64(i) => Ok(query.bind(*i)),
        DatabaseValue::Float32(f) => Ok(query.bind(*f)),
        DatabaseValue::Float64(f) => Ok(query.bind(*f)),
        DatabaseValue::String(s) => Ok(query.bind(s.clone())),
        DatabaseValue::Bytes(b) => Ok(query.bind(b.clone())),
        DatabaseValue::Uuid(u) => Ok(query.bind(*u)),
        DatabaseValue::DateTime(dt) => Ok(query.bind(*dt)),
        DatabaseValue::Date(d) => Ok(query.bind(*d)),
        DatabaseValue::Time(t) => Ok(query.bind(*t)),
        DatabaseValue::Json(j) => Ok(query.bind(j.clone())),
        DatabaseValue::Array(_) => Err(OrmError::Query(
            "Array values are expanded into placeholders before binding".to_string(),
        )),
    }
}

fn column_error(kind: &str, e: sqlx::Error) -> OrmError {
    OrmError::Query(format!("Failed to get {} value: {}", kind, e))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> OrmResult<DatabaseValue> {
    let raw = row.try_get_raw(index).map_err(|e| column_error("raw", e))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index).map_err(|e| column_error("bool", e))?),
        "INT2" => {
            let value: i16 = row.try_get(index).map_err(|e| column_error("int16", e))?;
            DatabaseValue::Int32(value as i32)
        }
        "INT4" => DatabaseValue::Int32(row.try_get(index).map_err(|e| column_error("int32", e))?),
        "INT8" => DatabaseValue::Int64(row.try_get(index).map_err(|e| column_error("int64", e))?),
        "FLOAT4" => {
            DatabaseValue::Float32(row.try_get(index).map_err(|e| column_error("float32", e))?)
        }
        "FLOAT8" => {
            DatabaseValue::Float64(row.try_get(index).map_err(|e| column_error("float64", e))?)
        }
        "BYTEA" => DatabaseValue::Bytes(row.try_get(index).map_err(|e| column_error("bytes", e))?),
        "UUID" => DatabaseValue::Uuid(row.try_get(index).map_err(|e| column_error("UUID", e))?),
        "TIMESTAMPTZ" | "TIMESTAMP" => {
            DatabaseValue::DateTime(row.try_get(index).map_err(|e| column_error("datetime", e))?)
        }
        "DATE" => DatabaseValue::Date(row.try_get(index).map_err(|e| column_error("date", e))?),
        "TIME" => DatabaseValue::Time(row.try_get(index).map_err(|e| column_error("time", e))?),
        "JSON" | "JSONB" => {
            let value: JsonValue = row.try_get(index).map_err(|e| column_error("JSON", e))?;
            DatabaseValue::Json(value)
        }
        _ => DatabaseValue::String(row.try_get(index).map_err(|e| {
            OrmError::Query(format!(
                "Failed to get value as string for type '{}': {}",
                type_name, e
            ))
        })?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_foreign_url_scheme() {
        let result = PostgresDataAccess::connect("mysql://localhost/app", 1).await;
        assert!(matches!(result, Err(OrmError::Configuration(_))));
    }
}
