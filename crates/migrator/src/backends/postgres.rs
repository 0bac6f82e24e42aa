//! PostgreSQL Backend Implementation
//!
//! Implements the database handle traits on top of a sqlx `PgPool`.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, Pool, Postgres, Row, TypeInfo, ValueRef};

use super::core::*;
use crate::error::{MigrationError, MigrationResult};

/// PostgreSQL connection pool implementation
#[derive(Clone)]
pub struct PostgresPool {
    pool: Pool<Postgres>,
}

impl PostgresPool {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Connect a small pool; the migrator only ever holds one connection per run
    pub async fn connect(database_url: &str) -> MigrationResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(|e| {
                MigrationError::Database(format!("Failed to create PostgreSQL pool: {}", e))
            })?;

        Ok(Self::new(pool))
    }

    pub fn inner(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn acquire(&self) -> MigrationResult<Box<dyn DatabaseConnection>> {
        let conn = self.pool.acquire().await.map_err(|e| {
            MigrationError::Database(format!("Failed to acquire connection: {}", e))
        })?;

        Ok(Box::new(PostgresConnection::new(conn)))
    }

    async fn begin_transaction(&self) -> MigrationResult<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin().await.map_err(|e| {
            MigrationError::Transaction(format!("Failed to begin transaction: {}", e))
        })?;

        Ok(Box::new(PostgresTransaction::new(tx)))
    }
}

/// PostgreSQL connection implementation
pub struct PostgresConnection {
    conn: sqlx::pool::PoolConnection<Postgres>,
}

impl PostgresConnection {
    pub fn new(conn: sqlx::pool::PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        let result = bind_all(sql, params)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| MigrationError::Database(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>> {
        let rows = bind_all(sql, params)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| MigrationError::Database(format!("Query fetch failed: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
            .collect())
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Option<Box<dyn DatabaseRow>>> {
        let row = bind_all(sql, params)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|e| MigrationError::Database(format!("Query fetch failed: {}", e)))?;

        Ok(row.map(|r| Box::new(PostgresRow::new(r)) as Box<dyn DatabaseRow>))
    }
}

/// PostgreSQL transaction implementation
///
/// Dropping an unfinished transaction rolls it back (sqlx semantics).
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    fn active(&mut self) -> MigrationResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| MigrationError::Transaction("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl DatabaseConnection for PostgresTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        let query = bind_all(sql, params);
        let tx = self.active()?;

        let result = query
            .execute(&mut **tx)
            .await
            .map_err(|e| MigrationError::Database(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>> {
        let query = bind_all(sql, params);
        let tx = self.active()?;

        let rows = query
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| MigrationError::Database(format!("Query fetch failed: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
            .collect())
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Option<Box<dyn DatabaseRow>>> {
        let query = bind_all(sql, params);
        let tx = self.active()?;

        let row = query
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| MigrationError::Database(format!("Query fetch failed: {}", e)))?;

        Ok(row.map(|r| Box::new(PostgresRow::new(r)) as Box<dyn DatabaseRow>))
    }
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
    fn as_connection(&mut self) -> &mut dyn DatabaseConnection {
        self
    }

    async fn commit(mut self: Box<Self>) -> MigrationResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrationError::Transaction("Transaction already completed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| MigrationError::Transaction(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> MigrationResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrationError::Transaction("Transaction already completed".to_string()))?;

        tx.rollback()
            .await
            .map_err(|e| MigrationError::Transaction(format!("Transaction rollback failed: {}", e)))
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
    fn get_by_index(&self, index: usize) -> MigrationResult<DatabaseValue> {
        postgres_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> MigrationResult<DatabaseValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| MigrationError::Database(format!("Column '{}' not found", name)))?;

        postgres_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn bind_all<'q>(sql: &'q str, params: &[DatabaseValue]) -> PgQuery<'q> {
    params.iter().fold(sqlx::query(sql), bind_database_value)
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'q>(query: PgQuery<'q>, value: &DatabaseValue) -> PgQuery<'q> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
    }
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> MigrationResult<DatabaseValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| MigrationError::Database(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name().to_string();
    let decode_err = |e: sqlx::Error| {
        MigrationError::Database(format!(
            "Failed to decode {} value in column {}: {}",
            type_name, index, e
        ))
    };

    match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(index).map(DatabaseValue::Bool).map_err(decode_err),
        "INT2" => row
            .try_get::<i16, _>(index)
            .map(|v| DatabaseValue::Int32(i32::from(v)))
            .map_err(decode_err),
        "INT4" => row.try_get::<i32, _>(index).map(DatabaseValue::Int32).map_err(decode_err),
        "INT8" => row.try_get::<i64, _>(index).map(DatabaseValue::Int64).map_err(decode_err),
        "FLOAT4" => row
            .try_get::<f32, _>(index)
            .map(|v| DatabaseValue::Float64(f64::from(v)))
            .map_err(decode_err),
        "FLOAT8" => row.try_get::<f64, _>(index).map(DatabaseValue::Float64).map_err(decode_err),
        "BYTEA" => row.try_get::<Vec<u8>, _>(index).map(DatabaseValue::Bytes).map_err(decode_err),
        // TEXT, VARCHAR, NAME, BPCHAR and anything else readable as text
        _ => row.try_get::<String, _>(index).map(DatabaseValue::String).map_err(decode_err),
    }
}
