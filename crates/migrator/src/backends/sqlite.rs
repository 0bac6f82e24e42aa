//! SQLite Backend Implementation
//!
//! Implements the database handle traits on top of a sqlx `SqlitePool`.
//! Transactions are opened with `BEGIN IMMEDIATE` so a migration run takes the
//! database write lock up front and concurrent runs queue on the busy timeout
//! instead of failing on lock upgrade.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite, TypeInfo, ValueRef};
use tracing::warn;

use super::core::*;
use crate::error::{MigrationError, MigrationResult};

/// SQLite connection pool implementation
#[derive(Clone)]
pub struct SqlitePool {
    pool: Pool<Sqlite>,
}

impl SqlitePool {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `database_url`
    pub async fn connect(database_url: &str) -> MigrationResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| MigrationError::Database(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        Self::connect_with(options).await
    }

    pub async fn connect_with(options: SqliteConnectOptions) -> MigrationResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to create SQLite pool: {}", e)))?;

        Ok(Self::new(pool))
    }

    pub fn inner(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl DatabasePool for SqlitePool {
    async fn acquire(&self) -> MigrationResult<Box<dyn DatabaseConnection>> {
        let conn = self.pool.acquire().await.map_err(|e| {
            MigrationError::Database(format!("Failed to acquire connection: {}", e))
        })?;

        Ok(Box::new(SqliteConnection::new(conn)))
    }

    async fn begin_transaction(&self) -> MigrationResult<Box<dyn DatabaseTransaction>> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            MigrationError::Database(format!("Failed to acquire connection: {}", e))
        })?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| MigrationError::Transaction(format!("Failed to begin transaction: {}", e)))?;

        Ok(Box::new(SqliteTransaction { conn: Some(conn) }))
    }
}

/// SQLite connection implementation
pub struct SqliteConnection {
    conn: PoolConnection<Sqlite>,
}

impl SqliteConnection {
    pub fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DatabaseConnection for SqliteConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        execute_on(&mut self.conn, sql, params).await
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>> {
        fetch_all_on(&mut self.conn, sql, params).await
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Option<Box<dyn DatabaseRow>>> {
        fetch_optional_on(&mut self.conn, sql, params).await
    }
}

/// SQLite transaction held open on a reserved pool connection
pub struct SqliteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteTransaction {
    fn active(&mut self) -> MigrationResult<&mut PoolConnection<Sqlite>> {
        self.conn
            .as_mut()
            .ok_or_else(|| MigrationError::Transaction("Transaction already completed".to_string()))
    }

    async fn finish(&mut self, statement: &'static str) -> MigrationResult<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| MigrationError::Transaction("Transaction already completed".to_string()))?;

        match sqlx::query(statement).execute(&mut *conn).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // The transaction may still be open on this connection
                drop(conn.detach());
                Err(MigrationError::Transaction(format!("{} failed: {}", statement, e)))
            }
        }
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        // A connection still inside BEGIN must not go back to the pool
        if let Some(conn) = self.conn.take() {
            warn!("SQLite transaction dropped without commit or rollback; closing its connection");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl DatabaseConnection for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        execute_on(self.active()?, sql, params).await
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>> {
        fetch_all_on(self.active()?, sql, params).await
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Option<Box<dyn DatabaseRow>>> {
        fetch_optional_on(self.active()?, sql, params).await
    }
}

#[async_trait]
impl DatabaseTransaction for SqliteTransaction {
    fn as_connection(&mut self) -> &mut dyn DatabaseConnection {
        self
    }

    async fn commit(mut self: Box<Self>) -> MigrationResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> MigrationResult<()> {
        self.finish("ROLLBACK").await
    }
}

/// SQLite row implementation
pub struct SqliteRowValue {
    row: SqliteRow,
}

impl DatabaseRow for SqliteRowValue {
    fn get_by_index(&self, index: usize) -> MigrationResult<DatabaseValue> {
        sqlite_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> MigrationResult<DatabaseValue> {
        use sqlx::Column;

        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| MigrationError::Database(format!("Column '{}' not found", name)))?;

        sqlite_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_all<'q>(sql: &'q str, params: &[DatabaseValue]) -> SqliteQuery<'q> {
    params.iter().fold(sqlx::query(sql), |query, value| match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
    })
}

async fn execute_on(
    conn: &mut PoolConnection<Sqlite>,
    sql: &str,
    params: &[DatabaseValue],
) -> MigrationResult<u64> {
    let result = bind_all(sql, params)
        .execute(&mut **conn)
        .await
        .map_err(|e| MigrationError::Database(format!("Query execution failed: {}", e)))?;

    Ok(result.rows_affected())
}

async fn fetch_all_on(
    conn: &mut PoolConnection<Sqlite>,
    sql: &str,
    params: &[DatabaseValue],
) -> MigrationResult<Vec<Box<dyn DatabaseRow>>> {
    let rows = bind_all(sql, params)
        .fetch_all(&mut **conn)
        .await
        .map_err(|e| MigrationError::Database(format!("Query fetch failed: {}", e)))?;

    Ok(rows
        .into_iter()
        .map(|row| Box::new(SqliteRowValue { row }) as Box<dyn DatabaseRow>)
        .collect())
}

async fn fetch_optional_on(
    conn: &mut PoolConnection<Sqlite>,
    sql: &str,
    params: &[DatabaseValue],
) -> MigrationResult<Option<Box<dyn DatabaseRow>>> {
    let row = bind_all(sql, params)
        .fetch_optional(&mut **conn)
        .await
        .map_err(|e| MigrationError::Database(format!("Query fetch failed: {}", e)))?;

    Ok(row.map(|row| Box::new(SqliteRowValue { row }) as Box<dyn DatabaseRow>))
}

/// Convert a SQLite value to DatabaseValue using the storage class of the value itself
fn sqlite_value_to_database_value(row: &SqliteRow, index: usize) -> MigrationResult<DatabaseValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| MigrationError::Database(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let decode_err = |e: sqlx::Error| {
        MigrationError::Database(format!(
            "Failed to decode {} value in column {}: {}",
            type_name, index, e
        ))
    };

    match type_name.as_str() {
        "INTEGER" => row
            .try_get::<i64, _>(index)
            .map(DatabaseValue::Int64)
            .map_err(decode_err),
        "BOOLEAN" => row
            .try_get::<bool, _>(index)
            .map(DatabaseValue::Bool)
            .map_err(decode_err),
        "REAL" => row
            .try_get::<f64, _>(index)
            .map(DatabaseValue::Float64)
            .map_err(decode_err),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(DatabaseValue::Bytes)
            .map_err(decode_err),
        // TEXT plus declared types (DATETIME, NUMERIC, ...) stored as text
        _ => row
            .try_get_unchecked::<String, _>(index)
            .map(DatabaseValue::String)
            .map_err(decode_err),
    }
}
