//! Core Database Handle Traits
//!
//! The migration engine never talks to a driver directly. It works against
//! these traits, which a backend implements for its connection, transaction
//! and pool types.

use async_trait::async_trait;

use crate::error::{MigrationError, MigrationResult};

/// Abstract database connection trait
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Execute a statement and return affected rows count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64>;

    /// Execute a query and return the result rows
    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>>;

    /// Execute a query and return the first result row
    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Option<Box<dyn DatabaseRow>>>;
}

/// Abstract database transaction trait
#[async_trait]
pub trait DatabaseTransaction: DatabaseConnection {
    /// Borrow the transaction as a plain connection handle
    fn as_connection(&mut self) -> &mut dyn DatabaseConnection;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> MigrationResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> MigrationResult<()>;
}

/// Execution-context provider
///
/// `begin_transaction` backs the transactional path used when the adapter
/// supports transactional DDL; `acquire` hands out a reserved connection for
/// the non-transactional path.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Reserve a single connection from the pool
    async fn acquire(&self) -> MigrationResult<Box<dyn DatabaseConnection>>;

    /// Begin a transaction on a freshly reserved connection
    async fn begin_transaction(&self) -> MigrationResult<Box<dyn DatabaseTransaction>>;
}

/// Abstract database row trait
pub trait DatabaseRow: Send + Sync {
    /// Get a column value by index
    fn get_by_index(&self, index: usize) -> MigrationResult<DatabaseValue>;

    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> MigrationResult<DatabaseValue>;

    /// Get column count
    fn column_count(&self) -> usize;
}

/// Extension helpers for reading typed columns
pub trait DatabaseRowExt {
    /// Read a non-null text column
    fn get_string(&self, column: &str) -> MigrationResult<String>;

    /// Read an integer column, `None` when the value is NULL
    fn get_optional_i64(&self, index: usize) -> MigrationResult<Option<i64>>;
}

impl<R: DatabaseRow + ?Sized> DatabaseRowExt for R {
    fn get_string(&self, column: &str) -> MigrationResult<String> {
        match self.get_by_name(column)? {
            DatabaseValue::String(value) => Ok(value),
            other => Err(MigrationError::Database(format!(
                "Expected text in column '{}', found {:?}",
                column, other
            ))),
        }
    }

    fn get_optional_i64(&self, index: usize) -> MigrationResult<Option<i64>> {
        match self.get_by_index(index)? {
            DatabaseValue::Null => Ok(None),
            value => value.as_i64().map(Some).ok_or_else(|| {
                MigrationError::Database(format!(
                    "Expected integer in column {}, found {:?}",
                    index, value
                ))
            }),
        }
    }
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of the value; booleans map to 0/1 and numeric strings are parsed
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Bool(b) => Some(i64::from(*b)),
            DatabaseValue::Int32(i) => Some(i64::from(*i)),
            DatabaseValue::Int64(i) => Some(*i),
            DatabaseValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<u64> for DatabaseValue {
    fn from(value: u64) -> Self {
        DatabaseValue::Int64(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(value: Vec<u8>) -> Self {
        DatabaseValue::Bytes(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl SqlDialect {
    /// Get the parameter placeholder for the zero-based parameter `index`
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::MySQL | SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Get the quote character for identifiers in this dialect
    pub fn identifier_quote(&self) -> char {
        match self {
            SqlDialect::PostgreSQL => '"',
            SqlDialect::MySQL => '`',
            SqlDialect::SQLite => '"',
        }
    }

    /// Quote an identifier, doubling any embedded quote characters
    pub fn quote_identifier(&self, identifier: &str) -> String {
        let quote = self.identifier_quote();
        let escaped = identifier.replace(quote, &format!("{quote}{quote}"));
        format!("{quote}{escaped}{quote}")
    }

    /// Quote a possibly schema-qualified table reference
    pub fn quote_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        }
    }

    /// Check if this dialect has schemas a migration table can be placed in
    pub fn supports_schemas(&self) -> bool {
        match self {
            SqlDialect::PostgreSQL | SqlDialect::MySQL => true,
            SqlDialect::SQLite => false,
        }
    }
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlDialect::PostgreSQL => write!(f, "postgresql"),
            SqlDialect::MySQL => write!(f, "mysql"),
            SqlDialect::SQLite => write!(f, "sqlite"),
        }
    }
}
