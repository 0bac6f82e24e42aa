//! Dialect Adapters
//!
//! Locking and introspection are database specific. An adapter tells the
//! migrator whether DDL is transactional (which decides the execution
//! context) and implements the lock protocol around the persisted lock row.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;

use crate::backends::{DatabaseConnection, SqlDialect};
use crate::config::MigratorConfig;
use crate::error::MigrationResult;

pub use mysql::MysqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

/// Identifies the lock row an adapter coordinates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    pub lock_table: String,
    pub lock_table_schema: Option<String>,
    pub lock_row_id: String,
    pub timeout_seconds: u64,
}

impl LockOptions {
    pub fn from_config(config: &MigratorConfig) -> Self {
        Self {
            lock_table: config.get_migration_lock_table_name().clone(),
            lock_table_schema: config.get_migration_table_schema().clone(),
            lock_row_id: config.get_lock_row_id().clone(),
            timeout_seconds: *config.get_lock_timeout_seconds(),
        }
    }

    /// Unquoted `schema.table` name, used as a lock key
    pub fn lock_key(&self) -> String {
        match &self.lock_table_schema {
            Some(schema) => format!("{}.{}", schema, self.lock_table),
            None => self.lock_table.clone(),
        }
    }

    /// Quoted table reference for `dialect`
    pub fn quoted_lock_table(&self, dialect: SqlDialect) -> String {
        dialect.quote_table(self.lock_table_schema.as_deref(), &self.lock_table)
    }
}

/// Database capability adapter consumed by the migrator
#[async_trait]
pub trait MigrationAdapter: Send + Sync {
    /// SQL dialect used for ledger statements
    fn dialect(&self) -> SqlDialect;

    /// Whether schema changes roll back with the surrounding transaction
    fn supports_transactional_ddl(&self) -> bool;

    /// Check whether a table exists, optionally inside `schema`
    async fn table_exists(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: Option<&str>,
        table: &str,
    ) -> MigrationResult<bool>;

    /// Check whether a schema exists
    async fn schema_exists(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: &str,
    ) -> MigrationResult<bool>;

    /// Block until this run holds the migration lock, or fail
    async fn acquire_migration_lock(
        &self,
        conn: &mut dyn DatabaseConnection,
        options: &LockOptions,
    ) -> MigrationResult<()>;

    /// Release the migration lock taken by `acquire_migration_lock`
    async fn release_migration_lock(
        &self,
        conn: &mut dyn DatabaseConnection,
        options: &LockOptions,
    ) -> MigrationResult<()>;
}
