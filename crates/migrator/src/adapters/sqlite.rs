//! SQLite adapter
//!
//! SQLite DDL is transactional and the transactional path opens its
//! transaction with `BEGIN IMMEDIATE`, which already serializes writers.
//! The lock row is still claimed so that non-transactional callers sharing
//! the database observe it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{LockOptions, MigrationAdapter};
use crate::backends::{DatabaseConnection, SqlDialect};
use crate::error::{MigrationError, MigrationResult};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MigrationAdapter for SqliteAdapter {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn table_exists(
        &self,
        conn: &mut dyn DatabaseConnection,
        _schema: Option<&str>,
        table: &str,
    ) -> MigrationResult<bool> {
        let row = conn
            .fetch_optional(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                &[table.into()],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn schema_exists(
        &self,
        _conn: &mut dyn DatabaseConnection,
        schema: &str,
    ) -> MigrationResult<bool> {
        Err(MigrationError::Configuration(format!(
            "SQLite does not support schemas, cannot use migration table schema '{}'",
            schema
        )))
    }

    async fn acquire_migration_lock(
        &self,
        conn: &mut dyn DatabaseConnection,
        options: &LockOptions,
    ) -> MigrationResult<()> {
        let sql = format!(
            "UPDATE {} SET {} = 1 WHERE {} = ? AND {} = 0",
            options.quoted_lock_table(SqlDialect::SQLite),
            SqlDialect::SQLite.quote_identifier("is_locked"),
            SqlDialect::SQLite.quote_identifier("id"),
            SqlDialect::SQLite.quote_identifier("is_locked"),
        );
        let deadline = Instant::now() + Duration::from_secs(options.timeout_seconds);

        loop {
            let claimed = conn
                .execute(&sql, &[options.lock_row_id.as_str().into()])
                .await
                .map_err(|e| MigrationError::Lock(format!("Failed to claim lock row: {}", e)))?;
            if claimed == 1 {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(MigrationError::Lock(format!(
                    "Timed out after {}s waiting for lock row '{}' in {}",
                    options.timeout_seconds,
                    options.lock_row_id,
                    options.lock_key()
                )));
            }
            debug!("Lock row '{}' is held, retrying", options.lock_row_id);
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn release_migration_lock(
        &self,
        conn: &mut dyn DatabaseConnection,
        options: &LockOptions,
    ) -> MigrationResult<()> {
        let sql = format!(
            "UPDATE {} SET {} = 0 WHERE {} = ?",
            options.quoted_lock_table(SqlDialect::SQLite),
            SqlDialect::SQLite.quote_identifier("is_locked"),
            SqlDialect::SQLite.quote_identifier("id"),
        );
        conn.execute(&sql, &[options.lock_row_id.as_str().into()])
            .await
            .map_err(|e| MigrationError::Lock(format!("Failed to release lock row: {}", e)))?;
        Ok(())
    }
}
