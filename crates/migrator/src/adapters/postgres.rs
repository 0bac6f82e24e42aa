//! PostgreSQL adapter
//!
//! DDL is transactional, so the whole run shares one transaction and the
//! lock is a transaction-scoped advisory lock keyed on the lock table name.
//! It is released by commit or rollback; `release_migration_lock` has nothing to do.

use async_trait::async_trait;
use tracing::debug;

use super::{LockOptions, MigrationAdapter};
use crate::backends::{DatabaseConnection, SqlDialect};
use crate::error::{MigrationError, MigrationResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MigrationAdapter for PostgresAdapter {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn table_exists(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: Option<&str>,
        table: &str,
    ) -> MigrationResult<bool> {
        let row = match schema {
            Some(schema) => {
                conn.fetch_optional(
                    "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2",
                    &[schema.into(), table.into()],
                )
                .await?
            }
            None => {
                conn.fetch_optional(
                    "SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1",
                    &[table.into()],
                )
                .await?
            }
        };
        Ok(row.is_some())
    }

    async fn schema_exists(
        &self,
        conn: &mut dyn DatabaseConnection,
        schema: &str,
    ) -> MigrationResult<bool> {
        let row = conn
            .fetch_optional(
                "SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1",
                &[schema.into()],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn acquire_migration_lock(
        &self,
        conn: &mut dyn DatabaseConnection,
        options: &LockOptions,
    ) -> MigrationResult<()> {
        debug!("Waiting for advisory lock on {}", options.lock_key());
        conn.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1))",
            &[options.lock_key().into()],
        )
        .await
        .map_err(|e| MigrationError::Lock(format!("Failed to acquire advisory lock: {}", e)))?;
        Ok(())
    }

    async fn release_migration_lock(
        &self,
        _conn: &mut dyn DatabaseConnection,
        _options: &LockOptions,
    ) -> MigrationResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        let adapter = PostgresAdapter::new();
        assert!(adapter.supports_transactional_ddl());
        assert_eq!(adapter.dialect(), SqlDialect::PostgreSQL);
    }
}
