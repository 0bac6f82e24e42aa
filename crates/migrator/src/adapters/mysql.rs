//! MySQL adapter
//!
//! MySQL commits implicitly around DDL, so runs use a reserved connection
//! and a session-level named lock (`GET_LOCK`). The lock belongs to the
//! connection, which is why acquire and release must share it.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{LockOptions, MigrationAdapter};
use crate::backends::{DatabaseConnection, DatabaseRowExt, SqlDialect};
use crate::error::{MigrationError, MigrationResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlAdapter;

impl MysqlAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// MySQL caps user-level lock names at 64 characters
fn lock_name(options: &LockOptions) -> String {
    options.lock_key().chars().take(64).collect()
}

#[async_trait]
impl MigrationAdapter for MysqlAdapter {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::MySQL
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
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
                    "SELECT 1 FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
                    &[schema.into(), table.into()],
                )
                .await?
            }
            None => {
                conn.fetch_optional(
                    "SELECT 1 FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?",
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
                "SELECT 1 FROM information_schema.schemata WHERE schema_name = ?",
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
        let name = lock_name(options);
        debug!("Waiting for named lock {}", name);

        let row = conn
            .fetch_optional(
                "SELECT GET_LOCK(?, ?) AS acquired",
                &[name.clone().into(), options.timeout_seconds.into()],
            )
            .await
            .map_err(|e| MigrationError::Lock(format!("Failed to acquire lock {}: {}", name, e)))?
            .ok_or_else(|| MigrationError::Lock("GET_LOCK returned no row".to_string()))?;

        match row.get_optional_i64(0)? {
            Some(1) => Ok(()),
            Some(_) => Err(MigrationError::Lock(format!(
                "Timed out after {}s waiting for lock {}",
                options.timeout_seconds, name
            ))),
            None => Err(MigrationError::Lock(format!(
                "GET_LOCK failed for lock {}",
                name
            ))),
        }
    }

    async fn release_migration_lock(
        &self,
        conn: &mut dyn DatabaseConnection,
        options: &LockOptions,
    ) -> MigrationResult<()> {
        let name = lock_name(options);
        let row = conn
            .fetch_optional("SELECT RELEASE_LOCK(?) AS released", &[name.clone().into()])
            .await
            .map_err(|e| MigrationError::Lock(format!("Failed to release lock {}: {}", name, e)))?;

        if let Some(row) = row {
            if row.get_optional_i64(0)? != Some(1) {
                warn!("Lock {} was not held by this connection", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::scripted::ScriptedConnection;
    use crate::backends::DatabaseValue;

    fn options() -> LockOptions {
        LockOptions {
            lock_table: "schema_migrations_lock".to_string(),
            lock_table_schema: None,
            lock_row_id: "migration_lock".to_string(),
            timeout_seconds: 30,
        }
    }

    #[test]
    fn test_capabilities() {
        let adapter = MysqlAdapter::new();
        assert!(!adapter.supports_transactional_ddl());
        assert_eq!(adapter.dialect(), SqlDialect::MySQL);
    }

    #[test]
    fn test_lock_name_is_capped() {
        let options = LockOptions {
            lock_table: "l".repeat(60),
            lock_table_schema: Some("schema".to_string()),
            lock_row_id: "migration_lock".to_string(),
            timeout_seconds: 10,
        };
        let name = lock_name(&options);
        assert_eq!(name.len(), 64);
        assert!(name.starts_with("schema."));
    }

    #[tokio::test]
    async fn test_get_lock_granted() {
        let adapter = MysqlAdapter::new();
        let mut conn = ScriptedConnection::new().on_fetch(Some(DatabaseValue::Int64(1)));

        adapter.acquire_migration_lock(&mut conn, &options()).await.unwrap();

        let (sql, params) = &conn.statements[0];
        assert_eq!(sql, "SELECT GET_LOCK(?, ?) AS acquired");
        assert_eq!(
            params,
            &vec![
                DatabaseValue::String("schema_migrations_lock".to_string()),
                DatabaseValue::Int64(30),
            ]
        );
    }

    #[tokio::test]
    async fn test_get_lock_timeout_is_a_lock_error() {
        let adapter = MysqlAdapter::new();
        let mut conn = ScriptedConnection::new().on_fetch(Some(DatabaseValue::Int64(0)));

        let err = adapter
            .acquire_migration_lock(&mut conn, &options())
            .await
            .unwrap_err();
        match err {
            MigrationError::Lock(message) => assert!(message.contains("Timed out after 30s")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_lock_null_or_missing_row_is_a_lock_error() {
        let adapter = MysqlAdapter::new();

        let mut conn = ScriptedConnection::new().on_fetch(Some(DatabaseValue::Null));
        let err = adapter
            .acquire_migration_lock(&mut conn, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Lock(ref m) if m.contains("GET_LOCK failed")));

        let mut conn = ScriptedConnection::new().on_fetch(None);
        let err = adapter
            .acquire_migration_lock(&mut conn, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Lock(ref m) if m.contains("no row")));
    }

    #[tokio::test]
    async fn test_get_lock_query_failure_is_a_lock_error() {
        let adapter = MysqlAdapter::new();
        let mut conn = ScriptedConnection::new().on_fetch_error("server has gone away");

        let err = adapter
            .acquire_migration_lock(&mut conn, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Lock(ref m) if m.contains("server has gone away")));
    }

    #[tokio::test]
    async fn test_release_lock() {
        let adapter = MysqlAdapter::new();

        let mut conn = ScriptedConnection::new().on_fetch(Some(DatabaseValue::Int64(1)));
        adapter.release_migration_lock(&mut conn, &options()).await.unwrap();
        let (sql, params) = &conn.statements[0];
        assert_eq!(sql, "SELECT RELEASE_LOCK(?) AS released");
        assert_eq!(
            params,
            &vec![DatabaseValue::String("schema_migrations_lock".to_string())]
        );

        // A lock this connection no longer holds only warns
        let mut conn = ScriptedConnection::new().on_fetch(Some(DatabaseValue::Int64(0)));
        adapter.release_migration_lock(&mut conn, &options()).await.unwrap();
        let mut conn = ScriptedConnection::new().on_fetch(Some(DatabaseValue::Null));
        adapter.release_migration_lock(&mut conn, &options()).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_lock_query_failure_is_a_lock_error() {
        let adapter = MysqlAdapter::new();
        let mut conn = ScriptedConnection::new().on_fetch_error("connection reset");

        let err = adapter
            .release_migration_lock(&mut conn, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Lock(ref m) if m.contains("connection reset")));
    }
}
