//! Migration Ledger - Persisted record of executed migrations
//!
//! Owns the DDL and DML for the ledger table and the single-row lock table.
//! Bootstrap is check-then-create; if creation fails the object is checked
//! again and the error is only kept when it still does not exist, so
//! concurrent runs can bootstrap the same database.

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info};

use crate::adapters::MigrationAdapter;
use crate::backends::{DatabaseConnection, DatabaseRowExt, SqlDialect};
use crate::config::MigratorConfig;
use crate::error::{MigrationError, MigrationResult};

const NAME_COLUMN: &str = "name";
const TIMESTAMP_COLUMN: &str = "timestamp";
const LOCK_ID_COLUMN: &str = "id";
const LOCK_FLAG_COLUMN: &str = "is_locked";

/// One row of the ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub name: String,
    pub timestamp: String,
}

pub(crate) struct Ledger<'a> {
    config: &'a MigratorConfig,
    adapter: &'a dyn MigrationAdapter,
}

impl<'a> Ledger<'a> {
    pub(crate) fn new(config: &'a MigratorConfig, adapter: &'a dyn MigrationAdapter) -> Self {
        Self { config, adapter }
    }

    fn dialect(&self) -> SqlDialect {
        self.adapter.dialect()
    }

    fn column(&self, name: &str) -> String {
        self.dialect().quote_identifier(name)
    }

    fn schema(&self) -> Option<&str> {
        self.config.get_migration_table_schema().as_deref()
    }

    /// Create the schema, both tables and the lock row when missing
    pub(crate) async fn ensure_tables(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        if let Some(schema) = self.schema() {
            self.ensure_schema(conn, schema).await?;
        }
        self.ensure_ledger_table(conn).await?;
        self.ensure_lock_table(conn).await?;
        self.ensure_lock_row(conn).await?;
        Ok(())
    }

    async fn ensure_schema(&self, conn: &mut dyn DatabaseConnection, schema: &str) -> MigrationResult<()> {
        if self.adapter.schema_exists(conn, schema).await? {
            return Ok(());
        }

        let sql = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.dialect().quote_identifier(schema)
        );
        if let Err(e) = conn.execute(&sql, &[]).await {
            if !self.adapter.schema_exists(conn, schema).await? {
                return Err(e);
            }
            debug!("Schema {} was created concurrently", schema);
            return Ok(());
        }
        info!("Created migration schema {}", schema);
        Ok(())
    }

    async fn ensure_ledger_table(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        let table = self.config.get_migration_table_name();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) NOT NULL PRIMARY KEY, {} VARCHAR(255) NOT NULL)",
            self.config.migration_table(self.dialect()),
            self.column(NAME_COLUMN),
            self.column(TIMESTAMP_COLUMN),
        );
        self.ensure_table(conn, table, &sql).await
    }

    async fn ensure_lock_table(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        let table = self.config.get_migration_lock_table_name();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) NOT NULL PRIMARY KEY, {} INTEGER NOT NULL DEFAULT 0)",
            self.config.migration_lock_table(self.dialect()),
            self.column(LOCK_ID_COLUMN),
            self.column(LOCK_FLAG_COLUMN),
        );
        self.ensure_table(conn, table, &sql).await
    }

    async fn ensure_table(
        &self,
        conn: &mut dyn DatabaseConnection,
        table: &str,
        create_sql: &str,
    ) -> MigrationResult<()> {
        if self.adapter.table_exists(conn, self.schema(), table).await? {
            return Ok(());
        }

        if let Err(e) = conn.execute(create_sql, &[]).await {
            if !self.adapter.table_exists(conn, self.schema(), table).await? {
                return Err(e);
            }
            debug!("Table {} was created concurrently", table);
            return Ok(());
        }
        info!("Created table {}", table);
        Ok(())
    }

    async fn lock_row_exists(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<bool> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.column(LOCK_ID_COLUMN),
            self.config.migration_lock_table(self.dialect()),
            self.column(LOCK_ID_COLUMN),
            self.dialect().parameter_placeholder(0),
        );
        let row = conn
            .fetch_optional(&sql, &[self.config.get_lock_row_id().as_str().into()])
            .await?;
        Ok(row.is_some())
    }

    async fn ensure_lock_row(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        if self.lock_row_exists(conn).await? {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, 0)",
            self.config.migration_lock_table(self.dialect()),
            self.column(LOCK_ID_COLUMN),
            self.column(LOCK_FLAG_COLUMN),
            self.dialect().parameter_placeholder(0),
        );
        if let Err(e) = conn
            .execute(&sql, &[self.config.get_lock_row_id().as_str().into()])
            .await
        {
            if !self.lock_row_exists(conn).await? {
                return Err(e);
            }
            debug!("Lock row was inserted concurrently");
        }
        Ok(())
    }

    /// All ledger rows, sorted by migration name
    pub(crate) async fn records(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<Vec<LedgerRecord>> {
        let sql = format!(
            "SELECT {}, {} FROM {}",
            self.column(NAME_COLUMN),
            self.column(TIMESTAMP_COLUMN),
            self.config.migration_table(self.dialect()),
        );

        let mut records = conn
            .fetch_all(&sql, &[])
            .await?
            .iter()
            .map(|row| {
                Ok(LedgerRecord {
                    name: row.get_string(NAME_COLUMN)?,
                    timestamp: row.get_string(TIMESTAMP_COLUMN)?,
                })
            })
            .collect::<MigrationResult<Vec<_>>>()?;

        // Sorted here so ordering never depends on the database collation
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Names of executed migrations in ascending order
    pub(crate) async fn executed_migrations(
        &self,
        conn: &mut dyn DatabaseConnection,
    ) -> MigrationResult<Vec<String>> {
        Ok(self
            .records(conn)
            .await?
            .into_iter()
            .map(|record| record.name)
            .collect())
    }

    pub(crate) async fn record_applied(
        &self,
        conn: &mut dyn DatabaseConnection,
        name: &str,
    ) -> MigrationResult<()> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            self.config.migration_table(self.dialect()),
            self.column(NAME_COLUMN),
            self.column(TIMESTAMP_COLUMN),
            self.dialect().parameter_placeholder(0),
            self.dialect().parameter_placeholder(1),
        );
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        conn.execute(&sql, &[name.into(), timestamp.into()]).await?;
        Ok(())
    }

    pub(crate) async fn remove_applied(
        &self,
        conn: &mut dyn DatabaseConnection,
        name: &str,
    ) -> MigrationResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.config.migration_table(self.dialect()),
            self.column(NAME_COLUMN),
            self.dialect().parameter_placeholder(0),
        );
        let removed = conn.execute(&sql, &[name.into()]).await?;
        if removed == 0 {
            return Err(MigrationError::Database(format!(
                "Migration {} has no ledger record to remove",
                name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;

    use crate::adapters::{LockOptions, SqliteAdapter};
    use crate::backends::scripted::ScriptedConnection;
    use crate::backends::{DatabasePool, DatabaseValue, SqlitePool};
    use crate::config::MigratorConfigBuilder;

    /// Adapter answering existence checks from queues of canned answers
    struct ScriptedAdapter {
        tables: Mutex<VecDeque<bool>>,
        schemas: Mutex<VecDeque<bool>>,
    }

    impl ScriptedAdapter {
        fn new(tables: &[bool]) -> Self {
            Self {
                tables: Mutex::new(tables.iter().copied().collect()),
                schemas: Mutex::new(VecDeque::new()),
            }
        }

        fn with_schemas(self, schemas: &[bool]) -> Self {
            *self.schemas.lock().unwrap() = schemas.iter().copied().collect();
            self
        }
    }

    #[async_trait]
    impl MigrationAdapter for ScriptedAdapter {
        fn dialect(&self) -> SqlDialect {
            SqlDialect::SQLite
        }

        fn supports_transactional_ddl(&self) -> bool {
            true
        }

        async fn table_exists(
            &self,
            _conn: &mut dyn DatabaseConnection,
            _schema: Option<&str>,
            _table: &str,
        ) -> MigrationResult<bool> {
            Ok(self.tables.lock().unwrap().pop_front().unwrap_or(false))
        }

        async fn schema_exists(
            &self,
            _conn: &mut dyn DatabaseConnection,
            _schema: &str,
        ) -> MigrationResult<bool> {
            Ok(self.schemas.lock().unwrap().pop_front().unwrap_or(false))
        }

        async fn acquire_migration_lock(
            &self,
            _conn: &mut dyn DatabaseConnection,
            _options: &LockOptions,
        ) -> MigrationResult<()> {
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

    fn already_exists() -> MigrationResult<u64> {
        Err(MigrationError::Database("object already exists".to_string()))
    }

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqlitePool::new(pool)
    }

    #[tokio::test]
    async fn test_ensure_tables_is_idempotent() {
        let pool = memory_pool().await;
        let config = MigratorConfig::default();
        let adapter = SqliteAdapter::new();
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = pool.acquire().await.unwrap();

        ledger.ensure_tables(conn.as_mut()).await.unwrap();
        ledger.ensure_tables(conn.as_mut()).await.unwrap();

        assert!(adapter
            .table_exists(conn.as_mut(), None, "schema_migrations")
            .await
            .unwrap());
        let rows = conn
            .fetch_all("SELECT \"id\", \"is_locked\" FROM \"schema_migrations_lock\"", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_string("id").unwrap(), "migration_lock");
        assert_eq!(rows[0].get_optional_i64(1).unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_record_and_remove() {
        let pool = memory_pool().await;
        let config = MigratorConfig::default();
        let adapter = SqliteAdapter::new();
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = pool.acquire().await.unwrap();
        ledger.ensure_tables(conn.as_mut()).await.unwrap();

        ledger.record_applied(conn.as_mut(), "b").await.unwrap();
        ledger.record_applied(conn.as_mut(), "a").await.unwrap();
        assert_eq!(ledger.executed_migrations(conn.as_mut()).await.unwrap(), vec!["a", "b"]);

        let records = ledger.records(conn.as_mut()).await.unwrap();
        assert!(records[0].timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&records[0].timestamp).is_ok());

        ledger.remove_applied(conn.as_mut(), "a").await.unwrap();
        assert_eq!(ledger.executed_migrations(conn.as_mut()).await.unwrap(), vec!["b"]);
        assert!(ledger.remove_applied(conn.as_mut(), "a").await.is_err());
    }

    #[tokio::test]
    async fn test_schema_is_rejected_on_sqlite() {
        let pool = memory_pool().await;
        let config = MigratorConfigBuilder::new()
            .migration_table_schema(Some("admin".to_string()))
            .build()
            .expect("Failed to build config");
        let adapter = SqliteAdapter::new();
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = pool.acquire().await.unwrap();

        let err = ledger.ensure_tables(conn.as_mut()).await.unwrap_err();
        assert!(matches!(err, MigrationError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_schema_created_concurrently_is_accepted() {
        let config = MigratorConfigBuilder::new()
            .migration_table_schema(Some("admin".to_string()))
            .build()
            .expect("Failed to build config");
        let adapter = ScriptedAdapter::new(&[]).with_schemas(&[false, true]);
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = ScriptedConnection::new().on_execute(already_exists());

        ledger.ensure_schema(&mut conn, "admin").await.unwrap();

        assert_eq!(conn.statements.len(), 1);
        assert_eq!(conn.statements[0].0, "CREATE SCHEMA IF NOT EXISTS \"admin\"");
        assert!(adapter.schemas.lock().unwrap().is_empty());

        let adapter = ScriptedAdapter::new(&[]).with_schemas(&[false, false]);
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = ScriptedConnection::new().on_execute(already_exists());
        assert!(ledger.ensure_schema(&mut conn, "admin").await.is_err());
    }

    #[tokio::test]
    async fn test_table_created_concurrently_is_accepted() {
        let config = MigratorConfig::default();
        let adapter = ScriptedAdapter::new(&[false, true]);
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = ScriptedConnection::new().on_execute(already_exists());

        ledger.ensure_ledger_table(&mut conn).await.unwrap();

        assert_eq!(conn.statements.len(), 1);
        assert!(conn.statements[0].0.starts_with("CREATE TABLE IF NOT EXISTS"));
        assert!(adapter.tables.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_table_create_failure_is_kept_when_table_is_missing() {
        let config = MigratorConfig::default();
        let adapter = ScriptedAdapter::new(&[false, false]);
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = ScriptedConnection::new().on_execute(already_exists());

        let err = ledger.ensure_lock_table(&mut conn).await.unwrap_err();
        assert!(matches!(err, MigrationError::Database(ref m) if m == "object already exists"));
    }

    #[tokio::test]
    async fn test_lock_row_inserted_concurrently_is_accepted() {
        let config = MigratorConfig::default();
        let adapter = ScriptedAdapter::new(&[]);
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = ScriptedConnection::new()
            .on_fetch(None)
            .on_execute(already_exists())
            .on_fetch(Some(DatabaseValue::String("migration_lock".to_string())));

        ledger.ensure_lock_row(&mut conn).await.unwrap();

        let statements: Vec<&str> = conn.statements.iter().map(|(sql, _)| sql.as_str()).collect();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("SELECT"));
        assert!(statements[1].starts_with("INSERT INTO"));
        assert!(statements[2].starts_with("SELECT"));
        assert_eq!(
            conn.statements[1].1,
            vec![DatabaseValue::String("migration_lock".to_string())]
        );
    }

    #[tokio::test]
    async fn test_lock_row_insert_failure_is_kept_when_row_is_missing() {
        let config = MigratorConfig::default();
        let adapter = ScriptedAdapter::new(&[]);
        let ledger = Ledger::new(&config, &adapter);
        let mut conn = ScriptedConnection::new()
            .on_fetch(None)
            .on_execute(already_exists())
            .on_fetch(None);

        let err = ledger.ensure_lock_row(&mut conn).await.unwrap_err();
        assert!(matches!(err, MigrationError::Database(ref m) if m == "object already exists"));
    }
}
