//! Migration Runner - Executes migrations against the database
//!
//! Every public operation bootstraps the ledger tables, takes the migration
//! lock inside the execution context chosen by the adapter, plans against
//! the ledger and walks the plan one migration at a time. Failures are
//! reported through the returned [`MigrationResultSet`], never raised.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::definitions::{
    MigrationDirection, MigrationInfo, MigrationResultSet, MigrationStatus, MigrationStepResult,
    MigrationTarget,
};
use super::ledger::Ledger;
use super::planner::{MigrationMode, MigrationPlan, MigrationState};
use super::provider::MigrationProvider;
use crate::adapters::{LockOptions, MigrationAdapter, PostgresAdapter, SqliteAdapter};
use crate::backends::{DatabaseConnection, DatabasePool, PostgresPool, SqlitePool};
use crate::config::MigratorConfig;
use crate::error::{BoxError, MigrationError, MigrationResult};

/// Internal failure carrying partial results when a step plan existed
#[derive(Debug)]
enum RunFailure {
    Plan(MigrationError),
    Step {
        error: MigrationError,
        results: Vec<MigrationStepResult>,
    },
}

impl From<MigrationError> for RunFailure {
    fn from(error: MigrationError) -> Self {
        RunFailure::Plan(error)
    }
}

impl RunFailure {
    fn error(&self) -> &MigrationError {
        match self {
            RunFailure::Plan(error) | RunFailure::Step { error, .. } => error,
        }
    }
}

type RunOutcome = Result<Vec<MigrationStepResult>, RunFailure>;

/// Migrator that runs a provider's migrations against a database
pub struct Migrator {
    pool: Arc<dyn DatabasePool>,
    adapter: Arc<dyn MigrationAdapter>,
    provider: Arc<dyn MigrationProvider>,
    config: MigratorConfig,
}

impl Migrator {
    /// Create a migrator with the default configuration
    pub fn new<P, A, M>(pool: P, adapter: A, provider: M) -> Self
    where
        P: DatabasePool + 'static,
        A: MigrationAdapter + 'static,
        M: MigrationProvider + 'static,
    {
        Self {
            pool: Arc::new(pool),
            adapter: Arc::new(adapter),
            provider: Arc::new(provider),
            config: MigratorConfig::default(),
        }
    }

    /// Migrator for a PostgreSQL pool
    pub fn postgres<M: MigrationProvider + 'static>(pool: PostgresPool, provider: M) -> Self {
        Self::new(pool, PostgresAdapter::new(), provider)
    }

    /// Migrator for a SQLite pool
    pub fn sqlite<M: MigrationProvider + 'static>(pool: SqlitePool, provider: M) -> Self {
        Self::new(pool, SqliteAdapter::new(), provider)
    }

    /// Replace the ledger configuration
    pub fn with_config(mut self, config: MigratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Run all migrations that have not yet been run
    pub async fn migrate_to_latest(&self) -> MigrationResultSet {
        self.migrate(MigrationMode::Latest).await
    }

    /// Migrate up or down until `target` is the last executed migration
    ///
    /// `MigrationTarget::NoMigrations` reverts every executed migration.
    pub async fn migrate_to(&self, target: impl Into<MigrationTarget>) -> MigrationResultSet {
        self.migrate(MigrationMode::To(target.into())).await
    }

    /// Run the next pending migration, if any
    pub async fn migrate_up(&self) -> MigrationResultSet {
        self.migrate(MigrationMode::Up).await
    }

    /// Revert the last executed migration, if any
    pub async fn migrate_down(&self) -> MigrationResultSet {
        self.migrate(MigrationMode::Down).await
    }

    /// All resolved migrations with their execution time from the ledger
    ///
    /// Does not take the migration lock.
    pub async fn get_migrations(&self) -> MigrationResult<Vec<MigrationInfo>> {
        self.config.validate()?;
        self.ensure_tables().await?;

        let migrations = self.provider.get_migrations().await?;
        let mut conn = self.pool.acquire().await?;
        let ledger = Ledger::new(&self.config, self.adapter.as_ref());
        let executed: HashMap<String, String> = ledger
            .records(conn.as_mut())
            .await?
            .into_iter()
            .map(|record| (record.name, record.timestamp))
            .collect();

        Ok(migrations
            .into_iter()
            .map(|(name, migration)| MigrationInfo {
                executed_at: executed.get(&name).cloned(),
                reversible: migration.has_down(),
                name,
            })
            .collect())
    }

    async fn migrate(&self, mode: MigrationMode) -> MigrationResultSet {
        debug!("Starting migration run: {:?}", mode);

        match self.run(&mode).await {
            Ok(results) => {
                info!("Migration run finished, {} step(s) planned", results.len());
                MigrationResultSet::success(results)
            }
            Err(RunFailure::Plan(error)) => {
                error!("Migration run failed: {}", error);
                MigrationResultSet::failure(error)
            }
            Err(RunFailure::Step { error, results }) => {
                error!("Migration run stopped: {}", error);
                MigrationResultSet::step_failure(error, results)
            }
        }
    }

    async fn run(&self, mode: &MigrationMode) -> RunOutcome {
        self.config.validate()?;
        self.ensure_tables().await?;

        if self.adapter.supports_transactional_ddl() {
            self.run_in_transaction(mode).await
        } else {
            self.run_on_reserved_connection(mode).await
        }
    }

    async fn ensure_tables(&self) -> MigrationResult<()> {
        let mut conn = self.pool.acquire().await?;
        Ledger::new(&self.config, self.adapter.as_ref())
            .ensure_tables(conn.as_mut())
            .await
    }

    /// Run the locked region in one transaction, committed only on success
    async fn run_in_transaction(&self, mode: &MigrationMode) -> RunOutcome {
        let mut tx = self.pool.begin_transaction().await?;
        let outcome = self.run_locked(tx.as_connection(), mode).await;

        match outcome {
            Ok(results) => {
                tx.commit().await.map_err(|e| match e {
                    MigrationError::Transaction(_) => e,
                    other => MigrationError::Transaction(other.to_string()),
                })?;
                Ok(results)
            }
            Err(failure) => {
                debug!("Rolling back migration transaction: {}", failure.error());
                if let Err(e) = tx.rollback().await {
                    warn!("Failed to roll back migration transaction: {}", e);
                }
                Err(failure)
            }
        }
    }

    /// Run the locked region on a single connection, without a transaction
    async fn run_on_reserved_connection(&self, mode: &MigrationMode) -> RunOutcome {
        let mut conn = self.pool.acquire().await?;
        self.run_locked(conn.as_mut(), mode).await
    }

    /// Hold the migration lock around planning and execution
    async fn run_locked(&self, conn: &mut dyn DatabaseConnection, mode: &MigrationMode) -> RunOutcome {
        let lock = LockOptions::from_config(&self.config);

        self.adapter.acquire_migration_lock(conn, &lock).await?;
        debug!("Acquired migration lock {}", lock.lock_key());

        let outcome = self.plan_and_execute(conn, mode).await;

        // Released on every path once acquired
        match (outcome, self.adapter.release_migration_lock(conn, &lock).await) {
            (outcome, Ok(())) => {
                debug!("Released migration lock {}", lock.lock_key());
                outcome
            }
            (Ok(_), Err(release_error)) => Err(RunFailure::Plan(release_error)),
            (Err(failure), Err(release_error)) => {
                warn!("Failed to release migration lock: {}", release_error);
                Err(failure)
            }
        }
    }

    async fn plan_and_execute(&self, conn: &mut dyn DatabaseConnection, mode: &MigrationMode) -> RunOutcome {
        let ledger = Ledger::new(&self.config, self.adapter.as_ref());

        let migrations = self.provider.get_migrations().await?;
        let executed = ledger.executed_migrations(conn).await?;
        let state = MigrationState::new(migrations, &executed)?;

        if state.is_empty() {
            info!("No migrations found");
            return Ok(Vec::new());
        }

        let target = state.target_index(mode)?;
        match state.plan(target) {
            Some(plan) => self.execute(conn, &ledger, plan).await,
            None => {
                info!("Migrations are already at the requested target");
                Ok(Vec::new())
            }
        }
    }

    /// Walk the plan in order, stopping at the first failing step
    async fn execute(
        &self,
        conn: &mut dyn DatabaseConnection,
        ledger: &Ledger<'_>,
        plan: MigrationPlan<'_>,
    ) -> RunOutcome {
        let direction = plan.direction;
        let mut results: Vec<MigrationStepResult> = plan
            .steps
            .iter()
            .map(|step| MigrationStepResult::planned(&step.name, direction))
            .collect();

        for (index, step) in plan.steps.iter().enumerate() {
            let action = match direction {
                MigrationDirection::Up => Some(step.migration.up()),
                MigrationDirection::Down => step.migration.down(),
            };
            let Some(action) = action else {
                debug!("Migration {} has no down action, skipping", step.name);
                continue;
            };

            info!("Migrating {} {}", direction, step.name);
            let outcome: Result<(), BoxError> = match action.run(conn).await {
                Ok(()) => {
                    let recorded = match direction {
                        MigrationDirection::Up => ledger.record_applied(conn, &step.name).await,
                        MigrationDirection::Down => ledger.remove_applied(conn, &step.name).await,
                    };
                    recorded.map_err(BoxError::from)
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => results[index].status = MigrationStatus::Success,
                Err(source) => {
                    results[index].status = MigrationStatus::Error;
                    error!("Migration {} failed while migrating {}: {}", step.name, direction, source);
                    return Err(RunFailure::Step {
                        error: MigrationError::StepExecution {
                            migration_name: step.name.clone(),
                            direction,
                            source,
                        },
                        results,
                    });
                }
            }
        }

        Ok(results)
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("dialect", &self.adapter.dialect())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigratorConfigBuilder;
    use crate::migrations::definitions::Migration;
    use crate::migrations::provider::StaticMigrationProvider;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqlitePool::new(pool)
    }

    fn provider() -> StaticMigrationProvider {
        StaticMigrationProvider::default()
            .add(
                "001_users",
                Migration::sql(
                    vec!["CREATE TABLE users (id INTEGER PRIMARY KEY)"],
                    Some(vec!["DROP TABLE users"]),
                ),
            )
            .add(
                "002_posts",
                Migration::sql(
                    vec!["CREATE TABLE posts (id INTEGER PRIMARY KEY)"],
                    Some(vec!["DROP TABLE posts"]),
                ),
            )
    }

    #[tokio::test]
    async fn test_latest_then_down_to_nothing() {
        let migrator = Migrator::sqlite(memory_pool().await, provider());

        let up = migrator.migrate_to_latest().await;
        assert!(up.is_success());
        assert_eq!(up.applied(), vec!["001_users", "002_posts"]);

        let down = migrator.migrate_to(MigrationTarget::NoMigrations).await;
        assert!(down.is_success());
        assert_eq!(down.applied(), vec!["002_posts", "001_users"]);
        assert!(down
            .results()
            .iter()
            .all(|r| r.direction == MigrationDirection::Down));
    }

    #[tokio::test]
    async fn test_invalid_config_is_reported_without_results() {
        let config = MigratorConfigBuilder::new()
            .migration_table_name("bad name".to_string())
            .build()
            .expect("Failed to build config");
        let migrator = Migrator::sqlite(memory_pool().await, provider()).with_config(config);

        let result = migrator.migrate_to_latest().await;
        assert!(matches!(result.error, Some(MigrationError::Configuration(_))));
        assert!(result.results.is_none());
    }

    #[tokio::test]
    async fn test_get_migrations_reports_execution() {
        let migrator = Migrator::sqlite(memory_pool().await, provider());
        assert!(migrator.migrate_up().await.is_success());

        let infos = migrator.get_migrations().await.unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "001_users");
        assert!(infos[0].is_executed());
        assert!(infos[0].reversible);
        assert!(!infos[1].is_executed());
    }

    #[tokio::test]
    async fn test_debug_hides_handles() {
        let migrator = Migrator::sqlite(memory_pool().await, provider());
        let debug = format!("{:?}", migrator);
        assert!(debug.contains("SQLite"));
        assert!(debug.contains("schema_migrations"));
    }
}
