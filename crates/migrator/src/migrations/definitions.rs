//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the migration unit itself, the target selection type and the
//! result set every public migration operation returns.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::backends::DatabaseConnection;
use crate::error::{BoxError, MigrationError};

/// Result type for migration actions
pub type ActionResult = Result<(), BoxError>;

/// A forward or backward migration action
#[async_trait]
pub trait MigrationAction: Send + Sync {
    /// Apply the action using the run's database handle
    async fn run(&self, db: &mut dyn DatabaseConnection) -> ActionResult;
}

/// Action executing a fixed list of SQL statements in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlAction {
    statements: Vec<String>,
}

impl SqlAction {
    pub fn new<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.iter().all(|s| s.trim().is_empty())
    }
}

#[async_trait]
impl MigrationAction for SqlAction {
    async fn run(&self, db: &mut dyn DatabaseConnection) -> ActionResult {
        for statement in self.statements.iter().filter(|s| !s.trim().is_empty()) {
            db.execute(statement, &[]).await?;
        }
        Ok(())
    }
}

/// Action backed by an async closure
///
/// ```ignore
/// let up = FnAction::new(|db| Box::pin(async move {
///     db.execute("CREATE TABLE users (id INTEGER PRIMARY KEY)", &[]).await?;
///     Ok(())
/// }));
/// ```
pub struct FnAction<F> {
    func: F,
}

impl<F> FnAction<F>
where
    F: for<'a> Fn(&'a mut dyn DatabaseConnection) -> BoxFuture<'a, ActionResult> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> MigrationAction for FnAction<F>
where
    F: for<'a> Fn(&'a mut dyn DatabaseConnection) -> BoxFuture<'a, ActionResult> + Send + Sync,
{
    async fn run(&self, db: &mut dyn DatabaseConnection) -> ActionResult {
        (self.func)(db).await
    }
}

/// A schema change unit with a required forward action and an optional backward action
#[derive(Clone)]
pub struct Migration {
    up: Arc<dyn MigrationAction>,
    down: Option<Arc<dyn MigrationAction>>,
}

impl Migration {
    /// Create an irreversible migration
    pub fn new<A>(up: A) -> Self
    where
        A: MigrationAction + 'static,
    {
        Self {
            up: Arc::new(up),
            down: None,
        }
    }

    /// Attach a backward action
    pub fn with_down<A>(mut self, down: A) -> Self
    where
        A: MigrationAction + 'static,
    {
        self.down = Some(Arc::new(down));
        self
    }

    /// Migration made of plain SQL statements
    pub fn sql<I, S>(up: I, down: Option<I>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let migration = Self::new(SqlAction::new(up));
        match down {
            Some(down) => migration.with_down(SqlAction::new(down)),
            None => migration,
        }
    }

    pub fn up(&self) -> &Arc<dyn MigrationAction> {
        &self.up
    }

    pub fn down(&self) -> Option<&Arc<dyn MigrationAction>> {
        self.down.as_ref()
    }

    /// Whether the migration can be reversed
    pub fn has_down(&self) -> bool {
        self.down.is_some()
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("has_down", &self.has_down())
            .finish_non_exhaustive()
    }
}

/// A migration bound to its resolved name
#[derive(Debug, Clone)]
pub struct NamedMigration {
    pub name: String,
    pub migration: Migration,
}

/// Resolved migration together with its ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    /// Migration name
    pub name: String,
    /// Whether a backward action is defined
    pub reversible: bool,
    /// ISO-8601 timestamp of execution, `None` when pending
    pub executed_at: Option<String>,
}

impl MigrationInfo {
    pub fn is_executed(&self) -> bool {
        self.executed_at.is_some()
    }
}

/// Target selection for [`Migrator::migrate_to`](crate::Migrator::migrate_to)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MigrationTarget {
    /// Migrate up or down until the named migration is the last executed one
    Name(String),
    /// Migrate all the way down, leaving no migration executed
    NoMigrations,
}

impl From<&str> for MigrationTarget {
    fn from(name: &str) -> Self {
        MigrationTarget::Name(name.to_string())
    }
}

impl From<String> for MigrationTarget {
    fn from(name: String) -> Self {
        MigrationTarget::Name(name)
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationDirection {
    /// Apply the migration (run the forward action)
    Up,
    /// Revert the migration (run the backward action)
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// Outcome of a single planned step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationStatus {
    Success,
    Error,
    /// Never attempted, or skipped because no backward action is defined
    NotExecuted,
}

/// Result of one planned migration step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStepResult {
    pub migration_name: String,
    pub direction: MigrationDirection,
    pub status: MigrationStatus,
}

impl MigrationStepResult {
    pub(crate) fn planned(migration_name: &str, direction: MigrationDirection) -> Self {
        Self {
            migration_name: migration_name.to_string(),
            direction,
            status: MigrationStatus::NotExecuted,
        }
    }
}

/// Outcome of a public migration operation
///
/// `results` is `None` when the run failed before a step plan existed
/// (bootstrap, locking, source resolution, corruption, unknown target).
/// When a step fails, both `error` and `results` are set.
#[derive(Debug, Default)]
pub struct MigrationResultSet {
    pub error: Option<MigrationError>,
    pub results: Option<Vec<MigrationStepResult>>,
}

impl MigrationResultSet {
    pub(crate) fn success(results: Vec<MigrationStepResult>) -> Self {
        Self {
            error: None,
            results: Some(results),
        }
    }

    pub(crate) fn step_failure(error: MigrationError, results: Vec<MigrationStepResult>) -> Self {
        Self {
            error: Some(error),
            results: Some(results),
        }
    }

    pub(crate) fn failure(error: MigrationError) -> Self {
        Self {
            error: Some(error),
            results: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&MigrationError> {
        self.error.as_ref()
    }

    /// Step results, empty when planning failed
    pub fn results(&self) -> &[MigrationStepResult] {
        self.results.as_deref().unwrap_or(&[])
    }

    /// Names of the steps that completed successfully, in execution order
    pub fn applied(&self) -> Vec<&str> {
        self.results()
            .iter()
            .filter(|r| r.status == MigrationStatus::Success)
            .map(|r| r.migration_name.as_str())
            .collect()
    }

    /// Convert into a plain `Result`, discarding partial results on failure
    pub fn into_result(self) -> Result<Vec<MigrationStepResult>, MigrationError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.results.unwrap_or_default()),
        }
    }
}
