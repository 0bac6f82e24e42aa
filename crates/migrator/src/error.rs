//! Error types for the migration engine
//!
//! Every public migration operation reports failures through a
//! [`MigrationResultSet`](crate::MigrationResultSet); these errors are the
//! payload of its `error` field and the `Err` side of the lower-level APIs.

use thiserror::Error;

use crate::migrations::definitions::MigrationDirection;

/// Boxed error returned by user supplied migration actions
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for migration engine operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Migration engine errors
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Migration definitions could not be read or loaded
    #[error("Failed to resolve migrations: {0}")]
    SourceResolution(String),

    /// The ledger is not a prefix of the resolved migration list
    #[error("Corrupted migrations: {0}")]
    Corruption(String),

    /// A named target is not among the resolved migrations
    #[error("Migration \"{0}\" does not exist")]
    TargetNotFound(String),

    /// The migration lock could not be acquired or released
    #[error("Migration lock error: {0}")]
    Lock(String),

    /// A migration's forward or backward action failed
    #[error("Migration \"{migration_name}\" failed while migrating {direction}: {source}")]
    StepExecution {
        migration_name: String,
        direction: MigrationDirection,
        #[source]
        source: BoxError,
    },

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(String),

    /// Transaction begin/commit/rollback error
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Invalid migrator configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MigrationError {
    /// Name of the migration whose action failed, if this is a step failure
    pub fn failed_migration(&self) -> Option<&str> {
        match self {
            MigrationError::StepExecution { migration_name, .. } => Some(migration_name),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database(err.to_string())
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        MigrationError::SourceResolution(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_execution_message() {
        let err = MigrationError::StepExecution {
            migration_name: "2024_01_create_users".to_string(),
            direction: MigrationDirection::Up,
            source: "relation already exists".into(),
        };

        assert_eq!(
            err.to_string(),
            "Migration \"2024_01_create_users\" failed while migrating up: relation already exists"
        );
        assert_eq!(err.failed_migration(), Some("2024_01_create_users"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_planning_errors_have_no_failed_migration() {
        let err = MigrationError::TargetNotFound("missing".to_string());
        assert_eq!(err.to_string(), "Migration \"missing\" does not exist");
        assert!(err.failed_migration().is_none());

        let err = MigrationError::Corruption("previously executed migration x is missing".into());
        assert!(err.to_string().starts_with("Corrupted migrations:"));
    }

    #[test]
    fn test_io_error_is_source_resolution() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: MigrationError = io.into();
        assert!(matches!(err, MigrationError::SourceResolution(_)));
    }
}
