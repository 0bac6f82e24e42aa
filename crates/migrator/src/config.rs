//! Migrator configuration types and builders

use serde::{Deserialize, Serialize};
use service_builder::builder;

use crate::backends::SqlDialect;
use crate::error::{MigrationError, MigrationResult};

pub const DEFAULT_MIGRATION_TABLE: &str = "schema_migrations";
pub const DEFAULT_MIGRATION_LOCK_TABLE: &str = "schema_migrations_lock";
pub const DEFAULT_LOCK_ROW_ID: &str = "migration_lock";
pub const DEFAULT_LOCK_TIMEOUT_SECONDS: u64 = 3600;

/// Configuration for the migration ledger and lock tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[builder]
pub struct MigratorConfig {
    /// Name of the ledger table recording executed migrations
    #[builder(default = "\"schema_migrations\".to_string()", getter)]
    pub migration_table_name: String,

    /// Name of the single-row lock table
    #[builder(default = "\"schema_migrations_lock\".to_string()", getter)]
    pub migration_lock_table_name: String,

    /// Schema holding both tables; created on demand when set
    #[builder(default = "None", getter)]
    pub migration_table_schema: Option<String>,

    /// Fixed id of the lock row
    #[builder(default = "\"migration_lock\".to_string()", getter)]
    pub lock_row_id: String,

    /// Upper bound for adapters whose lock primitive takes a timeout
    #[builder(default = "3600", getter)]
    pub lock_timeout_seconds: u64,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            migration_table_name: DEFAULT_MIGRATION_TABLE.to_string(),
            migration_lock_table_name: DEFAULT_MIGRATION_LOCK_TABLE.to_string(),
            migration_table_schema: None,
            lock_row_id: DEFAULT_LOCK_ROW_ID.to_string(),
            lock_timeout_seconds: DEFAULT_LOCK_TIMEOUT_SECONDS,
        }
    }
}

impl MigratorConfig {
    /// Load configuration from the environment, falling back to defaults
    ///
    /// Reads `MIGRATION_TABLE_NAME`, `MIGRATION_LOCK_TABLE_NAME`,
    /// `MIGRATION_TABLE_SCHEMA` and `MIGRATION_LOCK_TIMEOUT`.
    pub fn from_env() -> MigrationResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> MigrationResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(table) = lookup("MIGRATION_TABLE_NAME") {
            config.migration_table_name = table;
        }
        if let Some(table) = lookup("MIGRATION_LOCK_TABLE_NAME") {
            config.migration_lock_table_name = table;
        }
        config.migration_table_schema = lookup("MIGRATION_TABLE_SCHEMA").filter(|s| !s.is_empty());
        if let Some(timeout) = lookup("MIGRATION_LOCK_TIMEOUT") {
            config.lock_timeout_seconds = timeout.parse().map_err(|_| {
                MigrationError::Configuration(format!(
                    "MIGRATION_LOCK_TIMEOUT must be a number of seconds, got '{}'",
                    timeout
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check identifiers and limits
    pub fn validate(&self) -> MigrationResult<()> {
        validate_identifier("migration_table_name", &self.migration_table_name)?;
        validate_identifier("migration_lock_table_name", &self.migration_lock_table_name)?;
        if let Some(schema) = &self.migration_table_schema {
            validate_identifier("migration_table_schema", schema)?;
        }
        if self.migration_table_name == self.migration_lock_table_name {
            return Err(MigrationError::Configuration(
                "Migration table and lock table must have different names".to_string(),
            ));
        }
        if self.lock_row_id.is_empty() {
            return Err(MigrationError::Configuration(
                "lock_row_id must not be empty".to_string(),
            ));
        }
        if self.lock_timeout_seconds == 0 {
            return Err(MigrationError::Configuration(
                "lock_timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Quoted, schema-qualified ledger table reference
    pub fn migration_table(&self, dialect: SqlDialect) -> String {
        dialect.quote_table(self.migration_table_schema.as_deref(), &self.migration_table_name)
    }

    /// Quoted, schema-qualified lock table reference
    pub fn migration_lock_table(&self, dialect: SqlDialect) -> String {
        dialect.quote_table(
            self.migration_table_schema.as_deref(),
            &self.migration_lock_table_name,
        )
    }
}

fn validate_identifier(field: &str, value: &str) -> MigrationResult<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(MigrationError::Configuration(format!(
            "{} '{}' is not a valid identifier",
            field, value
        )))
    }
}
