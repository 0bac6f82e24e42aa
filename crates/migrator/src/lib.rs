//! # schema-migrator: Migration Execution Engine
//!
//! Runs an ordered set of named migrations against a database exactly once.
//! Executed migrations are recorded in a ledger table and concurrent runs
//! are serialized through a persisted lock row plus the database's own
//! locking primitive.
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite://app.db").await?;
//! let migrator = Migrator::sqlite(pool, FileMigrationProvider::new("migrations"));
//!
//! let result = migrator.migrate_to_latest().await;
//! if let Some(error) = result.error() {
//!     eprintln!("migration failed: {}", error);
//! }
//! ```

pub mod adapters;
pub mod backends;
pub mod config;
pub mod error;
pub mod migrations;

// Re-export core traits and types
pub use adapters::{LockOptions, MigrationAdapter, MysqlAdapter, PostgresAdapter, SqliteAdapter};
pub use backends::{
    DatabaseConnection, DatabasePool, DatabaseRow, DatabaseRowExt, DatabaseTransaction,
    DatabaseValue, PostgresPool, SqlDialect, SqlitePool,
};
pub use config::*;
pub use error::*;
pub use migrations::*;
