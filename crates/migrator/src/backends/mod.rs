//! Database Backend Abstractions
//!
//! Connection, transaction and pool traits the migration engine runs on,
//! plus sqlx-backed implementations for PostgreSQL and SQLite.

pub mod core;
pub mod postgres;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod scripted;

// Re-export core traits and types
pub use self::core::*;
pub use postgres::PostgresPool;
pub use sqlite::SqlitePool;
