//! Migration Providers - Resolve migration definitions
//!
//! A provider turns a caller supplied collection into a name→migration map.
//! Two providers ship with the crate: an explicit in-memory registry and a
//! directory of `.sql` files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

use super::definitions::{Migration, SqlAction};
use crate::error::{MigrationError, MigrationResult};

/// Source of migration definitions
#[async_trait]
pub trait MigrationProvider: Send + Sync {
    /// Resolve all migrations, keyed by name
    async fn get_migrations(&self) -> MigrationResult<BTreeMap<String, Migration>>;
}

/// Provider over an explicit name→migration registry
#[derive(Debug, Clone, Default)]
pub struct StaticMigrationProvider {
    migrations: BTreeMap<String, Migration>,
}

impl StaticMigrationProvider {
    pub fn new(migrations: BTreeMap<String, Migration>) -> Self {
        Self { migrations }
    }

    /// Register a migration, replacing any existing one with the same name
    pub fn add(mut self, name: impl Into<String>, migration: Migration) -> Self {
        self.migrations.insert(name.into(), migration);
        self
    }
}

impl<S: Into<String>> FromIterator<(S, Migration)> for StaticMigrationProvider {
    fn from_iter<T: IntoIterator<Item = (S, Migration)>>(iter: T) -> Self {
        Self::new(iter.into_iter().map(|(name, m)| (name.into(), m)).collect())
    }
}

#[async_trait]
impl MigrationProvider for StaticMigrationProvider {
    async fn get_migrations(&self) -> MigrationResult<BTreeMap<String, Migration>> {
        Ok(self.migrations.clone())
    }
}

/// Provider reading `.sql` migration files from a directory
///
/// The file stem is the migration name. Statements under a `-- Up` marker
/// form the forward action, statements under `-- Down` the backward action.
/// A file without markers is treated as forward-only.
#[derive(Debug, Clone)]
pub struct FileMigrationProvider {
    migrations_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

impl FileMigrationProvider {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    fn load_migration_file(path: &Path) -> MigrationResult<Option<(String, Migration)>> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                MigrationError::SourceResolution(format!(
                    "Invalid migration filename: {}",
                    path.display()
                ))
            })?
            .to_string();

        let content = fs::read_to_string(path).map_err(|e| {
            MigrationError::SourceResolution(format!(
                "Failed to read migration file {}: {}",
                path.display(),
                e
            ))
        })?;

        let (up_sql, down_sql) = parse_migration_content(&content);
        let up = SqlAction::new(split_sql_statements(&up_sql));
        if up.is_empty() {
            debug!("Skipping {}: no forward statements", path.display());
            return Ok(None);
        }

        let down = SqlAction::new(split_sql_statements(&down_sql));
        let migration = if down.is_empty() {
            Migration::new(up)
        } else {
            Migration::new(up).with_down(down)
        };

        Ok(Some((name, migration)))
    }
}

#[async_trait]
impl MigrationProvider for FileMigrationProvider {
    async fn get_migrations(&self) -> MigrationResult<BTreeMap<String, Migration>> {
        if !self.migrations_dir.exists() {
            debug!(
                "Migrations directory {} does not exist",
                self.migrations_dir.display()
            );
            return Ok(BTreeMap::new());
        }

        let entries = fs::read_dir(&self.migrations_dir).map_err(|e| {
            MigrationError::SourceResolution(format!("Failed to read migrations directory: {}", e))
        })?;

        let mut migrations = BTreeMap::new();
        for entry in entries {
            let path = entry
                .map_err(|e| {
                    MigrationError::SourceResolution(format!("Failed to read directory entry: {}", e))
                })?
                .path();

            let is_sql = path.is_file() && path.extension().map_or(false, |ext| ext == "sql");
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with('.'));
            if !is_sql || hidden {
                continue;
            }

            if let Some((name, migration)) = Self::load_migration_file(&path)? {
                migrations.insert(name, migration);
            }
        }

        debug!(
            "Resolved {} migrations from {}",
            migrations.len(),
            self.migrations_dir.display()
        );
        Ok(migrations)
    }
}

fn section_marker(line: &str) -> Option<Section> {
    let normalized = line.trim().to_lowercase();
    match normalized.as_str() {
        "-- up" | "-- up migration" | "-- migrate:up" => Some(Section::Up),
        "-- down" | "-- down migration" | "-- migrate:down" => Some(Section::Down),
        _ => None,
    }
}

/// Split file content into forward and backward SQL
fn parse_migration_content(content: &str) -> (String, String) {
    let has_markers = content.lines().any(|line| section_marker(line).is_some());
    let mut current = if has_markers { Section::Preamble } else { Section::Up };
    let mut up_sql = Vec::new();
    let mut down_sql = Vec::new();

    for line in content.lines() {
        if let Some(section) = section_marker(line) {
            current = section;
            continue;
        }

        if line.trim().is_empty() || line.trim().starts_with("--") {
            continue;
        }

        match current {
            Section::Up => up_sql.push(line),
            Section::Down => down_sql.push(line),
            Section::Preamble => {}
        }
    }

    (
        up_sql.join("\n").trim().to_string(),
        down_sql.join("\n").trim().to_string(),
    )
}

/// Split SQL statements for execution using proper SQL parsing
fn split_sql_statements(sql: &str) -> Vec<String> {
    if sql.trim().is_empty() {
        return Vec::new();
    }

    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(parsed) => parsed.into_iter().map(|stmt| format!("{};", stmt)).collect(),
        Err(e) => {
            // Dialect-specific syntax the generic parser rejects still runs as written
            warn!("SQL parsing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| format!("{};", s))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_sections() {
        let content = "-- Migration: test1\n-- Up\nCREATE TABLE test1 (id INT);\n-- Down\nDROP TABLE test1;";
        let (up, down) = parse_migration_content(content);
        assert_eq!(up, "CREATE TABLE test1 (id INT);");
        assert_eq!(down, "DROP TABLE test1;");
    }

    #[test]
    fn test_parse_without_markers_is_forward_only() {
        let (up, down) = parse_migration_content("CREATE TABLE t (id INT);\n-- a comment\n");
        assert_eq!(up, "CREATE TABLE t (id INT);");
        assert!(down.is_empty());
    }

    #[test]
    fn test_comment_resembling_marker_is_ignored() {
        let content = "-- Up\n-- update the users table\nALTER TABLE users ADD COLUMN age INT;\n";
        let (up, down) = parse_migration_content(content);
        assert_eq!(up, "ALTER TABLE users ADD COLUMN age INT;");
        assert!(down.is_empty());
    }

    #[test]
    fn test_split_statements() {
        let statements = split_sql_statements("CREATE TABLE a (id INT); CREATE TABLE b (id INT);");
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE a"));
        assert!(statements[1].ends_with(';'));
        assert!(split_sql_statements("  ").is_empty());
    }

    #[tokio::test]
    async fn test_load_migrations_sorted_by_name() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("002_posts.sql"),
            "-- Up\nCREATE TABLE posts (id INT);\n-- Down\nDROP TABLE posts;",
        )
        .unwrap();
        fs::write(
            temp_dir.path().join("001_users.sql"),
            "-- Up\nCREATE TABLE users (id INT);",
        )
        .unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "not a migration").unwrap();
        fs::write(temp_dir.path().join("003_empty.sql"), "-- Up\n-- Down\nDROP TABLE x;").unwrap();

        let provider = FileMigrationProvider::new(temp_dir.path());
        let migrations = provider.get_migrations().await.unwrap();

        let names: Vec<_> = migrations.keys().cloned().collect();
        assert_eq!(names, vec!["001_users", "002_posts"]);
        assert!(!migrations["001_users"].has_down());
        assert!(migrations["002_posts"].has_down());
    }

    #[tokio::test]
    async fn test_missing_directory_yields_no_migrations() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FileMigrationProvider::new(temp_dir.path().join("nope"));
        assert!(provider.get_migrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider: StaticMigrationProvider = vec![
            ("b", Migration::sql(vec!["SELECT 2"], None)),
            ("a", Migration::sql(vec!["SELECT 1"], None)),
        ]
        .into_iter()
        .collect();

        let migrations = provider.get_migrations().await.unwrap();
        assert_eq!(migrations.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
