//! Scripted connection for unit tests
//!
//! Replays queued results in call order and records every statement it
//! receives. An empty queue answers `Ok(0)` for writes and no row for reads.

use std::collections::VecDeque;

use async_trait::async_trait;

use super::core::{DatabaseConnection, DatabaseRow, DatabaseValue};
use crate::error::{MigrationError, MigrationResult};

/// Single-column row holding a fixed value
pub(crate) struct ValueRow(pub DatabaseValue);

impl DatabaseRow for ValueRow {
    fn get_by_index(&self, index: usize) -> MigrationResult<DatabaseValue> {
        match index {
            0 => Ok(self.0.clone()),
            _ => Err(MigrationError::Database(format!("No column at index {}", index))),
        }
    }

    fn get_by_name(&self, _name: &str) -> MigrationResult<DatabaseValue> {
        Ok(self.0.clone())
    }

    fn column_count(&self) -> usize {
        1
    }
}

#[derive(Default)]
pub(crate) struct ScriptedConnection {
    executes: VecDeque<MigrationResult<u64>>,
    rows: VecDeque<MigrationResult<Option<DatabaseValue>>>,
    pub statements: Vec<(String, Vec<DatabaseValue>)>,
}

impl ScriptedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `execute`
    pub fn on_execute(mut self, result: MigrationResult<u64>) -> Self {
        self.executes.push_back(result);
        self
    }

    /// Queue the next `fetch_optional` answer; `None` means no row
    pub fn on_fetch(mut self, value: Option<DatabaseValue>) -> Self {
        self.rows.push_back(Ok(value));
        self
    }

    /// Queue a failing `fetch_optional`
    pub fn on_fetch_error(mut self, message: &str) -> Self {
        self.rows
            .push_back(Err(MigrationError::Database(message.to_string())));
        self
    }
}

#[async_trait]
impl DatabaseConnection for ScriptedConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        self.statements.push((sql.to_string(), params.to_vec()));
        self.executes.pop_front().unwrap_or(Ok(0))
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>> {
        self.statements.push((sql.to_string(), params.to_vec()));
        Ok(Vec::new())
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Option<Box<dyn DatabaseRow>>> {
        self.statements.push((sql.to_string(), params.to_vec()));
        let value = self.rows.pop_front().unwrap_or(Ok(None))?;
        Ok(value.map(|value| Box::new(ValueRow(value)) as Box<dyn DatabaseRow>))
    }
}
