//! Migration Planner - Current position, corruption checks and targets
//!
//! Positions are indices into the name-sorted migration list. `None` means
//! no migration has been executed, which orders before every `Some(index)`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::definitions::{Migration, MigrationDirection, MigrationTarget, NamedMigration};
use crate::error::{MigrationError, MigrationResult};

/// Operation requested by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MigrationMode {
    Latest,
    To(MigrationTarget),
    Up,
    Down,
}

/// Resolved migrations aligned with the ledger
#[derive(Debug, Clone)]
pub(crate) struct MigrationState {
    pub migrations: Vec<NamedMigration>,
    /// Index of the last executed migration
    pub current_index: Option<usize>,
}

/// Steps a run has to walk, in execution order
#[derive(Debug)]
pub(crate) struct MigrationPlan<'a> {
    pub direction: MigrationDirection,
    pub steps: Vec<&'a NamedMigration>,
}

impl MigrationState {
    /// Align resolved migrations with the executed names from the ledger
    ///
    /// `executed` must be sorted by name. Every executed name has to exist
    /// and the executed names have to be a prefix of the migration list.
    pub fn new(migrations: BTreeMap<String, Migration>, executed: &[String]) -> MigrationResult<Self> {
        let migrations: Vec<NamedMigration> = migrations
            .into_iter()
            .map(|(name, migration)| NamedMigration { name, migration })
            .collect();

        for name in executed {
            if !migrations.iter().any(|m| &m.name == name) {
                return Err(MigrationError::Corruption(format!(
                    "previously executed migration {} is missing",
                    name
                )));
            }
        }

        for (index, name) in executed.iter().enumerate() {
            match migrations.get(index) {
                Some(found) if &found.name == name => {}
                found => {
                    return Err(MigrationError::Corruption(format!(
                        "expected previously executed migration {} to be at index {} but {} was found in its place. \
                         New migrations must always have a name that comes alphabetically after the last executed migration.",
                        name,
                        index,
                        found.map_or("nothing", |m| m.name.as_str())
                    )));
                }
            }
        }

        Ok(Self {
            migrations,
            current_index: executed.len().checked_sub(1),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    fn last_index(&self) -> Option<usize> {
        self.migrations.len().checked_sub(1)
    }

    /// Resolve the position a run should end at
    pub fn target_index(&self, mode: &MigrationMode) -> MigrationResult<Option<usize>> {
        match mode {
            MigrationMode::Latest => Ok(self.last_index()),
            MigrationMode::To(MigrationTarget::NoMigrations) => Ok(None),
            MigrationMode::To(MigrationTarget::Name(name)) => self
                .migrations
                .iter()
                .position(|m| &m.name == name)
                .map(Some)
                .ok_or_else(|| MigrationError::TargetNotFound(name.clone())),
            MigrationMode::Up => Ok(match self.current_index {
                None => self.last_index().map(|_| 0),
                Some(current) => self.last_index().map(|last| (current + 1).min(last)),
            }),
            MigrationMode::Down => Ok(self.current_index.and_then(|current| current.checked_sub(1))),
        }
    }

    /// Steps between the current position and `target`, `None` when already there
    pub fn plan(&self, target: Option<usize>) -> Option<MigrationPlan<'_>> {
        match target.cmp(&self.current_index) {
            Ordering::Equal => None,
            Ordering::Greater => {
                let start = self.current_index.map_or(0, |current| current + 1);
                let end = target?;
                Some(MigrationPlan {
                    direction: MigrationDirection::Up,
                    steps: self.migrations[start..=end].iter().collect(),
                })
            }
            Ordering::Less => {
                let start = target.map_or(0, |t| t + 1);
                let end = self.current_index?;
                Some(MigrationPlan {
                    direction: MigrationDirection::Down,
                    steps: self.migrations[start..=end].iter().rev().collect(),
                })
            }
        }
    }
}
