//! Migration System
//!
//! Definitions, sources, the ledger, the planner and the runner that ties
//! them together.

pub mod definitions;
pub mod ledger;
pub mod planner;
pub mod provider;
pub mod runner;

pub use definitions::*;
pub use ledger::LedgerRecord;
pub use provider::*;
pub use runner::Migrator;
