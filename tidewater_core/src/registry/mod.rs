//! Refresh Config Registry: one durable record per synchronized table.
//!
//! The registry answers two questions for the orchestrator: which tables to run
//! (enabled, in priority order) and whether a table may run again yet.

pub mod models;
pub mod traits;

pub use models::{RefreshConfig, sort_for_run};
pub use traits::RefreshConfigStore;
