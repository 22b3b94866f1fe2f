//! Refresh Orchestrator and the background scheduler built on it.

pub mod engine;
pub mod schedule;

pub use engine::{OutcomeStatus, RefreshOrchestrator, RunSummary, TableOutcome};
pub use schedule::{RefreshScheduler, TickReport};
