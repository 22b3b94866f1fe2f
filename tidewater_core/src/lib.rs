//! Tidewater core library: checkpointed, resumable warehouse-to-store refreshes.

pub mod audit;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod o11y;
pub mod orchestrator;
pub mod registry;
pub mod source;
pub mod store;
pub mod target;
pub mod webhooks;
pub mod worker;

pub use audit::{AuditLog, AuditLogEntry, AuditQuery, AuditStatus, MetricsQuery, RefreshMetrics};
pub use catalog::{TableCatalog, TableSpec};
pub use checkpoint::{Checkpoint, CheckpointKey, CheckpointStore, SyncCursor};
pub use config::SyncSettings;
pub use error::{Error, ErrorCategory, Result};
pub use orchestrator::{RefreshOrchestrator, RefreshScheduler, RunSummary, TableOutcome};
pub use registry::{RefreshConfig, RefreshConfigStore};
pub use worker::{ContinuationTask, TableRefreshWorker, WorkerRun, WorkerSettings};
