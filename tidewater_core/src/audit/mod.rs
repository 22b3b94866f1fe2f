//! Audit Logger: one entry per refresh attempt, and the freshness/health metrics
//! computed from them.

pub mod metrics;
pub mod models;
pub mod traits;

pub use metrics::{MetricsQuery, RefreshMetrics};
pub use models::{AuditLogEntry, AuditQuery, AuditStatus, BatchMetrics};
pub use traits::AuditLog;
