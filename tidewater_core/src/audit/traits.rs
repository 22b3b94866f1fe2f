use crate::Result;
use crate::audit::models::{AuditLogEntry, AuditQuery, BatchMetrics};
use crate::registry::RefreshConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Append-only record of refresh attempts.
///
/// Updates to a finished entry fail with `Conflict`; an unknown id is `NotFound`.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Open a `running` entry for `config`.
    async fn start(&self, config: &RefreshConfig, now: DateTime<Utc>) -> Result<AuditLogEntry>;

    async fn record_batch(&self, id: Uuid, batch: &BatchMetrics) -> Result<AuditLogEntry>;

    async fn succeed(
        &self,
        id: Uuid,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<AuditLogEntry>;

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<AuditLogEntry>;

    /// Close an entry that did no work because another attempt held the lease.
    async fn skip(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<AuditLogEntry>;

    async fn get(&self, id: Uuid) -> Result<Option<AuditLogEntry>>;

    /// Newest first.
    async fn list(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>>;
}
