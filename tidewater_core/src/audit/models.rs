use crate::registry::RefreshConfig;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Running,
    Success,
    Failed,
    /// Superseded by an attempt already holding the table's lease. Not a failure.
    Skipped,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Running => "running",
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
            AuditStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(AuditStatus::Running),
            "success" => Ok(AuditStatus::Success),
            "failed" => Ok(AuditStatus::Failed),
            "skipped" => Ok(AuditStatus::Skipped),
            other => Err(Error::InvalidInput(format!("unknown audit status '{other}'"))),
        }
    }
}

/// Counters for one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_skipped: u64,
}

/// One refresh attempt. Frozen once `refresh_completed_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub refresh_config_id: Uuid,
    pub table_schema: String,
    pub table_name: String,
    pub status: AuditStatus,
    pub refresh_started_at: DateTime<Utc>,
    pub refresh_completed_at: Option<DateTime<Utc>>,
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_skipped: u64,
    pub execution_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub sync_metadata: serde_json::Value,
}

impl AuditLogEntry {
    pub fn new_running(config: &RefreshConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            refresh_config_id: config.id,
            table_schema: config.table_schema.clone(),
            table_name: config.table_name.clone(),
            status: AuditStatus::Running,
            refresh_started_at: now,
            refresh_completed_at: None,
            rows_processed: 0,
            rows_inserted: 0,
            rows_updated: 0,
            rows_skipped: 0,
            execution_time_ms: None,
            error_message: None,
            sync_metadata: serde_json::json!({
                "function_name": config.function_name,
                "batches": 0,
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.refresh_completed_at.is_some()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::Conflict(format!(
                "audit entry {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    pub fn apply_batch(&mut self, batch: &BatchMetrics) -> Result<()> {
        self.ensure_running()?;
        self.rows_processed += batch.rows_processed;
        self.rows_inserted += batch.rows_inserted;
        self.rows_updated += batch.rows_updated;
        self.rows_skipped += batch.rows_skipped;
        let batches = self
            .sync_metadata
            .get("batches")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        merge_metadata(
            &mut self.sync_metadata,
            serde_json::json!({ "batches": batches + 1 }),
        );
        Ok(())
    }

    pub fn finish_success(
        &mut self,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_running()?;
        merge_metadata(&mut self.sync_metadata, metadata);
        self.finish(AuditStatus::Success, now);
        Ok(())
    }

    pub fn finish_failure(&mut self, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_running()?;
        self.error_message = Some(error.to_string());
        self.finish(AuditStatus::Failed, now);
        Ok(())
    }

    pub fn finish_skipped(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_running()?;
        merge_metadata(
            &mut self.sync_metadata,
            serde_json::json!({ "skipped_reason": reason }),
        );
        self.finish(AuditStatus::Skipped, now);
        Ok(())
    }

    fn finish(&mut self, status: AuditStatus, now: DateTime<Utc>) {
        self.status = status;
        self.refresh_completed_at = Some(now);
        let elapsed = (now - self.refresh_started_at).num_milliseconds().max(0);
        self.execution_time_ms = Some(elapsed as u64);
    }
}

/// Shallow merge of object keys from `patch` into `target`.
pub fn merge_metadata(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(t), serde_json::Value::Object(p)) => {
            for (k, v) in p {
                t.insert(k, v);
            }
        }
        (_, serde_json::Value::Null) => {}
        (t, p) => *t = p,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub table_name: Option<String>,
    pub status: Option<AuditStatus>,
    /// Only entries started at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.table_name
            .as_deref()
            .is_none_or(|t| entry.table_name == t)
            && self.status.is_none_or(|s| entry.status == s)
            && self.since.is_none_or(|s| entry.refresh_started_at >= s)
    }
}
