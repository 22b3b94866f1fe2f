use std::sync::Arc;

use crate::audit::AuditLog;
use crate::registry::{RefreshConfig, RefreshConfigStore};
use crate::worker::TableRefreshWorker;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    /// Handed off to the continuation queue.
    Continuing,
    Throttled,
    /// Another attempt holds the table's lease; nothing was started.
    InProgress,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub success: bool,
    pub rows_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    pub status: OutcomeStatus,
    pub completed: bool,
    pub continued: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log_id: Option<Uuid>,
}

impl TableOutcome {
    fn throttled(table: &str, err: &Error) -> Self {
        Self {
            table: table.to_string(),
            success: false,
            rows_processed: 0,
            error: Some(err.to_string()),
            error_code: Some(err.code()),
            status: OutcomeStatus::Throttled,
            completed: false,
            continued: false,
            skipped: true,
            audit_log_id: None,
        }
    }

    fn in_progress(table: &str, err: &Error) -> Self {
        Self {
            status: OutcomeStatus::InProgress,
            ..Self::throttled(table, err)
        }
    }

    fn failed(table: &str, audit_log_id: Option<Uuid>, err: &Error) -> Self {
        Self {
            table: table.to_string(),
            success: false,
            rows_processed: 0,
            error: Some(err.to_string()),
            error_code: Some(err.code()),
            status: OutcomeStatus::Failed,
            completed: false,
            continued: false,
            skipped: false,
            audit_log_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub continued: usize,
    pub rows_processed: u64,
    pub results: Vec<TableOutcome>,
}

impl RunSummary {
    fn from_results(started_at: DateTime<Utc>, results: Vec<TableOutcome>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            total: results.len(),
            succeeded: results.iter().filter(|r| r.success).count(),
            failed: results
                .iter()
                .filter(|r| r.status == OutcomeStatus::Failed)
                .count(),
            skipped: results.iter().filter(|r| r.skipped).count(),
            continued: results.iter().filter(|r| r.continued).count(),
            rows_processed: results.iter().map(|r| r.rows_processed).sum(),
            results,
        }
    }
}

/// Runs enabled tables in priority order and reports per-table outcomes.
pub struct RefreshOrchestrator {
    registry: Arc<dyn RefreshConfigStore>,
    audit: Arc<dyn AuditLog>,
    worker: Arc<TableRefreshWorker>,
    min_refresh_interval: chrono::Duration,
}

impl RefreshOrchestrator {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        registry: Arc<dyn RefreshConfigStore>,
        audit: Arc<dyn AuditLog>,
        worker: Arc<TableRefreshWorker>,
        min_refresh_interval: std::time::Duration,
    ) -> Result<Self> {
        let min_refresh_interval = chrono::Duration::from_std(min_refresh_interval)
            .map_err(|e| Error::InvalidInput(format!("min_refresh_interval out of range: {e}")))?;
        Ok(Self {
            registry,
            audit,
            worker,
            min_refresh_interval,
        })
    }

    /// Refresh every enabled table. Per-table failures land in the summary.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_all(&self, force: bool) -> Result<RunSummary> {
        let started_at = Utc::now();
        let configs = self.registry.list_enabled().await?;
        let mut results = Vec::with_capacity(configs.len());
        for config in &configs {
            results.push(self.run_config_outcome(config, force).await);
        }
        let summary = RunSummary::from_results(started_at, results);
        tracing::info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            continued = summary.continued,
            rows_processed = summary.rows_processed,
            "refresh run finished"
        );
        Ok(summary)
    }

    /// Refresh one table. Unknown, disabled, throttled and failed runs are errors.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_table(&self, table_name: &str, force: bool) -> Result<TableOutcome> {
        let config = self.registry.require_config(table_name).await?;
        if !config.is_enabled {
            return Err(Error::Disabled(config.table_name.clone()));
        }
        let (_, result) = self.run_config(&config, force).await;
        result
    }

    /// Scheduled path: every enabled table whose `next_refresh_at` has passed.
    /// Tables with a sync still holding its lease are left to their continuation chain.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<TableOutcome>> {
        let configs = self.registry.list_enabled().await?;
        let mut results = Vec::new();
        for config in configs.iter().filter(|c| c.is_due(now)) {
            if let Some(holder) = self.worker.lease_holder(config, now).await? {
                tracing::debug!(table = %config.table_name, %holder, "due table still in progress");
                continue;
            }
            results.push(self.run_config_outcome(config, true).await);
        }
        Ok(results)
    }

    async fn run_config_outcome(&self, config: &RefreshConfig, force: bool) -> TableOutcome {
        match self.run_config(config, force).await {
            (_, Ok(outcome)) => outcome,
            (_, Err(e @ Error::Throttled { .. })) => {
                tracing::info!(table = %config.table_name, error = %e, "refresh skipped");
                TableOutcome::throttled(&config.table_name, &e)
            }
            (audit_log_id, Err(e @ Error::Conflict(_))) => {
                tracing::info!(table = %config.table_name, error = %e, "refresh already in progress");
                TableOutcome {
                    audit_log_id,
                    ..TableOutcome::in_progress(&config.table_name, &e)
                }
            }
            (audit_log_id, Err(e)) => TableOutcome::failed(&config.table_name, audit_log_id, &e),
        }
    }

    async fn run_config(
        &self,
        config: &RefreshConfig,
        force: bool,
    ) -> (Option<Uuid>, Result<TableOutcome>) {
        let now = Utc::now();
        if !force && let Err(e) = config.check_throttle(now, self.min_refresh_interval) {
            return (None, Err(e));
        }
        match self.worker.lease_holder(config, now).await {
            Ok(Some(holder)) => {
                return (
                    None,
                    Err(Error::Conflict(format!(
                        "refresh already in progress for {} (attempt {holder})",
                        config.table_name
                    ))),
                );
            }
            Ok(None) => {}
            Err(e) => return (None, Err(e)),
        }
        if let Err(e) = self.registry.mark_run_start(&config.table_name, now).await {
            return (None, Err(e));
        }
        let entry = match self.audit.start(config, now).await {
            Ok(entry) => entry,
            Err(e) => return (None, Err(e)),
        };
        let result = self.worker.run(config, entry.id).await.map(|run| TableOutcome {
            table: config.table_name.clone(),
            success: true,
            rows_processed: run.rows_processed,
            error: None,
            error_code: None,
            status: if run.completed {
                OutcomeStatus::Completed
            } else {
                OutcomeStatus::Continuing
            },
            completed: run.completed,
            continued: run.continued,
            skipped: false,
            audit_log_id: Some(entry.id),
        });
        (Some(entry.id), result)
    }
}
