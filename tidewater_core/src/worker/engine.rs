use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::{AuditLog, BatchMetrics};
use crate::catalog::{SyncMode, TableCatalog, TableSpec, transform_batch};
use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore, Lease, SyncCursor};
use crate::config::SyncSettings;
use crate::registry::{RefreshConfig, RefreshConfigStore};
use crate::source::{SourceWarehouse, cursor_value};
use crate::target::TargetStore;
use crate::webhooks::{EVENT_REFRESH_COMPLETED, EVENT_REFRESH_FAILED, WebhookQueue};
use crate::worker::tasks::{ContinuationQueue, ContinuationTask};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

pub const DISABLED_CANCEL_MESSAGE: &str = "refresh cancelled: table disabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    /// Soft deadline per invocation.
    pub time_budget: Duration,
    pub lease_ttl: Duration,
}

impl WorkerSettings {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            time_budget: settings.time_budget(),
            lease_ttl: settings.checkpoint_lease,
        }
    }
}

/// Result of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerRun {
    pub table_name: String,
    pub audit_log_id: Uuid,
    pub checkpoint_id: Uuid,
    pub invocation: u32,
    /// Rows processed by the whole attempt so far, across invocations.
    pub rows_processed: u64,
    pub rows_this_invocation: u64,
    pub batches: u32,
    pub completed: bool,
    /// A continuation was enqueued for the remaining work.
    pub continued: bool,
}

/// Moves one table forward batch by batch under the checkpoint lease.
pub struct TableRefreshWorker {
    registry: Arc<dyn RefreshConfigStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditLog>,
    catalog: Arc<TableCatalog>,
    source: Arc<dyn SourceWarehouse>,
    target: Arc<dyn TargetStore>,
    continuations: Arc<dyn ContinuationQueue>,
    webhooks: Option<Arc<WebhookQueue>>,
    settings: WorkerSettings,
}

impl TableRefreshWorker {
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        registry: Arc<dyn RefreshConfigStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        audit: Arc<dyn AuditLog>,
        catalog: Arc<TableCatalog>,
        source: Arc<dyn SourceWarehouse>,
        target: Arc<dyn TargetStore>,
        continuations: Arc<dyn ContinuationQueue>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            audit,
            catalog,
            source,
            target,
            continuations,
            webhooks: None,
            settings,
        }
    }

    /// Emit `refresh.completed` / `refresh.failed` through this queue.
    pub fn with_webhooks(mut self, webhooks: Arc<WebhookQueue>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// First invocation of an attempt whose audit entry is already `running`.
    #[tracing::instrument(level = "info", skip(self, config), fields(table = %config.table_name))]
    pub async fn run(&self, config: &RefreshConfig, audit_log_id: Uuid) -> Result<WorkerRun> {
        self.invoke(config, audit_log_id, 1).await
    }

    /// Pick up a handed-off attempt. Returns `None` when the attempt was abandoned.
    #[tracing::instrument(level = "info", skip(self, task), fields(table = %task.table_name, invocation = task.invocation))]
    pub async fn continue_task(&self, task: &ContinuationTask) -> Result<Option<WorkerRun>> {
        let Some(entry) = self.audit.get(task.audit_log_id).await? else {
            tracing::warn!(audit_log_id = %task.audit_log_id, "continuation for unknown audit entry dropped");
            return Ok(None);
        };
        if entry.is_finished() {
            tracing::info!(audit_log_id = %task.audit_log_id, status = entry.status.as_str(), "attempt already finished");
            return Ok(None);
        }

        let config = match self.registry.get_config(&task.table_name).await? {
            Some(config) if config.is_enabled => config,
            other => {
                tracing::info!(table = %task.table_name, "table disabled; abandoning continuation");
                if let Some(config) = &other {
                    self.release_lease(&CheckpointKey::for_config(config), task.audit_log_id)
                        .await;
                }
                let err = Error::Disabled(DISABLED_CANCEL_MESSAGE.to_string());
                self.record_failure(&entry.table_name, &entry.table_schema, task.audit_log_id, &err)
                    .await;
                return Ok(None);
            }
        };

        self.invoke(&config, task.audit_log_id, task.invocation)
            .await
            .map(Some)
    }

    /// Owner of a live lease on the table's active checkpoint, if any.
    #[tracing::instrument(level = "debug", skip(self, config), fields(table = %config.table_name))]
    pub async fn lease_holder(
        &self,
        config: &RefreshConfig,
        now: chrono::DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let active = self
            .checkpoints
            .get_active(&CheckpointKey::for_config(config))
            .await?;
        Ok(active
            .filter(|c| c.has_live_lease(now))
            .and_then(|c| c.lease_owner))
    }

    async fn invoke(
        &self,
        config: &RefreshConfig,
        audit_log_id: Uuid,
        invocation: u32,
    ) -> Result<WorkerRun> {
        let key = CheckpointKey::for_config(config);
        let (spec, lease, checkpoint) = match self.acquire(config, &key, audit_log_id).await {
            Ok(acquired) => acquired,
            Err(e @ Error::Conflict(_)) => {
                self.record_skipped(config, audit_log_id, &e).await;
                return Err(e);
            }
            Err(e) => {
                self.record_failure(&config.table_name, &config.table_schema, audit_log_id, &e)
                    .await;
                return Err(e);
            }
        };
        match self
            .sync_batches(config, &spec, checkpoint, &lease, invocation)
            .await
        {
            Ok(run) => Ok(run),
            Err(e) => {
                self.release_lease(&key, audit_log_id).await;
                self.record_failure(&config.table_name, &config.table_schema, audit_log_id, &e)
                    .await;
                Err(e)
            }
        }
    }

    fn lease(&self, owner: Uuid) -> Result<Lease> {
        let ttl = chrono::Duration::from_std(self.settings.lease_ttl)
            .map_err(|e| Error::InvalidInput(format!("lease ttl out of range: {e}")))?;
        Ok(Lease::new(owner, ttl))
    }

    async fn acquire(
        &self,
        config: &RefreshConfig,
        key: &CheckpointKey,
        audit_log_id: Uuid,
    ) -> Result<(Arc<TableSpec>, Lease, Checkpoint)> {
        let spec = self.catalog.get(&config.function_name)?;
        let lease = self.lease(audit_log_id)?;
        let initial = self.initial_cursor(&spec, key).await?;
        let acquired = self
            .checkpoints
            .acquire_or_resume(key, &initial, &lease, Utc::now())
            .await?;
        tracing::info!(
            checkpoint_id = %acquired.checkpoint.id,
            outcome = ?acquired.outcome,
            watermark = acquired.checkpoint.cursor.watermark.as_deref().unwrap_or(""),
            skip = acquired.checkpoint.cursor.skip,
            "checkpoint acquired"
        );
        Ok((spec, lease, acquired.checkpoint))
    }

    async fn sync_batches(
        &self,
        config: &RefreshConfig,
        spec: &TableSpec,
        mut checkpoint: Checkpoint,
        lease: &Lease,
        invocation: u32,
    ) -> Result<WorkerRun> {
        let started = Instant::now();
        let audit_log_id = lease.owner;
        let limit = spec.batch_size.unwrap_or(self.settings.batch_size).max(1);
        let mut run = WorkerRun {
            table_name: config.table_name.clone(),
            audit_log_id,
            checkpoint_id: checkpoint.id,
            invocation,
            rows_processed: 0,
            rows_this_invocation: 0,
            batches: 0,
            completed: false,
            continued: false,
        };

        loop {
            let fetched = self.apply_batch(spec, &mut checkpoint, lease, limit).await?;
            run.batches += 1;
            run.rows_this_invocation += fetched.rows;
            run.rows_processed = fetched.attempt_rows;

            if fetched.rows < limit as u64 {
                self.finish(config, spec, &checkpoint, lease, &mut run).await?;
                return Ok(run);
            }
            if started.elapsed() >= self.settings.time_budget {
                self.hand_off(config, &checkpoint, &mut run).await?;
                return Ok(run);
            }
        }
    }

    async fn initial_cursor(&self, spec: &TableSpec, key: &CheckpointKey) -> Result<SyncCursor> {
        if spec.sync_mode == SyncMode::Full {
            return Ok(SyncCursor::default());
        }
        Ok(self
            .checkpoints
            .get_completed(key)
            .await?
            .map(|c| c.cursor.restart())
            .unwrap_or_default())
    }

    /// Fetch, transform, upsert and advance one batch.
    #[tracing::instrument(level = "debug", skip_all, fields(checkpoint_id = %checkpoint.id))]
    async fn apply_batch(
        &self,
        spec: &TableSpec,
        checkpoint: &mut Checkpoint,
        lease: &Lease,
        limit: usize,
    ) -> Result<FetchedBatch> {
        let rows = self
            .source
            .fetch_batch(spec, &checkpoint.cursor, limit)
            .await?;
        let cursor_values: Vec<String> = rows.iter().filter_map(|r| cursor_value(spec, r)).collect();
        let transformed = transform_batch(spec, &rows);
        let outcome = if transformed.rows.is_empty() {
            Default::default()
        } else {
            self.target.upsert_batch(spec, &transformed.rows).await?
        };

        let fetched = rows.len() as u64;
        let next_cursor = checkpoint.cursor.advance(&cursor_values);
        let rows_so_far = checkpoint.last_processed_row + fetched;
        *checkpoint = self
            .checkpoints
            .advance(checkpoint, &next_cursor, rows_so_far, lease, Utc::now())
            .await?;

        let entry = self
            .audit
            .record_batch(
                lease.owner,
                &BatchMetrics {
                    rows_processed: fetched,
                    rows_inserted: outcome.inserted,
                    rows_updated: outcome.updated,
                    rows_skipped: transformed.skipped,
                },
            )
            .await?;
        tracing::debug!(
            fetched,
            inserted = outcome.inserted,
            updated = outcome.updated,
            skipped = transformed.skipped,
            watermark = next_cursor.watermark.as_deref().unwrap_or(""),
            "batch applied"
        );
        Ok(FetchedBatch {
            rows: fetched,
            attempt_rows: entry.rows_processed,
        })
    }

    async fn finish(
        &self,
        config: &RefreshConfig,
        spec: &TableSpec,
        checkpoint: &Checkpoint,
        lease: &Lease,
        run: &mut WorkerRun,
    ) -> Result<()> {
        let now = Utc::now();
        let done = self.checkpoints.complete(checkpoint, lease, now).await?;
        let entry = self
            .audit
            .succeed(
                run.audit_log_id,
                serde_json::json!({
                    "checkpoint_id": done.id,
                    "cursor": done.cursor,
                    "total_rows": done.total_rows,
                    "invocations": run.invocation,
                    "target": spec.qualified_target(),
                }),
                now,
            )
            .await?;
        self.registry
            .mark_run_success(&config.table_name, entry.rows_processed, now)
            .await?;
        run.completed = true;
        tracing::info!(
            rows_processed = entry.rows_processed,
            invocations = run.invocation,
            execution_time_ms = entry.execution_time_ms.unwrap_or(0),
            "refresh completed"
        );

        self.emit(
            EVENT_REFRESH_COMPLETED,
            serde_json::json!({
                "table_name": config.table_name,
                "table_schema": config.table_schema,
                "function_name": config.function_name,
                "audit_log_id": run.audit_log_id,
                "rows_processed": entry.rows_processed,
                "rows_inserted": entry.rows_inserted,
                "rows_updated": entry.rows_updated,
                "execution_time_ms": entry.execution_time_ms,
            }),
        )
        .await;
        Ok(())
    }

    async fn hand_off(
        &self,
        config: &RefreshConfig,
        checkpoint: &Checkpoint,
        run: &mut WorkerRun,
    ) -> Result<()> {
        self.continuations
            .enqueue(ContinuationTask {
                table_name: config.table_name.clone(),
                audit_log_id: run.audit_log_id,
                checkpoint_id: checkpoint.id,
                invocation: run.invocation + 1,
                enqueued_at: Utc::now(),
            })
            .await?;
        run.continued = true;
        tracing::info!(
            rows_this_invocation = run.rows_this_invocation,
            next_invocation = run.invocation + 1,
            "time budget reached; continuation enqueued"
        );
        Ok(())
    }

    /// Give the lease back so the next attempt resumes from the saved cursor at once.
    async fn release_lease(&self, key: &CheckpointKey, owner: Uuid) {
        let released = match self.lease(owner) {
            Ok(lease) => self.checkpoints.release(key, &lease, Utc::now()).await,
            Err(e) => Err(e),
        };
        match released {
            Ok(true) => tracing::info!(%key, %owner, "checkpoint lease released"),
            Ok(false) => {}
            Err(e) => tracing::warn!(%key, %owner, error = %e, "could not release checkpoint lease"),
        }
    }

    /// Another attempt holds the lease; close this entry without reporting a failure.
    async fn record_skipped(&self, config: &RefreshConfig, audit_log_id: Uuid, err: &Error) {
        tracing::info!(
            table = %config.table_name,
            %audit_log_id,
            reason = %err,
            "refresh skipped; another attempt holds the lease"
        );
        if let Err(e) = self.audit.skip(audit_log_id, &err.to_string(), Utc::now()).await {
            tracing::warn!(%audit_log_id, error = %e, "could not record skipped refresh");
        }
    }

    async fn record_failure(&self, table_name: &str, table_schema: &str, audit_log_id: Uuid, err: &Error) {
        tracing::warn!(
            table = table_name,
            %audit_log_id,
            code = err.code(),
            category = err.category().as_str(),
            error = %err,
            "refresh failed"
        );
        let message = match err {
            Error::Disabled(msg) => msg.clone(),
            other => other.to_string(),
        };
        if let Err(e) = self.audit.fail(audit_log_id, &message, Utc::now()).await {
            tracing::warn!(%audit_log_id, error = %e, "could not record refresh failure");
        }
        self.emit(
            EVENT_REFRESH_FAILED,
            serde_json::json!({
                "table_name": table_name,
                "table_schema": table_schema,
                "audit_log_id": audit_log_id,
                "error": message,
                "code": err.code(),
                "category": err.category().as_str(),
            }),
        )
        .await;
    }

    async fn emit(&self, event_type: &str, data: serde_json::Value) {
        let Some(webhooks) = &self.webhooks else {
            return;
        };
        if let Err(e) = webhooks.notify(event_type, data, Utc::now()).await {
            tracing::warn!(event_type, error = %e, "webhook enqueue failed");
        }
    }
}

struct FetchedBatch {
    rows: u64,
    attempt_rows: u64,
}
