use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::CheckpointStore;
use crate::orchestrator::engine::{RefreshOrchestrator, TableOutcome};
use crate::webhooks::{DrainReport, WebhookQueue};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub reclaimed: u64,
    pub refreshed: Vec<TableOutcome>,
    pub webhooks: DrainReport,
}

/// Background scheduler for due refreshes.
///
/// Each tick reclaims expired checkpoint leases, runs tables whose `next_refresh_at`
/// has passed and drains due webhook deliveries.
pub struct RefreshScheduler {
    orchestrator: Arc<RefreshOrchestrator>,
    checkpoints: Arc<dyn CheckpointStore>,
    webhooks: Option<Arc<WebhookQueue>>,
    poll_interval: Duration,
}

impl RefreshScheduler {
    #[tracing::instrument(level = "debug", skip(orchestrator, checkpoints))]
    pub fn new(
        orchestrator: Arc<RefreshOrchestrator>,
        checkpoints: Arc<dyn CheckpointStore>,
        poll_interval: Duration,
    ) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        Ok(Self {
            orchestrator,
            checkpoints,
            webhooks: None,
            poll_interval,
        })
    }

    pub fn with_webhooks(mut self, webhooks: Arc<WebhookQueue>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    /// Tick until cancelled. Tick errors are logged and do not stop scheduling.
    #[tracing::instrument(level = "info", skip(self, cancel))]
    pub async fn run_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::warn!(error = %e, "refresh scheduler tick failed");
                    }
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let reclaimed = self.checkpoints.reclaim_expired(now).await?;
        if reclaimed > 0 {
            tracing::info!(reclaimed, "expired checkpoint leases reclaimed");
        }
        let refreshed = self.orchestrator.run_due(now).await?;
        let webhooks = match &self.webhooks {
            Some(queue) => queue.drain(now).await?,
            None => DrainReport::default(),
        };
        Ok(TickReport {
            reclaimed,
            refreshed,
            webhooks,
        })
    }
}
