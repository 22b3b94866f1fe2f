use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WebhookSettings;
use crate::webhooks::models::{DeliveryStatus, WebhookConfig, WebhookDelivery};
use crate::webhooks::signing::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, sign_body};
use crate::webhooks::traits::{OutboundRequest, WebhookStore, WebhookTransport};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Upper bound on drain rounds per call, so a flood cannot pin the caller.
const MAX_DRAIN_ROUNDS: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub batches: usize,
    pub selected: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.batches += other.batches;
        self.selected += other.selected;
        self.delivered += other.delivered;
        self.retrying += other.retrying;
        self.failed += other.failed;
    }
}

/// Durable outbound notifications with per-config retry schedules.
pub struct WebhookQueue {
    store: Arc<dyn WebhookStore>,
    transport: Arc<dyn WebhookTransport>,
    default_timeout: Duration,
    batch_size: usize,
}

impl WebhookQueue {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        transport: Arc<dyn WebhookTransport>,
        settings: &WebhookSettings,
    ) -> Self {
        Self {
            store,
            transport,
            default_timeout: settings.timeout,
            batch_size: settings.batch_size.max(1),
        }
    }

    /// One `pending` delivery per config, due immediately.
    #[tracing::instrument(level = "debug", skip(self, event_data, configs), fields(configs = configs.len()))]
    pub async fn enqueue(
        &self,
        event_type: &str,
        event_data: serde_json::Value,
        configs: &[WebhookConfig],
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>> {
        let deliveries: Vec<WebhookDelivery> = configs
            .iter()
            .map(|c| WebhookDelivery::new_pending(c.id, event_type, event_data.clone(), now))
            .collect();
        if !deliveries.is_empty() {
            self.store.insert_deliveries(&deliveries).await?;
        }
        Ok(deliveries)
    }

    /// Enqueue for every active config subscribed to `event_type`.
    #[tracing::instrument(level = "info", skip(self, event_data))]
    pub async fn notify(
        &self,
        event_type: &str,
        event_data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let configs: Vec<WebhookConfig> = self
            .store
            .list_webhook_configs()
            .await?
            .into_iter()
            .filter(|c| c.is_active && c.subscribes_to(event_type))
            .collect();
        let created = self.enqueue(event_type, event_data, &configs, now).await?;
        if !created.is_empty() {
            tracing::info!(deliveries = created.len(), "webhook deliveries enqueued");
        }
        Ok(created.len())
    }

    /// Attempt up to `max_batch` due deliveries.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn process_pending(&self, max_batch: usize, now: DateTime<Utc>) -> Result<DrainReport> {
        let claim_window = chrono::Duration::from_std(self.default_timeout * 2 + Duration::from_secs(60))
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let due = self
            .store
            .claim_due_deliveries(now, now + claim_window, max_batch)
            .await?;
        let mut report = DrainReport {
            batches: 1,
            selected: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let mut configs: HashMap<uuid::Uuid, Option<WebhookConfig>> = HashMap::new();
        for d in &due {
            if !configs.contains_key(&d.webhook_config_id) {
                let cfg = self.store.get_webhook_config(d.webhook_config_id).await?;
                configs.insert(d.webhook_config_id, cfg);
            }
        }

        let attempts = due.into_iter().map(|delivery| {
            let config = configs.get(&delivery.webhook_config_id).cloned().flatten();
            self.attempt(delivery, config, now)
        });
        for outcome in join_all(attempts).await {
            match outcome {
                Ok(DeliveryStatus::Success) => report.delivered += 1,
                Ok(DeliveryStatus::Retrying) | Ok(DeliveryStatus::Pending) => report.retrying += 1,
                Ok(DeliveryStatus::Failed) => report.failed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to record webhook delivery outcome");
                }
            }
        }
        Ok(report)
    }

    /// Process batches until one comes back short.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        for _ in 0..MAX_DRAIN_ROUNDS {
            let report = self.process_pending(self.batch_size, now).await?;
            let full = report.selected == self.batch_size;
            total.absorb(report);
            if !full {
                break;
            }
        }
        Ok(total)
    }

    /// Drain on a fixed interval until cancelled.
    #[tracing::instrument(level = "info", skip(self, cancel))]
    pub async fn run_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain(Utc::now()).await {
                        tracing::warn!(error = %e, "webhook drain failed");
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        mut delivery: WebhookDelivery,
        config: Option<WebhookConfig>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatus> {
        let Some(config) = config.filter(|c| c.is_active) else {
            delivery.abandon("webhook config missing or inactive", now);
            self.store.update_delivery(&delivery).await?;
            return Ok(delivery.status);
        };

        let request = self.build_request(&config, &delivery)?;
        match self.transport.deliver(&request).await {
            Ok(resp) if (200..300).contains(&resp.status) => {
                delivery.record_success(resp.status, &resp.body, now);
            }
            Ok(resp) => {
                delivery.record_failure(
                    &config.retry,
                    Some(resp.status),
                    Some(&resp.body),
                    &format!("non-success status {}", resp.status),
                    now,
                );
            }
            Err(e) => {
                delivery.record_failure(&config.retry, None, None, &e.to_string(), now);
            }
        }
        tracing::debug!(
            delivery_id = %delivery.id,
            status = delivery.status.as_str(),
            attempt_count = delivery.attempt_count,
            "webhook attempt recorded"
        );
        self.store.update_delivery(&delivery).await?;
        Ok(delivery.status)
    }

    fn build_request(&self, config: &WebhookConfig, delivery: &WebhookDelivery) -> Result<OutboundRequest> {
        let body = serde_json::to_vec(&serde_json::json!({
            "id": delivery.id,
            "event": delivery.event_type,
            "created_at": delivery.created_at,
            "data": delivery.event_data,
        }))
        .map_err(|e| Error::Webhook(format!("encode payload: {e}")))?;

        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.push((EVENT_HEADER.to_string(), delivery.event_type.clone()));
        headers.push((DELIVERY_HEADER.to_string(), delivery.id.to_string()));
        if let Some(secret) = config.secret.as_deref() {
            headers.push((SIGNATURE_HEADER.to_string(), sign_body(secret, &body)?));
        }

        Ok(OutboundRequest {
            url: config.url.clone(),
            headers,
            body,
            timeout: config
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout),
        })
    }
}
