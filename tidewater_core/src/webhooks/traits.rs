use std::time::Duration;

use crate::Result;
use crate::webhooks::models::{WebhookConfig, WebhookDelivery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn upsert_webhook_config(&self, config: &WebhookConfig) -> Result<()>;

    async fn get_webhook_config(&self, id: Uuid) -> Result<Option<WebhookConfig>>;

    async fn list_webhook_configs(&self) -> Result<Vec<WebhookConfig>>;

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<()>;

    /// Take up to `limit` deliveries in `pending`/`retrying` with `next_retry_at <= now`,
    /// oldest first, and push their `next_retry_at` to `claim_until` so concurrent
    /// drains skip them.
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>>;

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>>;
}

/// A prepared outbound callback.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Sends prepared callbacks. Transport errors (DNS, connect, timeout) are `Err`;
/// any HTTP response, including non-2xx, is `Ok`.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, request: &OutboundRequest) -> Result<TransportResponse>;
}
