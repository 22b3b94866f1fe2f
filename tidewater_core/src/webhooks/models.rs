use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::WebhookSettings;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVENT_REFRESH_COMPLETED: &str = "refresh.completed";
pub const EVENT_REFRESH_FAILED: &str = "refresh.failed";
/// Subscribes a config to every event type.
pub const EVENT_WILDCARD: &str = "*";

const MAX_RESPONSE_BODY_CHARS: usize = 2_048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_seconds: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_seconds: vec![5, 30, 300],
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &WebhookSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            backoff_seconds: settings.backoff_seconds.clone(),
        }
    }

    /// Delay before the retry that follows `attempt_count` scheduled retries.
    /// The last entry repeats once the schedule is exhausted.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let idx = (attempt_count as usize).min(self.backoff_seconds.len().saturating_sub(1));
        Duration::from_secs(self.backoff_seconds.get(idx).copied().unwrap_or(60))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    /// HMAC key for `x-tidewater-signature`. Unsigned when `None`.
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub events: Vec<String>,
    pub is_active: bool,
    pub retry: RetryConfig,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    #[tracing::instrument(level = "debug", skip(secret))]
    pub fn new(
        name: impl Into<String> + std::fmt::Debug,
        url: impl Into<String> + std::fmt::Debug,
        secret: Option<String>,
        events: Vec<String>,
        retry: RetryConfig,
        now: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let now = now.unwrap_or_else(Utc::now);
        let config = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            url: url.into(),
            secret,
            headers: BTreeMap::new(),
            events,
            is_active: true,
            retry,
            timeout_ms: None,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("webhook name is empty".to_string()));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::InvalidInput(format!(
                "webhook url must be http(s): {}",
                self.url
            )));
        }
        if self.events.is_empty() {
            return Err(Error::InvalidInput(
                "webhook must subscribe to at least one event".to_string(),
            ));
        }
        if self.retry.backoff_seconds.is_empty() {
            return Err(Error::InvalidInput(
                "webhook backoff schedule is empty".to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(Error::InvalidInput("webhook timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events
            .iter()
            .any(|e| e == EVENT_WILDCARD || e == event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "retrying" => Ok(DeliveryStatus::Retrying),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(Error::BackendMessage(format!(
                "unknown delivery status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_config_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub status: DeliveryStatus,
    /// Retries scheduled so far; never exceeds `RetryConfig::max_attempts`.
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    pub fn new_pending(
        webhook_config_id: Uuid,
        event_type: &str,
        event_data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_config_id,
            event_type: event_type.to_string(),
            event_data,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_retry_at: Some(now),
            response_status: None,
            response_body: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }

    pub fn record_success(&mut self, status: u16, body: &str, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Success;
        self.response_status = Some(status);
        self.response_body = Some(truncate(body));
        self.error_message = None;
        self.next_retry_at = None;
        self.delivered_at = Some(now);
        self.updated_at = now;
    }

    /// Schedule the next retry from `retry`, or mark `failed` once exhausted.
    pub fn record_failure(
        &mut self,
        retry: &RetryConfig,
        status: Option<u16>,
        body: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) {
        self.response_status = status;
        self.response_body = body.map(truncate);
        self.error_message = Some(error.to_string());
        self.updated_at = now;
        if self.attempt_count < retry.max_attempts {
            let delay = retry.delay_for(self.attempt_count);
            self.next_retry_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.attempt_count += 1;
            self.status = DeliveryStatus::Retrying;
        } else {
            self.next_retry_at = None;
            self.status = DeliveryStatus::Failed;
        }
    }

    /// Terminal failure without retry (config deleted or deactivated).
    pub fn abandon(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = DeliveryStatus::Failed;
        self.error_message = Some(reason.to_string());
        self.next_retry_at = None;
        self.updated_at = now;
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_RESPONSE_BODY_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_fails_after_max_attempts() {
        let retry = RetryConfig {
            max_attempts: 3,
            backoff_seconds: vec![5, 30, 300],
        };
        let t0 = Utc::now();
        let mut d = WebhookDelivery::new_pending(Uuid::new_v4(), EVENT_REFRESH_FAILED, serde_json::json!({}), t0);

        let mut deltas = Vec::new();
        for _ in 0..3 {
            d.record_failure(&retry, Some(500), Some("boom"), "non-success status 500", t0);
            assert_eq!(d.status, DeliveryStatus::Retrying);
            deltas.push((d.next_retry_at.unwrap() - t0).num_seconds());
        }
        assert_eq!(deltas, vec![5, 30, 300]);
        assert_eq!(d.attempt_count, 3);

        d.record_failure(&retry, Some(500), None, "non-success status 500", t0);
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.attempt_count, 3);
        assert!(d.next_retry_at.is_none());
    }

    #[test]
    fn short_schedule_repeats_last_delay() {
        let retry = RetryConfig {
            max_attempts: 4,
            backoff_seconds: vec![10],
        };
        assert_eq!(retry.delay_for(0), Duration::from_secs(10));
        assert_eq!(retry.delay_for(3), Duration::from_secs(10));
    }

    #[test]
    fn wildcard_subscribes_to_everything() {
        let cfg = WebhookConfig::new(
            "ops",
            "https://hooks.example.com/tidewater",
            None,
            vec![EVENT_WILDCARD.to_string()],
            RetryConfig::default(),
            None,
        )
        .unwrap();
        assert!(cfg.subscribes_to(EVENT_REFRESH_COMPLETED));
        assert!(cfg.subscribes_to("anything"));
    }

    #[test]
    fn rejects_non_http_url() {
        let err = WebhookConfig::new(
            "ops",
            "ftp://example.com",
            None,
            vec![EVENT_REFRESH_FAILED.to_string()],
            RetryConfig::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
