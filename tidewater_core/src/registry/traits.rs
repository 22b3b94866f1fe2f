use crate::registry::models::RefreshConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable storage for `RefreshConfig` rows, keyed by table name.
#[async_trait]
pub trait RefreshConfigStore: Send + Sync {
    /// Insert or replace a config (seeding and admin edits).
    async fn upsert_config(&self, config: &RefreshConfig) -> Result<()>;

    async fn get_config(&self, table_name: &str) -> Result<Option<RefreshConfig>>;

    /// All configs, in run order.
    async fn list_configs(&self) -> Result<Vec<RefreshConfig>>;

    /// Enabled configs, priority descending then table name ascending.
    async fn list_enabled(&self) -> Result<Vec<RefreshConfig>>;

    async fn set_enabled(&self, table_name: &str, enabled: bool) -> Result<RefreshConfig>;

    /// Record `last_attempt_at`.
    async fn mark_run_start(&self, table_name: &str, at: DateTime<Utc>) -> Result<()>;

    /// Record a successful run and recompute `next_refresh_at`.
    async fn mark_run_success(
        &self,
        table_name: &str,
        rows_processed: u64,
        at: DateTime<Utc>,
    ) -> Result<RefreshConfig>;

    /// `get_config` that treats a missing row as `NotFound`.
    async fn require_config(&self, table_name: &str) -> Result<RefreshConfig> {
        self.get_config(table_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no refresh config for table '{table_name}'")))
    }
}
