use std::collections::HashMap;
use std::sync::Arc;

use crate::audit::{AuditLog, AuditLogEntry, AuditQuery, BatchMetrics};
use crate::checkpoint::{
    Acquired, AcquireOutcome, AdvanceDecision, Checkpoint, CheckpointKey, CheckpointStatus,
    CheckpointStore, Lease, SyncCursor, resolve_acquire, resolve_advance, resolve_complete,
    resolve_release,
};
use crate::registry::{RefreshConfig, RefreshConfigStore, sort_for_run};
use crate::webhooks::{DeliveryStatus, WebhookConfig, WebhookDelivery, WebhookStore};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-memory bookkeeping for local development and tests.
///
/// Every collection sits behind its own mutex, so checkpoint transitions are
/// serialized the same way a row lock serializes them in Postgres.
#[derive(Clone, Default)]
pub struct MemoryStore {
    configs: Arc<Mutex<HashMap<String, RefreshConfig>>>,
    checkpoints: Arc<Mutex<Vec<Checkpoint>>>,
    audit: Arc<Mutex<Vec<AuditLogEntry>>>,
    webhook_configs: Arc<Mutex<HashMap<Uuid, WebhookConfig>>>,
    deliveries: Arc<Mutex<Vec<WebhookDelivery>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every checkpoint row (primarily for tests).
    pub async fn all_checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().await.clone()
    }

    /// Snapshot of every delivery (primarily for tests).
    pub async fn all_deliveries(&self) -> Vec<WebhookDelivery> {
        self.deliveries.lock().await.clone()
    }
}

fn position(rows: &[Checkpoint], key: &CheckpointKey, status: CheckpointStatus) -> Option<usize> {
    rows.iter().position(|c| c.key == *key && c.status == status)
}

#[async_trait]
impl RefreshConfigStore for MemoryStore {
    async fn upsert_config(&self, config: &RefreshConfig) -> Result<()> {
        config.validate()?;
        self.configs
            .lock()
            .await
            .insert(config.table_name.clone(), config.clone());
        Ok(())
    }

    async fn get_config(&self, table_name: &str) -> Result<Option<RefreshConfig>> {
        Ok(self.configs.lock().await.get(table_name).cloned())
    }

    async fn list_configs(&self) -> Result<Vec<RefreshConfig>> {
        let mut out: Vec<RefreshConfig> = self.configs.lock().await.values().cloned().collect();
        sort_for_run(&mut out);
        Ok(out)
    }

    async fn list_enabled(&self) -> Result<Vec<RefreshConfig>> {
        let mut out = self.list_configs().await?;
        out.retain(|c| c.is_enabled);
        Ok(out)
    }

    async fn set_enabled(&self, table_name: &str, enabled: bool) -> Result<RefreshConfig> {
        let mut guard = self.configs.lock().await;
        let config = guard
            .get_mut(table_name)
            .ok_or_else(|| Error::NotFound(format!("no refresh config for table '{table_name}'")))?;
        config.is_enabled = enabled;
        config.updated_at = Utc::now();
        Ok(config.clone())
    }

    async fn mark_run_start(&self, table_name: &str, at: DateTime<Utc>) -> Result<()> {
        let mut guard = self.configs.lock().await;
        let config = guard
            .get_mut(table_name)
            .ok_or_else(|| Error::NotFound(format!("no refresh config for table '{table_name}'")))?;
        config.mark_attempt(at);
        Ok(())
    }

    async fn mark_run_success(
        &self,
        table_name: &str,
        rows_processed: u64,
        at: DateTime<Utc>,
    ) -> Result<RefreshConfig> {
        let mut guard = self.configs.lock().await;
        let config = guard
            .get_mut(table_name)
            .ok_or_else(|| Error::NotFound(format!("no refresh config for table '{table_name}'")))?;
        config.mark_success(rows_processed, at);
        Ok(config.clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    #[tracing::instrument(level = "debug", skip(self, initial, lease), fields(key = %key))]
    async fn acquire_or_resume(
        &self,
        key: &CheckpointKey,
        initial: &SyncCursor,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Acquired> {
        let mut rows = self.checkpoints.lock().await;
        if let Some(pos) = position(&rows, key, CheckpointStatus::Active) {
            let acquired = resolve_acquire(&rows[pos], lease, now)?;
            rows[pos] = acquired.checkpoint.clone();
            return Ok(acquired);
        }
        let checkpoint = Checkpoint::new_active(key.clone(), initial.clone(), lease, now);
        rows.push(checkpoint.clone());
        Ok(Acquired {
            checkpoint,
            outcome: AcquireOutcome::Created,
        })
    }

    async fn advance(
        &self,
        checkpoint: &Checkpoint,
        cursor: &SyncCursor,
        rows_so_far: u64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let mut rows = self.checkpoints.lock().await;
        let current = rows
            .iter_mut()
            .find(|c| c.id == checkpoint.id)
            .ok_or_else(|| Error::NotFound(format!("checkpoint {}", checkpoint.id)))?;
        match resolve_advance(current, checkpoint, cursor, rows_so_far, lease, now)? {
            AdvanceDecision::Apply(next) => {
                *current = next.clone();
                Ok(next)
            }
            AdvanceDecision::Replay(stored) => Ok(stored),
        }
    }

    async fn complete(
        &self,
        checkpoint: &Checkpoint,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let mut rows = self.checkpoints.lock().await;
        let pos = rows
            .iter()
            .position(|c| c.id == checkpoint.id)
            .ok_or_else(|| Error::NotFound(format!("checkpoint {}", checkpoint.id)))?;
        let done = resolve_complete(&rows[pos], lease, now)?;
        rows.retain(|c| !(c.key == done.key && c.status == CheckpointStatus::Completed));
        if let Some(row) = rows.iter_mut().find(|c| c.id == done.id) {
            *row = done.clone();
        }
        Ok(done)
    }

    async fn release(&self, key: &CheckpointKey, lease: &Lease, now: DateTime<Utc>) -> Result<bool> {
        let mut rows = self.checkpoints.lock().await;
        let Some(pos) = position(&rows, key, CheckpointStatus::Active) else {
            return Ok(false);
        };
        match resolve_release(&rows[pos], lease, now) {
            Some(next) => {
                rows[pos] = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.checkpoints.lock().await;
        let mut reclaimed = 0;
        for row in rows.iter_mut() {
            if row.status == CheckpointStatus::Active
                && row.lease_owner.is_some()
                && row.is_expired(now)
            {
                row.lease_owner = None;
                row.version += 1;
                row.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get_active(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        let rows = self.checkpoints.lock().await;
        Ok(position(&rows, key, CheckpointStatus::Active).map(|pos| rows[pos].clone()))
    }

    async fn get_completed(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        let rows = self.checkpoints.lock().await;
        Ok(position(&rows, key, CheckpointStatus::Completed).map(|pos| rows[pos].clone()))
    }
}

impl MemoryStore {
    async fn update_entry<F>(&self, id: Uuid, apply: F) -> Result<AuditLogEntry>
    where
        F: FnOnce(&mut AuditLogEntry) -> Result<()> + Send,
    {
        let mut entries = self.audit.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("audit entry {id}")))?;
        let mut next = entry.clone();
        apply(&mut next)?;
        *entry = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn start(&self, config: &RefreshConfig, now: DateTime<Utc>) -> Result<AuditLogEntry> {
        let entry = AuditLogEntry::new_running(config, now);
        self.audit.lock().await.push(entry.clone());
        Ok(entry)
    }

    async fn record_batch(&self, id: Uuid, batch: &BatchMetrics) -> Result<AuditLogEntry> {
        self.update_entry(id, |e| e.apply_batch(batch)).await
    }

    async fn succeed(
        &self,
        id: Uuid,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<AuditLogEntry> {
        self.update_entry(id, |e| e.finish_success(metadata, now)).await
    }

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<AuditLogEntry> {
        self.update_entry(id, |e| e.finish_failure(error, now)).await
    }

    async fn skip(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<AuditLogEntry> {
        self.update_entry(id, |e| e.finish_skipped(reason, now)).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditLogEntry>> {
        Ok(self.audit.lock().await.iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let entries = self.audit.lock().await;
        let mut out: Vec<AuditLogEntry> = entries.iter().filter(|e| query.matches(e)).cloned().collect();
        out.sort_by(|a, b| b.refresh_started_at.cmp(&a.refresh_started_at));
        if query.limit > 0 {
            out.truncate(query.limit);
        }
        Ok(out)
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn upsert_webhook_config(&self, config: &WebhookConfig) -> Result<()> {
        config.validate()?;
        self.webhook_configs
            .lock()
            .await
            .insert(config.id, config.clone());
        Ok(())
    }

    async fn get_webhook_config(&self, id: Uuid) -> Result<Option<WebhookConfig>> {
        Ok(self.webhook_configs.lock().await.get(&id).cloned())
    }

    async fn list_webhook_configs(&self) -> Result<Vec<WebhookConfig>> {
        let mut out: Vec<WebhookConfig> =
            self.webhook_configs.lock().await.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<()> {
        self.deliveries
            .lock()
            .await
            .extend(deliveries.iter().cloned());
        Ok(())
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>> {
        let mut rows = self.deliveries.lock().await;
        let mut due: Vec<&mut WebhookDelivery> = rows
            .iter_mut()
            .filter(|d| {
                matches!(d.status, DeliveryStatus::Pending | DeliveryStatus::Retrying)
                    && d.next_retry_at.is_some_and(|at| at <= now)
            })
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|d| {
                let claimed = d.clone();
                d.next_retry_at = Some(claim_until);
                claimed
            })
            .collect())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut rows = self.deliveries.lock().await;
        let row = rows
            .iter_mut()
            .find(|d| d.id == delivery.id)
            .ok_or_else(|| Error::NotFound(format!("webhook delivery {}", delivery.id)))?;
        *row = delivery.clone();
        Ok(())
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>> {
        Ok(self.deliveries.lock().await.iter().find(|d| d.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> CheckpointKey {
        CheckpointKey::new("asin_performance_data", "public", "asin_performance").unwrap()
    }

    #[tokio::test]
    async fn same_owner_resumes_same_row() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let lease = Lease::new(Uuid::new_v4(), Duration::seconds(600));
        let a = store
            .acquire_or_resume(&key(), &SyncCursor::default(), &lease, now)
            .await
            .unwrap();
        let b = store
            .acquire_or_resume(&key(), &SyncCursor::default(), &lease, now)
            .await
            .unwrap();
        assert_eq!(a.outcome, AcquireOutcome::Created);
        assert_eq!(b.outcome, AcquireOutcome::Resumed);
        assert_eq!(a.checkpoint.id, b.checkpoint.id);
        assert_eq!(store.all_checkpoints().await.len(), 1);
    }

    #[tokio::test]
    async fn complete_replaces_older_completed_row() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for _ in 0..2 {
            let lease = Lease::new(Uuid::new_v4(), Duration::seconds(600));
            let acquired = store
                .acquire_or_resume(&key(), &SyncCursor::default(), &lease, now)
                .await
                .unwrap();
            store.complete(&acquired.checkpoint, &lease, now).await.unwrap();
        }
        let rows = store.all_checkpoints().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, CheckpointStatus::Completed);
        assert!(store.get_active(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_clears_expired_owners_only() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let lease = Lease::new(Uuid::new_v4(), Duration::seconds(60));
        store
            .acquire_or_resume(&key(), &SyncCursor::default(), &lease, now)
            .await
            .unwrap();
        assert_eq!(store.reclaim_expired(now).await.unwrap(), 0);
        assert_eq!(
            store
                .reclaim_expired(now + Duration::seconds(61))
                .await
                .unwrap(),
            1
        );
        let active = store.get_active(&key()).await.unwrap().unwrap();
        assert_eq!(active.lease_owner, None);
    }

    #[tokio::test]
    async fn claimed_deliveries_are_not_reclaimed_until_window_passes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let d = WebhookDelivery::new_pending(Uuid::new_v4(), "refresh.completed", serde_json::json!({}), now);
        store.insert_deliveries(&[d]).await.unwrap();
        let later = now + Duration::minutes(5);
        assert_eq!(store.claim_due_deliveries(now, later, 10).await.unwrap().len(), 1);
        assert!(store.claim_due_deliveries(now, later, 10).await.unwrap().is_empty());
        assert_eq!(store.claim_due_deliveries(later, later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registry_orders_enabled_configs() {
        let store = MemoryStore::new();
        for (name, prio, enabled) in [("b", 1, true), ("a", 1, true), ("z", 9, false)] {
            let c = RefreshConfig::new("public", name, "fn", 24, prio, None)
                .unwrap()
                .with_enabled(enabled);
            store.upsert_config(&c).await.unwrap();
        }
        let names: Vec<String> = store
            .list_enabled()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.table_name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(matches!(
            store.require_config("missing").await,
            Err(Error::NotFound(_))
        ));
    }
}
