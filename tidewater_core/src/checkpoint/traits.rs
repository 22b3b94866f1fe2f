use crate::Result;
use crate::checkpoint::models::{Acquired, Checkpoint, CheckpointKey, Lease, SyncCursor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable checkpoint rows, unique on `(function_name, table_schema, table_name, status)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Resume the active checkpoint for `key`, or create one at `initial`.
    ///
    /// Fails with `Conflict` while another owner holds a live lease. Concurrent callers
    /// never produce two active rows.
    async fn acquire_or_resume(
        &self,
        key: &CheckpointKey,
        initial: &SyncCursor,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Acquired>;

    /// Conditional update on `checkpoint.version`. Renews the lease.
    /// Replaying an already-applied advance returns the stored state.
    async fn advance(
        &self,
        checkpoint: &Checkpoint,
        cursor: &SyncCursor,
        rows_so_far: u64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint>;

    /// Mark `completed`, replacing any older completed row for the key.
    async fn complete(
        &self,
        checkpoint: &Checkpoint,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint>;

    /// Drop `lease` on the active checkpoint for `key` without touching cursor or row
    /// count, so the next attempt resumes immediately. Returns false when `lease` did
    /// not hold it.
    async fn release(&self, key: &CheckpointKey, lease: &Lease, now: DateTime<Utc>) -> Result<bool>;

    /// Clear the owner of active checkpoints whose lease expired. Returns the count.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn get_active(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>>;

    async fn get_completed(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>>;
}
