//! Target store: idempotent upserts on the natural conflict key.

pub mod memory;
pub mod postgres;

pub use memory::MemoryTargetStore;
pub use postgres::PgTargetStore;

use crate::Result;
use crate::catalog::{TableSpec, TargetRow};
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert or overwrite `rows` keyed by `spec.conflict_key`. Last write wins.
    /// Applying the same rows twice leaves the table unchanged.
    async fn upsert_batch(&self, spec: &TableSpec, rows: &[TargetRow]) -> Result<UpsertOutcome>;
}
