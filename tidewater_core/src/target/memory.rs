use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::catalog::{TableSpec, TargetRow};
use crate::target::{TargetStore, UpsertOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

type Table = BTreeMap<Vec<String>, TargetRow>;

/// In-process target tables keyed by `schema.table`, then by conflict key.
#[derive(Clone, Default)]
pub struct MemoryTargetStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    fail_next: Arc<AtomicUsize>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upserts fail with a transient backend error.
    pub fn fail_next_upserts(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Snapshot of a table in conflict-key order.
    pub async fn rows(&self, qualified_table: &str) -> Vec<TargetRow> {
        let guard = self.tables.read().await;
        guard
            .get(qualified_table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    #[tracing::instrument(level = "debug", skip(self, spec, rows), fields(table = %spec.qualified_target(), rows = rows.len()))]
    async fn upsert_batch(&self, spec: &TableSpec, rows: &[TargetRow]) -> Result<UpsertOutcome> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::BackendMessage(
                "target store connection reset".to_string(),
            ));
        }

        let mut guard = self.tables.write().await;
        let table = guard.entry(spec.qualified_target()).or_default();
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            match table.insert(row.conflict_key(spec), row.clone()) {
                Some(_) => outcome.updated += 1,
                None => outcome.inserted += 1,
            }
        }
        Ok(outcome)
    }
}
