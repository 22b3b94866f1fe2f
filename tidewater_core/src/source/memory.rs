use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::catalog::TableSpec;
use crate::checkpoint::SyncCursor;
use crate::source::{SourceRow, SourceWarehouse, cursor_value};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// In-process warehouse keyed by `TableSpec::source_table`.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    tables: Arc<RwLock<HashMap<String, Vec<SourceRow>>>>,
    fail_next: Arc<AtomicUsize>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_rows(&self, source_table: &str, rows: Vec<SourceRow>) {
        let mut guard = self.tables.write().await;
        guard
            .entry(source_table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Make the next `n` fetches fail with a transient source error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceWarehouse for MemoryWarehouse {
    #[tracing::instrument(level = "debug", skip(self, spec), fields(table = %spec.source_table))]
    async fn fetch_batch(
        &self,
        spec: &TableSpec,
        cursor: &SyncCursor,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::SourceMessage(
                "warehouse returned 503 Service Unavailable".to_string(),
            ));
        }

        let guard = self.tables.read().await;
        let Some(rows) = guard.get(&spec.source_table) else {
            return Ok(Vec::new());
        };

        let keys = spec.key_source_columns();
        let mut candidates: Vec<(String, Vec<String>, &SourceRow)> = rows
            .iter()
            .filter_map(|row| {
                let value = cursor_value(spec, row)?;
                if let Some(watermark) = cursor.watermark.as_deref()
                    && value.as_str() < watermark
                {
                    return None;
                }
                let key = keys
                    .iter()
                    .map(|k| row.get(*k).map(|v| v.to_string()).unwrap_or_default())
                    .collect();
                Some((value, key, row))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        Ok(candidates
            .into_iter()
            .skip(cursor.skip as usize)
            .take(limit)
            .map(|(_, _, row)| row.clone())
            .collect())
    }
}
