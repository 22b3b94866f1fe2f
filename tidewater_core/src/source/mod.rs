//! Source warehouse: bounded, deterministically ordered batch reads.

pub mod bigquery;
pub mod memory;

pub use bigquery::BigQueryWarehouse;
pub use memory::MemoryWarehouse;

use crate::Result;
use crate::catalog::TableSpec;
use crate::checkpoint::SyncCursor;
use async_trait::async_trait;

/// One warehouse row keyed by source field name.
pub type SourceRow = serde_json::Map<String, serde_json::Value>;

/// Field carrying the cursor value as text, when the warehouse query adds it.
pub const CURSOR_FIELD: &str = "_tidewater_cursor";

#[async_trait]
pub trait SourceWarehouse: Send + Sync {
    /// Rows with cursor value `>= cursor.watermark`, ordered by `(cursor column,
    /// conflict key)`, skipping `cursor.skip` rows, at most `limit` rows.
    ///
    /// Rows with a null cursor value are never returned.
    async fn fetch_batch(
        &self,
        spec: &TableSpec,
        cursor: &SyncCursor,
        limit: usize,
    ) -> Result<Vec<SourceRow>>;
}

/// Text form of a row's cursor value.
pub fn cursor_value(spec: &TableSpec, row: &SourceRow) -> Option<String> {
    let value = row
        .get(CURSOR_FIELD)
        .or_else(|| row.get(&spec.cursor_column))?;
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
