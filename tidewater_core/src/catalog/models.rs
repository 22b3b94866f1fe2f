use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Target type a source field is coerced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Float,
    Text,
    Boolean,
    Date,
    Timestamp,
    Json,
}

impl ColumnKind {
    /// Watermarks are compared as strings; only these kinds sort the same way as text.
    pub fn orders_as_text(self) -> bool {
        matches!(self, Self::Date | Self::Timestamp | Self::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Field name in the warehouse row.
    pub source: String,
    /// Column name in the target table. Defaults to `source`.
    #[serde(default)]
    pub target: Option<String>,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(source: &str, kind: ColumnKind) -> Self {
        Self {
            source: source.to_string(),
            target: None,
            kind,
        }
    }

    pub fn renamed(source: &str, target: &str, kind: ColumnKind) -> Self {
        Self {
            source: source.to_string(),
            target: Some(target.to_string()),
            kind,
        }
    }

    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Each run starts where the last completed run stopped.
    #[default]
    Incremental,
    /// Each run re-reads the whole source table.
    Full,
}

/// Describes one sync function: where rows come from and where they land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub function_name: String,
    /// Warehouse table, `table` or `dataset.table`.
    pub source_table: String,
    pub target_schema: String,
    pub target_table: String,
    /// Source field that orders rows for incremental reads.
    pub cursor_column: String,
    /// Target columns forming the natural conflict key.
    pub conflict_key: Vec<String>,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Overrides the process-wide batch size.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl TableSpec {
    #[tracing::instrument(level = "debug", skip(self), fields(function = %self.function_name))]
    pub fn validate(&self) -> Result<()> {
        if self.function_name.trim().is_empty() {
            return Err(Error::InvalidInput("function_name is empty".to_string()));
        }
        for (what, ident) in [
            ("target_schema", self.target_schema.as_str()),
            ("target_table", self.target_table.as_str()),
            ("cursor_column", self.cursor_column.as_str()),
        ] {
            check_identifier(what, ident)?;
        }
        for part in self.source_table.split('.') {
            check_identifier("source_table", part)?;
        }
        if self.columns.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{}: no columns defined",
                self.function_name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            check_identifier("column source", &col.source)?;
            check_identifier("column target", col.target_name())?;
            if !seen.insert(col.target_name()) {
                return Err(Error::InvalidInput(format!(
                    "{}: duplicate target column '{}'",
                    self.function_name,
                    col.target_name()
                )));
            }
        }
        let Some(cursor) = self.columns.iter().find(|c| c.source == self.cursor_column) else {
            return Err(Error::InvalidInput(format!(
                "{}: cursor column '{}' is not mapped",
                self.function_name, self.cursor_column
            )));
        };
        if !cursor.kind.orders_as_text() {
            return Err(Error::InvalidInput(format!(
                "{}: cursor column '{}' has kind {:?}; only date, timestamp and text cursors are supported",
                self.function_name, self.cursor_column, cursor.kind
            )));
        }
        if self.conflict_key.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{}: conflict_key is empty",
                self.function_name
            )));
        }
        for key in &self.conflict_key {
            if self.column_for_target(key).is_none() {
                return Err(Error::InvalidInput(format!(
                    "{}: conflict key '{key}' is not a target column",
                    self.function_name
                )));
            }
        }
        if self.batch_size == Some(0) {
            return Err(Error::InvalidInput(format!(
                "{}: batch_size must be > 0",
                self.function_name
            )));
        }
        Ok(())
    }

    pub fn column_for_target(&self, target: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.target_name() == target)
    }

    /// Source field names of the conflict key, in key order.
    pub fn key_source_columns(&self) -> Vec<&str> {
        self.conflict_key
            .iter()
            .filter_map(|k| self.column_for_target(k).map(|c| c.source.as_str()))
            .collect()
    }

    pub fn qualified_target(&self) -> String {
        format!("{}.{}", self.target_schema, self.target_table)
    }
}

fn check_identifier(what: &str, ident: &str) -> Result<()> {
    let valid = !ident.is_empty()
        && ident
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(Error::InvalidInput(format!(
            "{what} '{ident}' is not a valid identifier"
        )));
    }
    Ok(())
}
