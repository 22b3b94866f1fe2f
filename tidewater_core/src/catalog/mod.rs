//! Table catalog: typed descriptions of each sync function.

pub mod models;
pub mod transform;

pub use models::{ColumnKind, ColumnSpec, SyncMode, TableSpec};
pub use transform::{ColumnValue, TargetRow, TransformOutput, transform_batch};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::{Error, Result};

/// Lookup of `TableSpec` by function name.
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    specs: HashMap<String, Arc<TableSpec>>,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the built-in sync functions.
    pub fn with_builtin() -> Result<Self> {
        let mut catalog = Self::new();
        catalog.register(asin_performance_data())?;
        Ok(catalog)
    }

    /// Add or replace a spec.
    #[tracing::instrument(level = "debug", skip(self, spec), fields(function = %spec.function_name))]
    pub fn register(&mut self, spec: TableSpec) -> Result<()> {
        spec.validate()?;
        if self
            .specs
            .insert(spec.function_name.clone(), Arc::new(spec))
            .is_some()
        {
            tracing::debug!("replaced existing table spec");
        }
        Ok(())
    }

    pub fn get(&self, function_name: &str) -> Result<Arc<TableSpec>> {
        self.specs.get(function_name).cloned().ok_or_else(|| {
            Error::InvalidInput(format!("unknown sync function '{function_name}'"))
        })
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register every spec from a YAML list.
    pub fn load_yaml_str(&mut self, yaml: &str) -> Result<usize> {
        let specs: Vec<TableSpec> = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidInput(format!("invalid tables yaml: {e}")))?;
        let count = specs.len();
        for spec in specs {
            self.register(spec)?;
        }
        Ok(count)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn load_yaml_file(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidInput(format!("cannot read tables file {}: {e}", path.display()))
        })?;
        let count = self.load_yaml_str(&raw)?;
        tracing::info!(count, "loaded table specs");
        Ok(count)
    }
}

/// Daily per-ASIN storefront and advertising performance.
pub fn asin_performance_data() -> TableSpec {
    use ColumnKind::*;
    TableSpec {
        function_name: "asin_performance_data".to_string(),
        source_table: "asin_performance".to_string(),
        target_schema: "public".to_string(),
        target_table: "asin_performance".to_string(),
        cursor_column: "date".to_string(),
        conflict_key: vec!["asin".to_string(), "date".to_string()],
        columns: vec![
            ColumnSpec::new("date", Date),
            ColumnSpec::new("asin", Text),
            ColumnSpec::new("parent_asin", Text),
            ColumnSpec::new("marketplace", Text),
            ColumnSpec::new("sessions", Integer),
            ColumnSpec::new("page_views", Integer),
            ColumnSpec::new("units_ordered", Integer),
            ColumnSpec::renamed("ordered_product_sales", "revenue", Float),
            ColumnSpec::new("buy_box_percentage", Float),
            ColumnSpec::new("unit_session_percentage", Float),
            ColumnSpec::new("impressions", Integer),
            ColumnSpec::new("clicks", Integer),
            ColumnSpec::renamed("ad_spend", "spend", Float),
            ColumnSpec::new("ad_sales", Float),
            ColumnSpec::new("updated_at", Timestamp),
        ],
        sync_mode: SyncMode::Incremental,
        batch_size: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_spec_is_valid() {
        let catalog = TableCatalog::with_builtin().unwrap();
        let spec = catalog.get("asin_performance_data").unwrap();
        assert_eq!(spec.key_source_columns(), vec!["asin", "date"]);
        assert!(matches!(
            catalog.get("nope"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn loads_specs_from_yaml() {
        let yaml = r#"
- function_name: campaign_daily
  source_table: ads.campaign_daily
  target_schema: public
  target_table: campaign_daily
  cursor_column: day
  conflict_key: [campaign_id, day]
  sync_mode: full
  batch_size: 500
  columns:
    - { source: day, kind: date }
    - { source: campaign_id, kind: text }
    - { source: cost_micros, target: cost, kind: integer }
"#;
        let mut catalog = TableCatalog::new();
        assert_eq!(catalog.load_yaml_str(yaml).unwrap(), 1);
        let spec = catalog.get("campaign_daily").unwrap();
        assert_eq!(spec.sync_mode, SyncMode::Full);
        assert_eq!(spec.columns[2].target_name(), "cost");
    }

    #[test]
    fn rejects_unmapped_cursor() {
        let mut spec = asin_performance_data();
        spec.cursor_column = "report_day".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_numeric_cursor_columns() {
        let mut spec = asin_performance_data();
        spec.cursor_column = "sessions".into();
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, crate::Error::InvalidInput(_)));
        assert!(err.to_string().contains("sessions"));

        spec.cursor_column = "ad_spend".into();
        assert!(matches!(spec.validate(), Err(crate::Error::InvalidInput(_))));

        spec.cursor_column = "updated_at".into();
        spec.validate().unwrap();
    }
}
