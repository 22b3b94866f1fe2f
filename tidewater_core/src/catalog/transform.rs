use std::collections::{BTreeMap, HashMap};

use crate::catalog::models::{ColumnKind, TableSpec};
use crate::source::SourceRow;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// A coerced cell ready to be written to the target store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Stable text form used to compare conflict keys.
    pub fn key_fragment(&self) -> String {
        match self {
            ColumnValue::Null => String::new(),
            ColumnValue::Integer(v) => v.to_string(),
            ColumnValue::Float(v) => v.to_string(),
            ColumnValue::Text(v) => v.clone(),
            ColumnValue::Boolean(v) => v.to_string(),
            ColumnValue::Date(v) => v.to_string(),
            ColumnValue::Timestamp(v) => v.to_rfc3339(),
            ColumnValue::Json(v) => v.to_string(),
        }
    }
}

/// One row keyed by target column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetRow {
    pub values: BTreeMap<String, ColumnValue>,
}

impl TargetRow {
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.values.get(column)
    }

    pub fn conflict_key(&self, spec: &TableSpec) -> Vec<String> {
        spec.conflict_key
            .iter()
            .map(|k| {
                self.values
                    .get(k)
                    .map(ColumnValue::key_fragment)
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub rows: Vec<TargetRow>,
    /// Rows dropped for a missing conflict-key field.
    pub skipped: u64,
}

/// Coerce a batch of warehouse rows into target rows.
///
/// Numeric columns default to zero and date/timestamp columns to null when the field
/// is missing or unparsable. Rows whose conflict-key fields are missing or null are
/// dropped. Duplicate keys within the batch collapse to the last occurrence.
pub fn transform_batch(spec: &TableSpec, rows: &[SourceRow]) -> TransformOutput {
    let key_sources = spec.key_source_columns();
    let mut out = TransformOutput::default();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();

    for row in rows {
        let missing_key = key_sources
            .iter()
            .any(|k| row.get(*k).is_none_or(Value::is_null));
        if missing_key {
            out.skipped += 1;
            continue;
        }

        let mut target = TargetRow::default();
        for col in &spec.columns {
            target
                .values
                .insert(col.target_name().to_string(), coerce(col.kind, row.get(&col.source)));
        }

        let key = target.conflict_key(spec);
        match index.get(&key) {
            Some(&pos) => out.rows[pos] = target,
            None => {
                index.insert(key, out.rows.len());
                out.rows.push(target);
            }
        }
    }
    out
}

pub fn coerce(kind: ColumnKind, value: Option<&Value>) -> ColumnValue {
    let value = value.filter(|v| !v.is_null());
    match kind {
        ColumnKind::Integer => ColumnValue::Integer(value.and_then(as_i64).unwrap_or(0)),
        ColumnKind::Float => ColumnValue::Float(value.and_then(as_f64).unwrap_or(0.0)),
        ColumnKind::Text => match value {
            Some(Value::String(s)) => ColumnValue::Text(s.clone()),
            Some(other) => ColumnValue::Text(other.to_string()),
            None => ColumnValue::Null,
        },
        ColumnKind::Boolean => match value {
            Some(Value::Bool(b)) => ColumnValue::Boolean(*b),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => ColumnValue::Boolean(true),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => {
                ColumnValue::Boolean(false)
            }
            Some(Value::Number(n)) => ColumnValue::Boolean(n.as_f64().is_some_and(|f| f != 0.0)),
            _ => ColumnValue::Null,
        },
        ColumnKind::Date => value
            .and_then(as_str)
            .and_then(parse_date)
            .map(ColumnValue::Date)
            .unwrap_or(ColumnValue::Null),
        ColumnKind::Timestamp => value
            .and_then(parse_timestamp)
            .map(ColumnValue::Timestamp)
            .unwrap_or(ColumnValue::Null),
        ColumnKind::Json => value
            .cloned()
            .map(ColumnValue::Json)
            .unwrap_or(ColumnValue::Null),
    }
}

fn as_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim)
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| s.get(..10).and_then(|p| NaiveDate::parse_from_str(p, "%Y-%m-%d").ok()))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(epoch_seconds),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            let bare = s.strip_suffix(" UTC").unwrap_or(s);
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(bare, fmt) {
                    return Some(naive.and_utc());
                }
            }
            // Warehouse REST APIs encode TIMESTAMP as fractional epoch seconds.
            s.parse::<f64>().ok().and_then(epoch_seconds)
        }
        _ => None,
    }
}

fn epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros)
}
