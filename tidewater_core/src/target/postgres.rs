use std::time::Duration;

use crate::catalog::{ColumnKind, ColumnValue, TableSpec, TargetRow};
use crate::target::{TargetStore, UpsertOutcome};
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder, Row};

/// Postgres allows at most this many bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Upserts into existing target tables. Each table needs a unique index on its
/// conflict key; target tables are never created or altered here.
#[derive(Debug, Clone)]
pub struct PgTargetStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgTargetStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn upsert_in_tx(&self, spec: &TableSpec, rows: &[TargetRow]) -> Result<UpsertOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend("begin upsert transaction", e))?;

        let per_statement = (MAX_BIND_PARAMS / spec.columns.len().max(1)).clamp(1, 5_000);
        let mut outcome = UpsertOutcome::default();
        for chunk in rows.chunks(per_statement) {
            let mut qb = upsert_statement(spec, chunk);
            let returned = qb
                .build()
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| Error::backend(format!("upsert into {}", spec.qualified_target()), e))?;
            let mut inserted = 0u64;
            for row in &returned {
                let was_insert: bool = row
                    .try_get("inserted")
                    .map_err(|e| Error::backend("decode upsert result", e))?;
                if was_insert {
                    inserted += 1;
                }
            }
            outcome.inserted += inserted;
            outcome.updated += chunk.len() as u64 - inserted;
        }

        tx.commit()
            .await
            .map_err(|e| Error::backend("commit upsert transaction", e))?;
        Ok(outcome)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `INSERT ... VALUES ... ON CONFLICT (key) DO UPDATE SET ... RETURNING (xmax = 0)`.
fn upsert_statement<'args>(spec: &TableSpec, rows: &'args [TargetRow]) -> QueryBuilder<'args, Postgres> {
    let columns: Vec<String> = spec
        .columns
        .iter()
        .map(|c| quote_ident(c.target_name()))
        .collect();
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {}.{} ({}) ",
        quote_ident(&spec.target_schema),
        quote_ident(&spec.target_table),
        columns.join(", ")
    ));

    qb.push_values(rows, |mut b, row| {
        for col in &spec.columns {
            let value = row.get(col.target_name()).unwrap_or(&ColumnValue::Null);
            push_value(&mut b, col.kind, value);
        }
    });

    let key: Vec<String> = spec.conflict_key.iter().map(|k| quote_ident(k)).collect();
    let updates: Vec<String> = spec
        .columns
        .iter()
        .filter(|c| !spec.conflict_key.iter().any(|k| k == c.target_name()))
        .map(|c| {
            let ident = quote_ident(c.target_name());
            format!("{ident} = EXCLUDED.{ident}")
        })
        .collect();
    qb.push(format!(" ON CONFLICT ({}) ", key.join(", ")));
    if updates.is_empty() {
        qb.push("DO NOTHING");
    } else {
        qb.push(format!("DO UPDATE SET {}", updates.join(", ")));
    }
    qb.push(" RETURNING (xmax = 0) AS inserted");
    qb
}

/// Bind a value, typing nulls after the column kind so Postgres accepts them.
fn push_value(b: &mut Separated<'_, '_, Postgres, &'static str>, kind: ColumnKind, value: &ColumnValue) {
    match value {
        ColumnValue::Integer(v) => {
            b.push_bind(*v);
        }
        ColumnValue::Float(v) => {
            b.push_bind(*v);
        }
        ColumnValue::Text(v) => {
            b.push_bind(v.clone());
        }
        ColumnValue::Boolean(v) => {
            b.push_bind(*v);
        }
        ColumnValue::Date(v) => {
            b.push_bind(*v);
        }
        ColumnValue::Timestamp(v) => {
            b.push_bind(*v);
        }
        ColumnValue::Json(v) => {
            b.push_bind(sqlx::types::Json(v.clone()));
        }
        ColumnValue::Null => match kind {
            ColumnKind::Integer => {
                b.push_bind(None::<i64>);
            }
            ColumnKind::Float => {
                b.push_bind(None::<f64>);
            }
            ColumnKind::Text => {
                b.push_bind(None::<String>);
            }
            ColumnKind::Boolean => {
                b.push_bind(None::<bool>);
            }
            ColumnKind::Date => {
                b.push_bind(None::<chrono::NaiveDate>);
            }
            ColumnKind::Timestamp => {
                b.push_bind(None::<chrono::DateTime<chrono::Utc>>);
            }
            ColumnKind::Json => {
                b.push_bind(None::<sqlx::types::Json<serde_json::Value>>);
            }
        },
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    #[tracing::instrument(level = "debug", skip(self, spec, rows), fields(table = %spec.qualified_target(), rows = rows.len()))]
    async fn upsert_batch(&self, spec: &TableSpec, rows: &[TargetRow]) -> Result<UpsertOutcome> {
        if rows.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        match tokio::time::timeout(self.timeout, self.upsert_in_tx(spec, rows)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "upsert into {} exceeded {}ms",
                spec.qualified_target(),
                self.timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{asin_performance_data, transform_batch};
    use sqlx::Execute;

    #[test]
    fn statement_updates_non_key_columns_only() {
        let spec = asin_performance_data();
        let rows = transform_batch(
            &spec,
            &[serde_json::json!({"date": "2024-01-01", "asin": "B001"})
                .as_object()
                .cloned()
                .unwrap()],
        )
        .rows;
        let mut qb = upsert_statement(&spec, &rows);
        let sql = qb.build().sql().to_string();
        assert!(sql.starts_with("INSERT INTO \"public\".\"asin_performance\""));
        assert!(sql.contains("ON CONFLICT (\"asin\", \"date\") DO UPDATE SET"));
        assert!(sql.contains("\"revenue\" = EXCLUDED.\"revenue\""));
        assert!(!sql.contains("\"asin\" = EXCLUDED"));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }
}
