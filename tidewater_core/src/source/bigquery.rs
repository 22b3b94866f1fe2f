use std::time::Duration;

use crate::catalog::TableSpec;
use crate::checkpoint::SyncCursor;
use crate::config::SourceSettings;
use crate::source::{CURSOR_FIELD, SourceRow, SourceWarehouse};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

/// BigQuery REST client issuing synchronous `jobs.query` calls.
#[derive(Debug, Clone)]
pub struct BigQueryWarehouse {
    client: Client,
    api_base: String,
    project_id: String,
    dataset: String,
    access_token: Option<String>,
    timeout: Duration,
}

impl BigQueryWarehouse {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("tidewater/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| Error::upstream("build warehouse http client", e))?;
        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            project_id: settings.project_id.clone(),
            dataset: settings.dataset.clone(),
            access_token: settings.access_token.clone(),
            timeout: settings.timeout,
        })
    }

    fn qualified_source(&self, spec: &TableSpec) -> String {
        if spec.source_table.contains('.') {
            format!("{}.{}", self.project_id, spec.source_table)
        } else {
            format!("{}.{}.{}", self.project_id, self.dataset, spec.source_table)
        }
    }

    /// SQL text and named parameters for one batch.
    pub fn build_query(&self, spec: &TableSpec, cursor: &SyncCursor, limit: usize) -> (String, Vec<Value>) {
        let columns: Vec<String> = spec
            .columns
            .iter()
            .map(|c| format!("`{}`", c.source))
            .collect();
        let cursor_col = format!("`{}`", spec.cursor_column);
        let mut order: Vec<String> = vec![cursor_col.clone()];
        order.extend(
            spec.key_source_columns()
                .iter()
                .filter(|k| **k != spec.cursor_column)
                .map(|k| format!("`{k}`")),
        );

        let mut sql = format!(
            "SELECT {}, CAST({cursor_col} AS STRING) AS {CURSOR_FIELD} FROM `{}` WHERE {cursor_col} IS NOT NULL",
            columns.join(", "),
            self.qualified_source(spec),
        );
        let mut params = vec![
            scalar_param("limit", "INT64", json!(limit.to_string())),
            scalar_param("skip", "INT64", json!(cursor.skip.to_string())),
        ];
        if let Some(watermark) = cursor.watermark.as_deref() {
            sql.push_str(&format!(" AND CAST({cursor_col} AS STRING) >= @watermark"));
            params.push(scalar_param("watermark", "STRING", json!(watermark)));
        }
        sql.push_str(&format!(
            " ORDER BY {} LIMIT @limit OFFSET @skip",
            order.join(", ")
        ));
        (sql, params)
    }
}

fn scalar_param(name: &str, ty: &str, value: Value) -> Value {
    json!({
        "name": name,
        "parameterType": { "type": ty },
        "parameterValue": { "value": value },
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    schema: Option<QuerySchema>,
    #[serde(default)]
    rows: Vec<QueryRow>,
}

#[derive(Debug, Deserialize)]
struct QuerySchema {
    fields: Vec<QueryField>,
}

#[derive(Debug, Deserialize)]
struct QueryField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    f: Vec<QueryCell>,
}

#[derive(Debug, Deserialize)]
struct QueryCell {
    v: Value,
}

/// Turn positional `{f: [{v}]}` rows into named rows.
fn decode_rows(resp: QueryResponse) -> Result<Vec<SourceRow>> {
    if !resp.job_complete {
        return Err(Error::SourceMessage(
            "warehouse query did not complete within the timeout".to_string(),
        ));
    }
    let Some(schema) = resp.schema else {
        return Ok(Vec::new());
    };
    resp.rows
        .into_iter()
        .map(|row| {
            if row.f.len() != schema.fields.len() {
                return Err(Error::SourceMessage(format!(
                    "warehouse row has {} cells, schema has {} fields",
                    row.f.len(),
                    schema.fields.len()
                )));
            }
            Ok(schema
                .fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| (field.name.clone(), cell.v))
                .collect())
        })
        .collect()
}

#[async_trait]
impl SourceWarehouse for BigQueryWarehouse {
    #[tracing::instrument(level = "debug", skip(self, spec), fields(table = %spec.source_table))]
    async fn fetch_batch(
        &self,
        spec: &TableSpec,
        cursor: &SyncCursor,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let (query, params) = self.build_query(spec, cursor, limit);
        let url = format!("{}/projects/{}/queries", self.api_base, self.project_id);
        let body = json!({
            "query": query,
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": params,
            "maxResults": limit,
            "timeoutMs": self.timeout.as_millis() as u64,
        });

        let mut req = self.client.post(&url).json(&body);
        if let Some(token) = self.access_token.as_deref() {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::upstream("warehouse query request", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(512).collect();
            tracing::warn!(status = status.as_u16(), "warehouse query rejected");
            return Err(Error::SourceMessage(format!(
                "warehouse returned {status}: {snippet}"
            )));
        }

        let parsed: QueryResponse = resp
            .json()
            .await
            .map_err(|e| Error::upstream("decode warehouse response", e))?;
        let rows = decode_rows(parsed)?;
        tracing::debug!(rows = rows.len(), "fetched warehouse batch");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::asin_performance_data;

    fn warehouse() -> BigQueryWarehouse {
        BigQueryWarehouse::new(&SourceSettings {
            project_id: "acme".into(),
            dataset: "analytics".into(),
            access_token: None,
            api_base: crate::config::DEFAULT_SOURCE_API_BASE.into(),
            timeout: Duration::from_secs(10),
        })
        .unwrap()
    }

    #[test]
    fn query_orders_by_cursor_then_key() {
        let wh = warehouse();
        let cursor = SyncCursor {
            watermark: Some("2024-01-07".into()),
            skip: 3,
        };
        let (sql, params) = wh.build_query(&asin_performance_data(), &cursor, 500);
        assert!(sql.contains("FROM `acme.analytics.asin_performance`"));
        assert!(sql.contains("CAST(`date` AS STRING) >= @watermark"));
        assert!(sql.ends_with("ORDER BY `date`, `asin` LIMIT @limit OFFSET @skip"));
        assert_eq!(params.len(), 3);
        assert_eq!(params[1]["parameterValue"]["value"], "3");
    }

    #[test]
    fn first_batch_has_no_watermark_filter() {
        let (sql, params) = warehouse().build_query(&asin_performance_data(), &SyncCursor::default(), 10);
        assert!(!sql.contains("@watermark"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn decodes_positional_rows() {
        let resp: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "asin"}, {"name": "sessions"}]},
            "rows": [{"f": [{"v": "B001"}, {"v": "12"}]}]
        }))
        .unwrap();
        let rows = decode_rows(resp).unwrap();
        assert_eq!(rows[0]["asin"], "B001");
        assert_eq!(rows[0]["sessions"], "12");
    }

    #[test]
    fn incomplete_job_is_transient() {
        let resp: QueryResponse = serde_json::from_value(json!({"jobComplete": false})).unwrap();
        let err = decode_rows(resp).unwrap_err();
        assert!(err.is_transient());
    }
}
