use crate::error::ApiError;
use crate::server::AppState;
use axum::body::Bytes;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body of `POST /refresh/trigger`. An empty body runs every enabled table.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub force: bool,
}

impl TriggerRequest {
    pub fn parse(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let mut req: TriggerRequest = serde_json::from_slice(body)
            .map_err(|e| ApiError::InvalidInput(format!("malformed trigger body: {e}")))?;
        req.table_name = req
            .table_name
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Ok(req)
    }
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub details: serde_json::Value,
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn trigger(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TriggerResponse>, ApiError> {
    let req = TriggerRequest::parse(&body)?;

    match req.table_name {
        Some(table) => {
            let outcome = state.orchestrator.run_table(&table, req.force).await?;
            let message = if outcome.completed {
                format!(
                    "refresh of {table} completed ({} rows)",
                    outcome.rows_processed
                )
            } else {
                format!(
                    "refresh of {table} continuing in background ({} rows so far)",
                    outcome.rows_processed
                )
            };
            Ok(Json(TriggerResponse {
                success: outcome.success,
                message,
                kind: "single",
                table: Some(table),
                details: serde_json::to_value(&outcome)
                    .map_err(|e| ApiError::InvalidInput(e.to_string()))?,
            }))
        }
        None => {
            let summary = state.orchestrator.run_all(req.force).await?;
            let message = format!(
                "refreshed {} of {} tables ({} skipped, {} failed, {} continuing)",
                summary.succeeded, summary.total, summary.skipped, summary.failed, summary.continued
            );
            Ok(Json(TriggerResponse {
                success: summary.failed == 0,
                message,
                kind: "all",
                table: None,
                details: serde_json::to_value(&summary)
                    .map_err(|e| ApiError::InvalidInput(e.to_string()))?,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestApp, read_json};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use chrono::Utc;
    use tidewater_core::registry::RefreshConfigStore;
    use tower::ServiceExt;

    fn post(body: &str) -> Request<Body> {
        Request::post("/refresh/trigger")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn empty_body_means_run_all() {
        assert_eq!(TriggerRequest::parse(b"").unwrap(), TriggerRequest::default());
        assert_eq!(TriggerRequest::parse(b"  \n").unwrap(), TriggerRequest::default());
        let req = TriggerRequest::parse(br#"{"table_name": " ", "force": true}"#).unwrap();
        assert_eq!(req.table_name, None);
        assert!(req.force);
    }

    #[tokio::test]
    async fn single_table_trigger_reports_the_outcome() {
        let app = TestApp::new().await;
        let resp = app
            .router()
            .oneshot(post(r#"{"table_name": "asin_performance"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["type"], "single");
        assert_eq!(body["table"], "asin_performance");
        assert_eq!(body["details"]["rows_processed"], 3);
        assert_eq!(body["details"]["status"], "completed");
    }

    #[tokio::test]
    async fn run_all_trigger_accepts_an_empty_body() {
        let app = TestApp::new().await;
        let resp = app.router().oneshot(post("")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["type"], "all");
        assert_eq!(body["details"]["total"], 1);
    }

    #[tokio::test]
    async fn throttled_trigger_returns_429_unless_forced() {
        let app = TestApp::new().await;
        let mut config = app.store.require_config("asin_performance").await.unwrap();
        config.mark_success(3, Utc::now() - chrono::Duration::minutes(30));
        app.store.upsert_config(&config).await.unwrap();

        let resp = app
            .router()
            .oneshot(post(r#"{"table_name": "asin_performance"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
        let body = read_json(resp).await;
        assert_eq!(body["code"], "throttled");
        assert_eq!(body["category"], "throttled");

        let resp = app
            .router()
            .oneshot(post(r#"{"table_name": "asin_performance", "force": true}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn client_errors_map_to_4xx() {
        let app = TestApp::new().await;

        let resp = app
            .router()
            .oneshot(post(r#"{"table_name": "nope"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(read_json(resp).await["code"], "not_found");

        let resp = app.router().oneshot(post("{not json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(resp).await["code"], "invalid_input");

        app.store.set_enabled("asin_performance", false).await.unwrap();
        let resp = app
            .router()
            .oneshot(post(r#"{"table_name": "asin_performance"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(resp).await["code"], "table_disabled");
    }

    #[tokio::test]
    async fn live_lease_held_elsewhere_returns_409() {
        use tidewater_core::checkpoint::{CheckpointKey, CheckpointStore, Lease, SyncCursor};

        let app = TestApp::new().await;
        let key =
            CheckpointKey::new("asin_performance_data", "public", "asin_performance").unwrap();
        let other = Lease::new(uuid::Uuid::new_v4(), chrono::Duration::minutes(10));
        app.store
            .acquire_or_resume(&key, &SyncCursor::default(), &other, Utc::now())
            .await
            .unwrap();

        let resp = app
            .router()
            .oneshot(post(r#"{"table_name": "asin_performance"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(read_json(resp).await["code"], "conflict");
    }

    #[tokio::test]
    async fn downstream_failure_returns_500_with_details() {
        let app = TestApp::new().await;
        app.warehouse.fail_next_fetches(1);
        let resp = app
            .router()
            .oneshot(post(r#"{"table_name": "asin_performance"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = read_json(resp).await;
        assert_eq!(body["code"], "source_unavailable");
        assert_eq!(body["category"], "source_transient");
        assert!(body["error"].as_str().unwrap().contains("503"));
        assert!(body.get("details").is_some());
    }
}
