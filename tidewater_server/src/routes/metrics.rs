use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::Query;
use axum::extract::rejection::QueryRejection;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tidewater_core::audit::metrics::{self, DEFAULT_METRICS_DAYS};
use tidewater_core::audit::{MetricsQuery, RefreshMetrics};

#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    pub days: Option<u32>,
    pub table_name: Option<String>,
}

/// Daily and per-table success rate, duration, throughput and recent errors.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_metrics(
    Extension(state): Extension<Arc<AppState>>,
    params: Result<Query<MetricsParams>, QueryRejection>,
) -> Result<Json<RefreshMetrics>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::InvalidInput(e.body_text()))?;
    let query = MetricsQuery {
        days: params.days.unwrap_or(DEFAULT_METRICS_DAYS),
        table_name: params.table_name.filter(|t| !t.trim().is_empty()),
    };
    let out = metrics::collect(state.audit.as_ref(), &query, Utc::now()).await?;
    Ok(Json(out))
}
