use std::error::Error as _;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tidewater_core::error as core_error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    pub category: &'static str,
    pub details: serde_json::Value,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Core(#[from] tidewater_core::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => match err {
                core_error::Error::InvalidInput(_) | core_error::Error::Disabled(_) => {
                    StatusCode::BAD_REQUEST
                }
                core_error::Error::NotFound(_) => StatusCode::NOT_FOUND,
                core_error::Error::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
                core_error::Error::Conflict(_) => StatusCode::CONFLICT,
                core_error::Error::Source { .. }
                | core_error::Error::SourceMessage(_)
                | core_error::Error::Backend { .. }
                | core_error::Error::BackendMessage(_)
                | core_error::Error::Timeout(_)
                | core_error::Error::Webhook(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::Core(err) => err.code(),
        }
    }

    fn category(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => core_error::ErrorCategory::Config.as_str(),
            ApiError::Core(err) => err.category().as_str(),
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            ApiError::Core(core_error::Error::Throttled {
                table,
                elapsed_secs,
                min_interval_secs,
            }) => serde_json::json!({
                "table": table,
                "elapsed_secs": elapsed_secs,
                "min_interval_secs": min_interval_secs,
                "retry_after_secs": retry_after(*elapsed_secs, *min_interval_secs),
            }),
            ApiError::Core(err) => match err.source() {
                Some(cause) => serde_json::json!({ "cause": cause.to_string() }),
                None => serde_json::Value::Null,
            },
            ApiError::InvalidInput(_) => serde_json::Value::Null,
        }
    }
}

fn retry_after(elapsed_secs: i64, min_interval_secs: i64) -> i64 {
    (min_interval_secs - elapsed_secs).max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
            category: self.category(),
            details: self.details(),
        };
        let mut response = (status, Json(body)).into_response();
        if let ApiError::Core(core_error::Error::Throttled {
            elapsed_secs,
            min_interval_secs,
            ..
        }) = &self
            && let Ok(value) = HeaderValue::from_str(
                &retry_after(*elapsed_secs, *min_interval_secs).to_string(),
            )
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_error_taxonomy() {
        let cases = [
            (tidewater_core::Error::NotFound("t".into()), StatusCode::NOT_FOUND),
            (tidewater_core::Error::Disabled("t".into()), StatusCode::BAD_REQUEST),
            (
                tidewater_core::Error::Throttled {
                    table: "t".into(),
                    elapsed_secs: 1800,
                    min_interval_secs: 3600,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (tidewater_core::Error::Conflict("t".into()), StatusCode::CONFLICT),
            (
                tidewater_core::Error::SourceMessage("503".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                tidewater_core::Error::Timeout("upsert".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn throttled_details_carry_retry_after() {
        let err = ApiError::from(tidewater_core::Error::Throttled {
            table: "asin_performance".into(),
            elapsed_secs: 1800,
            min_interval_secs: 3600,
        });
        assert_eq!(err.details()["retry_after_secs"], 1800);
        assert_eq!(err.category(), "throttled");
    }
}
