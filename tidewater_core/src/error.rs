use std::error::Error as StdError;

use serde::Serialize;

/// Common error type for `tidewater_core`.
///
/// Warehouse and Postgres failures keep their underlying error chain via
/// `Error::upstream` and `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("table '{0}' is disabled")]
    Disabled(String),

    #[error(
        "table '{table}' was refreshed {elapsed_secs}s ago; minimum interval is {min_interval_secs}s"
    )]
    Throttled {
        table: String,
        elapsed_secs: i64,
        min_interval_secs: i64,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("source error: {context}")]
    Source {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("source error: {0}")]
    SourceMessage(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("webhook error: {0}")]
    Webhook(String),
}

/// Coarse failure class used for retry policy and API error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Permanent: bad input, unknown or disabled table. Never retried.
    Config,
    Throttled,
    Conflict,
    /// Warehouse unavailable or rate limited. Retried by the next invocation.
    SourceTransient,
    /// Target store unavailable or slow. Retried by the next invocation.
    TargetTransient,
    Webhook,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Throttled => "throttled",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::SourceTransient => "source_transient",
            ErrorCategory::TargetTransient => "target_transient",
            ErrorCategory::Webhook => "webhook",
        }
    }
}

impl Error {
    #[tracing::instrument(level = "debug", name = "tidewater.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a warehouse-side failure (HTTP transport, decoding).
    #[tracing::instrument(level = "debug", name = "tidewater.error.upstream", skip(source))]
    pub fn upstream(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Source {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidInput(_) | Error::NotFound(_) | Error::Disabled(_) => {
                ErrorCategory::Config
            }
            Error::Throttled { .. } => ErrorCategory::Throttled,
            Error::Conflict(_) => ErrorCategory::Conflict,
            Error::Source { .. } | Error::SourceMessage(_) => ErrorCategory::SourceTransient,
            Error::Backend { .. } | Error::BackendMessage(_) | Error::Timeout(_) => {
                ErrorCategory::TargetTransient
            }
            Error::Webhook(_) => ErrorCategory::Webhook,
        }
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::Disabled(_) => "table_disabled",
            Error::Throttled { .. } => "throttled",
            Error::Conflict(_) => "conflict",
            Error::Source { .. } | Error::SourceMessage(_) => "source_unavailable",
            Error::Backend { .. } | Error::BackendMessage(_) => "target_unavailable",
            Error::Timeout(_) => "timeout",
            Error::Webhook(_) => "webhook_failed",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::SourceTransient | ErrorCategory::TargetTransient
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            Error::NotFound("t".into()).category(),
            ErrorCategory::Config
        );
        assert_eq!(
            Error::Disabled("t".into()).category(),
            ErrorCategory::Config
        );
        assert_eq!(
            Error::SourceMessage("429".into()).category(),
            ErrorCategory::SourceTransient
        );
        assert_eq!(
            Error::Timeout("upsert".into()).category(),
            ErrorCategory::TargetTransient
        );
        assert!(Error::BackendMessage("down".into()).is_transient());
        assert!(!Error::Conflict("held".into()).is_transient());
    }

    #[test]
    fn throttled_message_names_table_and_interval() {
        let err = Error::Throttled {
            table: "asin_performance".into(),
            elapsed_secs: 1800,
            min_interval_secs: 3600,
        };
        assert_eq!(err.code(), "throttled");
        let msg = err.to_string();
        assert!(msg.contains("asin_performance"));
        assert!(msg.contains("3600"));
    }
}
