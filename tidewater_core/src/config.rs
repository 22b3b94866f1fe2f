use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_SOURCE_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub project_id: String,
    pub dataset: String,
    pub access_token: Option<String>,
    pub api_base: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Default retry schedule applied to webhook configs created without one.
    pub backoff_seconds: Vec<u64>,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub batch_size: usize,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            backoff_seconds: vec![5, 30, 300],
            max_attempts: 3,
            timeout: Duration::from_millis(10_000),
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub tick: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick: Duration::from_millis(60_000),
        }
    }
}

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Postgres for bookkeeping and target tables. `None` selects in-memory backends.
    pub database: Option<DatabaseSettings>,
    /// Warehouse credentials. `None` selects the in-memory warehouse.
    pub source: Option<SourceSettings>,
    pub min_refresh_interval: Duration,
    pub batch_size: usize,
    pub platform_time_limit: Duration,
    pub time_safety_margin: Duration,
    pub upsert_timeout: Duration,
    pub checkpoint_lease: Duration,
    pub worker_concurrency: usize,
    pub webhook: WebhookSettings,
    pub scheduler: SchedulerSettings,
    pub tables_file: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database: None,
            source: None,
            min_refresh_interval: Duration::from_secs(3_600),
            batch_size: 1_000,
            platform_time_limit: Duration::from_secs(150),
            time_safety_margin: Duration::from_secs(30),
            upsert_timeout: Duration::from_millis(30_000),
            checkpoint_lease: Duration::from_secs(600),
            worker_concurrency: 4,
            webhook: WebhookSettings::default(),
            scheduler: SchedulerSettings::default(),
            tables_file: None,
        }
    }
}

impl SyncSettings {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup. Unset variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let database = match get("TIDEWATER_DATABASE_URL").or_else(|| get("DATABASE_URL")) {
            Some(url) => Some(DatabaseSettings {
                url,
                max_connections: parse_or(&get, "TIDEWATER_DB_MAX_CONNECTIONS", 10)?,
                acquire_timeout: Duration::from_secs(10),
            }),
            None => None,
        };

        let source = match get("TIDEWATER_SOURCE_PROJECT_ID") {
            Some(project_id) => Some(SourceSettings {
                project_id,
                dataset: get("TIDEWATER_SOURCE_DATASET").unwrap_or_else(|| "analytics".into()),
                access_token: get("TIDEWATER_SOURCE_ACCESS_TOKEN"),
                api_base: get("TIDEWATER_SOURCE_API_BASE")
                    .unwrap_or_else(|| DEFAULT_SOURCE_API_BASE.to_string()),
                timeout: Duration::from_millis(parse_or(
                    &get,
                    "TIDEWATER_SOURCE_TIMEOUT_MS",
                    60_000,
                )?),
            }),
            None => None,
        };

        let backoff_seconds = match get("TIDEWATER_WEBHOOK_BACKOFF_SECONDS") {
            Some(raw) => parse_backoff_list(&raw)?,
            None => defaults.webhook.backoff_seconds.clone(),
        };

        let settings = Self {
            database,
            source,
            min_refresh_interval: Duration::from_secs(parse_or(
                &get,
                "TIDEWATER_MIN_REFRESH_INTERVAL_SECS",
                defaults.min_refresh_interval.as_secs(),
            )?),
            batch_size: parse_or(&get, "TIDEWATER_BATCH_SIZE", defaults.batch_size)?,
            platform_time_limit: Duration::from_secs(parse_or(
                &get,
                "TIDEWATER_PLATFORM_TIME_LIMIT_SECS",
                defaults.platform_time_limit.as_secs(),
            )?),
            time_safety_margin: Duration::from_secs(parse_or(
                &get,
                "TIDEWATER_TIME_SAFETY_MARGIN_SECS",
                defaults.time_safety_margin.as_secs(),
            )?),
            upsert_timeout: Duration::from_millis(parse_or(
                &get,
                "TIDEWATER_UPSERT_TIMEOUT_MS",
                30_000,
            )?),
            checkpoint_lease: Duration::from_secs(parse_or(
                &get,
                "TIDEWATER_CHECKPOINT_LEASE_SECS",
                defaults.checkpoint_lease.as_secs(),
            )?),
            worker_concurrency: parse_or(
                &get,
                "TIDEWATER_WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
            webhook: WebhookSettings {
                backoff_seconds,
                max_attempts: parse_or(
                    &get,
                    "TIDEWATER_WEBHOOK_MAX_ATTEMPTS",
                    defaults.webhook.max_attempts,
                )?,
                timeout: Duration::from_millis(parse_or(&get, "TIDEWATER_WEBHOOK_TIMEOUT_MS", 10_000)?),
                batch_size: parse_or(
                    &get,
                    "TIDEWATER_WEBHOOK_BATCH_SIZE",
                    defaults.webhook.batch_size,
                )?,
            },
            scheduler: SchedulerSettings {
                enabled: get("TIDEWATER_SCHEDULER_ENABLED")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(true),
                tick: Duration::from_millis(parse_or(&get, "TIDEWATER_SCHEDULER_TICK_MS", 60_000)?),
            },
            tables_file: get("TIDEWATER_TABLES_FILE").map(PathBuf::from),
        };
        settings.validate()?;
        Ok(settings)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if let Some(db) = &self.database {
            if db.url.trim().is_empty() {
                return Err(Error::InvalidInput("database url is empty".into()));
            }
            if db.max_connections == 0 {
                return Err(Error::InvalidInput("db max_connections must be > 0".into()));
            }
        }
        if let Some(src) = &self.source {
            if src.project_id.trim().is_empty() {
                return Err(Error::InvalidInput("source project_id is empty".into()));
            }
            if src.dataset.trim().is_empty() {
                return Err(Error::InvalidInput("source dataset is empty".into()));
            }
            if src.timeout.is_zero() {
                return Err(Error::InvalidInput("source timeout must be > 0".into()));
            }
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be > 0".into()));
        }
        if self.platform_time_limit.is_zero() {
            return Err(Error::InvalidInput("platform_time_limit must be > 0".into()));
        }
        if self.time_safety_margin >= self.platform_time_limit {
            return Err(Error::InvalidInput(
                "time_safety_margin must be < platform_time_limit".into(),
            ));
        }
        if self.upsert_timeout.is_zero() {
            return Err(Error::InvalidInput("upsert_timeout must be > 0".into()));
        }
        if self.checkpoint_lease < self.platform_time_limit {
            return Err(Error::InvalidInput(
                "checkpoint_lease must be >= platform_time_limit".into(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(Error::InvalidInput("worker_concurrency must be > 0".into()));
        }
        if self.webhook.backoff_seconds.is_empty() {
            return Err(Error::InvalidInput("webhook backoff schedule is empty".into()));
        }
        if self.webhook.timeout.is_zero() {
            return Err(Error::InvalidInput("webhook timeout must be > 0".into()));
        }
        if self.webhook.batch_size == 0 {
            return Err(Error::InvalidInput("webhook batch_size must be > 0".into()));
        }
        if self.scheduler.tick.is_zero() {
            return Err(Error::InvalidInput("scheduler tick must be > 0".into()));
        }
        Ok(())
    }

    /// Soft deadline for one worker invocation.
    pub fn time_budget(&self) -> Duration {
        self.platform_time_limit
            .saturating_sub(self.time_safety_margin)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::InvalidInput(format!("{key} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn parse_backoff_list(raw: &str) -> Result<Vec<u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map_err(|_| {
                Error::InvalidInput(format!(
                    "TIDEWATER_WEBHOOK_BACKOFF_SECONDS has invalid entry '{s}'"
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<SyncSettings> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncSettings::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_select_memory_backends() {
        let s = settings_from(&[]).unwrap();
        assert!(s.database.is_none());
        assert!(s.source.is_none());
        assert_eq!(s.batch_size, 1_000);
        assert_eq!(s.time_budget(), Duration::from_secs(120));
        assert_eq!(s.webhook.backoff_seconds, vec![5, 30, 300]);
    }

    #[test]
    fn reads_overrides() {
        let s = settings_from(&[
            ("DATABASE_URL", "postgres://localhost/tide"),
            ("TIDEWATER_SOURCE_PROJECT_ID", "acme-analytics"),
            ("TIDEWATER_BATCH_SIZE", "250"),
            ("TIDEWATER_WEBHOOK_BACKOFF_SECONDS", "1, 2,4"),
            ("TIDEWATER_SCHEDULER_ENABLED", "false"),
        ])
        .unwrap();
        assert_eq!(s.database.unwrap().url, "postgres://localhost/tide");
        let src = s.source.unwrap();
        assert_eq!(src.dataset, "analytics");
        assert_eq!(src.api_base, DEFAULT_SOURCE_API_BASE);
        assert_eq!(s.batch_size, 250);
        assert_eq!(s.webhook.backoff_seconds, vec![1, 2, 4]);
        assert!(!s.scheduler.enabled);
    }

    #[test]
    fn rejects_margin_exceeding_limit() {
        let err = settings_from(&[
            ("TIDEWATER_PLATFORM_TIME_LIMIT_SECS", "30"),
            ("TIDEWATER_TIME_SAFETY_MARGIN_SECS", "30"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_unparsable_numbers() {
        let err = settings_from(&[("TIDEWATER_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("TIDEWATER_BATCH_SIZE"));
    }
}
