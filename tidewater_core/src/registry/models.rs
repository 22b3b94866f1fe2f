use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schedule and bookkeeping for one synchronized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub id: Uuid,
    pub table_schema: String,
    pub table_name: String,
    /// Identifier of the sync function (a `TableSpec` in the catalog).
    pub function_name: String,
    pub is_enabled: bool,
    pub refresh_frequency_hours: u32,
    pub priority: i32,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_rows_processed: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefreshConfig {
    #[tracing::instrument(level = "debug")]
    pub fn new(
        table_schema: impl Into<String> + std::fmt::Debug,
        table_name: impl Into<String> + std::fmt::Debug,
        function_name: impl Into<String> + std::fmt::Debug,
        refresh_frequency_hours: u32,
        priority: i32,
        now: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let now = now.unwrap_or_else(Utc::now);
        let config = Self {
            id: Uuid::new_v4(),
            table_schema: table_schema.into(),
            table_name: table_name.into(),
            function_name: function_name.into(),
            is_enabled: true,
            refresh_frequency_hours,
            priority,
            last_refresh_at: None,
            next_refresh_at: None,
            last_attempt_at: None,
            last_rows_processed: None,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        Ok(config)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self.table_schema.trim().is_empty() {
            return Err(Error::InvalidInput("table_schema is empty".to_string()));
        }
        if self.table_name.trim().is_empty() {
            return Err(Error::InvalidInput("table_name is empty".to_string()));
        }
        if self.function_name.trim().is_empty() {
            return Err(Error::InvalidInput("function_name is empty".to_string()));
        }
        if self.refresh_frequency_hours == 0 {
            return Err(Error::InvalidInput(
                "refresh_frequency_hours must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.table_schema, self.table_name)
    }

    pub fn frequency(&self) -> Duration {
        Duration::hours(i64::from(self.refresh_frequency_hours))
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }

    pub fn mark_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt_at = Some(now);
        self.updated_at = now;
    }

    /// Record a completed run. Keeps `next_refresh_at = last_refresh_at + frequency`.
    pub fn mark_success(&mut self, rows_processed: u64, now: DateTime<Utc>) {
        self.last_refresh_at = Some(now);
        self.next_refresh_at = Some(now + self.frequency());
        self.last_rows_processed = Some(rows_processed);
        self.updated_at = now;
    }

    /// Due for a scheduled refresh: enabled and never run, or past `next_refresh_at`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled && self.next_refresh_at.is_none_or(|next| next <= now)
    }

    /// Reject manual refreshes inside the minimum inter-refresh interval.
    pub fn check_throttle(&self, now: DateTime<Utc>, min_interval: Duration) -> Result<()> {
        let Some(last) = self.last_refresh_at else {
            return Ok(());
        };
        let elapsed = now - last;
        if elapsed < min_interval {
            return Err(Error::Throttled {
                table: self.table_name.clone(),
                elapsed_secs: elapsed.num_seconds().max(0),
                min_interval_secs: min_interval.num_seconds(),
            });
        }
        Ok(())
    }
}

/// Run order: priority descending, then table name ascending.
pub fn sort_for_run(configs: &mut [RefreshConfig]) {
    configs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.table_name.cmp(&b.table_name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, priority: i32) -> RefreshConfig {
        RefreshConfig::new("public", name, "asin_performance_data", 24, priority, None).unwrap()
    }

    #[test]
    fn success_sets_next_refresh_from_frequency() {
        let now = Utc::now();
        let mut c = config("asin_performance", 1);
        c.mark_success(42, now);
        assert_eq!(c.last_refresh_at, Some(now));
        assert_eq!(c.next_refresh_at, Some(now + Duration::hours(24)));
        assert_eq!(c.last_rows_processed, Some(42));
        assert!(!c.is_due(now));
        assert!(c.is_due(now + Duration::hours(24)));
    }

    #[test]
    fn throttle_applies_only_inside_interval() {
        let now = Utc::now();
        let mut c = config("asin_performance", 1);
        assert!(c.check_throttle(now, Duration::hours(1)).is_ok());

        c.mark_success(1, now - Duration::minutes(30));
        let err = c.check_throttle(now, Duration::hours(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::Throttled {
                elapsed_secs: 1800,
                min_interval_secs: 3600,
                ..
            }
        ));
        assert!(c.check_throttle(now + Duration::hours(1), Duration::hours(1)).is_ok());
    }

    #[test]
    fn run_order_is_priority_then_name() {
        let mut configs = vec![config("b", 1), config("a", 1), config("c", 5)];
        sort_for_run(&mut configs);
        let names: Vec<_> = configs.iter().map(|c| c.table_name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn rejects_zero_frequency() {
        let err = RefreshConfig::new("public", "t", "f", 0, 0, None).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
