use std::collections::BTreeMap;

use crate::audit::models::{AuditLogEntry, AuditQuery, AuditStatus};
use crate::audit::traits::AuditLog;
use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_METRICS_DAYS: u32 = 7;
pub const MAX_METRICS_DAYS: u32 = 90;
const RECENT_ERRORS_PER_TABLE: usize = 5;
const MAX_ENTRIES_SCANNED: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsQuery {
    pub days: u32,
    pub table_name: Option<String>,
}

impl Default for MetricsQuery {
    fn default() -> Self {
        Self {
            days: DEFAULT_METRICS_DAYS,
            table_name: None,
        }
    }
}

impl MetricsQuery {
    pub fn validate(&self) -> Result<()> {
        if self.days == 0 || self.days > MAX_METRICS_DAYS {
            return Err(Error::InvalidInput(format!(
                "days must be between 1 and {MAX_METRICS_DAYS}"
            )));
        }
        Ok(())
    }
}

/// Counters for a set of attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsBucket {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub running: u64,
    /// Attempts superseded by one already in progress; excluded from `attempts`.
    pub skipped: u64,
    /// Successes over finished attempts; `None` when nothing finished.
    pub success_rate: Option<f64>,
    pub avg_duration_ms: Option<f64>,
    pub rows_processed: u64,
    /// Rows per second across finished attempts.
    pub rows_per_second: Option<f64>,
    #[serde(skip)]
    duration_total_ms: u64,
    #[serde(skip)]
    rows_finished: u64,
}

impl MetricsBucket {
    fn add(&mut self, entry: &AuditLogEntry) {
        if entry.status == AuditStatus::Skipped {
            self.skipped += 1;
            return;
        }
        self.attempts += 1;
        self.rows_processed += entry.rows_processed;
        match entry.status {
            AuditStatus::Running => self.running += 1,
            AuditStatus::Success => self.successes += 1,
            AuditStatus::Failed => self.failures += 1,
            AuditStatus::Skipped => {}
        }
        if let Some(ms) = entry.execution_time_ms {
            self.duration_total_ms += ms;
            self.rows_finished += entry.rows_processed;
        }
    }

    fn finalize(&mut self) {
        let finished = self.successes + self.failures;
        if finished > 0 {
            self.success_rate = Some(self.successes as f64 / finished as f64);
            self.avg_duration_ms = Some(self.duration_total_ms as f64 / finished as f64);
        }
        if self.duration_total_ms > 0 {
            self.rows_per_second =
                Some(self.rows_finished as f64 / (self.duration_total_ms as f64 / 1000.0));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyMetrics {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub bucket: MetricsBucket,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentError {
    pub audit_log_id: Uuid,
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMetrics {
    pub table_schema: String,
    pub table_name: String,
    #[serde(flatten)]
    pub bucket: MetricsBucket,
    pub last_success_at: Option<DateTime<Utc>>,
    pub recent_errors: Vec<RecentError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshMetrics {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub days: u32,
    pub totals: MetricsBucket,
    pub daily: Vec<DailyMetrics>,
    pub tables: Vec<TableMetrics>,
}

/// Load the window from `audit` and summarize it.
#[tracing::instrument(level = "debug", skip(audit))]
pub async fn collect(
    audit: &dyn AuditLog,
    query: &MetricsQuery,
    now: DateTime<Utc>,
) -> Result<RefreshMetrics> {
    query.validate()?;
    let since = now - Duration::days(i64::from(query.days));
    let entries = audit
        .list(&AuditQuery {
            table_name: query.table_name.clone(),
            status: None,
            since: Some(since),
            limit: MAX_ENTRIES_SCANNED,
        })
        .await?;
    if entries.len() == MAX_ENTRIES_SCANNED {
        tracing::warn!(
            limit = MAX_ENTRIES_SCANNED,
            "metrics window truncated; narrow days or table_name"
        );
    }
    Ok(summarize(&entries, query.days, since, now))
}

/// Aggregate entries into daily and per-table buckets. Days without attempts are
/// reported with zero counts so the series is contiguous.
pub fn summarize(
    entries: &[AuditLogEntry],
    days: u32,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> RefreshMetrics {
    let mut totals = MetricsBucket::default();
    let mut daily: BTreeMap<NaiveDate, MetricsBucket> = BTreeMap::new();
    let mut day = window_start.date_naive();
    while day <= window_end.date_naive() {
        daily.insert(day, MetricsBucket::default());
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }

    let mut tables: BTreeMap<(String, String), TableMetrics> = BTreeMap::new();
    let mut sorted: Vec<&AuditLogEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| b.refresh_started_at.cmp(&a.refresh_started_at));

    for entry in sorted {
        totals.add(entry);
        daily
            .entry(entry.refresh_started_at.date_naive())
            .or_default()
            .add(entry);

        let table = tables
            .entry((entry.table_schema.clone(), entry.table_name.clone()))
            .or_insert_with(|| TableMetrics {
                table_schema: entry.table_schema.clone(),
                table_name: entry.table_name.clone(),
                bucket: MetricsBucket::default(),
                last_success_at: None,
                recent_errors: Vec::new(),
            });
        table.bucket.add(entry);
        match entry.status {
            AuditStatus::Success if table.last_success_at.is_none() => {
                table.last_success_at = entry.refresh_completed_at;
            }
            AuditStatus::Failed if table.recent_errors.len() < RECENT_ERRORS_PER_TABLE => {
                table.recent_errors.push(RecentError {
                    audit_log_id: entry.id,
                    at: entry.refresh_completed_at.unwrap_or(entry.refresh_started_at),
                    message: entry.error_message.clone().unwrap_or_default(),
                });
            }
            _ => {}
        }
    }

    totals.finalize();
    let daily = daily
        .into_iter()
        .map(|(date, mut bucket)| {
            bucket.finalize();
            DailyMetrics { date, bucket }
        })
        .collect();
    let tables = tables
        .into_values()
        .map(|mut t| {
            t.bucket.finalize();
            t
        })
        .collect();

    RefreshMetrics {
        window_start,
        window_end,
        days,
        totals,
        daily,
        tables,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RefreshConfig;

    fn finished(
        table: &str,
        started: DateTime<Utc>,
        ok: bool,
        rows: u64,
        ms: i64,
    ) -> AuditLogEntry {
        let config = RefreshConfig::new("public", table, "fn", 24, 0, None).unwrap();
        let mut e = AuditLogEntry::new_running(&config, started);
        e.rows_processed = rows;
        let end = started + Duration::milliseconds(ms);
        if ok {
            e.finish_success(serde_json::Value::Null, end).unwrap();
        } else {
            e.finish_failure("warehouse returned 503", end).unwrap();
        }
        e
    }

    #[test]
    fn aggregates_per_day_and_table() {
        let now = Utc::now();
        let start = now - Duration::days(2);
        let entries = vec![
            finished("a", now - Duration::hours(1), true, 100, 2_000),
            finished("a", now - Duration::hours(2), false, 0, 1_000),
            finished("b", now - Duration::hours(3), true, 50, 1_000),
        ];
        let m = summarize(&entries, 2, start, now);

        assert_eq!(m.totals.attempts, 3);
        assert_eq!(m.totals.successes, 2);
        let rate = m.totals.success_rate.unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.totals.rows_processed, 150);
        assert!(m.daily.len() >= 3);

        let a = m.tables.iter().find(|t| t.table_name == "a").unwrap();
        assert_eq!(a.bucket.attempts, 2);
        assert_eq!(a.bucket.avg_duration_ms, Some(1_500.0));
        assert_eq!(a.recent_errors.len(), 1);
        assert_eq!(a.recent_errors[0].message, "warehouse returned 503");
        assert!(a.last_success_at.is_some());
    }

    #[test]
    fn skipped_attempts_do_not_count_as_failures() {
        let now = Utc::now();
        let config = RefreshConfig::new("public", "a", "fn", 24, 0, None).unwrap();
        let mut skipped = AuditLogEntry::new_running(&config, now - Duration::minutes(5));
        skipped
            .finish_skipped("refresh already in progress", now - Duration::minutes(5))
            .unwrap();
        let entries = vec![finished("a", now - Duration::hours(1), true, 10, 1_000), skipped];
        let m = summarize(&entries, 1, now - Duration::days(1), now);

        assert_eq!(m.totals.attempts, 1);
        assert_eq!(m.totals.skipped, 1);
        assert_eq!(m.totals.failures, 0);
        assert_eq!(m.totals.success_rate, Some(1.0));
        let a = m.tables.iter().find(|t| t.table_name == "a").unwrap();
        assert!(a.recent_errors.is_empty());
    }

    #[test]
    fn empty_window_has_no_rates() {
        let now = Utc::now();
        let m = summarize(&[], 1, now - Duration::days(1), now);
        assert_eq!(m.totals.attempts, 0);
        assert_eq!(m.totals.success_rate, None);
        assert!(m.tables.is_empty());
    }

    #[test]
    fn rejects_out_of_range_days() {
        let q = MetricsQuery {
            days: 0,
            table_name: None,
        };
        assert!(q.validate().is_err());
    }
}
