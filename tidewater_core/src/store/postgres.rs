use crate::audit::{AuditLog, AuditLogEntry, AuditQuery, AuditStatus, BatchMetrics};
use crate::checkpoint::{
    AcquireOutcome, Acquired, AdvanceDecision, Checkpoint, CheckpointKey, CheckpointStatus,
    CheckpointStore, Lease, SyncCursor, resolve_acquire, resolve_advance, resolve_complete,
    resolve_release,
};
use crate::config::DatabaseSettings;
use crate::registry::{RefreshConfig, RefreshConfigStore};
use crate::webhooks::{
    DeliveryStatus, RetryConfig, WebhookConfig, WebhookDelivery, WebhookStore,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

/// Lost insert races are retried this many times before giving up.
const ACQUIRE_ATTEMPTS: usize = 3;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS refresh_config (
        id                      UUID PRIMARY KEY,
        table_schema            TEXT NOT NULL,
        table_name              TEXT NOT NULL UNIQUE,
        function_name           TEXT NOT NULL,
        is_enabled              BOOLEAN NOT NULL DEFAULT TRUE,
        refresh_frequency_hours INTEGER NOT NULL,
        priority                INTEGER NOT NULL DEFAULT 0,
        last_refresh_at         TIMESTAMPTZ NULL,
        next_refresh_at         TIMESTAMPTZ NULL,
        last_attempt_at         TIMESTAMPTZ NULL,
        last_rows_processed     BIGINT NULL,
        created_at              TIMESTAMPTZ NOT NULL,
        updated_at              TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS refresh_checkpoints (
        id                 UUID PRIMARY KEY,
        function_name      TEXT NOT NULL,
        table_schema       TEXT NOT NULL,
        table_name         TEXT NOT NULL,
        status             TEXT NOT NULL,
        checkpoint_data    JSONB NOT NULL,
        last_processed_row BIGINT NOT NULL DEFAULT 0,
        total_rows         BIGINT NULL,
        lease_owner        UUID NULL,
        expires_at         TIMESTAMPTZ NOT NULL,
        version            BIGINT NOT NULL,
        created_at         TIMESTAMPTZ NOT NULL,
        updated_at         TIMESTAMPTZ NOT NULL,
        CONSTRAINT refresh_checkpoints_identity_key
            UNIQUE (function_name, table_schema, table_name, status)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS refresh_checkpoints_status_expires_idx
      ON refresh_checkpoints (status, expires_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS refresh_audit_log (
        id                   UUID PRIMARY KEY,
        refresh_config_id    UUID NOT NULL,
        table_schema         TEXT NOT NULL,
        table_name           TEXT NOT NULL,
        status               TEXT NOT NULL,
        refresh_started_at   TIMESTAMPTZ NOT NULL,
        refresh_completed_at TIMESTAMPTZ NULL,
        rows_processed       BIGINT NOT NULL DEFAULT 0,
        rows_inserted        BIGINT NOT NULL DEFAULT 0,
        rows_updated         BIGINT NOT NULL DEFAULT 0,
        rows_skipped         BIGINT NOT NULL DEFAULT 0,
        execution_time_ms    BIGINT NULL,
        error_message        TEXT NULL,
        sync_metadata        JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS refresh_audit_log_table_started_idx
      ON refresh_audit_log (table_name, refresh_started_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_configs (
        id              UUID PRIMARY KEY,
        name            TEXT NOT NULL,
        url             TEXT NOT NULL,
        secret          TEXT NULL,
        headers         JSONB NOT NULL,
        events          JSONB NOT NULL,
        is_active       BOOLEAN NOT NULL DEFAULT TRUE,
        max_attempts    INTEGER NOT NULL,
        backoff_seconds JSONB NOT NULL,
        timeout_ms      BIGINT NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id                UUID PRIMARY KEY,
        webhook_config_id UUID NOT NULL REFERENCES webhook_configs (id) ON DELETE CASCADE,
        event_type        TEXT NOT NULL,
        event_data        JSONB NOT NULL,
        status            TEXT NOT NULL,
        attempt_count     INTEGER NOT NULL DEFAULT 0,
        next_retry_at     TIMESTAMPTZ NULL,
        response_status   INTEGER NULL,
        response_body     TEXT NULL,
        error_message     TEXT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL,
        delivered_at      TIMESTAMPTZ NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS webhook_deliveries_due_idx
      ON webhook_deliveries (status, next_retry_at)
    "#,
];

/// Postgres-backed bookkeeping: registry, checkpoints, audit log and webhooks.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.url)
            .await
            .map_err(|e| Error::backend("connect postgres", e))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create bookkeeping tables. Target tables are not touched.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::backend("run migration", e))?;
        }
        tracing::info!(statements = MIGRATIONS.len(), "bookkeeping migrations applied");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| Error::backend("begin transaction", e))
    }
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::backend(context, e)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn row_to_config(row: &PgRow) -> Result<RefreshConfig> {
    let frequency: i32 = row.try_get("refresh_frequency_hours").map_err(db_err("decode refresh_config"))?;
    let last_rows: Option<i64> = row.try_get("last_rows_processed").map_err(db_err("decode refresh_config"))?;
    Ok(RefreshConfig {
        id: row.try_get("id").map_err(db_err("decode refresh_config"))?,
        table_schema: row.try_get("table_schema").map_err(db_err("decode refresh_config"))?,
        table_name: row.try_get("table_name").map_err(db_err("decode refresh_config"))?,
        function_name: row.try_get("function_name").map_err(db_err("decode refresh_config"))?,
        is_enabled: row.try_get("is_enabled").map_err(db_err("decode refresh_config"))?,
        refresh_frequency_hours: u32::try_from(frequency).unwrap_or(0),
        priority: row.try_get("priority").map_err(db_err("decode refresh_config"))?,
        last_refresh_at: row.try_get("last_refresh_at").map_err(db_err("decode refresh_config"))?,
        next_refresh_at: row.try_get("next_refresh_at").map_err(db_err("decode refresh_config"))?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(db_err("decode refresh_config"))?,
        last_rows_processed: last_rows.map(to_u64),
        created_at: row.try_get("created_at").map_err(db_err("decode refresh_config"))?,
        updated_at: row.try_get("updated_at").map_err(db_err("decode refresh_config"))?,
    })
}

fn row_to_checkpoint(row: &PgRow) -> Result<Checkpoint> {
    let status: String = row.try_get("status").map_err(db_err("decode checkpoint"))?;
    let Json(cursor): Json<SyncCursor> = row.try_get("checkpoint_data").map_err(db_err("decode checkpoint"))?;
    let last_processed: i64 = row.try_get("last_processed_row").map_err(db_err("decode checkpoint"))?;
    let total: Option<i64> = row.try_get("total_rows").map_err(db_err("decode checkpoint"))?;
    Ok(Checkpoint {
        id: row.try_get("id").map_err(db_err("decode checkpoint"))?,
        key: CheckpointKey {
            function_name: row.try_get("function_name").map_err(db_err("decode checkpoint"))?,
            table_schema: row.try_get("table_schema").map_err(db_err("decode checkpoint"))?,
            table_name: row.try_get("table_name").map_err(db_err("decode checkpoint"))?,
        },
        status: CheckpointStatus::parse(&status)?,
        cursor,
        last_processed_row: to_u64(last_processed),
        total_rows: total.map(to_u64),
        lease_owner: row.try_get("lease_owner").map_err(db_err("decode checkpoint"))?,
        expires_at: row.try_get("expires_at").map_err(db_err("decode checkpoint"))?,
        version: row.try_get("version").map_err(db_err("decode checkpoint"))?,
        created_at: row.try_get("created_at").map_err(db_err("decode checkpoint"))?,
        updated_at: row.try_get("updated_at").map_err(db_err("decode checkpoint"))?,
    })
}

fn row_to_audit(row: &PgRow) -> Result<AuditLogEntry> {
    let status: String = row.try_get("status").map_err(db_err("decode audit entry"))?;
    let counter = |col: &str| -> Result<u64> {
        let v: i64 = row.try_get(col).map_err(db_err("decode audit entry"))?;
        Ok(to_u64(v))
    };
    let exec_ms: Option<i64> = row.try_get("execution_time_ms").map_err(db_err("decode audit entry"))?;
    let Json(sync_metadata): Json<serde_json::Value> =
        row.try_get("sync_metadata").map_err(db_err("decode audit entry"))?;
    Ok(AuditLogEntry {
        id: row.try_get("id").map_err(db_err("decode audit entry"))?,
        refresh_config_id: row.try_get("refresh_config_id").map_err(db_err("decode audit entry"))?,
        table_schema: row.try_get("table_schema").map_err(db_err("decode audit entry"))?,
        table_name: row.try_get("table_name").map_err(db_err("decode audit entry"))?,
        status: AuditStatus::parse(&status)?,
        refresh_started_at: row.try_get("refresh_started_at").map_err(db_err("decode audit entry"))?,
        refresh_completed_at: row
            .try_get("refresh_completed_at")
            .map_err(db_err("decode audit entry"))?,
        rows_processed: counter("rows_processed")?,
        rows_inserted: counter("rows_inserted")?,
        rows_updated: counter("rows_updated")?,
        rows_skipped: counter("rows_skipped")?,
        execution_time_ms: exec_ms.map(to_u64),
        error_message: row.try_get("error_message").map_err(db_err("decode audit entry"))?,
        sync_metadata,
    })
}

fn row_to_webhook_config(row: &PgRow) -> Result<WebhookConfig> {
    let Json(headers) = row.try_get("headers").map_err(db_err("decode webhook config"))?;
    let Json(events) = row.try_get("events").map_err(db_err("decode webhook config"))?;
    let Json(backoff_seconds) = row.try_get("backoff_seconds").map_err(db_err("decode webhook config"))?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(db_err("decode webhook config"))?;
    let timeout_ms: Option<i64> = row.try_get("timeout_ms").map_err(db_err("decode webhook config"))?;
    Ok(WebhookConfig {
        id: row.try_get("id").map_err(db_err("decode webhook config"))?,
        name: row.try_get("name").map_err(db_err("decode webhook config"))?,
        url: row.try_get("url").map_err(db_err("decode webhook config"))?,
        secret: row.try_get("secret").map_err(db_err("decode webhook config"))?,
        headers,
        events,
        is_active: row.try_get("is_active").map_err(db_err("decode webhook config"))?,
        retry: RetryConfig {
            max_attempts: u32::try_from(max_attempts).unwrap_or(0),
            backoff_seconds,
        },
        timeout_ms: timeout_ms.map(to_u64),
        created_at: row.try_get("created_at").map_err(db_err("decode webhook config"))?,
        updated_at: row.try_get("updated_at").map_err(db_err("decode webhook config"))?,
    })
}

fn row_to_delivery(row: &PgRow) -> Result<WebhookDelivery> {
    let status: String = row.try_get("status").map_err(db_err("decode webhook delivery"))?;
    let Json(event_data) = row.try_get("event_data").map_err(db_err("decode webhook delivery"))?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(db_err("decode webhook delivery"))?;
    let response_status: Option<i32> =
        row.try_get("response_status").map_err(db_err("decode webhook delivery"))?;
    Ok(WebhookDelivery {
        id: row.try_get("id").map_err(db_err("decode webhook delivery"))?,
        webhook_config_id: row
            .try_get("webhook_config_id")
            .map_err(db_err("decode webhook delivery"))?,
        event_type: row.try_get("event_type").map_err(db_err("decode webhook delivery"))?,
        event_data,
        status: DeliveryStatus::parse(&status)?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        next_retry_at: row.try_get("next_retry_at").map_err(db_err("decode webhook delivery"))?,
        response_status: response_status.and_then(|s| u16::try_from(s).ok()),
        response_body: row.try_get("response_body").map_err(db_err("decode webhook delivery"))?,
        error_message: row.try_get("error_message").map_err(db_err("decode webhook delivery"))?,
        created_at: row.try_get("created_at").map_err(db_err("decode webhook delivery"))?,
        updated_at: row.try_get("updated_at").map_err(db_err("decode webhook delivery"))?,
        delivered_at: row.try_get("delivered_at").map_err(db_err("decode webhook delivery"))?,
    })
}

#[async_trait]
impl RefreshConfigStore for PgStore {
    #[tracing::instrument(level = "debug", skip_all, fields(table = %config.table_name))]
    async fn upsert_config(&self, config: &RefreshConfig) -> Result<()> {
        config.validate()?;
        sqlx::query(
            r#"
            INSERT INTO refresh_config
                (id, table_schema, table_name, function_name, is_enabled,
                 refresh_frequency_hours, priority, last_refresh_at, next_refresh_at,
                 last_attempt_at, last_rows_processed, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (table_name) DO UPDATE SET
                table_schema = EXCLUDED.table_schema,
                function_name = EXCLUDED.function_name,
                is_enabled = EXCLUDED.is_enabled,
                refresh_frequency_hours = EXCLUDED.refresh_frequency_hours,
                priority = EXCLUDED.priority,
                last_refresh_at = EXCLUDED.last_refresh_at,
                next_refresh_at = EXCLUDED.next_refresh_at,
                last_attempt_at = EXCLUDED.last_attempt_at,
                last_rows_processed = EXCLUDED.last_rows_processed,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(config.id)
        .bind(&config.table_schema)
        .bind(&config.table_name)
        .bind(&config.function_name)
        .bind(config.is_enabled)
        .bind(i32::try_from(config.refresh_frequency_hours).unwrap_or(i32::MAX))
        .bind(config.priority)
        .bind(config.last_refresh_at)
        .bind(config.next_refresh_at)
        .bind(config.last_attempt_at)
        .bind(config.last_rows_processed.map(to_i64))
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("upsert refresh_config"))?;
        Ok(())
    }

    async fn get_config(&self, table_name: &str) -> Result<Option<RefreshConfig>> {
        let row = sqlx::query("SELECT * FROM refresh_config WHERE table_name = $1")
            .bind(table_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get refresh_config"))?;
        row.as_ref().map(row_to_config).transpose()
    }

    async fn list_configs(&self) -> Result<Vec<RefreshConfig>> {
        let rows = sqlx::query("SELECT * FROM refresh_config ORDER BY priority DESC, table_name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list refresh_config"))?;
        rows.iter().map(row_to_config).collect()
    }

    async fn list_enabled(&self) -> Result<Vec<RefreshConfig>> {
        let rows = sqlx::query(
            "SELECT * FROM refresh_config WHERE is_enabled ORDER BY priority DESC, table_name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list enabled refresh_config"))?;
        rows.iter().map(row_to_config).collect()
    }

    async fn set_enabled(&self, table_name: &str, enabled: bool) -> Result<RefreshConfig> {
        let row = sqlx::query(
            "UPDATE refresh_config SET is_enabled = $2, updated_at = now() WHERE table_name = $1 RETURNING *",
        )
        .bind(table_name)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("set refresh_config enabled"))?;
        match row {
            Some(row) => row_to_config(&row),
            None => Err(Error::NotFound(format!(
                "no refresh config for table '{table_name}'"
            ))),
        }
    }

    async fn mark_run_start(&self, table_name: &str, at: DateTime<Utc>) -> Result<()> {
        let res = sqlx::query(
            "UPDATE refresh_config SET last_attempt_at = $2, updated_at = $2 WHERE table_name = $1",
        )
        .bind(table_name)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err("mark refresh start"))?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "no refresh config for table '{table_name}'"
            )));
        }
        Ok(())
    }

    async fn mark_run_success(
        &self,
        table_name: &str,
        rows_processed: u64,
        at: DateTime<Utc>,
    ) -> Result<RefreshConfig> {
        let row = sqlx::query(
            r#"
            UPDATE refresh_config
               SET last_refresh_at = $2,
                   next_refresh_at = $2 + make_interval(hours => refresh_frequency_hours),
                   last_rows_processed = $3,
                   updated_at = $2
             WHERE table_name = $1
            RETURNING *
            "#,
        )
        .bind(table_name)
        .bind(at)
        .bind(to_i64(rows_processed))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("mark refresh success"))?;
        match row {
            Some(row) => row_to_config(&row),
            None => Err(Error::NotFound(format!(
                "no refresh config for table '{table_name}'"
            ))),
        }
    }
}

impl PgStore {
    async fn lock_active(
        tx: &mut Transaction<'static, Postgres>,
        key: &CheckpointKey,
    ) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM refresh_checkpoints
             WHERE function_name = $1 AND table_schema = $2 AND table_name = $3
               AND status = 'active'
            FOR UPDATE
            "#,
        )
        .bind(&key.function_name)
        .bind(&key.table_schema)
        .bind(&key.table_name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err("lock active checkpoint"))?;
        row.as_ref().map(row_to_checkpoint).transpose()
    }

    async fn lock_by_id(tx: &mut Transaction<'static, Postgres>, id: Uuid) -> Result<Checkpoint> {
        let row = sqlx::query("SELECT * FROM refresh_checkpoints WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err("lock checkpoint"))?;
        match row {
            Some(row) => row_to_checkpoint(&row),
            None => Err(Error::NotFound(format!("checkpoint {id}"))),
        }
    }

    /// Write lease, cursor and status fields guarded by the previous version.
    async fn write_checkpoint(
        tx: &mut Transaction<'static, Postgres>,
        next: &Checkpoint,
        expected_version: i64,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE refresh_checkpoints
               SET status = $3, checkpoint_data = $4, last_processed_row = $5, total_rows = $6,
                   lease_owner = $7, expires_at = $8, version = $9, updated_at = $10
             WHERE id = $1 AND version = $2
            "#,
        )
        .bind(next.id)
        .bind(expected_version)
        .bind(next.status.as_str())
        .bind(Json(&next.cursor))
        .bind(to_i64(next.last_processed_row))
        .bind(next.total_rows.map(to_i64))
        .bind(next.lease_owner)
        .bind(next.expires_at)
        .bind(next.version)
        .bind(next.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err("update checkpoint"))?;
        if res.rows_affected() != 1 {
            return Err(Error::Conflict(format!(
                "checkpoint {} changed concurrently",
                next.id
            )));
        }
        Ok(())
    }

    async fn get_by_status(
        &self,
        key: &CheckpointKey,
        status: CheckpointStatus,
    ) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM refresh_checkpoints
             WHERE function_name = $1 AND table_schema = $2 AND table_name = $3 AND status = $4
            "#,
        )
        .bind(&key.function_name)
        .bind(&key.table_schema)
        .bind(&key.table_name)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get checkpoint"))?;
        row.as_ref().map(row_to_checkpoint).transpose()
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    #[tracing::instrument(level = "debug", skip(self, initial, lease), fields(key = %key))]
    async fn acquire_or_resume(
        &self,
        key: &CheckpointKey,
        initial: &SyncCursor,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Acquired> {
        for _ in 0..ACQUIRE_ATTEMPTS {
            let mut tx = self.begin().await?;
            if let Some(existing) = Self::lock_active(&mut tx, key).await? {
                let acquired = resolve_acquire(&existing, lease, now)?;
                Self::write_checkpoint(&mut tx, &acquired.checkpoint, existing.version).await?;
                tx.commit().await.map_err(db_err("commit checkpoint acquire"))?;
                return Ok(acquired);
            }

            let fresh = Checkpoint::new_active(key.clone(), initial.clone(), lease, now);
            let res = sqlx::query(
                r#"
                INSERT INTO refresh_checkpoints
                    (id, function_name, table_schema, table_name, status, checkpoint_data,
                     last_processed_row, total_rows, lease_owner, expires_at, version,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, 'active', $5, 0, NULL, $6, $7, $8, $9, $9)
                ON CONFLICT (function_name, table_schema, table_name, status) DO NOTHING
                "#,
            )
            .bind(fresh.id)
            .bind(&key.function_name)
            .bind(&key.table_schema)
            .bind(&key.table_name)
            .bind(Json(&fresh.cursor))
            .bind(fresh.lease_owner)
            .bind(fresh.expires_at)
            .bind(fresh.version)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err("insert checkpoint"))?;
            if res.rows_affected() == 1 {
                tx.commit().await.map_err(db_err("commit checkpoint insert"))?;
                return Ok(Acquired {
                    checkpoint: fresh,
                    outcome: AcquireOutcome::Created,
                });
            }
            // Lost the insert race; re-read the winner's row.
            tx.rollback().await.map_err(db_err("rollback checkpoint insert"))?;
        }
        Err(Error::Conflict(format!(
            "could not acquire checkpoint for {key} after {ACQUIRE_ATTEMPTS} attempts"
        )))
    }

    async fn advance(
        &self,
        checkpoint: &Checkpoint,
        cursor: &SyncCursor,
        rows_so_far: u64,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let mut tx = self.begin().await?;
        let current = Self::lock_by_id(&mut tx, checkpoint.id).await?;
        let next = match resolve_advance(&current, checkpoint, cursor, rows_so_far, lease, now)? {
            AdvanceDecision::Replay(stored) => return Ok(stored),
            AdvanceDecision::Apply(next) => next,
        };
        Self::write_checkpoint(&mut tx, &next, current.version).await?;
        tx.commit().await.map_err(db_err("commit checkpoint advance"))?;
        Ok(next)
    }

    async fn complete(
        &self,
        checkpoint: &Checkpoint,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let mut tx = self.begin().await?;
        let current = Self::lock_by_id(&mut tx, checkpoint.id).await?;
        let done = resolve_complete(&current, lease, now)?;
        sqlx::query(
            r#"
            DELETE FROM refresh_checkpoints
             WHERE function_name = $1 AND table_schema = $2 AND table_name = $3
               AND status = 'completed'
            "#,
        )
        .bind(&done.key.function_name)
        .bind(&done.key.table_schema)
        .bind(&done.key.table_name)
        .execute(&mut *tx)
        .await
        .map_err(db_err("delete completed checkpoint"))?;
        Self::write_checkpoint(&mut tx, &done, current.version).await?;
        tx.commit().await.map_err(db_err("commit checkpoint complete"))?;
        Ok(done)
    }

    #[tracing::instrument(level = "debug", skip(self, lease), fields(key = %key))]
    async fn release(&self, key: &CheckpointKey, lease: &Lease, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.begin().await?;
        let Some(current) = Self::lock_active(&mut tx, key).await? else {
            return Ok(false);
        };
        let Some(next) = resolve_release(&current, lease, now) else {
            return Ok(false);
        };
        Self::write_checkpoint(&mut tx, &next, current.version).await?;
        tx.commit().await.map_err(db_err("commit checkpoint release"))?;
        Ok(true)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE refresh_checkpoints
               SET lease_owner = NULL, version = version + 1, updated_at = $1
             WHERE status = 'active' AND lease_owner IS NOT NULL AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("reclaim expired checkpoints"))?;
        Ok(res.rows_affected())
    }

    async fn get_active(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        self.get_by_status(key, CheckpointStatus::Active).await
    }

    async fn get_completed(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        self.get_by_status(key, CheckpointStatus::Completed).await
    }
}

impl PgStore {
    /// Read-modify-write of a running audit entry under a row lock.
    async fn update_entry<F>(&self, id: Uuid, apply: F) -> Result<AuditLogEntry>
    where
        F: FnOnce(&mut AuditLogEntry) -> Result<()> + Send,
    {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT * FROM refresh_audit_log WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("lock audit entry"))?;
        let Some(row) = row else {
            return Err(Error::NotFound(format!("audit entry {id}")));
        };
        let mut entry = row_to_audit(&row)?;
        apply(&mut entry)?;
        sqlx::query(
            r#"
            UPDATE refresh_audit_log
               SET status = $2, refresh_completed_at = $3, rows_processed = $4,
                   rows_inserted = $5, rows_updated = $6, rows_skipped = $7,
                   execution_time_ms = $8, error_message = $9, sync_metadata = $10
             WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(entry.status.as_str())
        .bind(entry.refresh_completed_at)
        .bind(to_i64(entry.rows_processed))
        .bind(to_i64(entry.rows_inserted))
        .bind(to_i64(entry.rows_updated))
        .bind(to_i64(entry.rows_skipped))
        .bind(entry.execution_time_ms.map(to_i64))
        .bind(&entry.error_message)
        .bind(Json(&entry.sync_metadata))
        .execute(&mut *tx)
        .await
        .map_err(db_err("update audit entry"))?;
        tx.commit().await.map_err(db_err("commit audit entry"))?;
        Ok(entry)
    }
}

#[async_trait]
impl AuditLog for PgStore {
    #[tracing::instrument(level = "debug", skip_all, fields(table = %config.table_name))]
    async fn start(&self, config: &RefreshConfig, now: DateTime<Utc>) -> Result<AuditLogEntry> {
        let entry = AuditLogEntry::new_running(config, now);
        sqlx::query(
            r#"
            INSERT INTO refresh_audit_log
                (id, refresh_config_id, table_schema, table_name, status, refresh_started_at,
                 rows_processed, rows_inserted, rows_updated, rows_skipped, sync_metadata)
            VALUES ($1, $2, $3, $4, $5, $6, 0, 0, 0, 0, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.refresh_config_id)
        .bind(&entry.table_schema)
        .bind(&entry.table_name)
        .bind(entry.status.as_str())
        .bind(entry.refresh_started_at)
        .bind(Json(&entry.sync_metadata))
        .execute(&self.pool)
        .await
        .map_err(db_err("insert audit entry"))?;
        Ok(entry)
    }

    async fn record_batch(&self, id: Uuid, batch: &BatchMetrics) -> Result<AuditLogEntry> {
        self.update_entry(id, |e| e.apply_batch(batch)).await
    }

    async fn succeed(
        &self,
        id: Uuid,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<AuditLogEntry> {
        self.update_entry(id, |e| e.finish_success(metadata, now)).await
    }

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<AuditLogEntry> {
        self.update_entry(id, |e| e.finish_failure(error, now)).await
    }

    async fn skip(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<AuditLogEntry> {
        self.update_entry(id, |e| e.finish_skipped(reason, now)).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditLogEntry>> {
        let row = sqlx::query("SELECT * FROM refresh_audit_log WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get audit entry"))?;
        row.as_ref().map(row_to_audit).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM refresh_audit_log WHERE TRUE");
        if let Some(table) = &query.table_name {
            qb.push(" AND table_name = ").push_bind(table.clone());
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = query.since {
            qb.push(" AND refresh_started_at >= ").push_bind(since);
        }
        qb.push(" ORDER BY refresh_started_at DESC");
        if query.limit > 0 {
            qb.push(" LIMIT ").push_bind(to_i64(query.limit as u64));
        }
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list audit entries"))?;
        rows.iter().map(row_to_audit).collect()
    }
}

#[async_trait]
impl WebhookStore for PgStore {
    async fn upsert_webhook_config(&self, config: &WebhookConfig) -> Result<()> {
        config.validate()?;
        sqlx::query(
            r#"
            INSERT INTO webhook_configs
                (id, name, url, secret, headers, events, is_active, max_attempts,
                 backoff_seconds, timeout_ms, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                secret = EXCLUDED.secret,
                headers = EXCLUDED.headers,
                events = EXCLUDED.events,
                is_active = EXCLUDED.is_active,
                max_attempts = EXCLUDED.max_attempts,
                backoff_seconds = EXCLUDED.backoff_seconds,
                timeout_ms = EXCLUDED.timeout_ms,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(&config.url)
        .bind(&config.secret)
        .bind(Json(&config.headers))
        .bind(Json(&config.events))
        .bind(config.is_active)
        .bind(i32::try_from(config.retry.max_attempts).unwrap_or(i32::MAX))
        .bind(Json(&config.retry.backoff_seconds))
        .bind(config.timeout_ms.map(to_i64))
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("upsert webhook config"))?;
        Ok(())
    }

    async fn get_webhook_config(&self, id: Uuid) -> Result<Option<WebhookConfig>> {
        let row = sqlx::query("SELECT * FROM webhook_configs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get webhook config"))?;
        row.as_ref().map(row_to_webhook_config).transpose()
    }

    async fn list_webhook_configs(&self) -> Result<Vec<WebhookConfig>> {
        let rows = sqlx::query("SELECT * FROM webhook_configs ORDER BY created_at ASC, name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list webhook configs"))?;
        rows.iter().map(row_to_webhook_config).collect()
    }

    async fn insert_deliveries(&self, deliveries: &[WebhookDelivery]) -> Result<()> {
        if deliveries.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO webhook_deliveries \
             (id, webhook_config_id, event_type, event_data, status, attempt_count, \
              next_retry_at, created_at, updated_at) ",
        );
        qb.push_values(deliveries, |mut b, d| {
            b.push_bind(d.id)
                .push_bind(d.webhook_config_id)
                .push_bind(d.event_type.clone())
                .push_bind(Json(d.event_data.clone()))
                .push_bind(d.status.as_str())
                .push_bind(i32::try_from(d.attempt_count).unwrap_or(i32::MAX))
                .push_bind(d.next_retry_at)
                .push_bind(d.created_at)
                .push_bind(d.updated_at);
        });
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(db_err("insert webhook deliveries"))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>> {
        // Returned rows carry the pre-claim next_retry_at.
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id, next_retry_at AS due_at FROM webhook_deliveries
                 WHERE status IN ('pending', 'retrying') AND next_retry_at <= $1
                 ORDER BY created_at ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE webhook_deliveries d
               SET next_retry_at = $2
              FROM due
             WHERE d.id = due.id
            RETURNING d.id, d.webhook_config_id, d.event_type, d.event_data, d.status,
                      d.attempt_count, due.due_at AS next_retry_at, d.response_status,
                      d.response_body, d.error_message, d.created_at, d.updated_at,
                      d.delivered_at
            "#,
        )
        .bind(now)
        .bind(claim_until)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("claim webhook deliveries"))?;
        let mut out = rows
            .iter()
            .map(row_to_delivery)
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE webhook_deliveries
               SET status = $2, attempt_count = $3, next_retry_at = $4, response_status = $5,
                   response_body = $6, error_message = $7, updated_at = $8, delivered_at = $9
             WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.status.as_str())
        .bind(i32::try_from(delivery.attempt_count).unwrap_or(i32::MAX))
        .bind(delivery.next_retry_at)
        .bind(delivery.response_status.map(i32::from))
        .bind(&delivery.response_body)
        .bind(&delivery.error_message)
        .bind(delivery.updated_at)
        .bind(delivery.delivered_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("update webhook delivery"))?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("webhook delivery {}", delivery.id)));
        }
        Ok(())
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>> {
        let row = sqlx::query("SELECT * FROM webhook_deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get webhook delivery"))?;
        row.as_ref().map(row_to_delivery).transpose()
    }
}
