use crate::registry::RefreshConfig;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a checkpoint, excluding status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub function_name: String,
    pub table_schema: String,
    pub table_name: String,
}

impl CheckpointKey {
    pub fn new(
        function_name: impl Into<String>,
        table_schema: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            function_name: function_name.into(),
            table_schema: table_schema.into(),
            table_name: table_name.into(),
        };
        if key.function_name.trim().is_empty()
            || key.table_schema.trim().is_empty()
            || key.table_name.trim().is_empty()
        {
            return Err(Error::InvalidInput(
                "checkpoint key fields must be non-empty".to_string(),
            ));
        }
        Ok(key)
    }

    pub fn for_config(config: &RefreshConfig) -> Self {
        Self {
            function_name: config.function_name.clone(),
            table_schema: config.table_schema.clone(),
            table_name: config.table_name.clone(),
        }
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}.{}",
            self.function_name, self.table_schema, self.table_name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Active,
    Completed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Active => "active",
            CheckpointStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(CheckpointStatus::Active),
            "completed" => Ok(CheckpointStatus::Completed),
            other => Err(Error::BackendMessage(format!(
                "unknown checkpoint status '{other}'"
            ))),
        }
    }
}

/// Resume position inside the source ordering `(cursor column, conflict key)`.
///
/// The next batch reads rows with cursor value `>= watermark` and skips the first
/// `skip` of them, which are the rows already applied at exactly `watermark`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub watermark: Option<String>,
    #[serde(default)]
    pub skip: u64,
}

impl SyncCursor {
    /// Position after applying a batch whose cursor values arrived in this order.
    pub fn advance(&self, batch_cursor_values: &[String]) -> SyncCursor {
        let Some(last) = batch_cursor_values.last() else {
            return self.clone();
        };
        let trailing = batch_cursor_values
            .iter()
            .rev()
            .take_while(|v| *v == last)
            .count() as u64;
        let skip = if self.watermark.as_deref() == Some(last.as_str()) {
            // Whole batch sat on the current watermark.
            self.skip + trailing
        } else {
            trailing
        };
        SyncCursor {
            watermark: Some(last.clone()),
            skip,
        }
    }

    /// Starting point for a new sync seeded from a previous completed one. Rows at the
    /// watermark are re-read so late arrivals for that value are picked up.
    pub fn restart(&self) -> SyncCursor {
        SyncCursor {
            watermark: self.watermark.clone(),
            skip: 0,
        }
    }
}

/// Who holds a checkpoint and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// The audit attempt id doing the work.
    pub owner: Uuid,
    pub ttl: Duration,
}

impl Lease {
    pub fn new(owner: Uuid, ttl: Duration) -> Self {
        Self { owner, ttl }
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub key: CheckpointKey,
    pub status: CheckpointStatus,
    pub cursor: SyncCursor,
    pub last_processed_row: u64,
    pub total_rows: Option<u64>,
    pub lease_owner: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new_active(
        key: CheckpointKey,
        initial: SyncCursor,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            status: CheckpointStatus::Active,
            cursor: initial,
            last_processed_row: 0,
            total_rows: None,
            lease_owner: Some(lease.owner),
            expires_at: lease.expires_at(now),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Some attempt holds an unexpired lease.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && !self.is_expired(now)
    }

    /// A live lease held by someone other than `owner`.
    pub fn is_held_by_other(&self, owner: Uuid, now: DateTime<Utc>) -> bool {
        match self.lease_owner {
            Some(holder) => holder != owner && !self.is_expired(now),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// No active checkpoint existed.
    Created,
    /// Same owner came back, or the row was reclaimed and unowned.
    Resumed,
    /// Another owner's lease had expired.
    TakenOver,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub checkpoint: Checkpoint,
    pub outcome: AcquireOutcome,
}
