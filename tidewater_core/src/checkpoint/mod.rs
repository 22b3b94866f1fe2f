//! Checkpoint Store: per-(function, table) progress marker and mutual-exclusion lease.
//!
//! At most one `active` row exists per key. The active row's `lease_owner` and
//! `expires_at` serialize work on the table; `version` is bumped on every write so
//! stores can apply updates with compare-and-swap.
//!
//! The transition rules live here as pure functions so every store applies them the
//! same way.

pub mod models;
pub mod traits;

pub use models::{
    AcquireOutcome, Acquired, Checkpoint, CheckpointKey, CheckpointStatus, Lease, SyncCursor,
};
pub use traits::CheckpointStore;

use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// Decide how an existing active checkpoint is taken by `lease`.
pub fn resolve_acquire(
    existing: &Checkpoint,
    lease: &Lease,
    now: DateTime<Utc>,
) -> Result<Acquired> {
    if existing.status != CheckpointStatus::Active {
        return Err(Error::Conflict(format!(
            "checkpoint {} is not active",
            existing.id
        )));
    }
    if existing.is_held_by_other(lease.owner, now) {
        return Err(Error::Conflict(format!(
            "refresh already in progress for {}",
            existing.key
        )));
    }
    let outcome = match existing.lease_owner {
        Some(holder) if holder != lease.owner => AcquireOutcome::TakenOver,
        _ => AcquireOutcome::Resumed,
    };
    let mut next = existing.clone();
    next.lease_owner = Some(lease.owner);
    next.expires_at = lease.expires_at(now);
    next.version = existing.version + 1;
    next.updated_at = now;
    Ok(Acquired {
        checkpoint: next,
        outcome,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceDecision {
    /// Write this new state.
    Apply(Checkpoint),
    /// The advance was already applied; return the stored state unchanged.
    Replay(Checkpoint),
}

/// Decide the result of advancing `expected` (the caller's view) given the stored row.
pub fn resolve_advance(
    current: &Checkpoint,
    expected: &Checkpoint,
    cursor: &SyncCursor,
    rows_so_far: u64,
    lease: &Lease,
    now: DateTime<Utc>,
) -> Result<AdvanceDecision> {
    if current.status != CheckpointStatus::Active {
        return Err(Error::Conflict(format!(
            "checkpoint {} is no longer active",
            current.id
        )));
    }
    if current.lease_owner != Some(lease.owner) {
        return Err(Error::Conflict(format!(
            "lease on {} was taken by another attempt",
            current.key
        )));
    }
    if current.cursor == *cursor && current.last_processed_row == rows_so_far {
        return Ok(AdvanceDecision::Replay(current.clone()));
    }
    if current.version != expected.version {
        return Err(Error::Conflict(format!(
            "checkpoint {} moved from version {} to {}",
            current.id, expected.version, current.version
        )));
    }
    let mut next = current.clone();
    next.cursor = cursor.clone();
    next.last_processed_row = rows_so_far;
    next.expires_at = lease.expires_at(now);
    next.version = current.version + 1;
    next.updated_at = now;
    Ok(AdvanceDecision::Apply(next))
}

/// Completed form of an active checkpoint held by `lease`.
pub fn resolve_complete(
    current: &Checkpoint,
    lease: &Lease,
    now: DateTime<Utc>,
) -> Result<Checkpoint> {
    if current.status != CheckpointStatus::Active {
        return Err(Error::Conflict(format!(
            "checkpoint {} is not active",
            current.id
        )));
    }
    if current.lease_owner != Some(lease.owner) {
        return Err(Error::Conflict(format!(
            "lease on {} was taken by another attempt",
            current.key
        )));
    }
    let mut done = current.clone();
    done.status = CheckpointStatus::Completed;
    done.total_rows = Some(current.last_processed_row);
    done.lease_owner = None;
    done.version = current.version + 1;
    done.updated_at = now;
    Ok(done)
}

/// Unowned form of an active checkpoint held by `lease`, with cursor and row count kept.
/// `None` when `lease` does not hold the row, so releasing is a no-op.
pub fn resolve_release(current: &Checkpoint, lease: &Lease, now: DateTime<Utc>) -> Option<Checkpoint> {
    if current.status != CheckpointStatus::Active || current.lease_owner != Some(lease.owner) {
        return None;
    }
    let mut next = current.clone();
    next.lease_owner = None;
    next.expires_at = now;
    next.version = current.version + 1;
    next.updated_at = now;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn active(owner: Uuid, now: DateTime<Utc>) -> Checkpoint {
        let key = CheckpointKey::new("asin_performance_data", "public", "asin_performance").unwrap();
        Checkpoint::new_active(
            key,
            SyncCursor::default(),
            &Lease::new(owner, Duration::seconds(600)),
            now,
        )
    }

    #[test]
    fn acquire_rejects_live_foreign_lease() {
        let now = Utc::now();
        let cp = active(Uuid::new_v4(), now);
        let other = Lease::new(Uuid::new_v4(), Duration::seconds(600));
        let err = resolve_acquire(&cp, &other, now).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn acquire_takes_over_expired_lease_and_keeps_cursor() {
        let now = Utc::now();
        let mut cp = active(Uuid::new_v4(), now);
        cp.cursor = SyncCursor {
            watermark: Some("2024-01-05".into()),
            skip: 1,
        };
        let later = now + Duration::seconds(601);
        let lease = Lease::new(Uuid::new_v4(), Duration::seconds(600));
        let got = resolve_acquire(&cp, &lease, later).unwrap();
        assert_eq!(got.outcome, AcquireOutcome::TakenOver);
        assert_eq!(got.checkpoint.cursor, cp.cursor);
        assert_eq!(got.checkpoint.lease_owner, Some(lease.owner));
        assert_eq!(got.checkpoint.version, cp.version + 1);
    }

    #[test]
    fn acquire_resumes_unowned_row() {
        let now = Utc::now();
        let mut cp = active(Uuid::new_v4(), now);
        cp.lease_owner = None;
        let lease = Lease::new(Uuid::new_v4(), Duration::seconds(600));
        let got = resolve_acquire(&cp, &lease, now).unwrap();
        assert_eq!(got.outcome, AcquireOutcome::Resumed);
    }

    #[test]
    fn advance_replay_is_a_noop() {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let lease = Lease::new(owner, Duration::seconds(600));
        let cp = active(owner, now);
        let cursor = SyncCursor {
            watermark: Some("2024-01-02".into()),
            skip: 1,
        };
        let AdvanceDecision::Apply(next) =
            resolve_advance(&cp, &cp, &cursor, 10, &lease, now).unwrap()
        else {
            panic!("expected apply");
        };
        // Same write again with a stale expected version.
        let again = resolve_advance(&next, &cp, &cursor, 10, &lease, now).unwrap();
        assert_eq!(again, AdvanceDecision::Replay(next));
    }

    #[test]
    fn advance_detects_stale_version() {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let lease = Lease::new(owner, Duration::seconds(600));
        let cp = active(owner, now);
        let mut moved = cp.clone();
        moved.version += 1;
        moved.last_processed_row = 5;
        let cursor = SyncCursor {
            watermark: Some("x".into()),
            skip: 1,
        };
        let err = resolve_advance(&moved, &cp, &cursor, 10, &lease, now).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn release_keeps_progress_and_ignores_foreign_leases() {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let lease = Lease::new(owner, Duration::seconds(600));
        let mut cp = active(owner, now);
        cp.cursor = SyncCursor {
            watermark: Some("2024-05-02".into()),
            skip: 1,
        };
        cp.last_processed_row = 3;

        let stranger = Lease::new(Uuid::new_v4(), Duration::seconds(600));
        assert_eq!(resolve_release(&cp, &stranger, now), None);

        let released = resolve_release(&cp, &lease, now).unwrap();
        assert_eq!(released.lease_owner, None);
        assert_eq!(released.cursor, cp.cursor);
        assert_eq!(released.last_processed_row, 3);
        assert_eq!(released.version, cp.version + 1);
        assert!(!released.has_live_lease(now));
        assert!(cp.has_live_lease(now));
    }

    #[test]
    fn complete_releases_lease() {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let lease = Lease::new(owner, Duration::seconds(600));
        let mut cp = active(owner, now);
        cp.last_processed_row = 7;
        let done = resolve_complete(&cp, &lease, now).unwrap();
        assert_eq!(done.status, CheckpointStatus::Completed);
        assert_eq!(done.lease_owner, None);
        assert_eq!(done.total_rows, Some(7));
    }
}
