//! Domain types for the waiting room.
//!
//! # Lifecycle
//!
//! ```text
//! NotInQueue ──enter──▶ Waiting ──promote──▶ Enterable ──complete──▶ Completed
//!      ▲                  │                     │
//!      │                  └──exit──┐            └──exit / lapse──▶ Expired
//!      └───────────────────────────┘
//! ```
//!
//! `Waiting` exists only in the fast store. `Enterable` is mirrored durably
//! as an [`Entry`], and the two terminal states are durable only.

use crate::error::{QueueError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Longest grant a queue may hand out.
pub const MAX_GRANT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

// ═══════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════

/// Identifier of an admission queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(Uuid);

impl QueueId {
    /// Creates a new random `QueueId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `QueueId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a durable entry row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Creates a new random `EntryId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EntryId` from a `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of the protected resource (e.g. a performance).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a new `ResourceId`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the resource ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a user, issued by the member system.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a new `UserId`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the user ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Scores
// ═══════════════════════════════════════════════════════════════════════

/// Sorted-set score for an instant (milliseconds since the Unix epoch).
#[must_use]
pub fn to_score(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Instant for a sorted-set score.
///
/// # Errors
///
/// Returns [`QueueError::Internal`] if the score is outside the representable range.
pub fn from_score(score: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(score)
        .ok_or_else(|| QueueError::Internal(format!("score out of range: {score}")))
}

// ═══════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════

/// Admission policy of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Maximum number of users holding a valid grant at once.
    pub capacity: u32,
    /// How long a grant stays valid after promotion.
    pub grant_lifetime: Duration,
    /// Maximum candidates examined per promotion run.
    pub batch_size: u32,
    /// Minimum time between promotion runs for this queue.
    pub promotion_interval: Duration,
}

impl QueueSettings {
    /// Create settings with the given capacity and grant lifetime.
    ///
    /// Batch size defaults to 100 and the promotion interval to one second.
    #[must_use]
    pub const fn new(capacity: u32, grant_lifetime: Duration) -> Self {
        Self {
            capacity,
            grant_lifetime,
            batch_size: 100,
            promotion_interval: Duration::from_secs(1),
        }
    }

    /// Set the promotion batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the promotion interval.
    #[must_use]
    pub const fn with_promotion_interval(mut self, interval: Duration) -> Self {
        self.promotion_interval = interval;
        self
    }

    /// Check the queue invariants.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidSettings`] if capacity or batch size is zero,
    /// the grant lifetime is shorter than a millisecond or longer than
    /// [`MAX_GRANT_LIFETIME`], or the promotion interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(QueueError::InvalidSettings("capacity must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(QueueError::InvalidSettings("batch size must be at least 1".into()));
        }
        if self.grant_lifetime < Duration::from_millis(1) {
            return Err(QueueError::InvalidSettings(
                "grant lifetime must be positive".into(),
            ));
        }
        if self.grant_lifetime > MAX_GRANT_LIFETIME {
            return Err(QueueError::InvalidSettings(format!(
                "grant lifetime must not exceed {}s",
                MAX_GRANT_LIFETIME.as_secs()
            )));
        }
        if self.promotion_interval.is_zero() {
            return Err(QueueError::InvalidSettings(
                "promotion interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Grant lifetime as a `chrono` delta.
    #[must_use]
    pub fn grant_delta(&self) -> TimeDelta {
        // Validated settings are bounded by MAX_GRANT_LIFETIME.
        TimeDelta::from_std(self.grant_lifetime).unwrap_or_else(|_| TimeDelta::zero())
    }

    /// Promotion interval as a `chrono` delta.
    #[must_use]
    pub fn promotion_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.promotion_interval).unwrap_or(TimeDelta::MAX)
    }
}

/// Durable admission queue for one protected resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    /// Queue identifier.
    pub id: QueueId,
    /// Protected resource (unique across queues).
    pub resource_id: ResourceId,
    /// Admission policy.
    pub settings: QueueSettings,
    /// When the queue was created.
    pub created_at: DateTime<Utc>,
    /// When the settings last changed.
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Durable Entries
// ═══════════════════════════════════════════════════════════════════════

/// Durable status of an entry. `Waiting` is deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Holds a grant (mirrors the fast store; may lag it).
    Enterable,
    /// Grant lapsed or was abandoned. Terminal.
    Expired,
    /// Grant was consumed. Terminal.
    Completed,
}

impl EntryStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Enterable => "enterable",
            Self::Expired => "expired",
            Self::Completed => "completed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "enterable" => Ok(Self::Enterable),
            "expired" => Ok(Self::Expired),
            "completed" => Ok(Self::Completed),
            _ => Err(QueueError::Database(format!("Invalid entry status: {s}"))),
        }
    }

    /// Returns `true` for `Expired` and `Completed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Completed)
    }
}

/// Durable record of one user's participation cycle in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Row identifier.
    pub id: EntryId,
    /// Owning queue.
    pub queue_id: QueueId,
    /// Participating user.
    pub user_id: UserId,
    /// Current status.
    pub status: EntryStatus,
    /// When the user joined the waiting set.
    pub joined_at: DateTime<Utc>,
    /// When the grant was issued.
    pub granted_at: DateTime<Utc>,
    /// When the grant lapses.
    pub expires_at: DateTime<Utc>,
    /// When the grant was consumed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the entry was marked expired.
    pub expired_at: Option<DateTime<Utc>>,
}

impl Entry {
    /// Returns `true` if the entry is `Enterable` and its grant has not lapsed.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Enterable && self.expires_at > now
    }
}

/// Data for a new durable entry row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGrant {
    /// Owning queue.
    pub queue_id: QueueId,
    /// Promoted user.
    pub user_id: UserId,
    /// Arrival instant (waiting-set score).
    pub joined_at: DateTime<Utc>,
    /// Promotion instant.
    pub granted_at: DateTime<Utc>,
    /// Grant expiry instant (enterable-set score).
    pub expires_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Fast Store Outcomes
// ═══════════════════════════════════════════════════════════════════════

/// A member of the enterable set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Grant holder.
    pub user_id: UserId,
    /// Grant expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// Where a user currently sits in the fast store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// In the waiting set at the given 0-based rank.
    Waiting {
        /// 0-based ordinal among waiting members.
        rank: u64,
    },
    /// In the enterable set; the grant may already have lapsed.
    Granted {
        /// Grant expiry instant.
        expires_at: DateTime<Utc>,
        /// Arrival instant of the join this grant was promoted from, if
        /// one is on record.
        last_joined: Option<DateTime<Utc>>,
    },
    /// In neither set.
    Absent {
        /// Arrival instant of the user's most recent join, if one is on
        /// record. Durable rows from before it belong to earlier cycles.
        last_joined: Option<DateTime<Utc>>,
    },
}

/// Result of the atomic join step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Inserted into the waiting set.
    Joined {
        /// 0-based rank after insertion.
        rank: u64,
    },
    /// Already waiting; nothing changed.
    AlreadyWaiting {
        /// Current 0-based rank.
        rank: u64,
    },
    /// Already holds a valid grant; nothing changed.
    AlreadyEnterable {
        /// Grant expiry instant.
        expires_at: DateTime<Utc>,
    },
}

/// What a leave step removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Departure {
    /// The user was removed from the waiting set.
    pub left_waiting: bool,
    /// Expiry of the enterable member that was removed, if any.
    pub revoked_grant: Option<DateTime<Utc>>,
}

/// Result of the atomic promote primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Moved from waiting to enterable.
    Moved {
        /// Arrival instant the user held in the waiting set.
        joined_at: DateTime<Utc>,
    },
    /// The user was not waiting (exited or already promoted). No mutation.
    Skipped,
    /// Capacity is exhausted. No mutation.
    RejectedFull,
}

impl PromoteOutcome {
    /// Label used for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Moved { .. } => "moved",
            Self::Skipped => "skipped",
            Self::RejectedFull => "rejected_full",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Request-Facing Results
// ═══════════════════════════════════════════════════════════════════════

/// A user's status in a queue as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Position {
    /// Queued behind earlier arrivals.
    Waiting {
        /// 1-based position among waiting users.
        rank: u64,
        /// Position reported to the user (equal to `rank`).
        count_ahead: u64,
    },
    /// Holds a valid grant.
    Enterable {
        /// Grant expiry instant.
        expires_at: DateTime<Utc>,
    },
    /// Last cycle ended without completion.
    Expired,
    /// Last cycle consumed its grant.
    Completed,
    /// No participation on record.
    NotInQueue,
}

impl Position {
    /// Build a `Waiting` position from a 0-based waiting-set rank.
    #[must_use]
    pub const fn waiting(zero_based_rank: u64) -> Self {
        let rank = zero_based_rank + 1;
        Self::Waiting {
            rank,
            count_ahead: rank,
        }
    }

    /// Status label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting { .. } => "waiting",
            Self::Enterable { .. } => "enterable",
            Self::Expired => "expired",
            Self::Completed => "completed",
            Self::NotInQueue => "not_in_queue",
        }
    }
}

/// Response to an enter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnterResponse {
    /// Queue guarding the requested resource.
    pub queue_id: QueueId,
    /// Status after the request.
    pub position: Position,
}

/// Result of consuming a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteOutcome {
    /// The grant was consumed and its capacity released.
    Completed,
    /// The user holds no valid grant; nothing changed.
    GrantNotActive,
}

/// Result of a voluntary exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Removed from the waiting set.
    LeftWaiting,
    /// Gave up a valid grant; the entry is now expired.
    LeftEnterable,
    /// Nothing to leave.
    NotInQueue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_enforce_queue_invariants() {
        let ok = QueueSettings::new(2, Duration::from_secs(300));
        assert!(ok.validate().is_ok());

        assert!(QueueSettings::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(QueueSettings::new(1, Duration::ZERO).validate().is_err());
        assert!(
            QueueSettings::new(1, MAX_GRANT_LIFETIME + Duration::from_secs(1))
                .validate()
                .is_err()
        );
        assert!(
            QueueSettings::new(1, Duration::from_secs(1))
                .with_batch_size(0)
                .validate()
                .is_err()
        );
        assert!(
            QueueSettings::new(1, Duration::from_secs(1))
                .with_promotion_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn grant_delta_matches_lifetime() {
        let settings = QueueSettings::new(1, Duration::from_millis(1500));
        assert_eq!(settings.grant_delta(), TimeDelta::milliseconds(1500));
    }

    #[test]
    fn entry_status_round_trips_through_db_strings() {
        for status in [EntryStatus::Enterable, EntryStatus::Expired, EntryStatus::Completed] {
            assert_eq!(EntryStatus::parse(status.as_str()), Ok(status));
        }
        assert!(EntryStatus::parse("waiting").is_err());
        assert!(EntryStatus::Completed.is_terminal());
        assert!(!EntryStatus::Enterable.is_terminal());
    }

    #[test]
    fn waiting_position_is_one_based() {
        assert_eq!(
            Position::waiting(0),
            Position::Waiting {
                rank: 1,
                count_ahead: 1
            }
        );
    }

    #[test]
    fn entry_liveness_uses_strict_expiry() {
        let now = Utc::now();
        let entry = Entry {
            id: EntryId::new(),
            queue_id: QueueId::new(),
            user_id: UserId::new("u1"),
            status: EntryStatus::Enterable,
            joined_at: now,
            granted_at: now,
            expires_at: now,
            completed_at: None,
            expired_at: None,
        };
        assert!(!entry.is_live_at(now));
        assert!(entry.is_live_at(now - TimeDelta::milliseconds(1)));
    }

    #[allow(clippy::unwrap_used)]
    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn scores_round_trip_at_millisecond_precision(
                ms in -8_000_000_000_000i64..8_000_000_000_000
            ) {
                let instant = from_score(ms).unwrap();
                prop_assert_eq!(to_score(instant), ms);
            }

            #[test]
            fn validate_accepts_exactly_the_invariant_settings(
                capacity in 0u32..4,
                batch_size in 0u32..4,
                lifetime_ms in 0u64..=(u64::try_from(MAX_GRANT_LIFETIME.as_millis()).unwrap() + 2),
                interval_ms in 0u64..3,
            ) {
                let settings = QueueSettings::new(capacity, Duration::from_millis(lifetime_ms))
                    .with_batch_size(batch_size)
                    .with_promotion_interval(Duration::from_millis(interval_ms));
                let lifetime = Duration::from_millis(lifetime_ms);
                let expected = capacity >= 1
                    && batch_size >= 1
                    && lifetime_ms >= 1
                    && lifetime <= MAX_GRANT_LIFETIME
                    && interval_ms >= 1;

                prop_assert_eq!(settings.validate().is_ok(), expected);
                if expected {
                    prop_assert_eq!(
                        settings.grant_delta().num_milliseconds(),
                        i64::try_from(lifetime_ms).unwrap()
                    );
                }
            }
        }
    }
}
