//! Fast ordered store trait.

use crate::error::Result;
use crate::types::{Departure, Grant, JoinOutcome, Membership, PromoteOutcome, QueueId, UserId};
use chrono::{DateTime, Utc};

/// Per-queue waiting set and enterable set.
///
/// This trait abstracts over the low-latency store (Redis sorted sets).
///
/// # Implementation Notes
///
/// - Waiting members are ordered by arrival; ties are impossible because
///   each join scores at `max(now, tail + 1ms)`
/// - Enterable members are scored by grant expiry; a member whose expiry
///   is `<= now` is stale and never counts toward capacity
/// - `join`, `promote`, `requeue` and `membership` must each be atomic
///   with respect to every other operation on the same queue
/// - A user is never in both sets of one queue
pub trait FastStore: Send + Sync {
    /// Insert a user into the waiting set unless already present.
    ///
    /// A stale enterable member for the same user is dropped first so the
    /// user can start a new cycle. A valid grant wins and nothing changes.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn join(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<JoinOutcome>> + Send;

    /// Remove a user from both sets.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn leave(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<Departure>> + Send;

    /// Read a user's membership in one atomic step.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn membership(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<Membership>> + Send;

    /// Number of waiting members.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn waiting_len(
        &self,
        queue_id: QueueId,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// The first `limit` waiting members in arrival order.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn waiting_head(
        &self,
        queue_id: QueueId,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<UserId>>> + Send;

    /// Number of enterable members with expiry strictly after `now`.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn count_active_grants(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Enterable members with expiry strictly after `now`.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn active_grants(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Grant>>> + Send;

    /// Remove enterable members with expiry `<= now` and return them.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn purge_expired_grants(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Grant>>> + Send;

    /// Remove a user's enterable member.
    ///
    /// # Returns
    ///
    /// The removed member's expiry, or `None` if there was none.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn revoke_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Atomically move a waiting user into the enterable set.
    ///
    /// In one indivisible step: if the user is not waiting the result is
    /// [`PromoteOutcome::Skipped`]; if at least `capacity` members have
    /// expiry after `now` the result is [`PromoteOutcome::RejectedFull`];
    /// otherwise the user leaves the waiting set and enters the enterable
    /// set scored at `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    /// The outcome of a timed-out call is unknown.
    fn promote(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        capacity: u32,
    ) -> impl std::future::Future<Output = Result<PromoteOutcome>> + Send;

    /// Undo a promotion: drop the user's enterable member and put them back
    /// in the waiting set at their original arrival instant.
    ///
    /// # Returns
    ///
    /// `true` if the user was re-inserted into the waiting set.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn requeue(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        joined_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Delete both sets of a queue.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable or the call times out.
    fn drop_queue(
        &self,
        queue_id: QueueId,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
