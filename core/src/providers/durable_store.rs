//! Durable queue and entry repository trait.

use crate::error::Result;
use crate::types::{Entry, NewGrant, Queue, QueueId, QueueSettings, ResourceId, UserId};
use chrono::{DateTime, Utc};

/// Durable store for queue configuration and entry history.
///
/// This trait abstracts over the relational store (`PostgreSQL`).
///
/// # Implementation Notes
///
/// - At most one `Enterable` entry per (queue, user); terminal rows are
///   never updated again and never deleted (except by queue deletion)
/// - Status transitions only ever go `Enterable → Expired` or
///   `Enterable → Completed`
pub trait DurableStore: Send + Sync {
    /// Insert a new queue.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - A queue already exists for the resource → `QueueError::DuplicateResource`
    /// - Database query fails
    fn create_queue(
        &self,
        queue: &Queue,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Replace a queue's settings.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Queue does not exist → `QueueError::QueueNotFound`
    /// - Database query fails
    fn update_queue(
        &self,
        queue_id: QueueId,
        settings: &QueueSettings,
        updated_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Queue>> + Send;

    /// Delete a queue and all its entries.
    ///
    /// # Returns
    ///
    /// `true` if a queue was deleted.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn delete_queue(
        &self,
        queue_id: QueueId,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Get a queue by ID.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn get_queue(
        &self,
        queue_id: QueueId,
    ) -> impl std::future::Future<Output = Result<Option<Queue>>> + Send;

    /// Get the queue guarding a resource.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn get_queue_by_resource(
        &self,
        resource_id: &ResourceId,
    ) -> impl std::future::Future<Output = Result<Option<Queue>>> + Send;

    /// List all queues.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn list_queues(&self) -> impl std::future::Future<Output = Result<Vec<Queue>>> + Send;

    /// Record a fresh `Enterable` entry for a promotion.
    ///
    /// Any `Enterable` row still present for the same (queue, user) is
    /// marked `Expired` at `grant.granted_at` in the same transaction.
    ///
    /// A grant is identified by (queue, user, `expires_at`). Recording a
    /// grant that already has a row, whatever its status, returns that row
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn record_grant(
        &self,
        grant: &NewGrant,
    ) -> impl std::future::Future<Output = Result<Entry>> + Send;

    /// Most recent entry for a user in a queue, by grant time then expiry.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn latest_entry(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<Option<Entry>>> + Send;

    /// Transition the user's `Enterable` entry to `Completed`.
    ///
    /// # Returns
    ///
    /// The updated entry, or `None` if no `Enterable` entry exists.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn complete_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        completed_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<Entry>>> + Send;

    /// Insert an entry that is `Completed` from the start.
    ///
    /// Used when a valid grant is consumed before its `Enterable` row landed.
    /// If the grant's row exists after all it is completed in place when
    /// still `Enterable` and returned unchanged otherwise.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn record_completion(
        &self,
        grant: &NewGrant,
        completed_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Entry>> + Send;

    /// Transition the user's `Enterable` entry to `Expired`.
    ///
    /// # Returns
    ///
    /// The updated entry, or `None` if no `Enterable` entry exists.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn expire_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        expired_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<Entry>>> + Send;

    /// Expire up to `limit` `Enterable` entries with `expires_at <= now`.
    ///
    /// # Returns
    ///
    /// Number of entries transitioned.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn expire_overdue(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Up to `limit` `Enterable` entries of a queue, oldest grant first.
    ///
    /// # Errors
    ///
    /// Returns error if database query fails.
    fn enterable_entries(
        &self,
        queue_id: QueueId,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Entry>>> + Send;
}
