//! Request-path operations of the waiting room.
//!
//! The fast store is the authority on who is waiting and who holds a valid
//! grant; the durable store only answers for users the fast store no longer
//! knows (their last cycle's terminal status). Every mutation that touches
//! both stores is ordered so that a retry after a partial failure converges
//! on the same result.

use chrono::{DateTime, Utc};
use std::time::Instant;
use waiting_room_core::environment::Clock;
use waiting_room_core::providers::{DurableStore, FastStore};
use waiting_room_core::{
    CompleteOutcome, EnterResponse, EntryStatus, ExitOutcome, JoinOutcome, Membership, NewGrant,
    Position, Queue, QueueError, QueueId, QueueSettings, ResourceId, Result, UserId,
};

use crate::environment::QueueEnvironment;
use crate::metrics::RequestMetrics;

/// Entry point for enter, position, complete and exit requests, and for
/// queue administration.
pub struct QueueOrchestrator<F, D, C> {
    env: QueueEnvironment<F, D, C>,
}

impl<F, D, C> Clone for QueueOrchestrator<F, D, C> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
        }
    }
}

impl<F, D, C> QueueOrchestrator<F, D, C>
where
    F: FastStore,
    D: DurableStore,
    C: Clock,
{
    /// Create an orchestrator.
    pub const fn new(env: QueueEnvironment<F, D, C>) -> Self {
        Self { env }
    }

    // ═══════════════════════════════════════════════════════════
    // Queue Administration
    // ═══════════════════════════════════════════════════════════

    /// Create the queue guarding `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidSettings`] for invalid settings and
    /// [`QueueError::DuplicateResource`] if the resource already has a queue.
    pub async fn create_queue(
        &self,
        resource_id: ResourceId,
        settings: QueueSettings,
    ) -> Result<Queue> {
        settings.validate()?;
        let now = self.env.clock.now();
        let queue = Queue {
            id: QueueId::new(),
            resource_id,
            settings,
            created_at: now,
            updated_at: now,
        };

        self.env.durable.create_queue(&queue).await?;
        tracing::info!(
            queue_id = %queue.id,
            resource_id = %queue.resource_id,
            capacity = queue.settings.capacity,
            "Queue created"
        );
        Ok(queue)
    }

    /// Replace a queue's settings. Takes effect on the next promotion run.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidSettings`] for invalid settings and
    /// [`QueueError::QueueNotFound`] for an unknown queue.
    pub async fn update_queue(&self, queue_id: QueueId, settings: QueueSettings) -> Result<Queue> {
        settings.validate()?;
        let queue = self
            .env
            .durable
            .update_queue(queue_id, &settings, self.env.clock.now())
            .await?;
        tracing::info!(
            queue_id = %queue_id,
            capacity = settings.capacity,
            "Queue settings updated"
        );
        Ok(queue)
    }

    /// Delete a queue, its entry history and its fast-store sets.
    ///
    /// Returns `false` if no such queue was on record. The fast-store sets
    /// are dropped either way, so a retry after a partial failure finishes
    /// the job.
    ///
    /// # Errors
    ///
    /// Returns error if either store fails.
    pub async fn delete_queue(&self, queue_id: QueueId) -> Result<bool> {
        let existed = self.env.durable.delete_queue(queue_id).await?;
        self.env.fast.drop_queue(queue_id).await?;
        tracing::info!(queue_id = %queue_id, existed, "Queue deleted");
        Ok(existed)
    }

    /// Look up a queue by id.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store fails.
    pub async fn get_queue(&self, queue_id: QueueId) -> Result<Option<Queue>> {
        self.env.durable.get_queue(queue_id).await
    }

    /// Look up the queue guarding a resource.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store fails.
    pub async fn queue_for_resource(&self, resource_id: &ResourceId) -> Result<Option<Queue>> {
        self.env.durable.get_queue_by_resource(resource_id).await
    }

    /// All queues.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store fails.
    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        self.env.durable.list_queues().await
    }

    // ═══════════════════════════════════════════════════════════
    // Request Path
    // ═══════════════════════════════════════════════════════════

    /// Join the queue guarding `resource_id`, or report the current status
    /// if the user is already waiting or already holds a valid grant.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::QueueNotFound`] for an unknown resource, or a
    /// store error.
    pub async fn enter(&self, resource_id: &ResourceId, user_id: &UserId) -> Result<EnterResponse> {
        let started = Instant::now();
        let result = self.enter_inner(resource_id, user_id).await;
        observe("enter", &result, started, |response| response.position.as_str());
        result
    }

    async fn enter_inner(
        &self,
        resource_id: &ResourceId,
        user_id: &UserId,
    ) -> Result<EnterResponse> {
        let queue = self
            .env
            .durable
            .get_queue_by_resource(resource_id)
            .await?
            .ok_or(QueueError::QueueNotFound)?;

        let outcome = self.env.fast.join(queue.id, user_id, self.env.clock.now()).await?;
        let position = match outcome {
            JoinOutcome::Joined { rank } => {
                tracing::debug!(
                    queue_id = %queue.id,
                    user_id = %user_id,
                    rank,
                    "User joined queue"
                );
                Position::waiting(rank)
            }
            JoinOutcome::AlreadyWaiting { rank } => Position::waiting(rank),
            JoinOutcome::AlreadyEnterable { expires_at } => Position::Enterable { expires_at },
        };

        Ok(EnterResponse {
            queue_id: queue.id,
            position,
        })
    }

    /// Report where a user stands in a queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::QueueNotFound`] if the user has no record and
    /// the queue does not exist, or a store error.
    pub async fn position(&self, queue_id: QueueId, user_id: &UserId) -> Result<Position> {
        let started = Instant::now();
        let result = self.position_inner(queue_id, user_id).await;
        observe("position", &result, started, Position::as_str);
        result
    }

    async fn position_inner(&self, queue_id: QueueId, user_id: &UserId) -> Result<Position> {
        let now = self.env.clock.now();
        let (lapsed_grant, last_joined) = match self.env.fast.membership(queue_id, user_id).await? {
            Membership::Waiting { rank } => return Ok(Position::waiting(rank)),
            Membership::Granted { expires_at, .. } if expires_at > now => {
                return Ok(Position::Enterable { expires_at });
            }
            Membership::Granted {
                expires_at,
                last_joined,
            } => (Some(expires_at), last_joined),
            Membership::Absent { last_joined } => (None, last_joined),
        };

        let latest = self.env.durable.latest_entry(queue_id, user_id).await?;

        // The fast store still holds this cycle's grant, already lapsed.
        if let Some(expires_at) = lapsed_grant {
            let completed = latest.is_some_and(|entry| {
                entry.expires_at == expires_at && entry.status == EntryStatus::Completed
            });
            return Ok(if completed {
                Position::Completed
            } else {
                Position::Expired
            });
        }

        let Some(entry) = latest else {
            return match self.env.durable.get_queue(queue_id).await? {
                Some(_) => Ok(Position::NotInQueue),
                None => Err(QueueError::QueueNotFound),
            };
        };

        // Rows older than the latest join belong to an earlier cycle; this
        // one ended while waiting.
        if last_joined.is_some_and(|joined| entry.joined_at < joined) {
            return Ok(Position::NotInQueue);
        }

        Ok(match entry.status {
            EntryStatus::Completed => Position::Completed,
            // An enterable row the fast store does not confirm has lapsed.
            EntryStatus::Expired | EntryStatus::Enterable => Position::Expired,
        })
    }

    /// Consume a valid grant and release its capacity.
    ///
    /// # Errors
    ///
    /// Returns a store error. The grant stays valid in that case and the
    /// call may be retried.
    pub async fn complete(&self, queue_id: QueueId, user_id: &UserId) -> Result<CompleteOutcome> {
        let started = Instant::now();
        let result = self.complete_inner(queue_id, user_id).await;
        observe("complete", &result, started, |outcome| match outcome {
            CompleteOutcome::Completed => "completed",
            CompleteOutcome::GrantNotActive => "grant_not_active",
        });
        result
    }

    async fn complete_inner(&self, queue_id: QueueId, user_id: &UserId) -> Result<CompleteOutcome> {
        let now = self.env.clock.now();
        let (expires_at, last_joined) = match self.env.fast.membership(queue_id, user_id).await? {
            Membership::Granted {
                expires_at,
                last_joined,
            } if expires_at > now => (expires_at, last_joined),
            _ => return Ok(CompleteOutcome::GrantNotActive),
        };

        let completed = match self.env.durable.complete_grant(queue_id, user_id, now).await? {
            Some(_) => true,
            None => {
                self.record_missing_completion(queue_id, user_id, expires_at, last_joined, now)
                    .await?
            }
        };
        if !completed {
            self.env.fast.revoke_grant(queue_id, user_id).await?;
            tracing::warn!(
                queue_id = %queue_id,
                user_id = %user_id,
                "Grant already expired in the durable store"
            );
            return Ok(CompleteOutcome::GrantNotActive);
        }

        // Durable first: a crash here leaves a completed row and a grant the
        // next call or the sweep removes.
        self.env.fast.revoke_grant(queue_id, user_id).await?;
        tracing::info!(queue_id = %queue_id, user_id = %user_id, "Grant completed");
        Ok(CompleteOutcome::Completed)
    }

    /// Record a completion for a grant whose durable row is missing or was
    /// already completed by an earlier attempt of this call.
    ///
    /// Returns `false` if the grant's row is already expired.
    async fn record_missing_completion(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        expires_at: DateTime<Utc>,
        last_joined: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let latest = self.env.durable.latest_entry(queue_id, user_id).await?;
        if let Some(entry) = latest.filter(|entry| entry.expires_at == expires_at) {
            return Ok(entry.status == EntryStatus::Completed);
        }

        let lifetime = self
            .env
            .durable
            .get_queue(queue_id)
            .await?
            .ok_or(QueueError::QueueNotFound)?
            .settings
            .grant_delta();
        // The lifetime may have changed since the grant; never place the
        // grant before the join it was promoted from.
        let joined_at = last_joined.unwrap_or(expires_at - lifetime);
        let granted_at = (expires_at - lifetime).max(joined_at);

        tracing::warn!(
            queue_id = %queue_id,
            user_id = %user_id,
            "Completing a grant with no durable record"
        );
        self.env
            .durable
            .record_completion(
                &NewGrant {
                    queue_id,
                    user_id: user_id.clone(),
                    joined_at,
                    granted_at,
                    expires_at,
                },
                now,
            )
            .await?;
        Ok(true)
    }

    /// Leave the queue, giving up a waiting place or a valid grant.
    ///
    /// # Errors
    ///
    /// Returns a store error; the call may be retried.
    pub async fn exit(&self, queue_id: QueueId, user_id: &UserId) -> Result<ExitOutcome> {
        let started = Instant::now();
        let result = self.exit_inner(queue_id, user_id).await;
        observe("exit", &result, started, |outcome| match outcome {
            ExitOutcome::LeftWaiting => "left_waiting",
            ExitOutcome::LeftEnterable => "left_enterable",
            ExitOutcome::NotInQueue => "not_in_queue",
        });
        result
    }

    async fn exit_inner(&self, queue_id: QueueId, user_id: &UserId) -> Result<ExitOutcome> {
        let now = self.env.clock.now();
        let departure = self.env.fast.leave(queue_id, user_id).await?;
        if departure.left_waiting {
            tracing::debug!(queue_id = %queue_id, user_id = %user_id, "User left the waiting set");
            return Ok(ExitOutcome::LeftWaiting);
        }

        let expired = self.env.durable.expire_grant(queue_id, user_id, now).await?;
        let held_until = departure
            .revoked_grant
            .or_else(|| expired.map(|entry| entry.expires_at));

        if held_until.is_some_and(|expires_at| expires_at > now) {
            tracing::info!(queue_id = %queue_id, user_id = %user_id, "User gave up a grant");
            Ok(ExitOutcome::LeftEnterable)
        } else {
            Ok(ExitOutcome::NotInQueue)
        }
    }
}

fn observe<T>(
    operation: &'static str,
    result: &Result<T>,
    started: Instant,
    label: impl FnOnce(&T) -> &'static str,
) {
    let outcome = match result {
        Ok(value) => label(value),
        Err(QueueError::QueueNotFound) => "queue_not_found",
        Err(e) => {
            tracing::warn!(operation, error = ?e, "Request failed");
            "error"
        }
    };
    RequestMetrics::record(operation, outcome, started.elapsed());
}
