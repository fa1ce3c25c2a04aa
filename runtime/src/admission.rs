//! Promotion of waiting users into enterable grants for one queue.
//!
//! The engine reads a batch of candidates from the head of the waiting set
//! and calls the atomic promote primitive once per candidate. Capacity is
//! enforced inside that primitive, so the engine never counts grants itself.
//!
//! After every successful move the grant is written to the durable store.
//! If that write cannot be completed within the retry budget the user is put
//! back in the waiting set at their original arrival and the batch stops, so
//! the two stores never disagree about who was admitted.

use chrono::{DateTime, SubsecRound, Utc};
use std::time::Instant;
use waiting_room_core::environment::Clock;
use waiting_room_core::providers::{DurableStore, FastStore};
use waiting_room_core::{NewGrant, PromoteOutcome, Queue, QueueId, Result, UserId};

use crate::environment::QueueEnvironment;
use crate::metrics::AdmissionMetrics;
use crate::retry::{RetryPolicy, retry_transient};

/// What one promotion batch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionReport {
    /// Queue the batch ran against.
    pub queue_id: QueueId,
    /// Users granted entry, in promotion order.
    pub promoted: Vec<UserId>,
    /// Candidates that had already left the waiting set.
    pub skipped: u32,
    /// The batch stopped because the queue was full.
    pub capacity_reached: bool,
}

impl PromotionReport {
    fn new(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            promoted: Vec::new(),
            skipped: 0,
            capacity_reached: false,
        }
    }
}

/// Runs promotion batches.
pub struct AdmissionEngine<F, D, C> {
    env: QueueEnvironment<F, D, C>,
    grant_write_retry: RetryPolicy,
}

impl<F, D, C> AdmissionEngine<F, D, C>
where
    F: FastStore,
    D: DurableStore,
    C: Clock,
{
    /// Create an engine.
    pub const fn new(env: QueueEnvironment<F, D, C>, grant_write_retry: RetryPolicy) -> Self {
        Self {
            env,
            grant_write_retry,
        }
    }

    /// Promote up to `batch_size` users from the head of `queue`.
    ///
    /// # Errors
    ///
    /// Returns an error if the fast store fails, or if a promoted user's
    /// durable write fails after retries (the user is requeued first).
    pub async fn promote(&self, queue: &Queue) -> Result<PromotionReport> {
        let started = Instant::now();
        let queue_id = queue.id;
        let settings = &queue.settings;
        // Scores carry millisecond precision; truncate so both stores agree.
        let now = self.env.clock.now().trunc_subsecs(3);
        let expires_at = now + settings.grant_delta();

        let candidates = self.env.fast.waiting_head(queue_id, settings.batch_size).await?;
        let mut report = PromotionReport::new(queue_id);

        for user_id in candidates {
            let outcome = self
                .env
                .fast
                .promote(queue_id, &user_id, expires_at, now, settings.capacity)
                .await?;

            match outcome {
                PromoteOutcome::Moved { joined_at } => {
                    let grant = NewGrant {
                        queue_id,
                        user_id: user_id.clone(),
                        joined_at,
                        granted_at: now,
                        expires_at,
                    };
                    if let Err(e) = self.persist_grant(&grant).await {
                        record(&report);
                        return Err(e);
                    }
                    report.promoted.push(user_id);
                }
                PromoteOutcome::Skipped => report.skipped += 1,
                PromoteOutcome::RejectedFull => {
                    report.capacity_reached = true;
                    break;
                }
            }
        }

        record(&report);
        AdmissionMetrics::record_queue_duration(started.elapsed());
        tracing::debug!(
            queue_id = %queue_id,
            promoted = report.promoted.len(),
            skipped = report.skipped,
            capacity_reached = report.capacity_reached,
            "Promotion batch finished"
        );

        Ok(report)
    }

    async fn persist_grant(&self, grant: &NewGrant) -> Result<()> {
        let written = retry_transient(&self.grant_write_retry, "record_grant", move || {
            self.env.durable.record_grant(grant)
        })
        .await;

        let Err(write_error) = written else {
            tracing::info!(
                queue_id = %grant.queue_id,
                user_id = %grant.user_id,
                expires_at = %grant.expires_at,
                "Granted entry"
            );
            return Ok(());
        };

        AdmissionMetrics::record_grant_write_failure();
        tracing::error!(
            queue_id = %grant.queue_id,
            user_id = %grant.user_id,
            error = ?write_error,
            "Durable grant write failed, returning user to the waiting set"
        );
        self.rollback(grant.queue_id, &grant.user_id, grant.joined_at).await;

        Err(write_error)
    }

    async fn rollback(&self, queue_id: QueueId, user_id: &UserId, joined_at: DateTime<Utc>) {
        match self.env.fast.requeue(queue_id, user_id, joined_at).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    queue_id = %queue_id,
                    user_id = %user_id,
                    "Grant already gone, nothing to requeue"
                );
            }
            Err(e) => {
                // Divergence repair removes the orphaned grant later.
                tracing::error!(
                    queue_id = %queue_id,
                    user_id = %user_id,
                    error = ?e,
                    "Requeue failed"
                );
            }
        }
    }
}

fn record(report: &PromotionReport) {
    AdmissionMetrics::record_promotions(
        "moved",
        u64::try_from(report.promoted.len()).unwrap_or(u64::MAX),
    );
    AdmissionMetrics::record_promotions("skipped", u64::from(report.skipped));
    if report.capacity_reached {
        AdmissionMetrics::record_promotions("rejected_full", 1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;
    use waiting_room_core::{EntryStatus, Membership, QueueSettings, ResourceId};
    use waiting_room_testing::{InMemoryDurableStore, InMemoryFastStore, ManualClock, test_clock};

    type Env = QueueEnvironment<InMemoryFastStore, InMemoryDurableStore, ManualClock>;

    async fn setup(capacity: u32) -> (Env, Queue) {
        let env = QueueEnvironment::new(
            InMemoryFastStore::new(),
            InMemoryDurableStore::new(),
            test_clock(),
        );
        let now = env.clock.now();
        let queue = Queue {
            id: QueueId::new(),
            resource_id: ResourceId::new("checkout"),
            settings: QueueSettings::new(capacity, Duration::from_secs(60)).with_batch_size(10),
            created_at: now,
            updated_at: now,
        };
        env.durable.create_queue(&queue).await.unwrap();
        (env, queue)
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy::none()
    }

    #[tokio::test]
    async fn promotes_in_arrival_order_up_to_capacity() {
        let (env, queue) = setup(2).await;
        for name in ["a", "b", "c"] {
            env.fast.join(queue.id, &UserId::new(name), env.clock.now()).await.unwrap();
        }

        let engine = AdmissionEngine::new(env.clone(), no_retry());
        let report = engine.promote(&queue).await.unwrap();

        assert_eq!(report.promoted, vec![UserId::new("a"), UserId::new("b")]);
        assert!(report.capacity_reached);
        assert_eq!(
            env.fast.membership(queue.id, &UserId::new("c")).await.unwrap(),
            Membership::Waiting { rank: 0 }
        );

        let entry = env
            .durable
            .latest_entry(queue.id, &UserId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Enterable);
        assert_eq!(entry.expires_at - entry.granted_at, queue.settings.grant_delta());
    }

    #[tokio::test]
    async fn failed_durable_write_puts_user_back_in_line() {
        let (env, queue) = setup(5).await;
        for name in ["a", "b"] {
            env.fast.join(queue.id, &UserId::new(name), env.clock.now()).await.unwrap();
        }
        env.durable.fail_grant_writes(1);

        let engine = AdmissionEngine::new(env.clone(), no_retry());
        assert!(engine.promote(&queue).await.is_err());

        assert_eq!(
            env.fast.waiting_head(queue.id, 10).await.unwrap(),
            vec![UserId::new("a"), UserId::new("b")]
        );
        assert_eq!(env.fast.enterable_len(queue.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_write_failure_is_retried() {
        let (env, queue) = setup(5).await;
        env.fast.join(queue.id, &UserId::new("a"), env.clock.now()).await.unwrap();
        env.durable.fail_grant_writes(2);

        let retry = RetryPolicy::builder()
            .max_retries(3)
            .initial_delay(Duration::from_millis(1))
            .build();
        let engine = AdmissionEngine::new(env.clone(), retry);
        let report = engine.promote(&queue).await.unwrap();

        assert_eq!(report.promoted, vec![UserId::new("a")]);
    }

    #[tokio::test]
    async fn sub_millisecond_clock_is_truncated() {
        let (env, queue) = setup(1).await;
        env.clock.set(env.clock.now() + chrono::TimeDelta::microseconds(1_500));
        env.fast.join(queue.id, &UserId::new("a"), env.clock.now()).await.unwrap();

        AdmissionEngine::new(env.clone(), no_retry())
            .promote(&queue)
            .await
            .unwrap();

        let Membership::Granted { expires_at, .. } =
            env.fast.membership(queue.id, &UserId::new("a")).await.unwrap()
        else {
            unreachable!("user was promoted");
        };
        let entry = env
            .durable
            .latest_entry(queue.id, &UserId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.expires_at, expires_at);
    }
}
