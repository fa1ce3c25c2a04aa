//! Leader-elected admission ticks.
//!
//! Every process runs an [`AdmissionScheduler`]; on each tick they race for
//! the leader lease and only the winner promotes. A tick that cannot get the
//! lease within the wait bound does nothing, which is the normal state for
//! all but one process.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use waiting_room_core::environment::Clock;
use waiting_room_core::providers::{DurableStore, FastStore, LeaseProvider};
use waiting_room_core::{Queue, QueueId, Result};

use crate::admission::AdmissionEngine;
use crate::config::AdmissionConfig;
use crate::environment::QueueEnvironment;
use crate::lease::LeaderLease;
use crate::metrics::AdmissionMetrics;
use crate::periodic::run_periodic;

/// What one admission tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another process held the lease for the whole wait.
    NotLeader,
    /// Every due queue was processed.
    Completed {
        /// Queues whose batch ran.
        queues: usize,
        /// Users promoted across all queues.
        promoted: usize,
        /// Queues whose batch failed.
        failed: usize,
    },
    /// The lease was lost part-way; remaining queues were left for the next
    /// leader.
    LeaseLost {
        /// Queues whose batch ran before the loss.
        queues: usize,
        /// Users promoted before the loss.
        promoted: usize,
    },
}

impl CycleOutcome {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::NotLeader => "not_leader",
            Self::Completed { .. } => "completed",
            Self::LeaseLost { .. } => "lease_lost",
        }
    }
}

/// Runs admission ticks under the leader lease.
pub struct AdmissionScheduler<F, D, C, L> {
    engine: AdmissionEngine<F, D, C>,
    env: QueueEnvironment<F, D, C>,
    leases: Arc<L>,
    config: AdmissionConfig,
    last_run: Mutex<HashMap<QueueId, DateTime<Utc>>>,
}

impl<F, D, C, L> AdmissionScheduler<F, D, C, L>
where
    F: FastStore + 'static,
    D: DurableStore + 'static,
    C: Clock + 'static,
    L: LeaseProvider + 'static,
{
    /// Create a scheduler.
    pub fn new(env: QueueEnvironment<F, D, C>, leases: Arc<L>, config: AdmissionConfig) -> Self {
        Self {
            engine: AdmissionEngine::new(env.clone(), config.grant_write_retry.clone()),
            env,
            leases,
            config,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    /// Run one tick.
    ///
    /// Per-queue failures are logged and counted; they never abort the tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease store or the queue listing fails.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let lease = match LeaderLease::acquire(Arc::clone(&self.leases), &self.config).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::debug!(
                    holder = %self.config.holder_id,
                    "Not leader, skipping admission tick"
                );
                AdmissionMetrics::record_cycle(CycleOutcome::NotLeader.as_str());
                return Ok(CycleOutcome::NotLeader);
            }
            Err(e) => {
                AdmissionMetrics::record_cycle("failed");
                return Err(e);
            }
        };

        let result = self.promote_due_queues(&lease).await;

        if let Err(e) = lease.release().await {
            tracing::warn!(error = ?e, "Failed to release leader lease, it will lapse on its own");
        }

        match &result {
            Ok(outcome) => AdmissionMetrics::record_cycle(outcome.as_str()),
            Err(_) => AdmissionMetrics::record_cycle("failed"),
        }
        result
    }

    async fn promote_due_queues(&self, lease: &LeaderLease<L>) -> Result<CycleOutcome> {
        let queues = self.env.durable.list_queues().await?;
        self.forget_deleted_queues(&queues);
        let (mut ran, mut promoted, mut failed) = (0, 0, 0);

        for queue in queues {
            if !lease.is_held() {
                tracing::warn!(
                    queues = ran,
                    promoted,
                    "Leader lease lost, stopping admission tick"
                );
                return Ok(CycleOutcome::LeaseLost {
                    queues: ran,
                    promoted,
                });
            }
            if !self.is_due(&queue) {
                continue;
            }

            ran += 1;
            match self.engine.promote(&queue).await {
                Ok(report) => promoted += report.promoted.len(),
                Err(e) => {
                    failed += 1;
                    tracing::error!(queue_id = %queue.id, error = ?e, "Promotion batch failed");
                }
            }
        }

        Ok(CycleOutcome::Completed {
            queues: ran,
            promoted,
            failed,
        })
    }

    /// Marks `queue` as run now if its promotion interval has elapsed.
    fn is_due(&self, queue: &Queue) -> bool {
        let now = self.env.clock.now();
        let mut last_run = self.last_run.lock().unwrap_or_else(PoisonError::into_inner);

        let due = last_run
            .get(&queue.id)
            .is_none_or(|last| now - *last >= queue.settings.promotion_delta());
        if due {
            last_run.insert(queue.id, now);
        }
        due
    }

    fn forget_deleted_queues(&self, queues: &[Queue]) {
        let mut last_run = self.last_run.lock().unwrap_or_else(PoisonError::into_inner);
        last_run.retain(|id, _| queues.iter().any(|queue| queue.id == *id));
    }

    /// Spawn the tick loop.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.tick_interval;
        tokio::spawn(run_periodic("admission", period, shutdown, move || {
            let scheduler = Arc::clone(&self);
            async move { scheduler.run_cycle().await.map(|_| ()) }
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeDelta;
    use std::time::Duration;
    use waiting_room_core::{QueueSettings, ResourceId, UserId};
    use waiting_room_testing::{
        InMemoryDurableStore, InMemoryFastStore, InMemoryLeaseProvider, ManualClock, test_clock,
    };

    type Scheduler = AdmissionScheduler<
        InMemoryFastStore,
        InMemoryDurableStore,
        ManualClock,
        InMemoryLeaseProvider,
    >;

    type Env = QueueEnvironment<InMemoryFastStore, InMemoryDurableStore, ManualClock>;

    async fn setup(settings: QueueSettings) -> (Scheduler, Env, Arc<InMemoryLeaseProvider>, Queue) {
        let env = QueueEnvironment::new(
            InMemoryFastStore::new(),
            InMemoryDurableStore::new(),
            test_clock(),
        );
        let now = env.clock.now();
        let queue = Queue {
            id: QueueId::new(),
            resource_id: ResourceId::new("tickets"),
            settings,
            created_at: now,
            updated_at: now,
        };
        env.durable.create_queue(&queue).await.unwrap();

        let leases = Arc::new(InMemoryLeaseProvider::new());
        let config = AdmissionConfig::default()
            .with_holder_id("test")
            .with_lock_wait(Duration::from_millis(20), Duration::from_millis(5));
        let scheduler = AdmissionScheduler::new(env.clone(), Arc::clone(&leases), config);
        (scheduler, env, leases, queue)
    }

    #[tokio::test]
    async fn test_skips_tick_when_another_process_leads() {
        let (scheduler, env, leases, queue) =
            setup(QueueSettings::new(5, Duration::from_secs(60))).await;
        env.fast.join(queue.id, &UserId::new("a"), env.clock.now()).await.unwrap();
        leases.steal("admission", Duration::from_secs(30)).unwrap();

        assert_eq!(scheduler.run_cycle().await.unwrap(), CycleOutcome::NotLeader);
        assert_eq!(env.fast.waiting_len(queue.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_leader_promotes_and_releases_lease() {
        let (scheduler, env, leases, queue) =
            setup(QueueSettings::new(5, Duration::from_secs(60))).await;
        env.fast.join(queue.id, &UserId::new("a"), env.clock.now()).await.unwrap();

        let outcome = scheduler.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                queues: 1,
                promoted: 1,
                failed: 0
            }
        );
        assert!(
            leases
                .try_acquire("admission", "other", Duration::from_secs(1))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_queue_runs_only_after_its_interval() {
        let settings = QueueSettings::new(5, Duration::from_secs(60))
            .with_promotion_interval(Duration::from_secs(10));
        let (scheduler, env, _leases, queue) = setup(settings).await;

        scheduler.run_cycle().await.unwrap();
        env.fast.join(queue.id, &UserId::new("a"), env.clock.now()).await.unwrap();

        env.clock.advance(TimeDelta::seconds(5));
        let early = scheduler.run_cycle().await.unwrap();
        assert!(matches!(early, CycleOutcome::Completed { queues: 0, .. }));

        env.clock.advance(TimeDelta::seconds(5));
        let due = scheduler.run_cycle().await.unwrap();
        assert!(matches!(due, CycleOutcome::Completed { queues: 1, promoted: 1, .. }));
    }

    #[tokio::test]
    async fn test_failing_queue_does_not_abort_the_tick() {
        let (scheduler, env, _leases, queue) =
            setup(QueueSettings::new(5, Duration::from_secs(60))).await;
        env.fast.join(queue.id, &UserId::new("a"), env.clock.now()).await.unwrap();
        env.fast.set_available(false);

        let outcome = scheduler.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed { failed: 1, .. }));
    }
}
