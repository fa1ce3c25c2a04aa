//! Background reconciliation between the fast and durable stores.
//!
//! Three independent duties, each on its own period:
//!
//! - **Expiry sweep**: drop lapsed grants from the fast store. Validity never
//!   depends on this; it only keeps the enterable sets small.
//! - **Expiry mirror**: mark durable `enterable` rows whose grant has lapsed
//!   as `expired`.
//! - **Divergence repair**: compare the two stores and correct drift. A live
//!   durable grant the fast store does not confirm is kept for a bounded
//!   grace (time and runs) and then expired. A fast-store grant with no
//!   durable row is revoked once it has gone unrecorded for the orphan
//!   grace, counted from the first run that saw it.
//!
//! Every duty is idempotent and tolerates overlapping runs.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use waiting_room_core::environment::Clock;
use waiting_room_core::providers::{DurableStore, FastStore};
use waiting_room_core::{Entry, EntryId, Grant, Queue, QueueId, Result, UserId};

use crate::config::ReconcileConfig;
use crate::environment::QueueEnvironment;
use crate::metrics::ReconcileMetrics;
use crate::periodic::run_periodic;

/// Result of one expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Queues swept.
    pub queues: usize,
    /// Lapsed grants removed.
    pub purged: usize,
    /// Queues whose sweep failed.
    pub failed: usize,
}

/// Result of one expiry mirror run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MirrorReport {
    /// Queues processed.
    pub queues: usize,
    /// Durable rows moved to expired.
    pub expired: u64,
    /// Queues whose run failed.
    pub failed: usize,
}

/// Result of one divergence repair run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairReport {
    /// Queues inspected.
    pub queues: usize,
    /// Durable grants confirmed by the fast store.
    pub confirmed: usize,
    /// Unconfirmed durable grants still within their grace.
    pub deferred: usize,
    /// Durable grants expired.
    pub expired: usize,
    /// Fast-store grants revoked for lack of a durable row.
    pub orphans_revoked: usize,
    /// Queues whose inspection failed.
    pub failed: usize,
}

/// An unconfirmed durable grant under observation.
#[derive(Debug, Clone, Copy)]
struct Suspect {
    queue_id: QueueId,
    first_seen: DateTime<Utc>,
    runs: u32,
}

/// A fast-store grant without a durable row, under observation.
#[derive(Debug, Clone, Copy)]
struct Orphan {
    expires_at: DateTime<Utc>,
    first_seen: DateTime<Utc>,
}

/// Runs the reconciliation duties.
pub struct Reconciler<F, D, C> {
    env: QueueEnvironment<F, D, C>,
    config: ReconcileConfig,
    suspects: Mutex<HashMap<EntryId, Suspect>>,
    orphans: Mutex<HashMap<(QueueId, UserId), Orphan>>,
}

impl<F, D, C> Reconciler<F, D, C>
where
    F: FastStore + 'static,
    D: DurableStore + 'static,
    C: Clock + 'static,
{
    /// Create a reconciler.
    pub fn new(env: QueueEnvironment<F, D, C>, config: ReconcileConfig) -> Self {
        Self {
            env,
            config,
            suspects: Mutex::new(HashMap::new()),
            orphans: Mutex::new(HashMap::new()),
        }
    }

    /// Remove lapsed grants from the fast store.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue listing fails. Per-queue failures are
    /// counted in the report.
    pub async fn sweep_expired_grants(&self) -> Result<SweepReport> {
        timed("expiry_sweep", async {
            let queues = self.env.durable.list_queues().await?;
            let now = self.env.clock.now();
            let mut report = SweepReport::default();

            for queue in &queues {
                report.queues += 1;
                match self.env.fast.purge_expired_grants(queue.id, now).await {
                    Ok(purged) => {
                        if !purged.is_empty() {
                            tracing::debug!(
                                queue_id = %queue.id,
                                purged = purged.len(),
                                "Removed lapsed grants"
                            );
                        }
                        report.purged += purged.len();
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            queue_id = %queue.id,
                            error = ?e,
                            "Expiry sweep failed for queue"
                        );
                    }
                }
            }

            ReconcileMetrics::record_actions("expiry_sweep", "purged", count(report.purged));
            Ok(report)
        })
        .await
    }

    /// Mark lapsed durable grants as expired, in batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue listing fails. Per-queue failures are
    /// counted in the report.
    pub async fn mirror_expiry(&self) -> Result<MirrorReport> {
        timed("expiry_mirror", async {
            let queues = self.env.durable.list_queues().await?;
            let now = self.env.clock.now();
            let batch = self.config.mirror_batch_size.max(1);
            let mut report = MirrorReport::default();

            for queue in &queues {
                report.queues += 1;
                match self.expire_overdue_in_batches(queue.id, now, batch).await {
                    Ok(expired) => report.expired += expired,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            queue_id = %queue.id,
                            error = ?e,
                            "Expiry mirror failed for queue"
                        );
                    }
                }
            }

            ReconcileMetrics::record_actions("expiry_mirror", "expired", report.expired);
            Ok(report)
        })
        .await
    }

    async fn expire_overdue_in_batches(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64> {
        let mut total = 0;
        loop {
            let expired = self.env.durable.expire_overdue(queue_id, now, batch).await?;
            total += expired;
            if expired < u64::from(batch) {
                return Ok(total);
            }
        }
    }

    /// Compare both stores and correct drift.
    ///
    /// A queue whose fast store cannot be read is skipped without judging
    /// any of its grants.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue listing fails. Per-queue failures are
    /// counted in the report.
    pub async fn repair_divergence(&self) -> Result<RepairReport> {
        timed("divergence_repair", async {
            let queues = self.env.durable.list_queues().await?;
            self.forget_deleted_queues(&queues);
            let now = self.env.clock.now();
            let mut report = RepairReport::default();

            for queue in &queues {
                report.queues += 1;
                if let Err(e) = self.repair_queue(queue, now, &mut report).await {
                    report.failed += 1;
                    tracing::warn!(
                        queue_id = %queue.id,
                        error = ?e,
                        "Divergence repair failed for queue"
                    );
                }
            }

            ReconcileMetrics::record_actions(
                "divergence_repair",
                "expired",
                count(report.expired),
            );
            ReconcileMetrics::record_actions(
                "divergence_repair",
                "deferred",
                count(report.deferred),
            );
            ReconcileMetrics::record_actions(
                "divergence_repair",
                "orphan_revoked",
                count(report.orphans_revoked),
            );
            Ok(report)
        })
        .await
    }

    async fn repair_queue(
        &self,
        queue: &Queue,
        now: DateTime<Utc>,
        report: &mut RepairReport,
    ) -> Result<()> {
        let limit = self.config.repair_batch_size.max(1);
        let grants = self.env.fast.active_grants(queue.id, now).await?;
        let entries = self.env.durable.enterable_entries(queue.id, limit).await?;

        let granted: HashSet<&UserId> = grants.iter().map(|grant| &grant.user_id).collect();
        let mut observed = HashSet::new();

        for entry in &entries {
            if granted.contains(&entry.user_id) {
                report.confirmed += 1;
                continue;
            }

            if entry.expires_at > now {
                observed.insert(entry.id);
                if !self.grace_exhausted(entry, now) {
                    report.deferred += 1;
                    continue;
                }
                tracing::warn!(
                    queue_id = %queue.id,
                    user_id = %entry.user_id,
                    expires_at = %entry.expires_at,
                    "Durable grant unconfirmed past grace, expiring"
                );
            }

            if self.env.durable.expire_grant(queue.id, &entry.user_id, now).await?.is_some() {
                report.expired += 1;
            }
        }
        self.forget_confirmed(queue.id, &observed);

        // A truncated listing cannot prove a grant has no durable row.
        if entries.len() >= usize::try_from(limit).unwrap_or(usize::MAX) {
            tracing::debug!(
                queue_id = %queue.id,
                limit,
                "Enterable listing truncated, skipping orphan check"
            );
            return Ok(());
        }

        let recorded: HashSet<&UserId> = entries.iter().map(|entry| &entry.user_id).collect();
        let unrecorded: Vec<&Grant> = grants
            .iter()
            .filter(|grant| !recorded.contains(&grant.user_id))
            .collect();

        for grant in self.overdue_orphans(queue.id, &unrecorded, now) {
            if self.env.fast.revoke_grant(queue.id, &grant.user_id).await?.is_some() {
                report.orphans_revoked += 1;
                tracing::warn!(
                    queue_id = %queue.id,
                    user_id = %grant.user_id,
                    expires_at = %grant.expires_at,
                    "Revoked grant with no durable record"
                );
            }
        }

        Ok(())
    }

    /// Record this run's unrecorded grants and return those that have gone
    /// unrecorded for the orphan grace.
    fn overdue_orphans<'g>(
        &self,
        queue_id: QueueId,
        unrecorded: &[&'g Grant],
        now: DateTime<Utc>,
    ) -> Vec<&'g Grant> {
        let orphan_grace = TimeDelta::from_std(self.config.orphan_grace).unwrap_or(TimeDelta::MAX);
        let mut orphans = self.orphans.lock().unwrap_or_else(PoisonError::into_inner);
        orphans.retain(|(queue, user), _| {
            *queue != queue_id || unrecorded.iter().any(|grant| &grant.user_id == user)
        });

        let mut overdue = Vec::new();
        for &grant in unrecorded {
            let seen = orphans
                .entry((queue_id, grant.user_id.clone()))
                .or_insert(Orphan {
                    expires_at: grant.expires_at,
                    first_seen: now,
                });
            // A different expiry is a different grant.
            if seen.expires_at != grant.expires_at {
                *seen = Orphan {
                    expires_at: grant.expires_at,
                    first_seen: now,
                };
            }
            if now - seen.first_seen >= orphan_grace {
                orphans.remove(&(queue_id, grant.user_id.clone()));
                overdue.push(grant);
            }
        }
        overdue
    }

    /// Count one more unconfirmed observation of `entry`.
    fn grace_exhausted(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        let max_grace = TimeDelta::from_std(self.config.max_grace).unwrap_or(TimeDelta::MAX);
        let mut suspects = self.suspects.lock().unwrap_or_else(PoisonError::into_inner);

        let suspect = suspects.entry(entry.id).or_insert(Suspect {
            queue_id: entry.queue_id,
            first_seen: now,
            runs: 0,
        });
        suspect.runs += 1;

        let exhausted =
            now - suspect.first_seen >= max_grace || suspect.runs > self.config.max_grace_cycles;
        if exhausted {
            suspects.remove(&entry.id);
        }
        exhausted
    }

    fn forget_confirmed(&self, queue_id: QueueId, observed: &HashSet<EntryId>) {
        let mut suspects = self.suspects.lock().unwrap_or_else(PoisonError::into_inner);
        suspects.retain(|id, suspect| suspect.queue_id != queue_id || observed.contains(id));
    }

    fn forget_deleted_queues(&self, queues: &[Queue]) {
        let live = |queue_id: QueueId| queues.iter().any(|queue| queue.id == queue_id);
        let mut suspects = self.suspects.lock().unwrap_or_else(PoisonError::into_inner);
        suspects.retain(|_, suspect| live(suspect.queue_id));
        drop(suspects);
        let mut orphans = self.orphans.lock().unwrap_or_else(PoisonError::into_inner);
        orphans.retain(|(queue_id, _), _| live(*queue_id));
    }

    /// Spawn the three duties, each on its own period.
    pub fn spawn_all(self: Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let sweep = Arc::clone(&self);
        let mirror = Arc::clone(&self);
        let repair = Arc::clone(&self);

        vec![
            tokio::spawn(run_periodic(
                "expiry_sweep",
                self.config.expiry_sweep_interval,
                shutdown.clone(),
                move || {
                    let reconciler = Arc::clone(&sweep);
                    async move { reconciler.sweep_expired_grants().await.map(|_| ()) }
                },
            )),
            tokio::spawn(run_periodic(
                "expiry_mirror",
                self.config.expiry_mirror_interval,
                shutdown.clone(),
                move || {
                    let reconciler = Arc::clone(&mirror);
                    async move { reconciler.mirror_expiry().await.map(|_| ()) }
                },
            )),
            tokio::spawn(run_periodic(
                "divergence_repair",
                self.config.divergence_repair_interval,
                shutdown.clone(),
                move || {
                    let reconciler = Arc::clone(&repair);
                    async move { reconciler.repair_divergence().await.map(|_| ()) }
                },
            )),
        ]
    }
}

async fn timed<T>(duty: &'static str, run: impl Future<Output = Result<T>>) -> Result<T> {
    let started = Instant::now();
    let result = run.await;
    ReconcileMetrics::record_run(duty, result.is_ok(), started.elapsed());
    result
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}
