//! Tunables for the admission scheduler and the reconcilers.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Admission scheduler configuration.
///
/// # Default Values
///
/// - `tick_interval`: 1 second
/// - `lock_key`: `admission`
/// - `lock_wait`: 500ms
/// - `lock_poll_interval`: 100ms
/// - `lease_ttl`: 30 seconds
/// - `lease_renew_interval`: 10 seconds
/// - `grant_write_retry`: [`RetryPolicy::default`]
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// How often the scheduler wakes up.
    pub tick_interval: Duration,
    /// Name of the leader lease.
    pub lock_key: String,
    /// Identity written into the lease (instance id).
    pub holder_id: String,
    /// How long a tick waits for the lease before skipping.
    pub lock_wait: Duration,
    /// Pause between acquisition attempts while waiting.
    pub lock_poll_interval: Duration,
    /// Lease time-to-live.
    pub lease_ttl: Duration,
    /// How often the holder renews while a tick runs.
    pub lease_renew_interval: Duration,
    /// Retry policy for the durable write after a promotion.
    pub grant_write_retry: RetryPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            lock_key: "admission".to_string(),
            holder_id: format!("worker-{}", std::process::id()),
            lock_wait: Duration::from_millis(500),
            lock_poll_interval: Duration::from_millis(100),
            lease_ttl: Duration::from_secs(30),
            lease_renew_interval: Duration::from_secs(10),
            grant_write_retry: RetryPolicy::default(),
        }
    }
}

impl AdmissionConfig {
    /// Set the tick interval.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the lease name.
    #[must_use]
    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = key.into();
        self
    }

    /// Set the lease holder identity.
    #[must_use]
    pub fn with_holder_id(mut self, holder: impl Into<String>) -> Self {
        self.holder_id = holder.into();
        self
    }

    /// Set how long a tick waits for the lease.
    #[must_use]
    pub const fn with_lock_wait(mut self, wait: Duration, poll_interval: Duration) -> Self {
        self.lock_wait = wait;
        self.lock_poll_interval = poll_interval;
        self
    }

    /// Set the lease TTL and renewal cadence.
    #[must_use]
    pub const fn with_lease(mut self, ttl: Duration, renew_interval: Duration) -> Self {
        self.lease_ttl = ttl;
        self.lease_renew_interval = renew_interval;
        self
    }

    /// Set the durable write retry policy.
    #[must_use]
    pub fn with_grant_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.grant_write_retry = policy;
        self
    }
}

/// Reconciliation configuration.
///
/// # Default Values
///
/// - `expiry_sweep_interval`: 5 seconds
/// - `expiry_mirror_interval`: 10 seconds
/// - `divergence_repair_interval`: 30 seconds
/// - `mirror_batch_size`: 500
/// - `repair_batch_size`: 1000
/// - `max_grace`: 60 seconds
/// - `max_grace_cycles`: 5
/// - `orphan_grace`: 10 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Period of the fast-store expiry sweep.
    pub expiry_sweep_interval: Duration,
    /// Period of the durable expiry mirror.
    pub expiry_mirror_interval: Duration,
    /// Period of the divergence repair.
    pub divergence_repair_interval: Duration,
    /// Rows expired per durable statement.
    pub mirror_batch_size: u32,
    /// Enterable rows inspected per queue by one repair run.
    pub repair_batch_size: u32,
    /// Longest a live durable grant may go unconfirmed by the fast store.
    pub max_grace: Duration,
    /// Most repair runs a live durable grant may go unconfirmed.
    pub max_grace_cycles: u32,
    /// Fast-store grants younger than this are never treated as orphans.
    pub orphan_grace: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            expiry_sweep_interval: Duration::from_secs(5),
            expiry_mirror_interval: Duration::from_secs(10),
            divergence_repair_interval: Duration::from_secs(30),
            mirror_batch_size: 500,
            repair_batch_size: 1000,
            max_grace: Duration::from_secs(60),
            max_grace_cycles: 5,
            orphan_grace: Duration::from_secs(10),
        }
    }
}

impl ReconcileConfig {
    /// Set the three duty periods.
    #[must_use]
    pub const fn with_intervals(
        mut self,
        expiry_sweep: Duration,
        expiry_mirror: Duration,
        divergence_repair: Duration,
    ) -> Self {
        self.expiry_sweep_interval = expiry_sweep;
        self.expiry_mirror_interval = expiry_mirror;
        self.divergence_repair_interval = divergence_repair;
        self
    }

    /// Set the durable expiry batch size.
    #[must_use]
    pub const fn with_mirror_batch_size(mut self, batch_size: u32) -> Self {
        self.mirror_batch_size = batch_size;
        self
    }

    /// Set the repair batch size.
    #[must_use]
    pub const fn with_repair_batch_size(mut self, batch_size: u32) -> Self {
        self.repair_batch_size = batch_size;
        self
    }

    /// Set the bounded grace for unconfirmed durable grants.
    #[must_use]
    pub const fn with_grace(mut self, max_grace: Duration, max_cycles: u32) -> Self {
        self.max_grace = max_grace;
        self.max_grace_cycles = max_cycles;
        self
    }

    /// Set the minimum age of an orphaned fast-store grant.
    #[must_use]
    pub const fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }
}
