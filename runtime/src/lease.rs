//! Leader lease held for the duration of one admission tick.
//!
//! [`LeaderLease::acquire`] polls the lease store until the lease is won or
//! the wait bound lapses. While held, a watchdog task renews the lease on a
//! fixed cadence and flips [`LeaderLease::is_held`] to `false` as soon as a
//! renewal is refused or the TTL passes without a confirmed renewal. The
//! scheduler checks that flag between queues and stops promoting once it
//! drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep};
use waiting_room_core::Result;
use waiting_room_core::providers::{LeaseProvider, LeaseToken};

use crate::config::AdmissionConfig;
use crate::metrics::LeaseMetrics;
use crate::retry::jittered;

/// Poll for a lease until it is acquired or `wait` elapses.
///
/// Returns `Ok(None)` when another holder kept the lease for the whole
/// wait. Contention is never an error.
///
/// # Errors
///
/// Returns the lease store's error if an acquisition attempt fails.
pub async fn acquire_within<L: LeaseProvider>(
    provider: &L,
    key: &str,
    holder: &str,
    ttl: Duration,
    wait: Duration,
    poll_interval: Duration,
) -> Result<Option<LeaseToken>> {
    let deadline = Instant::now() + wait;

    loop {
        if let Some(token) = provider.try_acquire(key, holder, ttl).await? {
            return Ok(Some(token));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep(jittered(poll_interval).min(deadline - now)).await;
    }
}

/// A held leader lease with a background renewal watchdog.
///
/// Dropping the guard stops renewal; the lease then lapses after its TTL.
/// Call [`LeaderLease::release`] to hand it back immediately.
pub struct LeaderLease<L: LeaseProvider> {
    provider: Arc<L>,
    token: LeaseToken,
    held: Arc<AtomicBool>,
    watchdog: JoinHandle<()>,
}

impl<L: LeaseProvider + 'static> LeaderLease<L> {
    /// Try to become leader, waiting at most `config.lock_wait`.
    ///
    /// # Errors
    ///
    /// Returns the lease store's error if an acquisition attempt fails.
    pub async fn acquire(provider: Arc<L>, config: &AdmissionConfig) -> Result<Option<Self>> {
        let token = acquire_within(
            provider.as_ref(),
            &config.lock_key,
            &config.holder_id,
            config.lease_ttl,
            config.lock_wait,
            config.lock_poll_interval,
        )
        .await?;

        let Some(token) = token else {
            LeaseMetrics::record("contended");
            return Ok(None);
        };

        LeaseMetrics::record("acquired");
        let held = Arc::new(AtomicBool::new(true));
        let watchdog = tokio::spawn(watch(
            Arc::clone(&provider),
            token.clone(),
            config.lease_renew_interval,
            Arc::clone(&held),
        ));

        Ok(Some(Self {
            provider,
            token,
            held,
            watchdog,
        }))
    }
}

impl<L: LeaseProvider> LeaderLease<L> {
    /// `false` once the watchdog has seen the lease lost.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// The token backing this lease.
    #[must_use]
    pub const fn token(&self) -> &LeaseToken {
        &self.token
    }

    /// Renew now instead of waiting for the watchdog.
    ///
    /// # Errors
    ///
    /// Returns the lease store's error if the renewal call fails.
    pub async fn renew(&self) -> Result<bool> {
        let renewed = self.provider.renew(&self.token).await?;
        if !renewed {
            self.mark_lost();
        }
        Ok(renewed)
    }

    /// Stop renewing and delete the lease if this holder still owns it.
    ///
    /// # Errors
    ///
    /// Returns the lease store's error if the release call fails. The lease
    /// then lapses on its own after the TTL.
    pub async fn release(self) -> Result<bool> {
        self.watchdog.abort();
        let released = self.provider.release(&self.token).await?;
        if released {
            LeaseMetrics::record("released");
        }
        Ok(released)
    }

    fn mark_lost(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            LeaseMetrics::record("lost");
            tracing::warn!(
                lease = %self.token.key,
                holder = %self.token.holder,
                "Leader lease lost"
            );
        }
    }
}

impl<L: LeaseProvider> Drop for LeaderLease<L> {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

async fn watch<L: LeaseProvider>(
    provider: Arc<L>,
    token: LeaseToken,
    renew_interval: Duration,
    held: Arc<AtomicBool>,
) {
    let period = renew_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut confirmed_at = Instant::now();

    loop {
        ticker.tick().await;

        match provider.renew(&token).await {
            Ok(true) => confirmed_at = Instant::now(),
            Ok(false) => {
                tracing::warn!(lease = %token.key, holder = %token.holder, "Lease renewal refused");
                break;
            }
            Err(e) if confirmed_at.elapsed() >= token.ttl => {
                tracing::warn!(
                    lease = %token.key,
                    error = %e.detail(),
                    "Lease expired without renewal"
                );
                break;
            }
            Err(e) => {
                tracing::debug!(
                    lease = %token.key,
                    error = %e.detail(),
                    "Lease renewal failed, will retry"
                );
            }
        }
    }

    if held.swap(false, Ordering::SeqCst) {
        LeaseMetrics::record("lost");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::TimeDelta;
    use waiting_room_testing::{InMemoryLeaseProvider, test_clock};

    fn config(holder: &str) -> AdmissionConfig {
        AdmissionConfig::default()
            .with_holder_id(holder)
            .with_lock_wait(Duration::from_millis(30), Duration::from_millis(5))
            .with_lease(Duration::from_secs(30), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_second_holder_waits_then_gives_up() {
        let provider = Arc::new(InMemoryLeaseProvider::new());

        let first = LeaderLease::acquire(Arc::clone(&provider), &config("a"))
            .await
            .unwrap()
            .expect("first holder wins");
        let second = LeaderLease::acquire(Arc::clone(&provider), &config("b"))
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(first.release().await.unwrap());
        assert!(
            LeaderLease::acquire(provider, &config("b"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_watchdog_notices_a_stolen_lease() {
        let clock = test_clock();
        let provider = Arc::new(InMemoryLeaseProvider::with_clock(clock.clone()));
        let lease = LeaderLease::acquire(Arc::clone(&provider), &config("a"))
            .await
            .unwrap()
            .expect("lease");
        assert!(lease.is_held());

        clock.advance(TimeDelta::seconds(31));
        provider.steal("admission", Duration::from_secs(30)).unwrap();

        for _ in 0..100 {
            if !lease.is_held() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!lease.is_held());
        assert!(!lease.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_surfaces_store_errors() {
        let provider = Arc::new(InMemoryLeaseProvider::new());
        provider.set_available(false);

        assert!(LeaderLease::acquire(provider, &config("a")).await.is_err());
    }
}
