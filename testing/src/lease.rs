//! In-memory lease provider.

use crate::clock::ManualClock;
use crate::lock_failed;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use waiting_room_core::environment::{Clock, SystemClock};
use waiting_room_core::providers::{LeaseProvider, LeaseToken};
use waiting_room_core::{QueueError, Result};

#[derive(Debug, Clone)]
struct Held {
    token: String,
    expires_at: DateTime<Utc>,
}

/// In-memory `LeaseProvider`.
///
/// Leases expire against the provider's clock, so a test can let a lease
/// lapse by advancing a [`ManualClock`] or revoke it with [`Self::steal`].
#[derive(Clone)]
pub struct InMemoryLeaseProvider {
    leases: Arc<Mutex<HashMap<String, Held>>>,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
}

impl InMemoryLeaseProvider {
    /// Create a provider that expires leases against system time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock_arc(Arc::new(SystemClock))
    }

    /// Create a provider that expires leases against a manual clock.
    #[must_use]
    pub fn with_clock(clock: ManualClock) -> Self {
        Self::with_clock_arc(Arc::new(clock))
    }

    fn with_clock_arc(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            clock,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the lock store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Hand the lease for `key` to an unknown holder (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if lock is poisoned.
    pub fn steal(&self, key: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now() + delta(ttl);
        self.leases.lock().map_err(|_| lock_failed())?.insert(
            key.to_string(),
            Held {
                token: Uuid::new_v4().to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn with_leases<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Held>, DateTime<Utc>) -> T,
    ) -> Result<T> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::FastStore("connection refused".to_string()));
        }
        let now = self.clock.now();
        let mut leases = self.leases.lock().map_err(|_| lock_failed())?;
        leases.retain(|_, held| held.expires_at > now);
        Ok(f(&mut leases, now))
    }
}

impl Default for InMemoryLeaseProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryLeaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLeaseProvider")
            .field("leases", &self.leases)
            .finish_non_exhaustive()
    }
}

fn delta(ttl: Duration) -> TimeDelta {
    TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::zero())
}

impl LeaseProvider for InMemoryLeaseProvider {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<LeaseToken>>> + Send {
        let result = self.with_leases(|leases, now| {
            if leases.contains_key(key) {
                return None;
            }
            let token = Uuid::new_v4().to_string();
            leases.insert(
                key.to_string(),
                Held {
                    token: token.clone(),
                    expires_at: now + delta(ttl),
                },
            );
            Some(LeaseToken {
                key: key.to_string(),
                holder: holder.to_string(),
                token,
                ttl,
            })
        });
        async move { result }
    }

    fn renew(&self, lease: &LeaseToken) -> impl Future<Output = Result<bool>> + Send {
        let result = self.with_leases(|leases, now| match leases.get_mut(&lease.key) {
            Some(held) if held.token == lease.token => {
                held.expires_at = now + delta(lease.ttl);
                true
            }
            _ => false,
        });
        async move { result }
    }

    fn release(&self, lease: &LeaseToken) -> impl Future<Output = Result<bool>> + Send {
        let result = self.with_leases(|leases, _| {
            if leases
                .get(&lease.key)
                .is_some_and(|held| held.token == lease.token)
            {
                leases.remove(&lease.key);
                true
            } else {
                false
            }
        });
        async move { result }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_clock;

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let provider = InMemoryLeaseProvider::new();
        let ttl = Duration::from_secs(10);

        let lease = provider.try_acquire("admission", "a", ttl).await.unwrap().unwrap();
        assert!(provider.try_acquire("admission", "b", ttl).await.unwrap().is_none());
        assert!(provider.renew(&lease).await.unwrap());
        assert!(provider.release(&lease).await.unwrap());
        assert!(provider.try_acquire("admission", "b", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn crashed_holder_loses_lease_after_ttl() {
        let clock = test_clock();
        let provider = InMemoryLeaseProvider::with_clock(clock.clone());
        let ttl = Duration::from_secs(10);

        let stale = provider.try_acquire("admission", "a", ttl).await.unwrap().unwrap();
        clock.advance(TimeDelta::seconds(10));

        let fresh = provider.try_acquire("admission", "b", ttl).await.unwrap();
        assert!(fresh.is_some());
        assert!(!provider.renew(&stale).await.unwrap());
        assert!(!provider.release(&stale).await.unwrap());
    }
}
