//! Distributed leader lease trait.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Proof of holding a lease.
///
/// The token is unique per acquisition; renew and release only succeed
/// while the store still holds this exact token under `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    /// Lock name.
    pub key: String,
    /// Process that holds the lease.
    pub holder: String,
    /// Fencing value for this acquisition.
    pub token: String,
    /// Lease time-to-live.
    pub ttl: Duration,
}

/// Cluster-wide, auto-expiring mutual exclusion.
///
/// A holder that crashes without releasing loses the lease once `ttl`
/// passes without renewal.
pub trait LeaseProvider: Send + Sync {
    /// Attempt to take the lease once.
    ///
    /// # Returns
    ///
    /// `Some(token)` if acquired, `None` if another holder has it.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<Option<LeaseToken>>> + Send;

    /// Extend the lease by its `ttl`.
    ///
    /// # Returns
    ///
    /// `false` if the lease was lost (expired or taken over).
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn renew(
        &self,
        lease: &LeaseToken,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Give up the lease.
    ///
    /// # Returns
    ///
    /// `false` if the lease was no longer held.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn release(
        &self,
        lease: &LeaseToken,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}
