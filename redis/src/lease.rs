//! Redis-based leader lease.
//!
//! A lease is a string key `waiting_room:lease:<name>` holding a unique
//! token, written with `SET NX PX`. Renew and release compare the token
//! server-side so a holder that lost the lease can never extend or delete
//! its successor's.

use crate::scripts::LeaseScripts;
use crate::{bounded, connect};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use waiting_room_core::providers::{LeaseProvider, LeaseToken};
use waiting_room_core::Result;

/// Redis implementation of [`LeaseProvider`].
#[derive(Clone)]
pub struct RedisLeaseProvider {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    scripts: Arc<LeaseScripts>,
    command_timeout: Duration,
}

impl RedisLeaseProvider {
    /// Connect to Redis and create a lease provider.
    ///
    /// # Errors
    ///
    /// Returns error if connection to Redis fails.
    pub async fn new(redis_url: &str, command_timeout: Duration) -> Result<Self> {
        let conn_manager = connect(redis_url).await?;
        Ok(Self::from_connection(conn_manager, command_timeout))
    }

    /// Create a lease provider on an existing connection.
    #[must_use]
    pub fn from_connection(conn_manager: ConnectionManager, command_timeout: Duration) -> Self {
        Self {
            conn_manager,
            scripts: Arc::new(LeaseScripts::load()),
            command_timeout,
        }
    }

    /// Get the Redis key for a named lease.
    fn lease_key(name: &str) -> String {
        format!("waiting_room:lease:{name}")
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl LeaseProvider for RedisLeaseProvider {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>> {
        let mut conn = self.conn_manager.clone();
        let token = format!("{holder}:{}", Uuid::new_v4());

        let reply: Option<String> = bounded(
            self.command_timeout,
            "lease_acquire",
            redis::cmd("SET")
                .arg(Self::lease_key(key))
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn),
        )
        .await?;

        if reply.is_none() {
            return Ok(None);
        }

        tracing::debug!(lease = key, holder, ttl_ms = ttl_millis(ttl), "Acquired lease");

        Ok(Some(LeaseToken {
            key: key.to_string(),
            holder: holder.to_string(),
            token,
            ttl,
        }))
    }

    async fn renew(&self, lease: &LeaseToken) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let extended: i64 = bounded(
            self.command_timeout,
            "lease_renew",
            self.scripts
                .renew
                .key(Self::lease_key(&lease.key))
                .arg(&lease.token)
                .arg(ttl_millis(lease.ttl))
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(extended == 1)
    }

    async fn release(&self, lease: &LeaseToken) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = bounded(
            self.command_timeout,
            "lease_release",
            self.scripts
                .release
                .key(Self::lease_key(&lease.key))
                .arg(&lease.token)
                .invoke_async(&mut conn),
        )
        .await?;

        tracing::debug!(
            lease = %lease.key,
            holder = %lease.holder,
            released = deleted == 1,
            "Released lease"
        );

        Ok(deleted == 1)
    }
}
