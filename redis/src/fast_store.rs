//! Redis-based fast store.
//!
//! # Architecture
//!
//! Each queue owns two sorted sets:
//! - **Waiting**: `waiting_room:{queue_id}:waiting`, member = user id, score = arrival ms
//! - **Enterable**: `waiting_room:{queue_id}:enterable`, member = user id, score = grant expiry ms
//!
//! and one hash:
//! - **Arrivals**: `waiting_room:{queue_id}:arrivals`, field = user id, value = arrival ms
//!   of the user's latest join. It outlives the user's membership so a
//!   status lookup can tell the current cycle from earlier ones.
//!
//! Compound steps (join, promote, requeue, leave, membership) run as Lua
//! scripts. Single-key reads use plain commands, and the purge and revoke
//! steps use `MULTI`/`EXEC` pipelines.

use crate::scripts::QueueScripts;
use crate::{bounded, connect};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use waiting_room_core::providers::FastStore;
use waiting_room_core::{
    Departure, Grant, JoinOutcome, Membership, PromoteOutcome, QueueError, QueueId, Result,
    UserId, from_score, to_score,
};

/// Redis sorted-set implementation of [`FastStore`].
#[derive(Clone)]
pub struct RedisFastStore {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    scripts: Arc<QueueScripts>,
    command_timeout: Duration,
}

impl RedisFastStore {
    /// Connect to Redis and create a store.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `command_timeout` - Deadline for every round trip
    ///
    /// # Errors
    ///
    /// Returns error if connection to Redis fails.
    pub async fn new(redis_url: &str, command_timeout: Duration) -> Result<Self> {
        let conn_manager = connect(redis_url).await?;
        Ok(Self::from_connection(conn_manager, command_timeout))
    }

    /// Create a store on an existing connection.
    #[must_use]
    pub fn from_connection(conn_manager: ConnectionManager, command_timeout: Duration) -> Self {
        Self {
            conn_manager,
            scripts: Arc::new(QueueScripts::load()),
            command_timeout,
        }
    }

    /// Get the Redis key for a queue's waiting set.
    fn waiting_key(queue_id: QueueId) -> String {
        format!("waiting_room:{{{queue_id}}}:waiting")
    }

    /// Get the Redis key for a queue's enterable set.
    fn enterable_key(queue_id: QueueId) -> String {
        format!("waiting_room:{{{queue_id}}}:enterable")
    }

    /// Get the Redis key for a queue's arrivals hash.
    fn arrivals_key(queue_id: QueueId) -> String {
        format!("waiting_room:{{{queue_id}}}:arrivals")
    }
}

#[allow(clippy::cast_possible_truncation)]
fn instant(score: f64) -> Result<DateTime<Utc>> {
    from_score(score as i64)
}

#[allow(clippy::cast_sign_loss)]
fn ordinal(value: i64) -> u64 {
    value.max(0) as u64
}

fn grants(members: Vec<(String, f64)>) -> Result<Vec<Grant>> {
    members
        .into_iter()
        .map(|(user, score)| {
            Ok(Grant {
                user_id: UserId::new(user),
                expires_at: instant(score)?,
            })
        })
        .collect()
}

fn malformed(script: &str, reply: &[i64]) -> QueueError {
    QueueError::FastStore(format!("unexpected {script} reply: {reply:?}"))
}

fn last_joined(arrival: &[i64]) -> Result<Option<DateTime<Utc>>> {
    match arrival {
        [] => Ok(None),
        [ms] => from_score(*ms).map(Some),
        other => Err(malformed("membership", other)),
    }
}

impl FastStore for RedisFastStore {
    async fn join(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome> {
        let mut conn = self.conn_manager.clone();
        let reply: Vec<i64> = bounded(
            self.command_timeout,
            "join",
            self.scripts
                .join
                .key(Self::waiting_key(queue_id))
                .key(Self::enterable_key(queue_id))
                .key(Self::arrivals_key(queue_id))
                .arg(user_id.as_str())
                .arg(to_score(now))
                .invoke_async(&mut conn),
        )
        .await?;

        let outcome = match reply.as_slice() {
            [0, rank] => JoinOutcome::Joined {
                rank: ordinal(*rank),
            },
            [1, rank] => JoinOutcome::AlreadyWaiting {
                rank: ordinal(*rank),
            },
            [2, expires] => JoinOutcome::AlreadyEnterable {
                expires_at: from_score(*expires)?,
            },
            other => return Err(malformed("join", other)),
        };

        tracing::debug!(
            queue_id = %queue_id,
            user_id = %user_id,
            outcome = ?outcome,
            "Join processed"
        );

        Ok(outcome)
    }

    async fn leave(&self, queue_id: QueueId, user_id: &UserId) -> Result<Departure> {
        let mut conn = self.conn_manager.clone();
        let reply: Vec<i64> = bounded(
            self.command_timeout,
            "leave",
            self.scripts
                .leave
                .key(Self::waiting_key(queue_id))
                .key(Self::enterable_key(queue_id))
                .arg(user_id.as_str())
                .invoke_async(&mut conn),
        )
        .await?;

        match reply.as_slice() {
            [left] => Ok(Departure {
                left_waiting: *left == 1,
                revoked_grant: None,
            }),
            [left, expires] => Ok(Departure {
                left_waiting: *left == 1,
                revoked_grant: Some(from_score(*expires)?),
            }),
            other => Err(malformed("leave", other)),
        }
    }

    async fn membership(&self, queue_id: QueueId, user_id: &UserId) -> Result<Membership> {
        let mut conn = self.conn_manager.clone();
        let reply: Vec<i64> = bounded(
            self.command_timeout,
            "membership",
            self.scripts
                .membership
                .key(Self::waiting_key(queue_id))
                .key(Self::enterable_key(queue_id))
                .key(Self::arrivals_key(queue_id))
                .arg(user_id.as_str())
                .invoke_async(&mut conn),
        )
        .await?;

        match reply.as_slice() {
            [2, expires, arrival @ ..] => Ok(Membership::Granted {
                expires_at: from_score(*expires)?,
                last_joined: last_joined(arrival)?,
            }),
            [1, rank] => Ok(Membership::Waiting {
                rank: ordinal(*rank),
            }),
            [0, arrival @ ..] => Ok(Membership::Absent {
                last_joined: last_joined(arrival)?,
            }),
            other => Err(malformed("membership", other)),
        }
    }

    async fn waiting_len(&self, queue_id: QueueId) -> Result<u64> {
        let mut conn = self.conn_manager.clone();
        bounded(
            self.command_timeout,
            "waiting_len",
            conn.zcard(Self::waiting_key(queue_id)),
        )
        .await
    }

    async fn waiting_head(&self, queue_id: QueueId, limit: u32) -> Result<Vec<UserId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let members: Vec<String> = bounded(
            self.command_timeout,
            "waiting_head",
            conn.zrange(Self::waiting_key(queue_id), 0, stop),
        )
        .await?;
        Ok(members.into_iter().map(UserId::new).collect())
    }

    async fn count_active_grants(&self, queue_id: QueueId, now: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn_manager.clone();
        bounded(
            self.command_timeout,
            "count_active_grants",
            conn.zcount(
                Self::enterable_key(queue_id),
                format!("({}", to_score(now)),
                "+inf",
            ),
        )
        .await
    }

    async fn active_grants(&self, queue_id: QueueId, now: DateTime<Utc>) -> Result<Vec<Grant>> {
        let mut conn = self.conn_manager.clone();
        let members: Vec<(String, f64)> = bounded(
            self.command_timeout,
            "active_grants",
            conn.zrangebyscore_withscores(
                Self::enterable_key(queue_id),
                format!("({}", to_score(now)),
                "+inf",
            ),
        )
        .await?;
        grants(members)
    }

    async fn purge_expired_grants(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        let mut conn = self.conn_manager.clone();
        let key = Self::enterable_key(queue_id);
        let cutoff = to_score(now);

        let (stale, removed): (Vec<(String, f64)>, u64) = bounded(
            self.command_timeout,
            "purge_expired_grants",
            redis::pipe()
                .atomic()
                .zrangebyscore_withscores(&key, "-inf", cutoff)
                .zrembyscore(&key, "-inf", cutoff)
                .query_async(&mut conn),
        )
        .await?;

        if removed > 0 {
            tracing::debug!(queue_id = %queue_id, removed, "Purged lapsed grants");
        }

        grants(stale)
    }

    async fn revoke_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn_manager.clone();
        let key = Self::enterable_key(queue_id);

        let (score, _removed): (Option<f64>, u64) = bounded(
            self.command_timeout,
            "revoke_grant",
            redis::pipe()
                .atomic()
                .zscore(&key, user_id.as_str())
                .zrem(&key, user_id.as_str())
                .query_async(&mut conn),
        )
        .await?;

        score.map(instant).transpose()
    }

    async fn promote(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        capacity: u32,
    ) -> Result<PromoteOutcome> {
        let mut conn = self.conn_manager.clone();
        let reply: Vec<i64> = bounded(
            self.command_timeout,
            "promote",
            self.scripts
                .promote
                .key(Self::waiting_key(queue_id))
                .key(Self::enterable_key(queue_id))
                .arg(user_id.as_str())
                .arg(to_score(expires_at))
                .arg(to_score(now))
                .arg(capacity)
                .invoke_async(&mut conn),
        )
        .await?;

        match reply.as_slice() {
            [1, arrival] => Ok(PromoteOutcome::Moved {
                joined_at: from_score(*arrival)?,
            }),
            [0, _] => Ok(PromoteOutcome::Skipped),
            [-1, _] => Ok(PromoteOutcome::RejectedFull),
            other => Err(malformed("promote", other)),
        }
    }

    async fn requeue(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        joined_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let added: i64 = bounded(
            self.command_timeout,
            "requeue",
            self.scripts
                .requeue
                .key(Self::waiting_key(queue_id))
                .key(Self::enterable_key(queue_id))
                .arg(user_id.as_str())
                .arg(to_score(joined_at))
                .invoke_async(&mut conn),
        )
        .await?;

        tracing::info!(
            queue_id = %queue_id,
            user_id = %user_id,
            restored = added == 1,
            "Requeued user after failed grant write"
        );

        Ok(added == 1)
    }

    async fn drop_queue(&self, queue_id: QueueId) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: u64 = bounded(
            self.command_timeout,
            "drop_queue",
            conn.del(vec![
                Self::waiting_key(queue_id),
                Self::enterable_key(queue_id),
                Self::arrivals_key(queue_id),
            ]),
        )
        .await?;

        tracing::info!(queue_id = %queue_id, "Dropped queue sets from Redis");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_share_a_hash_tag() {
        let queue_id = QueueId::new();
        let waiting = RedisFastStore::waiting_key(queue_id);
        let enterable = RedisFastStore::enterable_key(queue_id);
        let arrivals = RedisFastStore::arrivals_key(queue_id);

        let tag = format!("{{{queue_id}}}");
        assert!(waiting.contains(&tag));
        assert!(enterable.contains(&tag));
        assert!(arrivals.contains(&tag));
        assert!(waiting.ends_with(":waiting"));
        assert!(enterable.ends_with(":enterable"));
        assert!(arrivals.ends_with(":arrivals"));
    }
}
