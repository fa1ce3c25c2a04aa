//! In-memory fast store.

use crate::lock_failed;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use waiting_room_core::providers::FastStore;
use waiting_room_core::{
    Departure, Grant, JoinOutcome, Membership, PromoteOutcome, QueueError, QueueId, Result,
    UserId, from_score, to_score,
};

#[derive(Debug, Default)]
struct QueueSets {
    waiting_order: BTreeSet<(i64, UserId)>,
    waiting: HashMap<UserId, i64>,
    enterable: HashMap<UserId, i64>,
    arrivals: HashMap<UserId, i64>,
}

impl QueueSets {
    fn rank(&self, user_id: &UserId) -> Option<u64> {
        let score = *self.waiting.get(user_id)?;
        let ahead = self
            .waiting_order
            .range(..(score, user_id.clone()))
            .count();
        Some(ahead as u64)
    }

    fn insert_waiting(&mut self, user_id: &UserId, score: i64) {
        self.waiting.insert(user_id.clone(), score);
        self.waiting_order.insert((score, user_id.clone()));
    }

    fn remove_waiting(&mut self, user_id: &UserId) -> Option<i64> {
        let score = self.waiting.remove(user_id)?;
        self.waiting_order.remove(&(score, user_id.clone()));
        Some(score)
    }

    fn tail_score(&self) -> Option<i64> {
        self.waiting_order.last().map(|(score, _)| *score)
    }

    fn active_count(&self, now_ms: i64) -> usize {
        self.enterable.values().filter(|&&exp| exp > now_ms).count()
    }
}

/// In-memory `FastStore`.
///
/// A single mutex guards all queues, so every method is atomic the same
/// way the Redis scripts are.
#[derive(Debug, Clone)]
pub struct InMemoryFastStore {
    queues: Arc<Mutex<HashMap<QueueId, QueueSets>>>,
    available: Arc<AtomicBool>,
}

impl InMemoryFastStore {
    /// Create a new in-memory fast store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Insert a raw enterable member, bypassing promotion (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if lock is poisoned.
    pub fn insert_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut queues = self.queues.lock().map_err(|_| lock_failed())?;
        let sets = queues.entry(queue_id).or_default();
        sets.remove_waiting(user_id);
        sets.enterable.insert(user_id.clone(), to_score(expires_at));
        Ok(())
    }

    /// Total enterable members, stale ones included (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if lock is poisoned.
    pub fn enterable_len(&self, queue_id: QueueId) -> Result<usize> {
        let queues = self.queues.lock().map_err(|_| lock_failed())?;
        Ok(queues.get(&queue_id).map_or(0, |sets| sets.enterable.len()))
    }

    fn with_queues<T>(
        &self,
        f: impl FnOnce(&mut HashMap<QueueId, QueueSets>) -> Result<T>,
    ) -> Result<T> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::FastStore("connection refused".to_string()));
        }
        let mut queues = self.queues.lock().map_err(|_| lock_failed())?;
        f(&mut queues)
    }
}

impl Default for InMemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FastStore for InMemoryFastStore {
    fn join(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<JoinOutcome>> + Send {
        let result = self.with_queues(|queues| {
            let sets = queues.entry(queue_id).or_default();
            let now_ms = to_score(now);

            if let Some(&exp) = sets.enterable.get(user_id) {
                if exp > now_ms {
                    return Ok(JoinOutcome::AlreadyEnterable {
                        expires_at: from_score(exp)?,
                    });
                }
                sets.enterable.remove(user_id);
            }

            if let Some(rank) = sets.rank(user_id) {
                return Ok(JoinOutcome::AlreadyWaiting { rank });
            }

            let score = sets.tail_score().map_or(now_ms, |tail| now_ms.max(tail + 1));
            sets.insert_waiting(user_id, score);
            sets.arrivals.insert(user_id.clone(), score);
            let rank = sets.rank(user_id).unwrap_or_default();
            Ok(JoinOutcome::Joined { rank })
        });
        async move { result }
    }

    fn leave(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Departure>> + Send {
        let result = self.with_queues(|queues| {
            let Some(sets) = queues.get_mut(&queue_id) else {
                return Ok(Departure::default());
            };
            let left_waiting = sets.remove_waiting(user_id).is_some();
            let revoked_grant = sets
                .enterable
                .remove(user_id)
                .map(from_score)
                .transpose()?;
            Ok(Departure {
                left_waiting,
                revoked_grant,
            })
        });
        async move { result }
    }

    fn membership(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Membership>> + Send {
        let result = self.with_queues(|queues| {
            let Some(sets) = queues.get(&queue_id) else {
                return Ok(Membership::Absent { last_joined: None });
            };
            let last_joined = sets.arrivals.get(user_id).copied().map(from_score).transpose()?;
            if let Some(&exp) = sets.enterable.get(user_id) {
                return Ok(Membership::Granted {
                    expires_at: from_score(exp)?,
                    last_joined,
                });
            }
            if let Some(rank) = sets.rank(user_id) {
                return Ok(Membership::Waiting { rank });
            }
            Ok(Membership::Absent { last_joined })
        });
        async move { result }
    }

    fn waiting_len(&self, queue_id: QueueId) -> impl Future<Output = Result<u64>> + Send {
        let result = self.with_queues(|queues| {
            Ok(queues
                .get(&queue_id)
                .map_or(0, |sets| sets.waiting.len() as u64))
        });
        async move { result }
    }

    fn waiting_head(
        &self,
        queue_id: QueueId,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<UserId>>> + Send {
        let result = self.with_queues(|queues| {
            Ok(queues.get(&queue_id).map_or_else(Vec::new, |sets| {
                sets.waiting_order
                    .iter()
                    .take(limit as usize)
                    .map(|(_, user)| user.clone())
                    .collect()
            }))
        });
        async move { result }
    }

    fn count_active_grants(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64>> + Send {
        let result = self.with_queues(|queues| {
            Ok(queues
                .get(&queue_id)
                .map_or(0, |sets| sets.active_count(to_score(now)) as u64))
        });
        async move { result }
    }

    fn active_grants(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Grant>>> + Send {
        let result = self.with_queues(|queues| {
            let now_ms = to_score(now);
            let Some(sets) = queues.get(&queue_id) else {
                return Ok(Vec::new());
            };
            let mut grants = sets
                .enterable
                .iter()
                .filter(|&(_, &exp)| exp > now_ms)
                .map(|(user, &exp)| {
                    Ok(Grant {
                        user_id: user.clone(),
                        expires_at: from_score(exp)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            grants.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
            Ok(grants)
        });
        async move { result }
    }

    fn purge_expired_grants(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Grant>>> + Send {
        let result = self.with_queues(|queues| {
            let now_ms = to_score(now);
            let Some(sets) = queues.get_mut(&queue_id) else {
                return Ok(Vec::new());
            };
            let stale: Vec<(UserId, i64)> = sets
                .enterable
                .iter()
                .filter(|&(_, &exp)| exp <= now_ms)
                .map(|(user, &exp)| (user.clone(), exp))
                .collect();
            stale
                .into_iter()
                .map(|(user_id, exp)| {
                    sets.enterable.remove(&user_id);
                    Ok(Grant {
                        user_id,
                        expires_at: from_score(exp)?,
                    })
                })
                .collect()
        });
        async move { result }
    }

    fn revoke_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send {
        let result = self.with_queues(|queues| {
            queues
                .get_mut(&queue_id)
                .and_then(|sets| sets.enterable.remove(user_id))
                .map(from_score)
                .transpose()
        });
        async move { result }
    }

    fn promote(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        capacity: u32,
    ) -> impl Future<Output = Result<PromoteOutcome>> + Send {
        let result = self.with_queues(|queues| {
            let Some(sets) = queues.get_mut(&queue_id) else {
                return Ok(PromoteOutcome::Skipped);
            };
            if !sets.waiting.contains_key(user_id) {
                return Ok(PromoteOutcome::Skipped);
            }
            if sets.active_count(to_score(now)) >= capacity as usize {
                return Ok(PromoteOutcome::RejectedFull);
            }
            let arrival = sets.remove_waiting(user_id).unwrap_or_default();
            sets.enterable.insert(user_id.clone(), to_score(expires_at));
            Ok(PromoteOutcome::Moved {
                joined_at: from_score(arrival)?,
            })
        });
        async move { result }
    }

    fn requeue(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        joined_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send {
        let result = self.with_queues(|queues| {
            let Some(sets) = queues.get_mut(&queue_id) else {
                return Ok(false);
            };
            if sets.enterable.remove(user_id).is_none() {
                return Ok(false);
            }
            if sets.waiting.contains_key(user_id) {
                return Ok(false);
            }
            sets.insert_waiting(user_id, to_score(joined_at));
            Ok(true)
        });
        async move { result }
    }

    fn drop_queue(&self, queue_id: QueueId) -> impl Future<Output = Result<()>> + Send {
        let result = self.with_queues(|queues| {
            queues.remove(&queue_id);
            Ok(())
        });
        async move { result }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_clock;
    use chrono::TimeDelta;
    use proptest::prelude::*;
    use waiting_room_core::environment::Clock;

    #[tokio::test]
    async fn join_is_idempotent_and_strictly_ordered() {
        let store = InMemoryFastStore::new();
        let queue = QueueId::new();
        let now = test_clock().now();

        let a = UserId::new("a");
        let b = UserId::new("b");
        assert_eq!(store.join(queue, &a, now).await.unwrap(), JoinOutcome::Joined { rank: 0 });
        assert_eq!(store.join(queue, &b, now).await.unwrap(), JoinOutcome::Joined { rank: 1 });
        assert_eq!(
            store.join(queue, &a, now).await.unwrap(),
            JoinOutcome::AlreadyWaiting { rank: 0 }
        );
        assert_eq!(store.waiting_len(queue).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn promote_respects_capacity_and_skips_absent_users() {
        let store = InMemoryFastStore::new();
        let queue = QueueId::new();
        let now = test_clock().now();
        let expires = now + TimeDelta::seconds(60);

        for user in ["a", "b"] {
            store.join(queue, &UserId::new(user), now).await.unwrap();
        }

        let moved = store.promote(queue, &UserId::new("a"), expires, now, 1).await.unwrap();
        assert!(matches!(moved, PromoteOutcome::Moved { .. }));
        let full = store.promote(queue, &UserId::new("b"), expires, now, 1).await.unwrap();
        assert_eq!(full, PromoteOutcome::RejectedFull);
        let skipped = store.promote(queue, &UserId::new("x"), expires, now, 1).await.unwrap();
        assert_eq!(skipped, PromoteOutcome::Skipped);

        // A lapsed grant no longer occupies capacity.
        let later = expires;
        let moved = store
            .promote(queue, &UserId::new("b"), later + TimeDelta::seconds(60), later, 1)
            .await
            .unwrap();
        assert!(matches!(moved, PromoteOutcome::Moved { .. }));
    }

    #[tokio::test]
    async fn join_replaces_a_stale_grant() {
        let store = InMemoryFastStore::new();
        let queue = QueueId::new();
        let now = test_clock().now();
        let user = UserId::new("a");

        store.insert_grant(queue, &user, now).unwrap();
        assert_eq!(store.join(queue, &user, now).await.unwrap(), JoinOutcome::Joined { rank: 0 });
        assert_eq!(store.enterable_len(queue).unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_after_leaving_keeps_the_user_out() {
        let store = InMemoryFastStore::new();
        let queue = QueueId::new();
        let now = test_clock().now();
        let user = UserId::new("a");

        store.join(queue, &user, now).await.unwrap();
        let PromoteOutcome::Moved { joined_at } = store
            .promote(queue, &user, now + TimeDelta::seconds(60), now, 1)
            .await
            .unwrap()
        else {
            panic!("expected a move");
        };
        store.leave(queue, &user).await.unwrap();

        assert!(!store.requeue(queue, &user, joined_at).await.unwrap());
        assert_eq!(store.waiting_len(queue).await.unwrap(), 0);
        assert!(matches!(
            store.membership(queue, &user).await.unwrap(),
            Membership::Absent { .. }
        ));
    }

    #[tokio::test]
    async fn requeue_restores_a_held_grant_to_waiting() {
        let store = InMemoryFastStore::new();
        let queue = QueueId::new();
        let now = test_clock().now();
        let user = UserId::new("a");

        store.join(queue, &user, now).await.unwrap();
        store.promote(queue, &user, now + TimeDelta::seconds(60), now, 1).await.unwrap();

        assert!(store.requeue(queue, &user, now).await.unwrap());
        assert_eq!(store.membership(queue, &user).await.unwrap(), Membership::Waiting { rank: 0 });
        assert_eq!(store.enterable_len(queue).unwrap(), 0);
    }

    #[tokio::test]
    async fn membership_remembers_the_latest_join() {
        let store = InMemoryFastStore::new();
        let queue = QueueId::new();
        let user = UserId::new("a");
        let first = test_clock().now();
        let second = first + TimeDelta::seconds(30);

        assert_eq!(
            store.membership(queue, &user).await.unwrap(),
            Membership::Absent { last_joined: None }
        );

        store.join(queue, &user, first).await.unwrap();
        store.leave(queue, &user).await.unwrap();
        store.join(queue, &user, second).await.unwrap();
        store.leave(queue, &user).await.unwrap();

        assert_eq!(
            store.membership(queue, &user).await.unwrap(),
            Membership::Absent {
                last_joined: Some(second)
            }
        );
    }

    #[tokio::test]
    async fn outage_surfaces_as_fast_store_error() {
        let store = InMemoryFastStore::new();
        store.set_available(false);
        let err = store.waiting_len(QueueId::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    proptest! {
        #[test]
        fn ranks_follow_join_order(offsets in proptest::collection::vec(0i64..3, 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = InMemoryFastStore::new();
                let queue = QueueId::new();
                let mut now = test_clock().now();
                let mut users = Vec::new();

                for (i, offset) in offsets.iter().enumerate() {
                    now += TimeDelta::milliseconds(*offset);
                    let user = UserId::new(format!("u{i}"));
                    store.join(queue, &user, now).await.unwrap();
                    users.push(user);
                }

                let head = store.waiting_head(queue, u32::MAX).await.unwrap();
                prop_assert_eq!(&head, &users);
                for (i, user) in users.iter().enumerate() {
                    prop_assert_eq!(
                        store.membership(queue, user).await.unwrap(),
                        Membership::Waiting { rank: i as u64 }
                    );
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
