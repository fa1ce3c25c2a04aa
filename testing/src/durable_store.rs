//! In-memory durable store.

use crate::lock_failed;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use waiting_room_core::providers::DurableStore;
use waiting_room_core::{
    Entry, EntryId, EntryStatus, NewGrant, Queue, QueueError, QueueId, QueueSettings, ResourceId,
    Result, UserId,
};

#[derive(Debug, Default)]
struct Tables {
    queues: HashMap<QueueId, Queue>,
    entries: Vec<Entry>,
}

impl Tables {
    fn enterable_mut(&mut self, queue_id: QueueId, user_id: &UserId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| {
            e.queue_id == queue_id && &e.user_id == user_id && e.status == EntryStatus::Enterable
        })
    }

    fn grant_mut(&mut self, grant: &NewGrant) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| {
            e.queue_id == grant.queue_id
                && e.user_id == grant.user_id
                && e.expires_at == grant.expires_at
        })
    }
}

/// In-memory `DurableStore`.
///
/// Mirrors the `PostgreSQL` constraints: unique resource per queue, one
/// `Enterable` row per (queue, user), one row per grant (queue, user,
/// expiry), and cascading entry deletion.
#[derive(Debug, Clone)]
pub struct InMemoryDurableStore {
    tables: Arc<Mutex<Tables>>,
    available: Arc<AtomicBool>,
    failing_grant_writes: Arc<AtomicU32>,
}

impl InMemoryDurableStore {
    /// Create a new in-memory durable store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            available: Arc::new(AtomicBool::new(true)),
            failing_grant_writes: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Simulate the database going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `record_grant` fail with a transient error.
    pub fn fail_grant_writes(&self, count: u32) {
        self.failing_grant_writes.store(count, Ordering::SeqCst);
    }

    /// All entries of a user in a queue, oldest first (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if lock is poisoned.
    pub fn entries_for(&self, queue_id: QueueId, user_id: &UserId) -> Result<Vec<Entry>> {
        let tables = self.tables.lock().map_err(|_| lock_failed())?;
        Ok(tables
            .entries
            .iter()
            .filter(|e| e.queue_id == queue_id && &e.user_id == user_id)
            .cloned()
            .collect())
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::Database("pool timed out".to_string()));
        }
        let mut tables = self.tables.lock().map_err(|_| lock_failed())?;
        f(&mut tables)
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for InMemoryDurableStore {
    fn create_queue(&self, queue: &Queue) -> impl Future<Output = Result<()>> + Send {
        let result = self.with_tables(|tables| {
            if tables
                .queues
                .values()
                .any(|q| q.resource_id == queue.resource_id)
            {
                return Err(QueueError::DuplicateResource(queue.resource_id.to_string()));
            }
            tables.queues.insert(queue.id, queue.clone());
            Ok(())
        });
        async move { result }
    }

    fn update_queue(
        &self,
        queue_id: QueueId,
        settings: &QueueSettings,
        updated_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Queue>> + Send {
        let result = self.with_tables(|tables| {
            let queue = tables
                .queues
                .get_mut(&queue_id)
                .ok_or(QueueError::QueueNotFound)?;
            queue.settings = settings.clone();
            queue.updated_at = updated_at;
            Ok(queue.clone())
        });
        async move { result }
    }

    fn delete_queue(&self, queue_id: QueueId) -> impl Future<Output = Result<bool>> + Send {
        let result = self.with_tables(|tables| {
            let existed = tables.queues.remove(&queue_id).is_some();
            tables.entries.retain(|e| e.queue_id != queue_id);
            Ok(existed)
        });
        async move { result }
    }

    fn get_queue(&self, queue_id: QueueId) -> impl Future<Output = Result<Option<Queue>>> + Send {
        let result = self.with_tables(|tables| Ok(tables.queues.get(&queue_id).cloned()));
        async move { result }
    }

    fn get_queue_by_resource(
        &self,
        resource_id: &ResourceId,
    ) -> impl Future<Output = Result<Option<Queue>>> + Send {
        let result = self.with_tables(|tables| {
            Ok(tables
                .queues
                .values()
                .find(|q| &q.resource_id == resource_id)
                .cloned())
        });
        async move { result }
    }

    fn list_queues(&self) -> impl Future<Output = Result<Vec<Queue>>> + Send {
        let result = self.with_tables(|tables| {
            let mut queues: Vec<Queue> = tables.queues.values().cloned().collect();
            queues.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(queues)
        });
        async move { result }
    }

    fn record_grant(&self, grant: &NewGrant) -> impl Future<Output = Result<Entry>> + Send {
        let failing = self
            .failing_grant_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if failing {
            Err(QueueError::Database("connection reset".to_string()))
        } else {
            self.with_tables(|tables| {
                if let Some(existing) = tables.grant_mut(grant) {
                    return Ok(existing.clone());
                }
                if let Some(previous) = tables.enterable_mut(grant.queue_id, &grant.user_id) {
                    previous.status = EntryStatus::Expired;
                    previous.expired_at = Some(grant.granted_at);
                }
                let entry = Entry {
                    id: EntryId::new(),
                    queue_id: grant.queue_id,
                    user_id: grant.user_id.clone(),
                    status: EntryStatus::Enterable,
                    joined_at: grant.joined_at,
                    granted_at: grant.granted_at,
                    expires_at: grant.expires_at,
                    completed_at: None,
                    expired_at: None,
                };
                tables.entries.push(entry.clone());
                Ok(entry)
            })
        };
        async move { result }
    }

    fn latest_entry(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Option<Entry>>> + Send {
        let result = self.with_tables(|tables| {
            Ok(tables
                .entries
                .iter()
                .filter(|e| e.queue_id == queue_id && &e.user_id == user_id)
                .max_by_key(|e| (e.granted_at, e.expires_at))
                .cloned())
        });
        async move { result }
    }

    fn complete_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        completed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Entry>>> + Send {
        let result = self.with_tables(|tables| {
            Ok(tables.enterable_mut(queue_id, user_id).map(|entry| {
                entry.status = EntryStatus::Completed;
                entry.completed_at = Some(completed_at);
                entry.clone()
            }))
        });
        async move { result }
    }

    fn record_completion(
        &self,
        grant: &NewGrant,
        completed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Entry>> + Send {
        let result = self.with_tables(|tables| {
            if let Some(existing) = tables.grant_mut(grant) {
                if existing.status == EntryStatus::Enterable {
                    existing.status = EntryStatus::Completed;
                    existing.completed_at = Some(completed_at);
                }
                return Ok(existing.clone());
            }
            let entry = Entry {
                id: EntryId::new(),
                queue_id: grant.queue_id,
                user_id: grant.user_id.clone(),
                status: EntryStatus::Completed,
                joined_at: grant.joined_at,
                granted_at: grant.granted_at,
                expires_at: grant.expires_at,
                completed_at: Some(completed_at),
                expired_at: None,
            };
            tables.entries.push(entry.clone());
            Ok(entry)
        });
        async move { result }
    }

    fn expire_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        expired_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Entry>>> + Send {
        let result = self.with_tables(|tables| {
            Ok(tables.enterable_mut(queue_id, user_id).map(|entry| {
                entry.status = EntryStatus::Expired;
                entry.expired_at = Some(expired_at);
                entry.clone()
            }))
        });
        async move { result }
    }

    fn expire_overdue(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<u64>> + Send {
        let result = self.with_tables(|tables| {
            let mut expired = 0u64;
            for entry in tables.entries.iter_mut().filter(|e| {
                e.queue_id == queue_id
                    && e.status == EntryStatus::Enterable
                    && e.expires_at <= now
            }) {
                if expired >= u64::from(limit) {
                    break;
                }
                entry.status = EntryStatus::Expired;
                entry.expired_at = Some(now);
                expired += 1;
            }
            Ok(expired)
        });
        async move { result }
    }

    fn enterable_entries(
        &self,
        queue_id: QueueId,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Entry>>> + Send {
        let result = self.with_tables(|tables| {
            let mut entries: Vec<Entry> = tables
                .entries
                .iter()
                .filter(|e| e.queue_id == queue_id && e.status == EntryStatus::Enterable)
                .cloned()
                .collect();
            entries.sort_by(|a, b| a.granted_at.cmp(&b.granted_at));
            entries.truncate(limit as usize);
            Ok(entries)
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
    use std::time::Duration;
    use waiting_room_core::environment::Clock;

    fn grant(queue_id: QueueId, user: &str, at: DateTime<Utc>) -> NewGrant {
        NewGrant {
            queue_id,
            user_id: UserId::new(user),
            joined_at: at,
            granted_at: at,
            expires_at: at + TimeDelta::seconds(30),
        }
    }

    #[tokio::test]
    async fn resource_ids_are_unique() {
        let store = InMemoryDurableStore::new();
        let now = test_clock().now();
        let queue = Queue {
            id: QueueId::new(),
            resource_id: ResourceId::new("perf-1"),
            settings: QueueSettings::new(1, Duration::from_secs(30)),
            created_at: now,
            updated_at: now,
        };
        store.create_queue(&queue).await.unwrap();

        let duplicate = Queue {
            id: QueueId::new(),
            ..queue
        };
        assert!(matches!(
            store.create_queue(&duplicate).await,
            Err(QueueError::DuplicateResource(_))
        ));
    }

    #[tokio::test]
    async fn new_grant_supersedes_lingering_enterable_row() {
        let store = InMemoryDurableStore::new();
        let queue_id = QueueId::new();
        let now = test_clock().now();

        store.record_grant(&grant(queue_id, "a", now)).await.unwrap();
        let later = now + TimeDelta::seconds(60);
        store.record_grant(&grant(queue_id, "a", later)).await.unwrap();

        let rows = store.entries_for(queue_id, &UserId::new("a")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, EntryStatus::Expired);
        assert_eq!(rows[0].expired_at, Some(later));
        assert_eq!(rows[1].status, EntryStatus::Enterable);
    }

    #[tokio::test]
    async fn expire_overdue_honours_limit_and_boundary() {
        let store = InMemoryDurableStore::new();
        let queue_id = QueueId::new();
        let now = test_clock().now();
        for user in ["a", "b", "c"] {
            store.record_grant(&grant(queue_id, user, now)).await.unwrap();
        }

        let boundary = now + TimeDelta::seconds(30);
        let before = boundary - TimeDelta::milliseconds(1);
        assert_eq!(store.expire_overdue(queue_id, before, 10).await.unwrap(), 0);
        assert_eq!(store.expire_overdue(queue_id, boundary, 2).await.unwrap(), 2);
        assert_eq!(store.expire_overdue(queue_id, boundary, 2).await.unwrap(), 1);
        assert!(store.enterable_entries(queue_id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recording_the_same_grant_twice_keeps_one_row() {
        let store = InMemoryDurableStore::new();
        let queue_id = QueueId::new();
        let now = test_clock().now();
        let first = grant(queue_id, "a", now);

        store.record_completion(&first, now).await.unwrap();
        let again = store.record_grant(&first).await.unwrap();
        store.record_grant(&first).await.unwrap();

        let rows = store.entries_for(queue_id, &UserId::new("a")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, EntryStatus::Completed);
        assert_eq!(again.status, EntryStatus::Completed);
    }

    #[tokio::test]
    async fn completion_of_a_recorded_grant_completes_its_row() {
        let store = InMemoryDurableStore::new();
        let queue_id = QueueId::new();
        let now = test_clock().now();
        let first = grant(queue_id, "a", now);

        store.record_grant(&first).await.unwrap();
        let done = now + TimeDelta::seconds(5);
        store.record_completion(&first, done).await.unwrap();

        let rows = store.entries_for(queue_id, &UserId::new("a")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, EntryStatus::Completed);
        assert_eq!(rows[0].completed_at, Some(done));
    }

    #[tokio::test]
    async fn injected_grant_write_failures_are_consumed() {
        let store = InMemoryDurableStore::new();
        let queue_id = QueueId::new();
        let now = test_clock().now();
        store.fail_grant_writes(1);

        assert!(store.record_grant(&grant(queue_id, "a", now)).await.is_err());
        assert!(store.record_grant(&grant(queue_id, "a", now)).await.is_ok());
    }
}
