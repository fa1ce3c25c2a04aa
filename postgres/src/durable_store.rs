//! `PostgreSQL` implementation of [`DurableStore`].

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use waiting_room_core::providers::DurableStore;
use waiting_room_core::{
    Entry, EntryId, EntryStatus, NewGrant, Queue, QueueError, QueueId, QueueSettings, ResourceId,
    Result, UserId,
};

const ENTRY_COLUMNS: &str = "id, queue_id, user_id, status, joined_at, granted_at, expires_at, \
                             completed_at, expired_at";

const QUEUE_COLUMNS: &str = "id, resource_id, capacity, grant_lifetime_ms, batch_size, \
                             promotion_interval_ms, created_at, updated_at";

/// `PostgreSQL`-backed queue and entry repository.
///
/// Status transitions are single conditional `UPDATE`s on
/// `status = 'enterable'`, so concurrent reconcilers and request handlers
/// never move a terminal row.
#[derive(Clone)]
pub struct PostgresDurableStore {
    pool: PgPool,
}

impl PostgresDurableStore {
    /// Create a new store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    fn row_to_queue(row: &PgRow) -> Result<Queue> {
        let capacity: i32 = row.get("capacity");
        let batch_size: i32 = row.get("batch_size");
        let lifetime_ms: i64 = row.get("grant_lifetime_ms");
        let interval_ms: i64 = row.get("promotion_interval_ms");

        Ok(Queue {
            id: QueueId::from_uuid(row.get("id")),
            resource_id: ResourceId::new(row.get::<String, _>("resource_id")),
            settings: QueueSettings {
                capacity: from_column("capacity", capacity)?,
                grant_lifetime: Duration::from_millis(from_column(
                    "grant_lifetime_ms",
                    lifetime_ms,
                )?),
                batch_size: from_column("batch_size", batch_size)?,
                promotion_interval: Duration::from_millis(from_column(
                    "promotion_interval_ms",
                    interval_ms,
                )?),
            },
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_entry(row: &PgRow) -> Result<Entry> {
        let status: String = row.get("status");

        Ok(Entry {
            id: EntryId::from_uuid(row.get("id")),
            queue_id: QueueId::from_uuid(row.get("queue_id")),
            user_id: UserId::new(row.get::<String, _>("user_id")),
            status: EntryStatus::parse(&status)?,
            joined_at: row.get("joined_at"),
            granted_at: row.get("granted_at"),
            expires_at: row.get("expires_at"),
            completed_at: row.get("completed_at"),
            expired_at: row.get("expired_at"),
        })
    }

    /// The row of one grant, identified by its expiry.
    async fn find_grant<'e, E>(executor: E, grant: &NewGrant) -> Result<Option<Entry>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let row = sqlx::query(&format!(
            r"
            SELECT {ENTRY_COLUMNS}
            FROM admission_entries
            WHERE queue_id = $1 AND user_id = $2 AND expires_at = $3
            "
        ))
        .bind(*grant.queue_id.as_uuid())
        .bind(grant.user_id.as_str())
        .bind(grant.expires_at)
        .fetch_optional(executor)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn transition(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        to: EntryStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Entry>> {
        let stamp_column = match to {
            EntryStatus::Completed => "completed_at",
            EntryStatus::Expired | EntryStatus::Enterable => "expired_at",
        };

        let row = sqlx::query(&format!(
            r"
            UPDATE admission_entries
            SET status = $3, {stamp_column} = $4
            WHERE queue_id = $1 AND user_id = $2 AND status = 'enterable'
            RETURNING {ENTRY_COLUMNS}
            "
        ))
        .bind(*queue_id.as_uuid())
        .bind(user_id.as_str())
        .bind(to.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }
}

fn db_error(e: sqlx::Error) -> QueueError {
    QueueError::Database(e.to_string())
}

fn from_column<S, T: TryFrom<S>>(column: &str, value: S) -> Result<T> {
    T::try_from(value).map_err(|_| QueueError::Database(format!("{column} out of range")))
}

fn to_column<S, T: TryFrom<S>>(field: &str, value: S) -> Result<T> {
    T::try_from(value).map_err(|_| QueueError::InvalidSettings(format!("{field} out of range")))
}

struct SettingsColumns {
    capacity: i32,
    grant_lifetime_ms: i64,
    batch_size: i32,
    promotion_interval_ms: i64,
}

impl SettingsColumns {
    fn from_settings(settings: &QueueSettings) -> Result<Self> {
        Ok(Self {
            capacity: to_column("capacity", settings.capacity)?,
            grant_lifetime_ms: to_column("grant_lifetime", settings.grant_lifetime.as_millis())?,
            batch_size: to_column("batch_size", settings.batch_size)?,
            promotion_interval_ms: to_column(
                "promotion_interval",
                settings.promotion_interval.as_millis(),
            )?,
        })
    }
}

impl DurableStore for PostgresDurableStore {
    async fn create_queue(&self, queue: &Queue) -> Result<()> {
        let columns = SettingsColumns::from_settings(&queue.settings)?;

        sqlx::query(
            r"
            INSERT INTO admission_queues (
                id, resource_id, capacity, grant_lifetime_ms, batch_size,
                promotion_interval_ms, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(*queue.id.as_uuid())
        .bind(queue.resource_id.as_str())
        .bind(columns.capacity)
        .bind(columns.grant_lifetime_ms)
        .bind(columns.batch_size)
        .bind(columns.promotion_interval_ms)
        .bind(queue.created_at)
        .bind(queue.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                QueueError::DuplicateResource(queue.resource_id.to_string())
            }
            other => db_error(other),
        })?;

        tracing::info!(
            queue_id = %queue.id,
            resource_id = %queue.resource_id,
            capacity = queue.settings.capacity,
            "Queue created"
        );

        Ok(())
    }

    async fn update_queue(
        &self,
        queue_id: QueueId,
        settings: &QueueSettings,
        updated_at: DateTime<Utc>,
    ) -> Result<Queue> {
        let columns = SettingsColumns::from_settings(settings)?;

        let row = sqlx::query(&format!(
            r"
            UPDATE admission_queues
            SET capacity = $2, grant_lifetime_ms = $3, batch_size = $4,
                promotion_interval_ms = $5, updated_at = $6
            WHERE id = $1
            RETURNING {QUEUE_COLUMNS}
            "
        ))
        .bind(*queue_id.as_uuid())
        .bind(columns.capacity)
        .bind(columns.grant_lifetime_ms)
        .bind(columns.batch_size)
        .bind(columns.promotion_interval_ms)
        .bind(updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(QueueError::QueueNotFound)?;

        tracing::info!(
            queue_id = %queue_id,
            capacity = settings.capacity,
            "Queue settings updated"
        );

        Self::row_to_queue(&row)
    }

    async fn delete_queue(&self, queue_id: QueueId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM admission_queues WHERE id = $1")
            .bind(*queue_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_queue(&self, queue_id: QueueId) -> Result<Option<Queue>> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM admission_queues WHERE id = $1"
        ))
        .bind(*queue_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_queue).transpose()
    }

    async fn get_queue_by_resource(&self, resource_id: &ResourceId) -> Result<Option<Queue>> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM admission_queues WHERE resource_id = $1"
        ))
        .bind(resource_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_queue).transpose()
    }

    async fn list_queues(&self) -> Result<Vec<Queue>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM admission_queues ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_queue).collect()
    }

    async fn record_grant(&self, grant: &NewGrant) -> Result<Entry> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Database(format!("Failed to start transaction: {e}")))?;

        // Step 0: a retried write finds its own row, possibly already terminal
        if let Some(existing) = Self::find_grant(&mut *tx, grant).await? {
            tx.commit()
                .await
                .map_err(|e| QueueError::Database(format!("Failed to commit transaction: {e}")))?;
            tracing::debug!(
                queue_id = %grant.queue_id,
                user_id = %grant.user_id,
                status = existing.status.as_str(),
                "Grant already recorded"
            );
            return Ok(existing);
        }

        // Step 1: retire any live row so the partial unique index admits the new one
        let superseded = sqlx::query(
            r"
            UPDATE admission_entries
            SET status = 'expired', expired_at = $3
            WHERE queue_id = $1 AND user_id = $2 AND status = 'enterable'
            ",
        )
        .bind(*grant.queue_id.as_uuid())
        .bind(grant.user_id.as_str())
        .bind(grant.granted_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();

        // Step 2: insert the new grant
        let row = sqlx::query(&format!(
            r"
            INSERT INTO admission_entries (
                id, queue_id, user_id, status, joined_at, granted_at, expires_at
            ) VALUES ($1, $2, $3, 'enterable', $4, $5, $6)
            RETURNING {ENTRY_COLUMNS}
            "
        ))
        .bind(*EntryId::new().as_uuid())
        .bind(*grant.queue_id.as_uuid())
        .bind(grant.user_id.as_str())
        .bind(grant.joined_at)
        .bind(grant.granted_at)
        .bind(grant.expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit()
            .await
            .map_err(|e| QueueError::Database(format!("Failed to commit transaction: {e}")))?;

        if superseded > 0 {
            tracing::warn!(
                queue_id = %grant.queue_id,
                user_id = %grant.user_id,
                superseded,
                "New grant superseded a lingering enterable entry"
            );
        }

        Self::row_to_entry(&row)
    }

    async fn latest_entry(&self, queue_id: QueueId, user_id: &UserId) -> Result<Option<Entry>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {ENTRY_COLUMNS}
            FROM admission_entries
            WHERE queue_id = $1 AND user_id = $2
            ORDER BY granted_at DESC, expires_at DESC
            LIMIT 1
            "
        ))
        .bind(*queue_id.as_uuid())
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn complete_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<Entry>> {
        self.transition(queue_id, user_id, EntryStatus::Completed, completed_at)
            .await
    }

    async fn record_completion(
        &self,
        grant: &NewGrant,
        completed_at: DateTime<Utc>,
    ) -> Result<Entry> {
        let row = sqlx::query(&format!(
            r"
            INSERT INTO admission_entries (
                id, queue_id, user_id, status, joined_at, granted_at, expires_at, completed_at
            ) VALUES ($1, $2, $3, 'completed', $4, $5, $6, $7)
            ON CONFLICT (queue_id, user_id, expires_at) DO UPDATE
            SET status = 'completed', completed_at = EXCLUDED.completed_at
            WHERE admission_entries.status = 'enterable'
            RETURNING {ENTRY_COLUMNS}
            "
        ))
        .bind(*EntryId::new().as_uuid())
        .bind(*grant.queue_id.as_uuid())
        .bind(grant.user_id.as_str())
        .bind(grant.joined_at)
        .bind(grant.granted_at)
        .bind(grant.expires_at)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        if let Some(row) = row {
            return Self::row_to_entry(&row);
        }

        // The grant's row is already terminal
        Self::find_grant(&self.pool, grant)
            .await?
            .ok_or_else(|| QueueError::Database("completed grant row vanished".to_string()))
    }

    async fn expire_grant(
        &self,
        queue_id: QueueId,
        user_id: &UserId,
        expired_at: DateTime<Utc>,
    ) -> Result<Option<Entry>> {
        self.transition(queue_id, user_id, EntryStatus::Expired, expired_at)
            .await
    }

    async fn expire_overdue(
        &self,
        queue_id: QueueId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE admission_entries
            SET status = 'expired', expired_at = $2
            WHERE id IN (
                SELECT id FROM admission_entries
                WHERE queue_id = $1 AND status = 'enterable' AND expires_at <= $2
                ORDER BY expires_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'enterable'
            ",
        )
        .bind(*queue_id.as_uuid())
        .bind(now)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let expired = result.rows_affected();
        if expired > 0 {
            metrics::counter!("waiting_room_durable_entries_expired_total").increment(expired);
        }

        Ok(expired)
    }

    async fn enterable_entries(&self, queue_id: QueueId, limit: u32) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ENTRY_COLUMNS}
            FROM admission_entries
            WHERE queue_id = $1 AND status = 'enterable'
            ORDER BY granted_at ASC
            LIMIT $2
            "
        ))
        .bind(*queue_id.as_uuid())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_entry).collect()
    }
}
