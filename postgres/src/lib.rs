//! `PostgreSQL` durable store for the waiting room.
//!
//! This crate implements the `DurableStore` trait from `waiting-room-core`:
//!
//! - Queue configuration (`admission_queues`)
//! - Entry history (`admission_entries`), with a partial unique index that
//!   allows at most one `enterable` row per (queue, user)
//! - Batched expiry sweeps using `FOR UPDATE SKIP LOCKED` so concurrent
//!   workers never block each other
//!
//! # Example
//!
//! ```no_run
//! use waiting_room_postgres::{PoolSettings, PostgresDurableStore, connect};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/waiting_room", &PoolSettings::default()).await?;
//! let store = PostgresDurableStore::new(pool);
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

mod durable_store;

pub use durable_store::PostgresDurableStore;

use sqlx::Executor;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use waiting_room_core::{QueueError, Result};

/// Connection pool limits and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum pool size.
    pub max_connections: u32,
    /// Connections kept open when idle.
    pub min_connections: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
    /// Close connections idle for longer than this.
    pub idle_timeout: Duration,
    /// Server-side limit for any single statement.
    pub statement_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            statement_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    /// Set the maximum pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the per-statement timeout.
    #[must_use]
    pub const fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }
}

/// Open a connection pool.
///
/// Every new connection runs `SET statement_timeout` before use.
///
/// # Errors
///
/// Returns [`QueueError::Database`] if the initial connection fails.
pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<PgPool> {
    let statement_timeout_ms = settings.statement_timeout.as_millis();

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(Some(settings.idle_timeout))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                let sql = format!("SET statement_timeout = {statement_timeout_ms}");
                conn.execute(sql.as_str()).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .map_err(|e| QueueError::Database(format!("Failed to connect: {e}")))?;

    tracing::info!(
        max_connections = settings.max_connections,
        statement_timeout_ms = u64::try_from(statement_timeout_ms).unwrap_or(u64::MAX),
        "Connected to PostgreSQL"
    );

    Ok(pool)
}
