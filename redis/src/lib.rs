//! Redis adapters for the waiting room.
//!
//! - [`RedisFastStore`]: waiting and enterable sets as sorted sets, with
//!   every compound check-then-act step in a Lua script
//! - [`RedisLeaseProvider`]: `SET NX PX` leases with token-checked renew
//!   and release
//!
//! Both wrap every round trip in a timeout so a stalled Redis cannot wedge
//! a caller.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use waiting_room_redis::{RedisFastStore, RedisLeaseProvider, connect};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = connect("redis://127.0.0.1:6379").await?;
//! let store = RedisFastStore::from_connection(conn.clone(), Duration::from_millis(500));
//! let leases = RedisLeaseProvider::from_connection(conn, Duration::from_millis(500));
//! # Ok(())
//! # }
//! ```

mod fast_store;
mod lease;
mod scripts;

pub use fast_store::RedisFastStore;
pub use lease::RedisLeaseProvider;

use redis::Client;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;
use waiting_room_core::{QueueError, Result};

/// Open a managed (auto-reconnecting) connection.
///
/// # Errors
///
/// Returns error if the URL is invalid or the initial connection fails.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = Client::open(redis_url)
        .map_err(|e| QueueError::FastStore(format!("Failed to create Redis client: {e}")))?;

    ConnectionManager::new(client).await.map_err(|e| {
        QueueError::FastStore(format!("Failed to create Redis connection manager: {e}"))
    })
}

/// Run one Redis round trip under a deadline.
async fn bounded<T>(
    limit: Duration,
    operation: &'static str,
    call: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::warn!(operation, error = %e, "Redis call failed");
            Err(QueueError::FastStore(format!("{operation}: {e}")))
        }
        Err(_) => {
            tracing::warn!(operation, timeout_ms = limit.as_millis(), "Redis call timed out");
            Err(QueueError::Timeout {
                operation: operation.to_string(),
            })
        }
    }
}
