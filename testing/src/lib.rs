//! # Waiting Room Testing
//!
//! Testing utilities for the waiting room.
//!
//! This crate provides:
//! - [`ManualClock`]: deterministic, manually advanced time
//! - [`InMemoryFastStore`]: `FastStore` with the same atomicity as the Redis scripts
//! - [`InMemoryDurableStore`]: `DurableStore` over a `Vec` of entries
//! - [`InMemoryLeaseProvider`]: `LeaseProvider` with expiring leases
//!
//! Every store has `set_available(false)` to simulate an outage.
//!
//! ## Example
//!
//! ```
//! use waiting_room_testing::{InMemoryFastStore, test_clock};
//! use waiting_room_core::{FastStore, JoinOutcome, QueueId, UserId};
//! use waiting_room_core::environment::Clock;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryFastStore::new();
//! let clock = test_clock();
//! let queue = QueueId::new();
//!
//! let outcome = store.join(queue, &UserId::new("u1"), clock.now()).await.unwrap();
//! assert_eq!(outcome, JoinOutcome::Joined { rank: 0 });
//! # });
//! ```

pub mod clock;
pub mod durable_store;
pub mod fast_store;
pub mod lease;

pub use clock::{ManualClock, test_clock};
pub use durable_store::InMemoryDurableStore;
pub use fast_store::InMemoryFastStore;
pub use lease::InMemoryLeaseProvider;

use waiting_room_core::QueueError;

fn lock_failed() -> QueueError {
    QueueError::Internal("Mutex lock failed".to_string())
}
