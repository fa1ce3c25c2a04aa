//! # Waiting Room Core
//!
//! Domain model and store interfaces for an admission-control waiting room.
//!
//! Users enter a per-resource queue, wait in strict arrival order, and are
//! promoted to a time-boxed *grant* while the queue has capacity. The
//! number of valid grants never exceeds the queue's capacity.
//!
//! This crate has no I/O. It defines:
//!
//! - [`types`]: queue, entry, position and outcome types
//! - [`error`]: the [`QueueError`] taxonomy
//! - [`environment`]: the injected [`Clock`](environment::Clock)
//! - [`providers`]: the [`FastStore`], [`DurableStore`] and
//!   [`LeaseProvider`] traits implemented by the Redis, `PostgreSQL` and
//!   in-memory adapters

pub mod environment;
pub mod error;
pub mod providers;
pub mod types;

pub use error::{QueueError, Result};
pub use providers::{DurableStore, FastStore, LeaseProvider, LeaseToken};
pub use types::*;
