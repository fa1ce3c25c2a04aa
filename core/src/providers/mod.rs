//! Store and coordination interfaces.
//!
//! The admission logic depends only on these traits. Production wires in
//! Redis and `PostgreSQL`; tests use the in-memory versions from
//! `waiting-room-testing`.
//!
//! ```text
//!            ┌──────────────────────┐
//!  enter ───▶│ FastStore            │  waiting set (score = arrival ms)
//!  position  │  authoritative       │  enterable set (score = expiry ms)
//!            └──────────┬───────────┘
//!                       │ promote / revoke
//!                       ▼
//!            ┌──────────────────────┐
//!            │ DurableStore         │  queues + entry history
//!            │  mirror + terminal   │  (enterable / expired / completed)
//!            └──────────────────────┘
//! ```
//!
//! The fast store is authoritative for "who may enter now". The durable
//! store is the record of history and may lag it; reconciliation closes
//! the gap.

pub mod durable_store;
pub mod fast_store;
pub mod lease;

pub use durable_store::DurableStore;
pub use fast_store::FastStore;
pub use lease::{LeaseProvider, LeaseToken};
