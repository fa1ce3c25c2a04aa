//! # Waiting Room Runtime
//!
//! Admission control on top of the store traits in `waiting-room-core`.
//!
//! ## Core Components
//!
//! - **Orchestrator**: enter, position, complete and exit, plus queue
//!   administration
//! - **Admission Engine**: promotes a batch of waiting users through the
//!   atomic promote primitive and records each grant durably
//! - **Admission Scheduler**: runs the engine on every tick, but only in the
//!   process holding the leader lease
//! - **Reconciler**: expiry sweep, expiry mirror and divergence repair
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use waiting_room_core::{Position, QueueSettings, ResourceId, UserId};
//! use waiting_room_runtime::{QueueEnvironment, QueueOrchestrator};
//! use waiting_room_testing::{InMemoryDurableStore, InMemoryFastStore, test_clock};
//!
//! # tokio_test::block_on(async {
//! let env = QueueEnvironment::new(InMemoryFastStore::new(), InMemoryDurableStore::new(), test_clock());
//! let orchestrator = QueueOrchestrator::new(env);
//!
//! let resource = ResourceId::new("concert-2025");
//! orchestrator
//!     .create_queue(resource.clone(), QueueSettings::new(100, Duration::from_secs(300)))
//!     .await?;
//!
//! let response = orchestrator.enter(&resource, &UserId::new("alice")).await?;
//! assert_eq!(response.position, Position::Waiting { rank: 1, count_ahead: 1 });
//! # Ok::<(), waiting_room_core::QueueError>(())
//! # }).unwrap();
//! ```

/// Promotion of waiting users into grants
pub mod admission;

/// Scheduler and reconciler tunables
pub mod config;

/// Shared stores and clock
pub mod environment;

/// Leader lease with renewal watchdog
pub mod lease;

/// Prometheus metrics for observability
pub mod metrics;

/// Request-path operations and queue administration
pub mod orchestrator;

/// Fixed-period background jobs
pub mod periodic;

/// Store reconciliation duties
pub mod reconcile;

/// Retry logic with exponential backoff
pub mod retry;

/// Leader-elected admission ticks
pub mod scheduler;

pub use admission::{AdmissionEngine, PromotionReport};
pub use config::{AdmissionConfig, ReconcileConfig};
pub use environment::QueueEnvironment;
pub use lease::{LeaderLease, acquire_within};
pub use orchestrator::QueueOrchestrator;
pub use reconcile::{MirrorReport, Reconciler, RepairReport, SweepReport};
pub use retry::RetryPolicy;
pub use scheduler::{AdmissionScheduler, CycleOutcome};
