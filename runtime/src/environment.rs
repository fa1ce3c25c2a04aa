//! Injected dependencies shared by the engine, scheduler, reconciler and
//! orchestrator.

use std::sync::Arc;
use waiting_room_core::environment::Clock;
use waiting_room_core::providers::{DurableStore, FastStore};

/// The two stores and the clock every component works against.
///
/// Cloning is cheap; all fields are reference-counted.
pub struct QueueEnvironment<F, D, C> {
    /// Ordered waiting and enterable sets.
    pub fast: Arc<F>,
    /// Queue configuration and entry history.
    pub durable: Arc<D>,
    /// Source of "now".
    pub clock: Arc<C>,
}

impl<F, D, C> QueueEnvironment<F, D, C>
where
    F: FastStore,
    D: DurableStore,
    C: Clock,
{
    /// Bundle stores and clock.
    pub fn new(fast: F, durable: D, clock: C) -> Self {
        Self {
            fast: Arc::new(fast),
            durable: Arc::new(durable),
            clock: Arc::new(clock),
        }
    }

    /// Bundle already shared stores and clock.
    pub const fn from_shared(fast: Arc<F>, durable: Arc<D>, clock: Arc<C>) -> Self {
        Self {
            fast,
            durable,
            clock,
        }
    }
}

impl<F, D, C> Clone for QueueEnvironment<F, D, C> {
    fn clone(&self) -> Self {
        Self {
            fast: Arc::clone(&self.fast),
            durable: Arc::clone(&self.durable),
            clock: Arc::clone(&self.clock),
        }
    }
}
