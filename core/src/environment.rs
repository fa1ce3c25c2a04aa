//! Injected dependencies that are not stores.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability
///
/// Every instant the waiting room compares (arrival, grant expiry, repair
/// grace) comes from an injected clock so tests can control it.
///
/// # Examples
///
/// ```
/// use waiting_room_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let before = chrono::Utc::now();
/// assert!(clock.now() >= before);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
