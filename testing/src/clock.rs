//! Manually advanced clock.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{Arc, RwLock};
use waiting_room_core::environment::Clock;

/// Clock that only moves when told to.
///
/// Clones share the same instant, so a test can hand one clone to the
/// code under test and advance another.
///
/// # Example
///
/// ```
/// use waiting_room_testing::test_clock;
/// use waiting_room_core::environment::Clock;
/// use chrono::TimeDelta;
///
/// let clock = test_clock();
/// let start = clock.now();
/// clock.advance(TimeDelta::seconds(2));
/// assert_eq!(clock.now() - start, TimeDelta::seconds(2));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    time: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a new manual clock at the given time
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(RwLock::new(time)),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, time: DateTime<Utc>) {
        let mut guard = self.time.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = time;
    }

    /// Move forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut guard = self.time.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Create a default manual clock for tests (2025-01-01 00:00:00 UTC)
#[must_use]
pub fn test_clock() -> ManualClock {
    ManualClock::new(DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(1_735_689_600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_new_year_2025() {
        let clock = test_clock();
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn clones_share_time() {
        let clock = test_clock();
        let other = clock.clone();
        other.advance(TimeDelta::milliseconds(250));
        assert_eq!(clock.now(), other.now());
        assert_eq!(clock.now().timestamp_subsec_millis(), 250);
    }
}
