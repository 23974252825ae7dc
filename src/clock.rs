//! Time sources for limiter state.
//!
//! All algorithm math runs on plain seconds (`f64`) so that the in-process
//! and Redis backends share one unit. The trait exists so tests can advance
//! time deterministically instead of sleeping.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of "now" in seconds.
pub trait Clock: Send + Sync {
    /// Current time in seconds. Must be non-decreasing between calls.
    fn now(&self) -> f64;
}

/// Wall-clock time since the Unix epoch.
///
/// Redis Lua scripts receive `now` as an argument, so both backends agree on
/// the epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct MockClock {
    now: std::sync::Mutex<f64>,
}

impl MockClock {
    /// Create a clock starting at the given instant (seconds).
    pub fn new(start: f64) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    /// Advance the clock by `seconds`.
    pub fn advance(&self, seconds: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += seconds;
    }

    /// Jump the clock to an absolute instant. Ignored if it would go backwards.
    pub fn set(&self, instant: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if instant > *now {
            *now = instant;
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared clock handle used throughout the crate.
pub type SharedClock = Arc<dyn Clock>;

/// The default clock: system wall time.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 1_000_000_000.0); // sanity: epoch seconds, not uptime
    }

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new(100.0);
        assert_eq!(clock.now(), 100.0);
        clock.advance(0.5);
        assert_eq!(clock.now(), 100.5);
        clock.advance(59.5);
        assert_eq!(clock.now(), 160.0);
    }

    #[test]
    fn test_mock_clock_never_rewinds() {
        let clock = MockClock::new(100.0);
        clock.set(50.0);
        assert_eq!(clock.now(), 100.0);
        clock.set(200.0);
        assert_eq!(clock.now(), 200.0);
    }
}
