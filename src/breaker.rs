//! Default circuit-breaker collaborator.
//!
//! Tracks failures per key in a sliding time window and opens the circuit
//! for a fixed timeout once the threshold is reached. This is the breaker
//! the fail2ban rule and the composer use unless the application supplies
//! its own [`CircuitBreaker`] implementation.

use crate::clock::{SharedClock, system_clock};
use crate::traits::breaker::CircuitBreaker;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default, Clone)]
struct BreakerEntry {
    /// Timestamps of failures within the sliding window.
    failures: Vec<f64>,
    /// When the circuit opened, if it did.
    opened_at: Option<f64>,
}

impl BreakerEntry {
    fn prune(&mut self, cutoff: f64) {
        self.failures.retain(|&t| t > cutoff);
    }

    fn live_failures(&self, cutoff: f64) -> u64 {
        self.failures.iter().filter(|&&t| t > cutoff).count() as u64
    }
}

/// Sliding-window circuit breaker keyed by fingerprint.
pub struct WindowedBreaker {
    failure_threshold: u32,
    failure_window: f64,
    reset_timeout: f64,
    clock: SharedClock,
    state: RwLock<HashMap<String, BreakerEntry>>,
}

impl WindowedBreaker {
    /// Create a breaker that opens after `failure_threshold` failures within
    /// `failure_window` seconds and stays open for `reset_timeout` seconds.
    pub fn new(failure_threshold: u32, failure_window: f64, reset_timeout: f64) -> Self {
        Self::with_clock(failure_threshold, failure_window, reset_timeout, system_clock())
    }

    /// Create a breaker with an injected clock. Used by tests.
    pub fn with_clock(
        failure_threshold: u32,
        failure_window: f64,
        reset_timeout: f64,
        clock: SharedClock,
    ) -> Self {
        Self {
            failure_threshold,
            failure_window,
            reset_timeout,
            clock,
            state: RwLock::new(HashMap::new()),
        }
    }

    fn open_until(&self, entry: &BreakerEntry) -> Option<f64> {
        entry.opened_at.map(|t| t + self.reset_timeout)
    }
}

impl CircuitBreaker for WindowedBreaker {
    fn is_open(&self, key: &str) -> bool {
        let now = self.clock.now();
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .get(key)
            .and_then(|entry| self.open_until(entry))
            .map(|until| now < until)
            .unwrap_or(false)
    }

    fn record_failure(&self, key: &str) {
        let now = self.clock.now();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(key.to_string()).or_default();

        // An expired open circuit falls back to counting from scratch.
        if let Some(until) = self.open_until(entry) {
            if now >= until {
                *entry = BreakerEntry::default();
            }
        }

        entry.prune(now - self.failure_window);
        entry.failures.push(now);

        if entry.opened_at.is_none() && entry.failures.len() as u64 >= self.failure_threshold as u64
        {
            entry.opened_at = Some(now);
            tracing::warn!(
                target: "breakwater.breaker",
                key = %key,
                failures = entry.failures.len(),
                reset_timeout = self.reset_timeout,
                "Circuit opened"
            );
        }
    }

    fn record_success(&self, key: &str) {
        let now = self.clock.now();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        // A success after the timeout closes the circuit; successes while the
        // circuit is open or closed do not erase recorded failures.
        let probe_succeeded = state
            .get(key)
            .and_then(|entry| self.open_until(entry))
            .map(|until| now >= until)
            .unwrap_or(false);
        if probe_succeeded {
            state.remove(key);
            tracing::info!(
                target: "breakwater.breaker",
                key = %key,
                "Circuit closed after successful probe"
            );
        }
    }

    fn reset(&self, key: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.remove(key).is_some() {
            tracing::info!(
                target: "breakwater.breaker",
                key = %key,
                "Circuit reset"
            );
        }
    }

    fn failure_count(&self, key: &str) -> u64 {
        let cutoff = self.clock.now() - self.failure_window;
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .get(key)
            .map(|entry| entry.live_failures(cutoff))
            .unwrap_or(0)
    }

    fn time_until_close(&self, key: &str) -> f64 {
        let now = self.clock.now();
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .get(key)
            .and_then(|entry| self.open_until(entry))
            .map(|until| (until - now).max(0.0))
            .unwrap_or(0.0)
    }
}
