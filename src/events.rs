//! Structured rate-limit events with a pluggable sink.
//!
//! Instrumentation is a passive capability: the limiter emits events through
//! an [`EventSink`] and the default sink drops them. Applications wire in
//! [`TracingSink`] or their own implementation to observe limiter activity.

use serde::Serialize;

use crate::limiter::Algorithm;

/// A single rate-limit event emitted by the limiter façade.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum RateLimitEvent {
    /// A non-consuming check was performed.
    #[serde(rename = "rate_limit.checked")]
    Checked {
        key: String,
        limit: u64,
        period: f64,
        algorithm: Algorithm,
        allowed: bool,
        remaining: u64,
    },
    /// A consuming check admitted the request.
    #[serde(rename = "rate_limit.allowed")]
    Allowed {
        key: String,
        limit: u64,
        period: f64,
        algorithm: Algorithm,
        remaining: u64,
    },
    /// A consuming check rejected the request.
    #[serde(rename = "rate_limit.throttled")]
    Throttled {
        key: String,
        limit: u64,
        period: f64,
        algorithm: Algorithm,
        retry_after: f64,
    },
}

impl RateLimitEvent {
    /// The dotted event name, stable across sinks.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Checked { .. } => "rate_limit.checked",
            Self::Allowed { .. } => "rate_limit.allowed",
            Self::Throttled { .. } => "rate_limit.throttled",
        }
    }

    /// The limiter key the event concerns.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Checked { key, .. } | Self::Allowed { key, .. } | Self::Throttled { key, .. } => {
                key
            }
        }
    }
}

/// Sink for rate-limit events.
///
/// Emission order may differ from admission order under concurrency and must
/// not be relied upon.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RateLimitEvent);
}

/// The default sink: drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &RateLimitEvent) {}
}

/// Sink that logs events as structured tracing records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &RateLimitEvent) {
        match event {
            RateLimitEvent::Checked {
                key,
                limit,
                period,
                algorithm,
                allowed,
                remaining,
            } => {
                tracing::debug!(
                    target: "breakwater.events",
                    event = event.name(),
                    key = %key,
                    limit = limit,
                    period = period,
                    algorithm = %algorithm,
                    allowed = allowed,
                    remaining = remaining,
                    "Rate limit checked"
                );
            }
            RateLimitEvent::Allowed {
                key,
                limit,
                period,
                algorithm,
                remaining,
            } => {
                tracing::debug!(
                    target: "breakwater.events",
                    event = event.name(),
                    key = %key,
                    limit = limit,
                    period = period,
                    algorithm = %algorithm,
                    remaining = remaining,
                    "Rate limit allowed"
                );
            }
            RateLimitEvent::Throttled {
                key,
                limit,
                period,
                algorithm,
                retry_after,
            } => {
                tracing::info!(
                    target: "breakwater.events",
                    event = event.name(),
                    key = %key,
                    limit = limit,
                    period = period,
                    algorithm = %algorithm,
                    retry_after = retry_after,
                    "Rate limit throttled"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::Mutex;

    /// Records emitted events for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<RateLimitEvent>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn names(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.name())
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &RateLimitEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
