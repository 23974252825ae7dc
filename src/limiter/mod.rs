//! Algorithm-agnostic limiter façade.
//!
//! A [`Limiter`] binds a key and a `limit / period` quota to one of the
//! three admission algorithms and runs every check through the storage
//! backend's atomic operations. It never fails open: storage errors
//! propagate to the caller.

mod algorithm;

pub use algorithm::Algorithm;

use crate::clock::{SharedClock, system_clock};
use crate::error::{BreakwaterError, Result};
use crate::events::{EventSink, NullSink, RateLimitEvent};
use crate::storage::Storage;
use std::sync::Arc;

/// Snapshot returned by a successful [`Limiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Units consumed in the current window, as far as the algorithm can
    /// tell (post-increment count for fixed windows; `limit - remaining`
    /// otherwise).
    pub count: u64,
    /// Further allowances available right now. GCRA reports a pseudo-count
    /// of `{0, 1}`; do not treat it as a real count.
    pub remaining: u64,
}

/// Rate limiter for one key.
pub struct Limiter {
    key: String,
    limit: u64,
    period: f64,
    algorithm: Algorithm,
    storage: Arc<dyn Storage>,
    clock: SharedClock,
    events: Arc<dyn EventSink>,
}

impl Limiter {
    /// Create a limiter of `limit` units per `period` seconds.
    ///
    /// `limit == 0` is a valid configuration that rejects everything;
    /// a non-positive or non-finite `period` is a configuration error.
    pub fn new(
        key: impl Into<String>,
        limit: u64,
        period: f64,
        algorithm: Algorithm,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        if !period.is_finite() || period <= 0.0 {
            return Err(BreakwaterError::config(format!(
                "Rate limit period must be a positive number of seconds, got {}",
                period
            )));
        }
        Ok(Self {
            key: key.into(),
            limit,
            period,
            algorithm,
            storage,
            clock: system_clock(),
            events: Arc::new(NullSink),
        })
    }

    /// Replace the time source. Used by tests to control time.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Fixed windows run on whole seconds; sub-second periods round up.
    fn window_secs(&self) -> u64 {
        (self.period.ceil() as u64).max(1)
    }

    fn emission_interval(&self) -> f64 {
        self.period / self.limit as f64
    }

    fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.period
    }

    /// Whether the next consume would succeed at this instant, without
    /// consuming. Emits `rate_limit.checked`.
    pub async fn allowed(&self) -> Result<bool> {
        let (allowed, remaining) = self.observe().await?;
        self.events.emit(&RateLimitEvent::Checked {
            key: self.key.clone(),
            limit: self.limit,
            period: self.period,
            algorithm: self.algorithm,
            allowed,
            remaining,
        });
        Ok(allowed)
    }

    /// Best-effort count of further allowances.
    ///
    /// Fixed window: `limit - count`, clamped at zero. Token bucket: whole
    /// tokens. GCRA: `{0, 1}`.
    pub async fn remaining(&self) -> Result<u64> {
        let (_, remaining) = self.observe().await?;
        Ok(remaining)
    }

    /// Seconds until at least one unit becomes available. Zero whenever
    /// [`allowed`](Self::allowed) is true.
    pub async fn retry_after(&self) -> Result<f64> {
        if self.limit == 0 {
            return Ok(self.period);
        }
        match self.algorithm {
            Algorithm::FixedWindow => {
                let count = self.storage.get_counter(&self.key, self.window_secs()).await?;
                if count < self.limit {
                    Ok(0.0)
                } else {
                    self.storage.counter_ttl(&self.key, self.window_secs()).await
                }
            }
            Algorithm::Gcra => {
                let decision = self
                    .storage
                    .peek_gcra(&self.key, self.emission_interval(), 0.0, self.clock.now())
                    .await?;
                Ok(decision.retry_after)
            }
            Algorithm::TokenBucket => {
                let decision = self
                    .storage
                    .peek_token_bucket(
                        &self.key,
                        self.limit as f64,
                        self.refill_rate(),
                        self.clock.now(),
                    )
                    .await?;
                Ok(decision.retry_after)
            }
        }
    }

    /// Consume one unit.
    ///
    /// Returns the admission snapshot on success and
    /// [`BreakwaterError::Throttled`] on rejection. Emits
    /// `rate_limit.allowed` or `rate_limit.throttled`; the internal check
    /// does not emit a `checked` event.
    pub async fn acquire(&self) -> Result<Admission> {
        if self.limit == 0 {
            return Err(self.throttled(self.period));
        }

        match self.algorithm {
            Algorithm::FixedWindow => {
                let window = self.window_secs();
                let count = self.storage.increment_counter(&self.key, window, 1).await?;
                if count > self.limit {
                    let retry_after = self.storage.counter_ttl(&self.key, window).await?;
                    Err(self.throttled(retry_after))
                } else {
                    Ok(self.admitted(count, self.limit - count))
                }
            }
            Algorithm::Gcra => {
                let decision = self
                    .storage
                    .check_gcra(
                        &self.key,
                        self.emission_interval(),
                        0.0,
                        self.period,
                        self.clock.now(),
                    )
                    .await?;
                if decision.allowed {
                    // With zero tolerance an accept leaves no immediate
                    // headroom.
                    Ok(self.admitted(self.limit, 0))
                } else {
                    Err(self.throttled(decision.retry_after))
                }
            }
            Algorithm::TokenBucket => {
                let decision = self
                    .storage
                    .check_token_bucket(
                        &self.key,
                        self.limit as f64,
                        self.refill_rate(),
                        self.period,
                        self.clock.now(),
                    )
                    .await?;
                if decision.allowed {
                    let remaining = decision.tokens_remaining;
                    Ok(self.admitted(self.limit.saturating_sub(remaining), remaining))
                } else {
                    Err(self.throttled(decision.retry_after))
                }
            }
        }
    }

    /// Consume one unit, then run `op`. The operation only executes when
    /// admission succeeds.
    pub async fn throttle<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.acquire().await?;
        op().await
    }

    /// Return this key to its initial state: `allowed()` true,
    /// `retry_after()` zero.
    pub async fn reset(&self) -> Result<()> {
        match self.algorithm {
            Algorithm::FixedWindow => {
                self.storage.reset_counter(&self.key, self.window_secs()).await
            }
            Algorithm::Gcra | Algorithm::TokenBucket => self.storage.reset_state(&self.key).await,
        }
    }

    /// Non-consuming observation shared by `allowed` and `remaining`.
    async fn observe(&self) -> Result<(bool, u64)> {
        if self.limit == 0 {
            return Ok((false, 0));
        }
        match self.algorithm {
            Algorithm::FixedWindow => {
                let count = self.storage.get_counter(&self.key, self.window_secs()).await?;
                Ok((count < self.limit, self.limit.saturating_sub(count)))
            }
            Algorithm::Gcra => {
                let decision = self
                    .storage
                    .peek_gcra(&self.key, self.emission_interval(), 0.0, self.clock.now())
                    .await?;
                Ok((decision.allowed, decision.allowed as u64))
            }
            Algorithm::TokenBucket => {
                let decision = self
                    .storage
                    .peek_token_bucket(
                        &self.key,
                        self.limit as f64,
                        self.refill_rate(),
                        self.clock.now(),
                    )
                    .await?;
                Ok((decision.allowed, decision.tokens_remaining))
            }
        }
    }

    fn admitted(&self, count: u64, remaining: u64) -> Admission {
        self.events.emit(&RateLimitEvent::Allowed {
            key: self.key.clone(),
            limit: self.limit,
            period: self.period,
            algorithm: self.algorithm,
            remaining,
        });
        Admission { count, remaining }
    }

    fn throttled(&self, retry_after: f64) -> BreakwaterError {
        self.events.emit(&RateLimitEvent::Throttled {
            key: self.key.clone(),
            limit: self.limit,
            period: self.period,
            algorithm: self.algorithm,
            retry_after,
        });
        BreakwaterError::Throttled {
            key: self.key.clone(),
            limit: self.limit,
            period: self.period,
            retry_after,
        }
    }
}
