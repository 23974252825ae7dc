//! Storage abstraction for limiter state.
//!
//! A backend holds three kinds of state: fixed-window counters, GCRA
//! theoretical-arrival-times, and token buckets. Every `check_*` operation
//! is atomic with respect to concurrent operations on the same key: the
//! in-process backend serializes through shard locks, the Redis backend
//! through server-side scripts. `peek_*` operations never mutate.

mod in_memory;

#[cfg(feature = "redis-storage")]
mod redis;

pub use in_memory::{InMemoryStorage, MemoryStorageConfig, MemoryStorageConfigBuilder};

#[cfg(feature = "redis-storage")]
pub use redis::{RedisStorage, RedisStorageConfig, RedisStorageConfigBuilder};

use crate::error::Result;
use async_trait::async_trait;

/// Outcome of a GCRA admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcraDecision {
    /// Whether the request conforms at `now`.
    pub allowed: bool,
    /// Seconds until the next request would conform. Zero when allowed.
    pub retry_after: f64,
    /// The theoretical arrival time observed by this check, in the same
    /// units as `now`.
    pub tat: f64,
}

/// Outcome of a token-bucket admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketDecision {
    /// Whether a whole token was available at `now`.
    pub allowed: bool,
    /// Seconds until a whole token refills. Zero when allowed.
    pub retry_after: f64,
    /// Whole tokens left after the check.
    pub tokens_remaining: u64,
}

/// Atomic state store for rate limiters.
///
/// Implementations must be safe for use from any task or thread, and for a
/// given key must make concurrent check-and-consume calls observable as some
/// serial order.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomically add `amount` to the counter for `key` in the current
    /// window, returning the post-increment count. A fresh key gets a TTL of
    /// `window_secs`; the window boundary is anchored to the first request
    /// within it.
    async fn increment_counter(&self, key: &str, window_secs: u64, amount: u64) -> Result<u64>;

    /// Current counter value, or 0 if the key is absent or expired.
    async fn get_counter(&self, key: &str, window_secs: u64) -> Result<u64>;

    /// Seconds until the counter window expires. 0 when absent.
    async fn counter_ttl(&self, key: &str, window_secs: u64) -> Result<f64>;

    /// Drop the counter for `key`.
    async fn reset_counter(&self, key: &str, window_secs: u64) -> Result<()>;

    /// Drop GCRA and token-bucket state for exactly `key`.
    async fn reset_state(&self, key: &str) -> Result<()>;

    /// Atomic GCRA admission and TAT update.
    ///
    /// `emission_interval` is `period / limit`; `delay_tolerance` is the
    /// permitted burst in seconds (zero throughout this crate). On
    /// admission the stored TAT advances by exactly one emission interval
    /// and the entry TTL is refreshed to `ttl` seconds.
    async fn check_gcra(
        &self,
        key: &str,
        emission_interval: f64,
        delay_tolerance: f64,
        ttl: f64,
        now: f64,
    ) -> Result<GcraDecision>;

    /// GCRA admission check without mutating stored state.
    async fn peek_gcra(
        &self,
        key: &str,
        emission_interval: f64,
        delay_tolerance: f64,
        now: f64,
    ) -> Result<GcraDecision>;

    /// Atomic token-bucket refill and decrement.
    ///
    /// A fresh bucket starts full at `capacity`; refill is continuous at
    /// `refill_rate` tokens per second, clamped to `capacity`.
    async fn check_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        ttl: f64,
        now: f64,
    ) -> Result<TokenBucketDecision>;

    /// Token-bucket check without mutating stored state.
    async fn peek_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: f64,
    ) -> Result<TokenBucketDecision>;

    /// Best-effort removal of matching keys. `None` clears everything under
    /// the backend's namespace; `Some(pattern)` matches a key prefix.
    async fn clear(&self, pattern: Option<&str>) -> Result<()>;

    /// Whether the backend can currently serve requests.
    fn is_healthy(&self) -> bool;
}

/// Shared GCRA math used by the in-process backend and mirrored by the Lua
/// scripts. Returns the decision plus the TAT to store on admission.
pub(crate) fn gcra_decide(
    stored_tat: Option<f64>,
    emission_interval: f64,
    delay_tolerance: f64,
    now: f64,
) -> (GcraDecision, Option<f64>) {
    let tat = stored_tat.unwrap_or(0.0).max(now);
    let allowed = (tat - now) <= delay_tolerance;
    if allowed {
        (
            GcraDecision {
                allowed: true,
                retry_after: 0.0,
                tat,
            },
            Some(tat + emission_interval),
        )
    } else {
        (
            GcraDecision {
                allowed: false,
                retry_after: tat - now - delay_tolerance,
                tat,
            },
            None,
        )
    }
}

/// Continuous refill shared by both token-bucket paths, mirrored by the Lua
/// scripts.
pub(crate) fn token_bucket_refill(
    stored: Option<(f64, f64)>,
    capacity: f64,
    refill_rate: f64,
    now: f64,
) -> f64 {
    let (tokens, last_refill) = stored.unwrap_or((capacity, now));
    let elapsed = (now - last_refill).max(0.0);
    capacity.min(tokens + elapsed * refill_rate)
}

/// Consuming token-bucket decision: returns the decision plus the level to
/// store on admission. `tokens_remaining` reports the post-consume level.
pub(crate) fn token_bucket_consume(
    tokens: f64,
    refill_rate: f64,
) -> (TokenBucketDecision, Option<f64>) {
    if tokens >= 1.0 {
        let remaining = tokens - 1.0;
        (
            TokenBucketDecision {
                allowed: true,
                retry_after: 0.0,
                tokens_remaining: remaining.floor() as u64,
            },
            Some(remaining),
        )
    } else {
        (
            TokenBucketDecision {
                allowed: false,
                retry_after: (1.0 - tokens) / refill_rate,
                tokens_remaining: 0,
            },
            None,
        )
    }
}

/// Non-consuming token-bucket decision: `tokens_remaining` reports the
/// current whole tokens.
pub(crate) fn token_bucket_observe(tokens: f64, refill_rate: f64) -> TokenBucketDecision {
    if tokens >= 1.0 {
        TokenBucketDecision {
            allowed: true,
            retry_after: 0.0,
            tokens_remaining: tokens.floor() as u64,
        }
    } else {
        TokenBucketDecision {
            allowed: false,
            retry_after: (1.0 - tokens) / refill_rate,
            tokens_remaining: 0,
        }
    }
}
