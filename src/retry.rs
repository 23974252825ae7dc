//! Default retry collaborator.
//!
//! Exponential backoff with jitter, the policy the composer wires in when
//! `retry_on_failure` is configured. Rate-limit rejections are not retried
//! unless explicitly opted in; configuration errors are never retried.

use crate::error::{BreakwaterError, Result};
use crate::traits::retry::RetryPolicy;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`,
/// with up to `jitter_factor` of proportional random spread.
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    retry_throttled: bool,
}

impl ExponentialBackoff {
    /// Create a policy making at most `max_attempts` attempts.
    ///
    /// `jitter_factor` is clamped to `[0, 1]`; at `0.25` each delay is
    /// scattered within ±25% of its nominal value.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            retry_throttled: false,
        }
    }

    /// Also retry rate-limit rejections. Off by default.
    #[must_use]
    pub fn retry_throttled(mut self, retry: bool) -> Self {
        self.retry_throttled = retry;
        self
    }

    fn retryable(&self, error: &BreakwaterError) -> bool {
        match error {
            BreakwaterError::Throttled { .. } => self.retry_throttled,
            BreakwaterError::Config(_) => false,
            _ => true,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter_factor > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
            (capped * (1.0 + spread)).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

#[async_trait]
impl RetryPolicy for ExponentialBackoff {
    async fn call<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if !self.retryable(&error) => return Err(error),
                Err(error) => {
                    if attempt >= self.max_attempts {
                        return Err(BreakwaterError::RetryExhausted {
                            attempts: attempt,
                            last: Box::new(error),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        target: "breakwater.retry",
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
