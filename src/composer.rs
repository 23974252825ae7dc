//! Resilience composer.
//!
//! Binds a key to an optional rate limit, circuit breaker, and retry
//! policy, then runs a user operation wrapped retry → breaker → limiter →
//! operation. The limiter is the innermost check; retry sits outermost so
//! transient failures below it can be repeated. Rate-limit rejections are
//! not retried by default and do not count as breaker failures.

use crate::breaker::WindowedBreaker;
use crate::clock::{SharedClock, system_clock};
use crate::error::{BreakwaterError, Result};
use crate::events::EventSink;
use crate::limiter::{Algorithm, Limiter};
use crate::retry::ExponentialBackoff;
use crate::storage::Storage;
use crate::traits::breaker::CircuitBreaker;
use crate::traits::retry::RetryPolicy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Configures and builds a [`Composer`].
#[must_use = "builder does nothing until you call build()"]
pub struct ComposerBuilder {
    key: String,
    storage: Arc<dyn Storage>,
    clock: SharedClock,
    events: Option<Arc<dyn EventSink>>,
    limit: Option<(u64, f64, Algorithm)>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
    break_on: Option<(u32, f64, f64)>,
    retry: Option<ExponentialBackoff>,
}

impl ComposerBuilder {
    fn new(key: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            key: key.into(),
            storage,
            clock: system_clock(),
            events: None,
            limit: None,
            breaker: None,
            break_on: None,
            retry: None,
        }
    }

    /// Rate-limit the operation to `rate` executions per `per` seconds.
    pub fn limit(mut self, rate: u64, per: f64, algorithm: Algorithm) -> Self {
        self.limit = Some((rate, per, algorithm));
        self
    }

    /// Trip a circuit after `failures` failures within `within` seconds,
    /// holding it open for `timeout` seconds.
    pub fn break_on(mut self, failures: u32, within: f64, timeout: f64) -> Self {
        self.break_on = Some((failures, within, timeout));
        self
    }

    /// Use an externally supplied breaker instead of the default.
    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Retry failed operations up to `times` further attempts with
    /// exponential backoff.
    pub fn retry_on_failure(
        mut self,
        times: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Self {
        self.retry = Some(ExponentialBackoff::new(
            times.saturating_add(1),
            base_delay,
            max_delay,
            jitter_factor,
        ));
        self
    }

    /// Replace the time source. Used by tests.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an event sink to the limiter.
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration and build the composer.
    pub fn build(self) -> Result<Composer> {
        let limiter = match self.limit {
            Some((rate, per, algorithm)) => {
                let mut limiter =
                    Limiter::new(self.key.clone(), rate, per, algorithm, self.storage.clone())?
                        .with_clock(self.clock.clone());
                if let Some(events) = &self.events {
                    limiter = limiter.with_events(events.clone());
                }
                Some(limiter)
            }
            None => None,
        };

        let breaker = match (self.breaker, self.break_on) {
            (Some(custom), _) => Some(custom),
            (None, Some((failures, within, timeout))) => {
                Some(Arc::new(WindowedBreaker::with_clock(
                    failures,
                    within,
                    timeout,
                    self.clock.clone(),
                )) as Arc<dyn CircuitBreaker>)
            }
            (None, None) => None,
        };

        Ok(Composer {
            key: self.key,
            limiter,
            breaker,
            retry: self.retry,
        })
    }
}

/// Runs user operations under the configured resilience stack.
pub struct Composer {
    key: String,
    limiter: Option<Limiter>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
    retry: Option<ExponentialBackoff>,
}

impl std::fmt::Debug for Composer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Composer {
    /// Start building a composer for `key` over the given storage.
    pub fn builder(key: impl Into<String>, storage: Arc<dyn Storage>) -> ComposerBuilder {
        ComposerBuilder::new(key, storage)
    }

    /// Execute `op` under the configured wrapping.
    pub async fn run<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let attempt = || self.attempt(&op);
        match &self.retry {
            Some(policy) => policy.call(attempt).await,
            None => attempt().await,
        }
    }

    /// One pass through breaker → limiter → operation.
    async fn attempt<F, Fut, T>(&self, op: &F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if let Some(breaker) = &self.breaker {
            if breaker.is_open(&self.key) {
                return Err(BreakwaterError::CircuitOpen {
                    key: self.key.clone(),
                    retry_after: breaker.time_until_close(&self.key),
                });
            }
        }

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await?;
        }

        match op().await {
            Ok(value) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success(&self.key);
                }
                Ok(value)
            }
            Err(error) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure(&self.key);
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::storage::{InMemoryStorage, MemoryStorageConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn storage_at(clock: Arc<MockClock>) -> Arc<dyn Storage> {
        Arc::new(InMemoryStorage::with_clock(
            MemoryStorageConfig::default(),
            clock,
        ))
    }

    #[tokio::test]
    async fn test_plain_composer_just_runs() {
        let clock = Arc::new(MockClock::new(1000.0));
        let composer = Composer::builder("job", storage_at(clock.clone()))
            .build()
            .unwrap();

        let result = composer.run(|| async { Ok(5) }).await.unwrap();
        assert_eq!(result, 5);
    }

    #[tokio::test]
    async fn test_limit_rejections_propagate() {
        let clock = Arc::new(MockClock::new(1000.0));
        let composer = Composer::builder("job", storage_at(clock.clone()))
            .limit(1, 60.0, Algorithm::FixedWindow)
            .clock(clock)
            .build()
            .unwrap();

        composer.run(|| async { Ok(()) }).await.unwrap();
        let err = composer.run(|| async { Ok(()) }).await.unwrap_err();
        assert!(err.is_throttled());
    }

    #[tokio::test]
    async fn test_throttled_not_retried() {
        let clock = Arc::new(MockClock::new(1000.0));
        let calls = AtomicU32::new(0);
        let composer = Composer::builder("job", storage_at(clock.clone()))
            .limit(1, 60.0, Algorithm::FixedWindow)
            .retry_on_failure(5, Duration::from_millis(1), Duration::from_millis(2), 0.0)
            .clock(clock)
            .build()
            .unwrap();

        composer.run(|| async { Ok(()) }).await.unwrap();
        let err = composer
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        // The rejection came from the limiter: the operation never ran and
        // no retry was attempted.
        assert!(err.is_throttled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_reports() {
        let clock = Arc::new(MockClock::new(1000.0));
        let composer = Composer::builder("job", storage_at(clock.clone()))
            .break_on(2, 60.0, 30.0)
            .clock(clock.clone())
            .build()
            .unwrap();

        for _ in 0..2 {
            let _ = composer
                .run(|| async { Err::<(), _>(BreakwaterError::storage("down")) })
                .await;
        }

        let err = composer.run(|| async { Ok(()) }).await.unwrap_err();
        match err {
            BreakwaterError::CircuitOpen { retry_after, .. } => {
                assert!(retry_after > 29.0 && retry_after <= 30.0);
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }

        // After the reset timeout the operation runs again.
        clock.advance(31.0);
        composer.run(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let clock = Arc::new(MockClock::new(1000.0));
        let calls = AtomicU32::new(0);
        let composer = Composer::builder("job", storage_at(clock.clone()))
            .retry_on_failure(2, Duration::from_millis(1), Duration::from_millis(2), 0.0)
            .build()
            .unwrap();

        let result = composer
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(BreakwaterError::storage("blip"))
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_stable_error() {
        let clock = Arc::new(MockClock::new(1000.0));
        let composer = Composer::builder("job", storage_at(clock.clone()))
            .retry_on_failure(1, Duration::from_millis(1), Duration::from_millis(2), 0.0)
            .build()
            .unwrap();

        let err = composer
            .run(|| async { Err::<(), _>(BreakwaterError::storage("down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakwaterError::RetryExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_invalid_limit_config_fails_at_build() {
        let clock = Arc::new(MockClock::new(1000.0));
        let err = Composer::builder("job", storage_at(clock))
            .limit(5, 0.0, Algorithm::Gcra)
            .build()
            .unwrap_err();
        assert!(matches!(err, BreakwaterError::Config(_)));
    }
}
