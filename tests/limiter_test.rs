//! End-to-end limiter scenarios across all three algorithms.

use breakwater::{
    Algorithm, BreakwaterError, Limiter, InMemoryStorage, MemoryStorageConfig, MockClock, Storage,
};
use std::sync::Arc;

fn limiter_at(
    key: &str,
    limit: u64,
    period: f64,
    algorithm: Algorithm,
    start: f64,
) -> (Limiter, Arc<MockClock>, Arc<InMemoryStorage>) {
    let clock = Arc::new(MockClock::new(start));
    let storage = Arc::new(InMemoryStorage::with_clock(
        MemoryStorageConfig::default(),
        clock.clone(),
    ));
    let limiter = Limiter::new(key, limit, period, algorithm, storage.clone())
        .unwrap()
        .with_clock(clock.clone());
    (limiter, clock, storage)
}

#[tokio::test]
async fn fixed_window_five_per_second() {
    let (limiter, clock, _) = limiter_at("s1", 5, 1.0, Algorithm::FixedWindow, 0.0);

    for _ in 0..5 {
        limiter.acquire().await.unwrap();
    }
    let err = limiter.acquire().await.unwrap_err();
    let retry_after = err.retry_after().unwrap();
    assert!(
        retry_after > 0.9 && retry_after <= 1.0,
        "retry_after ≈ 1, got {}",
        retry_after
    );

    clock.advance(1.1);
    limiter.acquire().await.unwrap();
    assert_eq!(limiter.remaining().await.unwrap(), 4);
}

#[tokio::test]
async fn gcra_one_per_minute() {
    let (limiter, clock, _) = limiter_at("s2", 1, 60.0, Algorithm::Gcra, 0.0);

    limiter.acquire().await.unwrap();

    clock.advance(0.5);
    let err = limiter.acquire().await.unwrap_err();
    let retry_after = err.retry_after().unwrap();
    assert!(
        retry_after > 59.4 && retry_after < 59.6,
        "retry_after in (59.4, 59.6), got {}",
        retry_after
    );

    clock.advance(59.6); // t = 60.1
    limiter.acquire().await.unwrap();
}

#[tokio::test]
async fn token_bucket_three_per_three_seconds() {
    let (limiter, clock, _) = limiter_at("s3", 3, 3.0, Algorithm::TokenBucket, 0.0);

    for _ in 0..3 {
        limiter.acquire().await.unwrap();
    }
    assert!(limiter.acquire().await.is_err());

    clock.advance(1.0);
    limiter.acquire().await.unwrap();
    assert!(limiter.acquire().await.is_err());
}

#[tokio::test]
async fn sequential_calls_up_to_limit_never_fail() {
    for algorithm in [Algorithm::FixedWindow, Algorithm::TokenBucket] {
        let (limiter, _, _) = limiter_at("seq", 10, 60.0, algorithm, 1000.0);
        for i in 0..10 {
            limiter
                .acquire()
                .await
                .unwrap_or_else(|e| panic!("{} call {} failed: {}", algorithm, i, e));
        }
        assert!(limiter.acquire().await.is_err(), "{} call 11", algorithm);
    }
}

#[tokio::test]
async fn concurrent_callers_bounded_by_limit() {
    let clock = Arc::new(MockClock::new(1000.0));
    let storage = Arc::new(InMemoryStorage::with_clock(
        MemoryStorageConfig::default(),
        clock.clone(),
    ));

    for (algorithm, limit) in [(Algorithm::FixedWindow, 10u64), (Algorithm::TokenBucket, 10)] {
        let limiter = Arc::new(
            Limiter::new(
                format!("conc:{}", algorithm),
                limit,
                60.0,
                algorithm,
                storage.clone(),
            )
            .unwrap()
            .with_clock(clock.clone()),
        );

        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire().await.is_ok() }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted as u64, limit, "{}", algorithm);
    }
}

#[tokio::test]
async fn gcra_concurrent_zero_tolerance_admits_one_per_instant() {
    let clock = Arc::new(MockClock::new(1000.0));
    let storage = Arc::new(InMemoryStorage::with_clock(
        MemoryStorageConfig::default(),
        clock.clone(),
    ));
    let limiter = Arc::new(
        Limiter::new("gcra-conc", 5, 10.0, Algorithm::Gcra, storage)
            .unwrap()
            .with_clock(clock),
    );

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move { limiter.acquire().await.is_ok() }));
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    // With zero delay tolerance only one request conforms at a single
    // instant.
    assert_eq!(admitted, 1);
}

#[tokio::test]
async fn peeks_are_idempotent() {
    let (limiter, _, _) = limiter_at("peek", 3, 10.0, Algorithm::TokenBucket, 1000.0);

    limiter.acquire().await.unwrap();
    let first = limiter.remaining().await.unwrap();
    for _ in 0..20 {
        assert!(limiter.allowed().await.unwrap());
        assert_eq!(limiter.remaining().await.unwrap(), first);
        assert_eq!(limiter.retry_after().await.unwrap(), 0.0);
    }
}

#[tokio::test]
async fn acquire_then_state_reflects_consumption() {
    let (limiter, _, _) = limiter_at("state", 2, 60.0, Algorithm::TokenBucket, 1000.0);

    assert_eq!(limiter.remaining().await.unwrap(), 2);
    limiter.acquire().await.unwrap();
    assert_eq!(limiter.remaining().await.unwrap(), 1);
    limiter.acquire().await.unwrap();
    assert_eq!(limiter.remaining().await.unwrap(), 0);
    assert!(!limiter.allowed().await.unwrap());
}

#[tokio::test]
async fn waiting_retry_after_frees_one_unit() {
    for algorithm in [Algorithm::FixedWindow, Algorithm::Gcra, Algorithm::TokenBucket] {
        let (limiter, clock, _) = limiter_at("wait", 2, 8.0, algorithm, 1000.0);

        // Consume until the first rejection.
        let err = loop {
            match limiter.acquire().await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        let wait = err.retry_after().unwrap();
        assert!(wait > 0.0, "{}", algorithm);

        clock.advance(wait + 0.01);
        limiter
            .acquire()
            .await
            .unwrap_or_else(|e| panic!("{} after waiting {}: {}", algorithm, wait, e));
    }
}

#[tokio::test]
async fn clear_behaves_like_first_call() {
    let (limiter, _, storage) = limiter_at("clear", 1, 60.0, Algorithm::Gcra, 1000.0);

    limiter.acquire().await.unwrap();
    assert!(limiter.acquire().await.is_err());

    storage.clear(None).await.unwrap();
    limiter.acquire().await.unwrap();
}

#[tokio::test]
async fn reset_restores_initial_state() {
    for algorithm in [Algorithm::FixedWindow, Algorithm::Gcra, Algorithm::TokenBucket] {
        let (limiter, _, _) = limiter_at("reset", 1, 60.0, algorithm, 1000.0);

        limiter.acquire().await.unwrap();
        limiter.reset().await.unwrap();
        assert!(limiter.allowed().await.unwrap(), "{}", algorithm);
        assert_eq!(limiter.retry_after().await.unwrap(), 0.0, "{}", algorithm);
        limiter.acquire().await.unwrap();
    }
}

#[tokio::test]
async fn zero_limit_rejects_everything() {
    for algorithm in [Algorithm::FixedWindow, Algorithm::Gcra, Algorithm::TokenBucket] {
        let (limiter, _, _) = limiter_at("zero", 0, 5.0, algorithm, 1000.0);
        assert!(!limiter.allowed().await.unwrap(), "{}", algorithm);
        assert!(
            limiter.acquire().await.unwrap_err().is_throttled(),
            "{}",
            algorithm
        );
    }
}

#[tokio::test]
async fn sub_second_period_sustains_steady_rate() {
    // 5 per 500ms = one every 100ms at steady state.
    for algorithm in [Algorithm::Gcra, Algorithm::TokenBucket] {
        let (limiter, clock, _) = limiter_at("fast", 5, 0.5, algorithm, 1000.0);

        // Drain any burst allowance, then run at the steady rate.
        while limiter.acquire().await.is_ok() {}
        for _ in 0..20 {
            clock.advance(0.1);
            limiter
                .acquire()
                .await
                .unwrap_or_else(|e| panic!("{} steady-state: {}", algorithm, e));
        }
    }
}

#[test]
fn unknown_algorithm_is_rejected() {
    let err = "leaky_cauldron".parse::<Algorithm>().unwrap_err();
    assert!(matches!(err, BreakwaterError::Config(_)));
}
