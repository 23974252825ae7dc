//! Breakwater - traffic control for axum services
//!
//! Breakwater combines a multi-algorithm rate limiter with a
//! request-filtering middleware, sharing one storage abstraction so the
//! same rules run against an in-process store or a Redis cluster.
//!
//! # Features
//!
//! - **Limiter**: fixed-window, GCRA, and token-bucket admission over
//!   atomic check-and-consume storage
//! - **Filter**: safelists, blocklists, throttles, trackers, fail2ban and
//!   allow2ban rules composed into a tower layer
//! - **Storage**: striped-lock in-memory backend with a background reaper,
//!   or Redis driven by server-side Lua scripts
//! - **Composer**: retry → circuit breaker → limiter wrapping for outbound
//!   operations
//! - **Events**: structured rate-limit events through a pluggable sink
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use breakwater::{Filter, FilterConfig, Algorithm, InMemoryStorage, client_ip};
//! use axum::{Router, routing::get};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     breakwater::init_tracing();
//!
//!     let config = FilterConfig::builder()
//!         .safelist_ip("127.0.0.1")
//!         .throttle("req/ip", 300u64, 300.0, Algorithm::FixedWindow, client_ip)
//!         .build();
//!
//!     let filter = Filter::new(config, Arc::new(InMemoryStorage::new()));
//!
//!     let app: Router = Router::new()
//!         .route("/", get(|| async { "ok" }))
//!         .layer(filter.layer());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod breaker;
mod clock;
mod composer;
mod error;
mod events;
pub mod filter;
mod limiter;
pub mod retry;
pub mod rules;
pub mod storage;
pub mod traits;
mod utils;

// Re-exports for public API
pub use breaker::WindowedBreaker;
pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use composer::{Composer, ComposerBuilder};
pub use error::{BreakwaterError, Result};
pub use events::{EventSink, NullSink, RateLimitEvent, TracingSink};
pub use filter::{ClientIp, Filter, FilterConfig, FilterConfigBuilder, FilterLayer, client_ip};
pub use limiter::{Admission, Algorithm, Limiter};
pub use retry::ExponentialBackoff;
pub use rules::{
    Allow2BanRule, BlocklistRule, Fail2BanRule, FilterMatch, MatchData, MatchKind, Param,
    SafelistRule, ThrottleRule, TrackRule,
};
pub use storage::{
    GcraDecision, InMemoryStorage, MemoryStorageConfig, Storage, TokenBucketDecision,
};
#[cfg(feature = "redis-storage")]
pub use storage::{RedisStorage, RedisStorageConfig};
pub use traits::{CircuitBreaker, RetryPolicy};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// Call early in your application, before building a filter.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "breakwater=debug")
/// - `BREAKWATER_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("BREAKWATER_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
