//! Redis storage backend.
//!
//! All check-and-consume operations run as server-side Lua scripts so they
//! execute as a single unit across processes. The scripts live in
//! `scripts/*.lua` as standalone reviewable programs; `redis::Script`
//! invokes them by hash and transparently re-loads on NOSCRIPT, so scripts
//! are pushed lazily and survive server restarts.

use crate::error::{BreakwaterError, Result};
use crate::storage::{GcraDecision, Storage, TokenBucketDecision};
use crate::utils::get_env_with_prefix;
use async_trait::async_trait;
use redis::Script;
use std::time::Duration;

/// Default per-operation timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default key namespace.
const DEFAULT_KEY_PREFIX: &str = "throttle:";

/// Configuration for [`RedisStorage`].
#[derive(Debug, Clone)]
pub struct RedisStorageConfig {
    /// Redis connection URL.
    pub url: String,
    /// Namespace prepended to every key.
    pub key_prefix: String,
    /// Bound on each storage operation. On expiry the call surfaces a
    /// storage error; the library fails closed.
    pub timeout: Duration,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RedisStorageConfig {
    pub fn builder() -> RedisStorageConfigBuilder {
        RedisStorageConfigBuilder::new()
    }

    /// Load configuration from environment variables
    /// (`BREAKWATER_REDIS_URL`, `BREAKWATER_REDIS_KEY_PREFIX`,
    /// `BREAKWATER_REDIS_TIMEOUT_MS`).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(url) = get_env_with_prefix("REDIS_URL") {
            config.url = url;
        }
        if let Some(prefix) = get_env_with_prefix("REDIS_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(ms) = get_env_with_prefix("REDIS_TIMEOUT_MS") {
            if let Ok(val) = ms.parse() {
                config.timeout = Duration::from_millis(val);
            }
        }

        config
    }
}

/// Builder for [`RedisStorageConfig`].
#[must_use = "builder does nothing until you call build()"]
pub struct RedisStorageConfigBuilder {
    config: RedisStorageConfig,
}

impl RedisStorageConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RedisStorageConfig::default(),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn build(self) -> RedisStorageConfig {
        self.config
    }
}

impl Default for RedisStorageConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Scripts {
    counter_incr: Script,
    gcra_check: Script,
    gcra_peek: Script,
    token_bucket_check: Script,
    token_bucket_peek: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            counter_incr: Script::new(include_str!("scripts/counter_incr.lua")),
            gcra_check: Script::new(include_str!("scripts/gcra_check.lua")),
            gcra_peek: Script::new(include_str!("scripts/gcra_peek.lua")),
            token_bucket_check: Script::new(include_str!("scripts/token_bucket_check.lua")),
            token_bucket_peek: Script::new(include_str!("scripts/token_bucket_peek.lua")),
        }
    }
}

/// Redis-backed shared storage.
pub struct RedisStorage {
    client: redis::Client,
    config: RedisStorageConfig,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect with default configuration.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(RedisStorageConfig::builder().url(url).build())
    }

    /// Connect with the given configuration.
    pub fn with_config(config: RedisStorageConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(BreakwaterError::config("Redis URL must not be empty"));
        }
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BreakwaterError::storage(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            config,
            scripts: Scripts::load(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.bounded(self.client.get_multiplexed_async_connection())
            .await?
            .map_err(|e| BreakwaterError::storage(format!("Failed to get Redis connection: {}", e)))
    }

    /// Wrap a future in the configured operation timeout.
    async fn bounded<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.config.timeout, fut)
            .await
            .map_err(|_| {
                BreakwaterError::storage(format!(
                    "Redis operation timed out after {:?}",
                    self.config.timeout
                ))
            })
    }

    fn counter_key(&self, key: &str, window_secs: u64) -> String {
        format!("{}{}:{}", self.config.key_prefix, key, window_secs)
    }

    fn state_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

/// Raw tuple every decision script returns: `{flag, retry_after, third}`
/// with floats encoded as strings to survive Lua's integer conversion.
type ScriptReply = (i64, String, String);

fn parse_float(raw: &str, what: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| BreakwaterError::storage(format!("Malformed {} in script reply: {:?}", what, raw)))
}

#[async_trait]
impl Storage for RedisStorage {
    async fn increment_counter(&self, key: &str, window_secs: u64, amount: u64) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let count: i64 = self
            .bounded(
                self.scripts
                    .counter_incr
                    .key(self.counter_key(key, window_secs))
                    .arg(window_secs)
                    .arg(amount)
                    .invoke_async(&mut conn),
            )
            .await??;
        Ok(count.max(0) as u64)
    }

    async fn get_counter(&self, key: &str, window_secs: u64) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let count: Option<i64> = self
            .bounded(
                redis::cmd("GET")
                    .arg(self.counter_key(key, window_secs))
                    .query_async(&mut conn),
            )
            .await??;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn counter_ttl(&self, key: &str, window_secs: u64) -> Result<f64> {
        let mut conn = self.get_connection().await?;
        let ttl_ms: i64 = self
            .bounded(
                redis::cmd("PTTL")
                    .arg(self.counter_key(key, window_secs))
                    .query_async(&mut conn),
            )
            .await??;
        // -1 (no expiry) and -2 (no key) both mean no live window.
        Ok((ttl_ms.max(0) as f64) / 1000.0)
    }

    async fn reset_counter(&self, key: &str, window_secs: u64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = self
            .bounded(
                redis::cmd("DEL")
                    .arg(self.counter_key(key, window_secs))
                    .query_async(&mut conn),
            )
            .await??;
        Ok(())
    }

    async fn reset_state(&self, key: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = self
            .bounded(
                redis::cmd("DEL")
                    .arg(self.state_key(key))
                    .query_async(&mut conn),
            )
            .await??;
        Ok(())
    }

    async fn check_gcra(
        &self,
        key: &str,
        emission_interval: f64,
        delay_tolerance: f64,
        ttl: f64,
        now: f64,
    ) -> Result<GcraDecision> {
        let mut conn = self.get_connection().await?;
        let (allowed, retry_after, tat): ScriptReply = self
            .bounded(
                self.scripts
                    .gcra_check
                    .key(self.state_key(key))
                    .arg(emission_interval)
                    .arg(delay_tolerance)
                    .arg(now)
                    .arg(ttl)
                    .invoke_async(&mut conn),
            )
            .await??;
        Ok(GcraDecision {
            allowed: allowed == 1,
            retry_after: parse_float(&retry_after, "retry_after")?,
            tat: parse_float(&tat, "tat")?,
        })
    }

    async fn peek_gcra(
        &self,
        key: &str,
        emission_interval: f64,
        delay_tolerance: f64,
        now: f64,
    ) -> Result<GcraDecision> {
        let mut conn = self.get_connection().await?;
        let (allowed, retry_after, tat): ScriptReply = self
            .bounded(
                self.scripts
                    .gcra_peek
                    .key(self.state_key(key))
                    .arg(emission_interval)
                    .arg(delay_tolerance)
                    .arg(now)
                    .invoke_async(&mut conn),
            )
            .await??;
        Ok(GcraDecision {
            allowed: allowed == 1,
            retry_after: parse_float(&retry_after, "retry_after")?,
            tat: parse_float(&tat, "tat")?,
        })
    }

    async fn check_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        ttl: f64,
        now: f64,
    ) -> Result<TokenBucketDecision> {
        let mut conn = self.get_connection().await?;
        let (allowed, retry_after, tokens): (i64, String, i64) = self
            .bounded(
                self.scripts
                    .token_bucket_check
                    .key(self.state_key(key))
                    .arg(capacity)
                    .arg(refill_rate)
                    .arg(now)
                    .arg(ttl)
                    .invoke_async(&mut conn),
            )
            .await??;
        Ok(TokenBucketDecision {
            allowed: allowed == 1,
            retry_after: parse_float(&retry_after, "retry_after")?,
            tokens_remaining: tokens.max(0) as u64,
        })
    }

    async fn peek_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: f64,
    ) -> Result<TokenBucketDecision> {
        let mut conn = self.get_connection().await?;
        let (allowed, retry_after, tokens): (i64, String, i64) = self
            .bounded(
                self.scripts
                    .token_bucket_peek
                    .key(self.state_key(key))
                    .arg(capacity)
                    .arg(refill_rate)
                    .arg(now)
                    .invoke_async(&mut conn),
            )
            .await??;
        Ok(TokenBucketDecision {
            allowed: allowed == 1,
            retry_after: parse_float(&retry_after, "retry_after")?,
            tokens_remaining: tokens.max(0) as u64,
        })
    }

    async fn clear(&self, pattern: Option<&str>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let match_pattern = match pattern {
            Some(p) => format!("{}{}*", self.config.key_prefix, p),
            None => format!("{}*", self.config.key_prefix),
        };

        // Cursor-based SCAN keeps the server responsive; a blocking KEYS
        // sweep is forbidden here.
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&match_pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await??;

            if !keys.is_empty() {
                let mut del = redis::cmd("DEL");
                for key in &keys {
                    del.arg(key);
                }
                let _: i64 = self.bounded(del.query_async(&mut conn)).await??;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        // Best effort: checks that a connection can be established.
        self.client.get_connection().is_ok()
    }
}
