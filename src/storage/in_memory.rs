//! In-process storage backend.
//!
//! State lives in a striped pool of shards (default 32), each guarded by a
//! read-write lock and holding the three state maps. A key's shard is chosen
//! by `hash(key) % shard_count`; peeks take shared access, mutations take
//! exclusive access. No I/O happens under a lock.
//!
//! A background reaper drops expired entries every `cleanup_interval`. It
//! holds only a weak reference to the store, so dropping the last handle
//! ends the task on its next wake; `close()` shuts it down promptly within
//! a bounded grace period.

use crate::clock::{Clock, SharedClock, system_clock};
use crate::error::Result;
use crate::storage::{
    GcraDecision, Storage, TokenBucketDecision, gcra_decide, token_bucket_consume,
    token_bucket_observe, token_bucket_refill,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default number of lock stripes.
const DEFAULT_SHARD_COUNT: usize = 32;

/// Default reaper wake interval.
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// How long `close()` waits for the reaper before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for [`InMemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Number of lock stripes. Should dwarf expected contention.
    pub shard_count: usize,
    /// How often the reaper sweeps expired entries.
    pub cleanup_interval: Duration,
    /// Namespace prepended to every key.
    pub key_prefix: String,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            key_prefix: "throttle:".to_string(),
        }
    }
}

impl MemoryStorageConfig {
    pub fn builder() -> MemoryStorageConfigBuilder {
        MemoryStorageConfigBuilder::new()
    }
}

/// Builder for [`MemoryStorageConfig`].
#[must_use = "builder does nothing until you call build()"]
pub struct MemoryStorageConfigBuilder {
    config: MemoryStorageConfig,
}

impl MemoryStorageConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MemoryStorageConfig::default(),
        }
    }

    pub fn shard_count(mut self, count: usize) -> Self {
        self.config.shard_count = count.max(1);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn build(self) -> MemoryStorageConfig {
        self.config
    }
}

impl Default for MemoryStorageConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: f64,
}

#[derive(Debug, Clone, Copy)]
struct GcraEntry {
    tat: f64,
    expires_at: f64,
}

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    tokens: f64,
    last_refill: f64,
    expires_at: f64,
}

#[derive(Default)]
struct Shard {
    counters: HashMap<String, CounterEntry>,
    tats: HashMap<String, GcraEntry>,
    buckets: HashMap<String, BucketEntry>,
}

impl Shard {
    fn sweep(&mut self, now: f64) -> usize {
        let before = self.counters.len() + self.tats.len() + self.buckets.len();
        self.counters.retain(|_, e| e.expires_at > now);
        self.tats.retain(|_, e| e.expires_at > now);
        self.buckets.retain(|_, e| e.expires_at > now);
        before - (self.counters.len() + self.tats.len() + self.buckets.len())
    }

    fn clear_matching(&mut self, prefix: &str) {
        self.counters.retain(|k, _| !k.starts_with(prefix));
        self.tats.retain(|k, _| !k.starts_with(prefix));
        self.buckets.retain(|k, _| !k.starts_with(prefix));
    }
}

struct Inner {
    shards: Vec<RwLock<Shard>>,
    clock: SharedClock,
    prefix: String,
}

impl Inner {
    fn shard_for(&self, key: &str) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn counter_key(&self, key: &str, window_secs: u64) -> String {
        format!("{}{}:{}", self.prefix, key, window_secs)
    }

    fn state_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn sweep_all(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write().unwrap_or_else(|e| e.into_inner());
            removed += guard.sweep(now);
        }
        removed
    }
}

struct ReaperControl {
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Striped-lock in-process storage backend.
///
/// Cloning yields another handle to the same state. Must be constructed
/// inside a tokio runtime (the reaper task is spawned eagerly).
#[derive(Clone)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
    reaper: Arc<ReaperControl>,
}

impl InMemoryStorage {
    /// Create a store with default configuration and the system clock.
    pub fn new() -> Self {
        Self::with_config(MemoryStorageConfig::default())
    }

    /// Create a store with the given configuration and the system clock.
    pub fn with_config(config: MemoryStorageConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a store with an injected clock. Used by tests to control time.
    pub fn with_clock(config: MemoryStorageConfig, clock: SharedClock) -> Self {
        let shard_count = config.shard_count.max(1);
        let inner = Arc::new(Inner {
            shards: (0..shard_count).map(|_| RwLock::new(Shard::default())).collect(),
            clock,
            prefix: config.key_prefix,
        });

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = spawn_reaper(Arc::downgrade(&inner), config.cleanup_interval, shutdown_rx);

        Self {
            inner,
            reaper: Arc::new(ReaperControl {
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Shut the reaper down, waiting up to a bounded grace period before
    /// aborting it. Safe to call more than once.
    pub async fn close(&self) {
        let tx = self
            .reaper
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }

        let handle = self
            .reaper
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
                tracing::warn!(
                    target: "breakwater.storage.reaper",
                    "Reaper did not stop within grace period, aborted"
                );
            }
        }
    }

    /// Total live entries across all shards. Expired-but-unswept entries
    /// are counted; intended for tests and diagnostics.
    pub fn entry_count(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| {
                let guard = s.read().unwrap_or_else(|e| e.into_inner());
                guard.counters.len() + guard.tats.len() + guard.buckets.len()
            })
            .sum()
    }

    /// Run one reaper sweep immediately, returning the number of entries
    /// dropped.
    pub fn sweep_now(&self) -> usize {
        self.inner.sweep_all()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reaper(
    inner: Weak<Inner>,
    interval: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(
            target: "breakwater.storage.reaper",
            interval_secs = interval.as_secs_f64(),
            "Reaper started"
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::debug!(target: "breakwater.storage.reaper", "Shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    let removed = inner.sweep_all();
                    if removed > 0 {
                        tracing::trace!(
                            target: "breakwater.storage.reaper",
                            removed = removed,
                            "Swept expired entries"
                        );
                    }
                }
            }
        }
        tracing::debug!(target: "breakwater.storage.reaper", "Reaper stopped");
    })
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn increment_counter(&self, key: &str, window_secs: u64, amount: u64) -> Result<u64> {
        let full_key = self.inner.counter_key(key, window_secs);
        let now = self.inner.clock.now();
        let mut shard = self
            .inner
            .shard_for(&full_key)
            .write()
            .unwrap_or_else(|e| e.into_inner());

        let entry = shard.counters.entry(full_key).or_insert(CounterEntry {
            count: 0,
            expires_at: now + window_secs as f64,
        });
        if entry.expires_at <= now {
            // Window expired: this request anchors a fresh one.
            *entry = CounterEntry {
                count: amount,
                expires_at: now + window_secs as f64,
            };
        } else {
            entry.count += amount;
        }
        Ok(entry.count)
    }

    async fn get_counter(&self, key: &str, window_secs: u64) -> Result<u64> {
        let full_key = self.inner.counter_key(key, window_secs);
        let now = self.inner.clock.now();
        let shard = self
            .inner
            .shard_for(&full_key)
            .read()
            .unwrap_or_else(|e| e.into_inner());
        Ok(shard
            .counters
            .get(&full_key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.count)
            .unwrap_or(0))
    }

    async fn counter_ttl(&self, key: &str, window_secs: u64) -> Result<f64> {
        let full_key = self.inner.counter_key(key, window_secs);
        let now = self.inner.clock.now();
        let shard = self
            .inner
            .shard_for(&full_key)
            .read()
            .unwrap_or_else(|e| e.into_inner());
        Ok(shard
            .counters
            .get(&full_key)
            .map(|e| (e.expires_at - now).max(0.0))
            .unwrap_or(0.0))
    }

    async fn reset_counter(&self, key: &str, window_secs: u64) -> Result<()> {
        let full_key = self.inner.counter_key(key, window_secs);
        let mut shard = self
            .inner
            .shard_for(&full_key)
            .write()
            .unwrap_or_else(|e| e.into_inner());
        shard.counters.remove(&full_key);
        Ok(())
    }

    async fn reset_state(&self, key: &str) -> Result<()> {
        let full_key = self.inner.state_key(key);
        let mut shard = self
            .inner
            .shard_for(&full_key)
            .write()
            .unwrap_or_else(|e| e.into_inner());
        shard.tats.remove(&full_key);
        shard.buckets.remove(&full_key);
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
        let full_key = self.inner.state_key(key);
        let mut shard = self
            .inner
            .shard_for(&full_key)
            .write()
            .unwrap_or_else(|e| e.into_inner());

        let stored = shard
            .tats
            .get(&full_key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.tat);
        let (decision, new_tat) = gcra_decide(stored, emission_interval, delay_tolerance, now);
        if let Some(tat) = new_tat {
            shard.tats.insert(
                full_key,
                GcraEntry {
                    tat,
                    expires_at: now + ttl,
                },
            );
        }
        Ok(decision)
    }

    async fn peek_gcra(
        &self,
        key: &str,
        emission_interval: f64,
        delay_tolerance: f64,
        now: f64,
    ) -> Result<GcraDecision> {
        let full_key = self.inner.state_key(key);
        let shard = self
            .inner
            .shard_for(&full_key)
            .read()
            .unwrap_or_else(|e| e.into_inner());

        let stored = shard
            .tats
            .get(&full_key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.tat);
        let (decision, _) = gcra_decide(stored, emission_interval, delay_tolerance, now);
        Ok(decision)
    }

    async fn check_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        ttl: f64,
        now: f64,
    ) -> Result<TokenBucketDecision> {
        let full_key = self.inner.state_key(key);
        let mut shard = self
            .inner
            .shard_for(&full_key)
            .write()
            .unwrap_or_else(|e| e.into_inner());

        let stored = shard
            .buckets
            .get(&full_key)
            .filter(|e| e.expires_at > now)
            .map(|e| (e.tokens, e.last_refill));
        let refilled = token_bucket_refill(stored, capacity, refill_rate, now);
        let (decision, new_tokens) = token_bucket_consume(refilled, refill_rate);
        if let Some(tokens) = new_tokens {
            shard.buckets.insert(
                full_key,
                BucketEntry {
                    tokens,
                    last_refill: now,
                    expires_at: now + ttl,
                },
            );
        }
        Ok(decision)
    }

    async fn peek_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: f64,
    ) -> Result<TokenBucketDecision> {
        let full_key = self.inner.state_key(key);
        let shard = self
            .inner
            .shard_for(&full_key)
            .read()
            .unwrap_or_else(|e| e.into_inner());

        let stored = shard
            .buckets
            .get(&full_key)
            .filter(|e| e.expires_at > now)
            .map(|e| (e.tokens, e.last_refill));
        let refilled = token_bucket_refill(stored, capacity, refill_rate, now);
        Ok(token_bucket_observe(refilled, refill_rate))
    }

    async fn clear(&self, pattern: Option<&str>) -> Result<()> {
        let prefix = match pattern {
            Some(p) => format!("{}{}", self.inner.prefix, p),
            None => self.inner.prefix.clone(),
        };
        for shard in &self.inner.shards {
            let mut guard = shard.write().unwrap_or_else(|e| e.into_inner());
            guard.clear_matching(&prefix);
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
