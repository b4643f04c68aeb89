//! Keyed read cache with TTL and a pluggable eviction policy.
//!
//! Expired entries are dropped lazily on access and by a periodic sweeper.
//! When an insert pushes the cache past `max_size`, one victim is chosen by
//! the configured policy: least-recently-used, least-frequently-used, or
//! first-in-first-out.

use meshdb_core::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl: Option<Duration>,
    pub eviction_policy: EvictionPolicy,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Some(Duration::from_secs(600)),
            eviction_policy: EvictionPolicy::Lru,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    inserted_seq: u64,
    last_access_seq: u64,
    access_count: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    seq: u64,
}

pub struct Cache<V> {
    config: CacheConfig,
    inner: Mutex<Inner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone + Send + 'static> Cache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                seq: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Insert or replace. `ttl` overrides the configured default; pass
    /// `None` to use it.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;

        let ttl = ttl.or(self.config.default_ttl);
        let entry = Entry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
            inserted_seq: seq,
            last_access_seq: seq,
            access_count: 1,
        };
        inner.entries.insert(key.to_string(), entry);

        if self.config.max_size > 0 && inner.entries.len() > self.config.max_size {
            self.evict_one(&mut inner, key);
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;

        let expired = match inner.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(Instant::now()),
        };

        if expired {
            inner.entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let entry = inner.entries.get_mut(key).expect("checked above");
        entry.last_access_seq = seq;
        entry.access_count += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub fn delete(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    /// Drop every key matching the regex. Returns how many were removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| Error::malformed("pattern", e.to_string()))?;
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !re.is_match(key));
        Ok(before - inner.entries.len())
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Remove every expired entry now. The sweeper calls this; tests can
    /// too.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = (before - inner.entries.len()) as u64;
        if removed > 0 {
            self.expirations.fetch_add(removed, Ordering::Relaxed);
        }
    }

    /// Pick and drop one victim. The key that triggered the overflow is
    /// never its own victim.
    fn evict_one(&self, inner: &mut Inner<V>, just_inserted: &str) {
        let candidates = inner
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != just_inserted);
        let victim = match self.config.eviction_policy {
            EvictionPolicy::Lru => candidates
                .min_by_key(|(_, e)| e.last_access_seq)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => candidates
                .min_by_key(|(_, e)| (e.access_count, e.inserted_seq))
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => candidates
                .min_by_key(|(_, e)| e.inserted_seq)
                .map(|(k, _)| k.clone()),
        };
        if let Some(key) = victim {
            inner.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Spawn the periodic expiry sweeper for a shared cache.
pub fn spawn_sweeper<V: Clone + Send + Sync + 'static>(
    cache: Arc<Cache<V>>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let period = cache.config.cleanup_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => cache.sweep(),
                _ = shutdown.changed() => {
                    debug!("cache sweeper shutting down");
                    break;
                }
            }
        }
    })
}
