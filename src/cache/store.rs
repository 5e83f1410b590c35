//! Expiring key/value store with bounded capacity.

use crate::config::{CacheConfig, EvictionPolicy};
use lru::LruCache;
use serde::Serialize;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant, ttl: std::time::Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) < ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
}

/// In-memory cache with a time-to-live and a hard entry limit.
///
/// With [`EvictionPolicy::Fifo`] (the default) a full cache drops the entry
/// that was inserted first, no matter how recently it was read. Switch to
/// [`EvictionPolicy::Lru`] to let reads refresh an entry's position.
pub struct TtlCache<K: Hash + Eq, V> {
    config: CacheConfig,
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Display,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(LruCache::unbounded()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the value for `key` if present and younger than the TTL.
    /// A stale entry is removed on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        if !self.config.enabled {
            return None;
        }
        let now = Instant::now();
        let mut entries = self.lock();
        let fresh = match entries.peek(key) {
            Some(entry) => entry.is_fresh(now, self.config.ttl),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if !fresh {
            entries.pop(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache entry expired");
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        let entry = match self.config.eviction {
            EvictionPolicy::Fifo => entries.peek(key),
            EvictionPolicy::Lru => entries.get(key),
        };
        entry.map(|e| e.value.clone())
    }

    /// Store `value` stamped with the current time, evicting one entry first
    /// when a new key would exceed the capacity.
    ///
    /// Overwriting a key resets its insertion position along with its
    /// timestamp, so under FIFO eviction the rewritten entry is the newest
    /// one rather than keeping the slot of its first insertion.
    pub fn set(&self, key: K, value: V) {
        if !self.config.enabled {
            return;
        }
        let mut entries = self.lock();
        if !entries.contains(&key) && entries.len() >= self.config.capacity {
            if let Some((evicted, _)) = entries.pop_lru() {
                debug!(key = %evicted, "cache full, evicted oldest entry");
            }
        }
        entries.put(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove every entry and return how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let size = entries.len();
        entries.clear();
        info!(previous_size = size, "cache cleared");
        size
    }

    /// Remove all entries older than the TTL, accessed or not.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut entries = self.lock();
        let stale: Vec<K> = entries
            .iter()
            .filter(|(_, e)| !e.is_fresh(now, ttl))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), remaining = entries.len(), "cache sweep");
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.config.capacity,
            ttl_ms: self.config.ttl.as_millis() as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Display + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Start the periodic sweep. The task ends on its own once the cache is dropped.
    ///
    /// A zero interval is raised to one second; `interval_at` rejects zero.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut period = self.config.sweep_interval;
        if period.is_zero() {
            warn!("cache sweep interval is zero, using 1s");
            period = std::time::Duration::from_secs(1);
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
