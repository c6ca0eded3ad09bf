//! In-memory cache with TTL expiry and pluggable eviction.

use linked_hash_map::LinkedHashMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, trace};
use tradelog_core::{CacheConfig, EvictionPolicy, Result, TradelogError};

/// Bounds required of cache keys.
pub trait CacheKey: Eq + Hash + Clone + fmt::Debug + Send + 'static {}

impl<T: Eq + Hash + Clone + fmt::Debug + Send + 'static> CacheKey for T {}

/// Bounds required of cached values. Values are cloned out on every hit.
pub trait CacheValue: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> CacheValue for T {}

/// A single cached value with its access metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    /// When the value was stored.
    pub created_at: Instant,
    /// When the value was last read.
    pub last_accessed: Instant,
    /// Number of reads since the value was stored.
    pub access_count: u64,
    /// Lifetime of the value; `None` never expires.
    pub ttl: Option<Duration>,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl,
        }
    }

    /// Returns true if the entry has a TTL and it has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.created_at) > ttl)
    }

    fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    total_requests: u64,
}

/// Point-in-time view of a cache's counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Current number of entries.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// `hits / total_requests`, zero before the first request.
    pub hit_rate: f64,
    /// Reads that returned a value.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Total reads.
    pub total_requests: u64,
}

struct State<K, V> {
    entries: LinkedHashMap<K, CacheEntry<V>>,
    stats: Option<CacheStats>,
}

impl<K: CacheKey, V> State<K, V> {
    fn record_hit(&mut self) {
        if let Some(stats) = self.stats.as_mut() {
            stats.hits += 1;
            stats.total_requests += 1;
        }
    }

    fn record_miss(&mut self) {
        if let Some(stats) = self.stats.as_mut() {
            stats.misses += 1;
            stats.total_requests += 1;
        }
    }

    fn record_expirations(&mut self, count: usize) {
        if let Some(stats) = self.stats.as_mut() {
            stats.expirations += count as u64;
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        self.record_expirations(expired.len());
        expired.len()
    }

    /// Removes one entry according to `policy` and returns its key.
    ///
    /// The map is kept in insertion order, refreshed on reads only under LRU,
    /// so the front is the LRU or FIFO victim. LFU ties go to the entry
    /// closest to the front.
    fn evict_one(&mut self, policy: EvictionPolicy) -> Option<K> {
        let victim = match policy {
            EvictionPolicy::Lru | EvictionPolicy::Fifo => {
                self.entries.front().map(|(key, _)| key.clone())
            }
            EvictionPolicy::Lfu => {
                let mut best: Option<(&K, u64)> = None;
                for (key, entry) in self.entries.iter() {
                    match best {
                        Some((_, count)) if count <= entry.access_count => {}
                        _ => best = Some((key, entry.access_count)),
                    }
                }
                best.map(|(key, _)| key.clone())
            }
        }?;
        self.entries.remove(&victim);
        if let Some(stats) = self.stats.as_mut() {
            stats.evictions += 1;
        }
        Some(victim)
    }
}

struct Shared<K, V> {
    config: CacheConfig,
    state: Mutex<State<K, V>>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Bounded key-value cache with TTL expiry and LRU/LFU/FIFO eviction.
///
/// All operations are serialized by one mutex, so a cache can be shared
/// between threads behind an `Arc`. Unless `cleanup_interval` is zero, a
/// background thread sweeps expired entries until [`close`](Self::close) is
/// called or the cache is dropped. Expiry is also checked lazily on `get`.
///
/// `set` does not overwrite an existing key unless `force` is true.
pub struct SmartCache<K = String, V = serde_json::Value>
where
    K: CacheKey,
    V: CacheValue,
{
    name: String,
    shared: Arc<Shared<K, V>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for SmartCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartCache")
            .field("name", &self.name)
            .field("size", &self.len())
            .field("max_size", &self.shared.config.max_size)
            .field("eviction_policy", &self.shared.config.eviction_policy)
            .field("default_ttl", &self.shared.config.default_ttl)
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> SmartCache<K, V> {
    /// Creates a cache with the given configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the reaper thread
    /// cannot be spawned.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::named("smart-cache", config)
    }

    /// Creates a cache whose name appears in logs and in the reaper thread name.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the reaper thread
    /// cannot be spawned.
    pub fn named(name: impl Into<String>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: LinkedHashMap::new(),
                stats: config.enable_stats.then(CacheStats::default),
            }),
            config,
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let reaper = if shared.config.cleanup_interval.is_zero() {
            None
        } else {
            Some(spawn_reaper(&name, Arc::clone(&shared))?)
        };

        debug!(
            cache = %name,
            max_size = shared.config.max_size,
            policy = %shared.config.eviction_policy,
            "Created in-memory cache"
        );

        Ok(Self {
            name,
            shared,
            reaper: Mutex::new(reaper),
        })
    }

    /// Returns the cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration the cache was built with.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Returns the cached value for `key`, or `None` on a miss or expiry.
    ///
    /// A hit bumps the entry's access metadata and, under LRU, marks it as
    /// most recently used.
    #[instrument(level = "trace", skip(self), fields(cache = %self.name))]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        let now = Instant::now();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired_at(now),
            None => {
                state.record_miss();
                return None;
            }
        };

        if expired {
            state.entries.remove(key);
            state.record_expirations(1);
            state.record_miss();
            return None;
        }

        let entry = if self.shared.config.eviction_policy == EvictionPolicy::Lru {
            state.entries.get_refresh(key)
        } else {
            state.entries.get_mut(key)
        };
        let value = entry.map(|entry| {
            entry.touch(now);
            entry.value.clone()
        });
        state.record_hit();
        value
    }

    /// Returns the cached value for `key`, or `default` on a miss or expiry.
    pub fn get_or<Q>(&self, key: &Q, default: V) -> V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        self.get(key).unwrap_or(default)
    }

    /// Stores `value` under `key`.
    ///
    /// If the key is already present and `force` is false, nothing changes and
    /// `false` is returned. A `None` TTL uses the configured default. When the
    /// cache is full, one entry is evicted first.
    #[instrument(level = "trace", skip(self, value), fields(cache = %self.name))]
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>, force: bool) -> bool {
        let config = &self.shared.config;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if state.entries.contains_key(&key) {
            if !force {
                trace!("Key already cached, skipping");
                return false;
            }
            state.entries.remove(&key);
        }

        while state.entries.len() >= config.max_size {
            match state.evict_one(config.eviction_policy) {
                Some(victim) => debug!(
                    cache = %self.name,
                    key = ?victim,
                    policy = %config.eviction_policy,
                    "Evicted cache entry"
                ),
                None => break,
            }
        }

        let ttl = ttl.or(config.default_ttl);
        trace!(?ttl, "Cached value");
        state.entries.insert(key, CacheEntry::new(value, ttl));
        true
    }

    /// Stores `value` with the default TTL unless the key is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.set(key, value, None, false)
    }

    /// Removes `key`, returning true if it was present.
    #[instrument(level = "trace", skip(self), fields(cache = %self.name))]
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        self.shared.state.lock().entries.remove(key).is_some()
    }

    /// Returns true if `key` is stored, whether or not its TTL has elapsed.
    pub fn exists<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.state.lock().entries.contains_key(key)
    }

    /// Returns a copy of the entry for `key` without touching it.
    pub fn entry<Q>(&self, key: &Q) -> Option<CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.state.lock().entries.get(key).cloned()
    }

    /// Removes every entry and resets the statistics.
    #[instrument(skip(self), fields(cache = %self.name))]
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.entries.clear();
        if let Some(stats) = state.stats.as_mut() {
            *stats = CacheStats::default();
        }
        debug!("Cache cleared");
    }

    /// Returns the number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the stored keys in eviction order, front first.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.shared.state.lock().entries.keys().cloned().collect()
    }

    /// Removes every expired entry now and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.shared.state.lock().purge_expired(Instant::now())
    }

    /// Returns the current statistics, or `None` if statistics are disabled.
    #[must_use]
    pub fn stats(&self) -> Option<CacheStatsSnapshot> {
        let state = self.shared.state.lock();
        state.stats.as_ref().map(|stats| CacheStatsSnapshot {
            size: state.entries.len(),
            max_size: self.shared.config.max_size,
            hit_rate: if stats.total_requests == 0 {
                0.0
            } else {
                stats.hits as f64 / stats.total_requests as f64
            },
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            expirations: stats.expirations,
            total_requests: stats.total_requests,
        })
    }

    /// Zeroes the statistics without touching the entries.
    pub fn reset_stats(&self) {
        if let Some(stats) = self.shared.state.lock().stats.as_mut() {
            *stats = CacheStats::default();
        }
    }

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.stopped.lock()
    }

    /// Stops the reaper thread, waits for it to exit and clears the cache.
    ///
    /// Calling `close` more than once is harmless.
    #[instrument(skip(self), fields(cache = %self.name))]
    pub fn close(&self) {
        {
            let mut stopped = self.shared.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
            self.shared.wake.notify_all();
        }

        let handle = self.reaper.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(cache = %self.name, "Cache reaper thread panicked");
            }
        }

        self.clear();
        debug!(cache = %self.name, "Cache closed");
    }
}

impl<K: CacheKey, V: CacheValue> Drop for SmartCache<K, V> {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_reaper<K: CacheKey, V: CacheValue>(
    name: &str,
    shared: Arc<Shared<K, V>>,
) -> Result<JoinHandle<()>> {
    let thread_name = format!("cache-reaper-{name}");
    let cache_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || run_reaper(&cache_name, &shared))
        .map_err(|e| TradelogError::Thread {
            name: thread_name,
            reason: e.to_string(),
        })
}

fn run_reaper<K: CacheKey, V: CacheValue>(name: &str, shared: &Shared<K, V>) {
    let interval = shared.config.cleanup_interval;
    loop {
        {
            let mut stopped = shared.stopped.lock();
            if !*stopped {
                shared.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }

        let sweep = catch_unwind(AssertUnwindSafe(|| {
            shared.state.lock().purge_expired(Instant::now())
        }));
        match sweep {
            Ok(0) => {}
            Ok(removed) => debug!(cache = name, removed, "Swept expired cache entries"),
            Err(_) => error!(cache = name, "Cache sweep panicked, reaper keeps running"),
        }
    }
    trace!(cache = name, "Cache reaper stopped");
}
