//! Cache Store - collection-aware TTL cache
//!
//! One generic store for every cached read the governor performs.
//!
//! # Design
//!
//! - Sharded map, one `RwLock` per shard; cache hits never suspend
//! - `get` treats expired entries as misses and evicts them
//! - `lookup` keeps expired entries for a grace period so the façade can
//!   serve stale data when quota or the backend says no
//! - Capacity bound: once the ceiling is exceeded the oldest entries go

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheKey, Cacheable};
use super::metrics::{CacheMetrics, CacheStats};
use super::shard::ShardedMap;
use super::SHARD_COUNT;
use crate::config::GovernorConfig;
use crate::error::{Error, Result};

/// Cache store configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry ceiling
    pub max_entries: usize,
    /// Minimum number of oldest entries dropped per eviction pass
    pub eviction_batch: usize,
    /// How long expired entries remain available to `lookup`
    pub stale_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            eviction_batch: 500,
            stale_grace: Duration::from_secs(600),
        }
    }
}

impl From<&GovernorConfig> for CacheConfig {
    fn from(config: &GovernorConfig) -> Self {
        Self {
            max_entries: config.max_cache_entries,
            eviction_batch: config.eviction_batch,
            stale_grace: config.stale_grace(),
        }
    }
}

/// Result of a non-evicting lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    /// Entry within its TTL
    Fresh(V),
    /// Entry past its TTL but inside the grace period
    Stale(V),
    /// Nothing usable cached
    Miss,
}

impl<V> Lookup<V> {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Lookup::Fresh(_))
    }
}

/// Generic TTL cache keyed by [`CacheKey`]
pub struct CacheStore<V> {
    map: ShardedMap<CacheKey, CacheEntry<V>, SHARD_COUNT>,
    config: CacheConfig,
    metrics: CacheMetrics,
}

impl<V: Cacheable> CacheStore<V> {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            map: ShardedMap::new(),
            config,
            metrics: CacheMetrics::new(),
        }
    }

    /// Get a live value. Expired entries count as a miss and are evicted.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        match self.map.get(key) {
            Some(entry) if entry.is_live(now) => {
                self.metrics.record_hit();
                Some(entry.into_value())
            }
            Some(_) => {
                if self.map.remove_if(key, |e| !e.is_live(now)).is_some() {
                    self.metrics.record_expired(1);
                }
                self.metrics.record_miss();
                None
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Look up a value without evicting stale-but-graced entries
    pub fn lookup(&self, key: &CacheKey) -> Lookup<V> {
        let now = Instant::now();
        match self.map.get(key) {
            Some(entry) if entry.is_live(now) => {
                self.metrics.record_hit();
                Lookup::Fresh(entry.into_value())
            }
            Some(entry) if entry.within_grace(now, self.config.stale_grace) => {
                self.metrics.record_miss();
                Lookup::Stale(entry.into_value())
            }
            Some(_) => {
                let grace = self.config.stale_grace;
                if self
                    .map
                    .remove_if(key, |e| !e.within_grace(now, grace))
                    .is_some()
                {
                    self.metrics.record_expired(1);
                }
                self.metrics.record_miss();
                Lookup::Miss
            }
            None => {
                self.metrics.record_miss();
                Lookup::Miss
            }
        }
    }

    /// Whether a live entry exists (does not touch hit/miss counters)
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.map.get(key).is_some_and(|e| e.is_live(now))
    }

    /// Live value without touching hit/miss counters
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        self.map
            .get(key)
            .filter(|e| e.is_live(now))
            .map(CacheEntry::into_value)
    }

    /// Whether any entry exists for `key`, live or not
    pub fn holds(&self, key: &CacheKey) -> bool {
        self.map.get(key).is_some()
    }

    /// Store a value. Undefined values are rejected and leave any prior
    /// entry for `key` untouched.
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration) -> Result<()> {
        if value.is_undefined() {
            self.metrics.record_rejected();
            warn!(key = %key, "Refusing to cache undefined value");
            return Err(Error::InvalidCacheValue {
                key: key.to_string(),
            });
        }

        self.map.insert(key, CacheEntry::new(value, ttl));

        let len = self.map.len();
        if len > self.config.max_entries {
            let excess = len - self.config.max_entries;
            let n = excess
                .max(self.config.eviction_batch)
                .min(len.saturating_sub(1));
            self.evict_oldest(n);
        }
        Ok(())
    }

    /// Remove a single key
    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.map.remove(key).is_some();
        if removed {
            self.metrics.record_invalidations(1);
        }
        removed
    }

    /// Drop the `n` oldest entries; returns how many were removed
    pub fn evict_oldest(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut candidates: Vec<(CacheKey, Instant)> = self
            .map
            .shards()
            .flat_map(|shard| shard.collect(|k, e| (k.clone(), e.stored_at())))
            .collect();
        candidates.sort_by_key(|(_, stored_at)| *stored_at);

        let mut evicted = 0;
        for (key, stored_at) in candidates.into_iter().take(n) {
            // Skip keys replaced since the scan
            if self
                .map
                .remove_if(&key, |e| e.stored_at() == stored_at)
                .is_some()
            {
                evicted += 1;
            }
        }

        self.metrics.record_evictions(evicted as u64);
        debug!(evicted, "Evicted oldest cache entries");
        evicted
    }

    /// Remove every key whose rendered form starts with `pattern`
    /// (e.g. `"users/"`, `"services?q="`)
    pub fn invalidate_prefix(&self, pattern: &str) -> usize {
        let removed = self
            .map
            .retain(|key, _| !key.to_string().starts_with(pattern));
        self.metrics.record_invalidations(removed as u64);
        removed
    }

    /// Remove every key tagged with `collection`
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        let removed = self.map.retain(|key, _| key.collection() != collection);
        self.metrics.record_invalidations(removed as u64);
        removed
    }

    /// Drop entries that are past their TTL and grace period
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let grace = self.config.stale_grace;
        let removed = self.map.retain(|_, e| e.within_grace(now, grace));
        self.metrics.record_expired(removed as u64);
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Hits, misses and size
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot(self.len())
    }
}

impl<V: Cacheable> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
