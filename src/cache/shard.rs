//! Sharded Map Implementation
//!
//! Concurrent hashmap split into `N` independently locked shards.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention between handlers
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Whole-map scans (eviction, invalidation) lock one shard at a time

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Single shard containing a hashmap
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Get a value from the shard
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.map.read().get(key).cloned()
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.map.write().insert(key, value)
    }

    /// Remove a value, returning it if present
    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.write().remove(key)
    }

    /// Remove a value only if `pred` holds for the current value
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut guard = self.map.write();
        match guard.get(key) {
            Some(v) if pred(v) => guard.remove(key),
            _ => None,
        }
    }

    /// Drop every entry for which `keep` returns false; returns removed count
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let mut guard = self.map.write();
        let before = guard.len();
        guard.retain(|k, v| keep(k, v));
        before - guard.len()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Project every entry through `f` (for scans)
    pub fn collect<T>(&self, mut f: impl FnMut(&K, &V) -> T) -> Vec<T> {
        let guard = self.map.read();
        guard.iter().map(|(k, v)| f(k, v)).collect()
    }
}

/// Sharded map with configurable shard count
pub struct ShardedMap<K, V, const N: usize = 64> {
    shards: Vec<Shard<K, V>>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    /// Create a new sharded map
    pub fn new() -> Self {
        debug_assert!(N.is_power_of_two());
        Self {
            shards: (0..N).map(|_| Shard::default()).collect(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard<K, V>> {
        self.shards.iter()
    }
}

impl<K: Eq + Hash, V, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard_for(&self, key: &K) -> &Shard<K, V> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard_for(key).remove(key)
    }

    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        self.shard_for(key).remove_if(key, pred)
    }

    /// Retain across all shards; returns removed count
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        self.shards.iter().map(|s| s.retain(&mut keep)).sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let map: ShardedMap<String, u32, 8> = ShardedMap::new();
        assert!(map.is_empty());

        map.insert("a".into(), 1);
        map.insert("b".into(), 2);
        assert_eq!(map.get(&"a".to_string()), Some(1));
        assert_eq!(map.len(), 2);

        assert_eq!(map.insert("a".into(), 3), Some(1));
        assert_eq!(map.remove(&"a".to_string()), Some(3));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_if() {
        let map: ShardedMap<u32, u32, 4> = ShardedMap::new();
        map.insert(1, 10);
        assert!(map.remove_if(&1, |v| *v > 10).is_none());
        assert_eq!(map.remove_if(&1, |v| *v == 10), Some(10));
        assert!(map.is_empty());
    }

    #[test]
    fn test_retain_spans_shards() {
        let map: ShardedMap<u32, u32, 16> = ShardedMap::new();
        for i in 0..100 {
            map.insert(i, i);
        }
        let removed = map.retain(|_, v| v % 2 == 0);
        assert_eq!(removed, 50);
        assert_eq!(map.len(), 50);
        assert_eq!(map.shard_count(), 16);
    }
}
