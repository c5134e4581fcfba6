//! Invalidation Router
//!
//! Keeps cached data consistent with committed writes. A write to
//! `collection/id` removes the document entry and every query or count entry
//! derived from `collection`, found through a collection → key-set index.
//!
//! # Generations
//!
//! Each collection carries a generation counter bumped by every invalidation.
//! A read that misses the cache records the generation before calling the
//! backend and populates through [`InvalidationRouter::populate_if_current`].
//! Invalidation and populate both run under the router lock, so a populate
//! that raced with a write is discarded instead of resurrecting pre-write data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::{CacheKey, CacheStore, CachedValue};
use crate::error::Result;

#[derive(Debug, Default)]
struct RouterState {
    /// Query and count keys populated per collection
    derived: HashMap<String, HashSet<CacheKey>>,
    generations: HashMap<String, u64>,
}

impl RouterState {
    fn bump(&mut self, collection: &str) -> u64 {
        let generation = self.generations.entry(collection.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn generation(&self, collection: &str) -> u64 {
        self.generations.get(collection).copied().unwrap_or(0)
    }
}

/// Routes writes to the cache entries they make stale
pub struct InvalidationRouter {
    cache: Arc<CacheStore<CachedValue>>,
    state: Mutex<RouterState>,
}

impl InvalidationRouter {
    pub fn new(cache: Arc<CacheStore<CachedValue>>) -> Self {
        Self {
            cache,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Current generation of a collection; capture before a backend read
    pub fn generation(&self, collection: &str) -> u64 {
        self.state.lock().generation(collection)
    }

    /// Cache `value` under `key` unless the collection was invalidated since
    /// `observed` was read. Returns whether the value was stored.
    pub fn populate_if_current(
        &self,
        key: CacheKey,
        value: CachedValue,
        ttl: Duration,
        observed: u64,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if state.generation(key.collection()) != observed {
            trace!(key = %key, "Discarding populate that raced with a write");
            return Ok(false);
        }
        if key.is_derived() {
            state
                .derived
                .entry(key.collection().to_string())
                .or_default()
                .insert(key.clone());
        }
        self.cache.set(key, value, ttl)?;
        Ok(true)
    }

    /// Invalidate everything a write to `collection/id` makes stale.
    /// Returns the number of cache entries removed.
    pub fn on_write(&self, collection: &str, id: &str) -> usize {
        let mut state = self.state.lock();
        self.invalidate_locked(&mut state, collection, std::iter::once(id))
    }

    /// Invalidate for a write, then cache the document's known post-write
    /// state under the new generation
    pub fn write_through(
        &self,
        collection: &str,
        id: &str,
        known: Option<(CachedValue, Duration)>,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        let removed = self.invalidate_locked(&mut state, collection, std::iter::once(id));
        if let Some((value, ttl)) = known {
            self.cache.set(CacheKey::document(collection, id), value, ttl)?;
        }
        Ok(removed)
    }

    /// Invalidate for a set of written documents, touching each collection's
    /// derived entries once
    pub fn on_writes<'a, I>(&self, written: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut by_collection: HashMap<&str, HashSet<&str>> = HashMap::new();
        for (collection, id) in written {
            by_collection.entry(collection).or_default().insert(id);
        }

        let mut state = self.state.lock();
        by_collection
            .into_iter()
            .map(|(collection, ids)| self.invalidate_locked(&mut state, collection, ids))
            .sum()
    }

    fn invalidate_locked<'a>(
        &self,
        state: &mut RouterState,
        collection: &str,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> usize {
        let generation = state.bump(collection);
        let mut removed = 0;
        for id in ids {
            if self.cache.remove(&CacheKey::document(collection, id)) {
                removed += 1;
            }
        }
        if let Some(keys) = state.derived.remove(collection) {
            for key in keys {
                if self.cache.remove(&key) {
                    removed += 1;
                }
            }
        }
        debug!(collection, generation, removed, "Invalidated collection entries");
        removed
    }

    /// Drop every cached entry of a collection, documents included
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        let mut state = self.state.lock();
        state.bump(collection);
        state.derived.remove(collection);
        let removed = self.cache.invalidate_collection(collection);
        debug!(collection, removed, "Invalidated whole collection");
        removed
    }

    /// Forget index entries whose cache entry is already gone
    pub fn prune_index(&self) -> usize {
        let mut state = self.state.lock();
        let mut pruned = 0;
        for keys in state.derived.values_mut() {
            let before = keys.len();
            keys.retain(|key| self.cache.holds(key));
            pruned += before - keys.len();
        }
        state.derived.retain(|_, keys| !keys.is_empty());
        pruned
    }

    /// Number of derived keys currently indexed
    pub fn indexed_keys(&self) -> usize {
        self.state.lock().derived.values().map(HashSet::len).sum()
    }
}

impl std::fmt::Debug for InvalidationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationRouter")
            .field("indexed_keys", &self.indexed_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::query_fingerprint;
    use crate::domain::ports::{Document, Filters, QueryOptions};
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    fn setup() -> (Arc<CacheStore<CachedValue>>, InvalidationRouter) {
        let cache = Arc::new(CacheStore::new());
        let router = InvalidationRouter::new(cache.clone());
        (cache, router)
    }

    fn doc(collection: &str, id: &str) -> CachedValue {
        CachedValue::Document(
            Document::from_value(collection, id, json!({"name": id})).unwrap(),
        )
    }

    fn streaming() -> Filters {
        [("category".to_string(), json!("streaming"))].into_iter().collect()
    }

    #[test]
    fn test_write_removes_document_and_derived_queries() {
        let (cache, router) = setup();
        let fp = query_fingerprint("services", &streaming(), &QueryOptions::default());
        let query_key = CacheKey::query("services", fp);
        let doc_key = CacheKey::document("services", "netflix");
        let other_key = CacheKey::document("users", "1");

        router
            .populate_if_current(query_key.clone(), CachedValue::Documents(vec![]), TTL, 0)
            .unwrap();
        router
            .populate_if_current(doc_key.clone(), doc("services", "netflix"), TTL, 0)
            .unwrap();
        router
            .populate_if_current(other_key.clone(), doc("users", "1"), TTL, 0)
            .unwrap();
        assert_eq!(router.indexed_keys(), 1);

        assert_eq!(router.on_write("services", "netflix"), 2);
        assert!(!cache.contains(&query_key));
        assert!(!cache.contains(&doc_key));
        assert!(cache.contains(&other_key));
        assert_eq!(router.indexed_keys(), 0);
    }

    #[test]
    fn test_populate_after_write_is_discarded() {
        let (cache, router) = setup();
        let key = CacheKey::document("users", "1");

        let observed = router.generation("users");
        router.on_write("users", "1");
        let stored = router
            .populate_if_current(key.clone(), doc("users", "1"), TTL, observed)
            .unwrap();
        assert!(!stored);
        assert!(!cache.contains(&key));

        // A fresh read after the write populates normally
        let observed = router.generation("users");
        assert!(router
            .populate_if_current(key.clone(), doc("users", "1"), TTL, observed)
            .unwrap());
        assert!(cache.contains(&key));
    }

    #[test]
    fn test_write_through_replaces_document_and_drops_queries() {
        let (cache, router) = setup();
        let doc_key = CacheKey::document("users", "1");
        let query_key = CacheKey::query("users", 3);
        router
            .populate_if_current(doc_key.clone(), doc("users", "1"), TTL, 0)
            .unwrap();
        router
            .populate_if_current(query_key.clone(), CachedValue::Documents(vec![]), TTL, 0)
            .unwrap();

        router
            .write_through("users", "1", Some((CachedValue::Absent, TTL)))
            .unwrap();
        assert_eq!(cache.peek(&doc_key), Some(CachedValue::Absent));
        assert!(!cache.contains(&query_key));
        assert_eq!(router.generation("users"), 1);
    }

    #[test]
    fn test_other_collections_keep_their_generation() {
        let (_, router) = setup();
        router.on_write("users", "1");
        assert_eq!(router.generation("users"), 1);
        assert_eq!(router.generation("services"), 0);
    }

    #[test]
    fn test_on_writes_dedupes_collections() {
        let (cache, router) = setup();
        router
            .populate_if_current(CacheKey::count("orders", 1), CachedValue::Count(3), TTL, 0)
            .unwrap();
        router
            .populate_if_current(CacheKey::document("orders", "a"), doc("orders", "a"), TTL, 0)
            .unwrap();

        let removed = router.on_writes([("orders", "a"), ("orders", "b"), ("orders", "a")]);
        assert_eq!(removed, 2);
        assert!(cache.is_empty());
        assert_eq!(router.generation("orders"), 1);
    }

    #[test]
    fn test_invalidate_collection_and_prune() {
        let (cache, router) = setup();
        router
            .populate_if_current(CacheKey::query("users", 5), CachedValue::Documents(vec![]), TTL, 0)
            .unwrap();
        router
            .populate_if_current(CacheKey::query("stats", 6), CachedValue::Documents(vec![]), TTL, 0)
            .unwrap();
        router
            .populate_if_current(CacheKey::document("users", "9"), doc("users", "9"), TTL, 0)
            .unwrap();

        assert_eq!(router.invalidate_collection("users"), 2);
        assert_eq!(router.indexed_keys(), 1);

        cache.clear();
        assert_eq!(router.prune_index(), 1);
        assert_eq!(router.indexed_keys(), 0);
    }
}
