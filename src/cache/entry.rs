//! Cache Entry Types
//!
//! Keys are tagged with their source collection so the invalidation router
//! can find every derived entry of a collection without parsing strings.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::domain::ports::Document;

/// Fast non-cryptographic hash (FxHash algorithm).
///
/// Fixed seed, so values are stable across processes and can back query
/// fingerprints as well as shard selection.
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// What a cache key points at inside its collection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// A single document
    Document(String),
    /// A query result set, by fingerprint
    Query(u64),
    /// A count aggregate, by fingerprint
    Count(u64),
}

/// Cache key - collection tag plus document id or query fingerprint
#[derive(Clone, Debug, Eq)]
pub struct CacheKey {
    /// Pre-computed hash (for fast comparison and shard selection)
    hash: u64,
    collection: String,
    kind: KeyKind,
}

impl CacheKey {
    fn with_kind(collection: impl Into<String>, kind: KeyKind) -> Self {
        let collection = collection.into();
        let mut hash = fx_hash(collection.as_bytes());
        hash ^= match &kind {
            KeyKind::Document(id) => fx_hash(id.as_bytes()),
            KeyKind::Query(fp) => fp.rotate_left(17),
            KeyKind::Count(fp) => fp.rotate_left(31),
        };
        Self {
            hash,
            collection,
            kind,
        }
    }

    /// Key for a single document
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::with_kind(collection, KeyKind::Document(id.into()))
    }

    /// Key for a query result set
    pub fn query(collection: impl Into<String>, fingerprint: u64) -> Self {
        Self::with_kind(collection, KeyKind::Query(fingerprint))
    }

    /// Key for a count aggregate
    pub fn count(collection: impl Into<String>, fingerprint: u64) -> Self {
        Self::with_kind(collection, KeyKind::Count(fingerprint))
    }

    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    #[inline]
    pub fn kind(&self) -> &KeyKind {
        &self.kind
    }

    /// Whether this key holds a result derived from many documents
    pub fn is_derived(&self) -> bool {
        !matches!(self.kind, KeyKind::Document(_))
    }

    #[inline]
    pub fn combined_hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        self.hash == other.hash && self.collection == other.collection && self.kind == other.kind
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            KeyKind::Document(id) => write!(f, "{}/{}", self.collection, id),
            KeyKind::Query(fp) => write!(f, "{}?q={:016x}", self.collection, fp),
            KeyKind::Count(fp) => write!(f, "{}#count={:016x}", self.collection, fp),
        }
    }
}

// =============================================================================
// Cached Values
// =============================================================================

/// Values the cache store accepts.
///
/// An "undefined" value is one that says nothing about the store's contents.
/// Caching it would hide real data until expiry, so the store refuses it.
pub trait Cacheable: Clone + Send + Sync {
    fn is_undefined(&self) -> bool;
}

/// Value cached by the governor façade
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// A document that exists
    Document(Document),
    /// Confirmed absence of a document
    Absent,
    /// Query result set
    Documents(Vec<Document>),
    /// Count aggregate
    Count(u64),
}

impl CachedValue {
    /// Wrap a backend lookup result, keeping "not found" explicit
    pub fn from_lookup(doc: Option<Document>) -> Self {
        match doc {
            Some(doc) => CachedValue::Document(doc),
            None => CachedValue::Absent,
        }
    }
}

impl Cacheable for CachedValue {
    fn is_undefined(&self) -> bool {
        false
    }
}

impl Cacheable for Value {
    fn is_undefined(&self) -> bool {
        self.is_null()
    }
}

impl<T: Clone + Send + Sync> Cacheable for Option<T> {
    fn is_undefined(&self) -> bool {
        self.is_none()
    }
}

/// A stored value with its time-to-live
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
        }
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    #[inline]
    pub fn stored_at(&self) -> Instant {
        self.stored_at
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    /// Live iff `now - stored_at < ttl`
    #[inline]
    pub fn is_live(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }

    /// Whether the entry is still worth keeping as a stale fallback
    #[inline]
    pub fn within_grace(&self, now: Instant, grace: Duration) -> bool {
        self.age(now) < self.ttl.saturating_add(grace)
    }
}
