//! Cache Store
//!
//! The single place the governor keeps data in memory. Keys are tagged with
//! their collection; values carry a TTL; the store is bounded.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         CacheStore<V>                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ShardedMap<CacheKey, CacheEntry<V>>  (64 x RwLock<HashMap>) │
//! │                                                               │
//! │  users/42             -> Document   ttl 5m                    │
//! │  services?q=<fp>      -> Documents  ttl 30m                   │
//! │  orders#count=<fp>    -> Count      ttl 1m                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod entry;
mod fingerprint;
mod metrics;
mod shard;
mod store;

#[cfg(test)]
mod proptest;

pub use entry::{CacheEntry, CacheKey, Cacheable, CachedValue, KeyKind};
pub use fingerprint::{count_fingerprint, query_fingerprint};
pub use metrics::{CacheMetrics, CacheStats};
pub use shard::{Shard, ShardedMap};
pub use store::{CacheConfig, CacheStore, Lookup};

/// Number of shards in the cache map
pub const SHARD_COUNT: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_is_power_of_two() {
        // Power of 2 enables fast modulo via bitwise AND
        assert!(SHARD_COUNT.is_power_of_two());
    }
}
