//! Property-Based Tests for the Cache Store
//!
//! 1. **Freshness**: a value set with a long TTL is returned unchanged
//! 2. **No-undefined**: undefined values never replace a stored value
//! 3. **Boundedness**: the store never holds more than its ceiling
//! 4. **Fingerprint determinism**: filter insertion order is irrelevant

#![cfg(test)]

use std::time::Duration;

use proptest::prelude::*;
use serde_json::Value;

use super::entry::CacheKey;
use super::fingerprint::query_fingerprint;
use super::store::{CacheConfig, CacheStore};
use crate::domain::ports::{Filters, QueryOptions};

// =============================================================================
// Property Strategies
// =============================================================================

fn id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,12}"
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z ]{0,16}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ]
}

fn filter_pairs_strategy() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(("[a-z]{1,6}", any::<i64>()), 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: set then get returns the stored value while live.
    #[test]
    fn prop_set_then_get(id in id_strategy(), value in value_strategy()) {
        let cache: CacheStore<Value> = CacheStore::new();
        let key = CacheKey::document("users", id);
        cache.set(key.clone(), value.clone(), Duration::from_secs(60))?;
        prop_assert_eq!(cache.get(&key), Some(value));
    }

    /// Property: an undefined set is rejected and the prior value survives.
    #[test]
    fn prop_undefined_never_replaces(id in id_strategy(), value in value_strategy()) {
        let cache: CacheStore<Value> = CacheStore::new();
        let key = CacheKey::document("users", id);
        cache.set(key.clone(), value.clone(), Duration::from_secs(60))?;
        prop_assert!(cache.set(key.clone(), Value::Null, Duration::from_secs(60)).is_err());
        prop_assert_eq!(cache.get(&key), Some(value));
    }

    /// Property: the entry count never exceeds the configured ceiling.
    #[test]
    fn prop_bounded(max in 1usize..32, inserts in 0usize..128) {
        let cache: CacheStore<Value> = CacheStore::with_config(CacheConfig {
            max_entries: max,
            eviction_batch: 4,
            stale_grace: Duration::from_secs(1),
        });
        for i in 0..inserts {
            cache.set(
                CacheKey::document("c", i.to_string()),
                Value::from(i as u64),
                Duration::from_secs(60),
            )?;
            prop_assert!(cache.len() <= max);
        }
    }

    /// Property: fingerprints do not depend on filter insertion order.
    #[test]
    fn prop_fingerprint_order_independent(pairs in filter_pairs_strategy()) {
        let forward: Filters = pairs.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect();
        let backward: Filters = pairs.iter().rev().map(|(k, v)| (k.clone(), Value::from(*v))).collect();
        // Duplicate keys resolve differently by direction; only compare when unique
        prop_assume!(forward == backward);
        let opts = QueryOptions::default();
        prop_assert_eq!(
            query_fingerprint("services", &forward, &opts),
            query_fingerprint("services", &backward, &opts)
        );
    }
}
