//! Query fingerprints.
//!
//! A fingerprint is the FxHash of a canonical JSON rendering of the query's
//! parameters. Filters are a `BTreeMap` and `serde_json` objects are sorted
//! maps, so the same logical query always renders to the same bytes.

use serde::Serialize;

use super::entry::fx_hash;
use crate::domain::ports::{Filters, OrderBy, QueryOptions};

#[derive(Serialize)]
struct Canonical<'a> {
    collection: &'a str,
    filters: &'a Filters,
    order_by: Option<&'a OrderBy>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// Fingerprint of `(collection, filters, ordering, limit, offset)`
pub fn query_fingerprint(collection: &str, filters: &Filters, options: &QueryOptions) -> u64 {
    let canonical = Canonical {
        collection,
        filters,
        order_by: options.order_by.as_ref(),
        limit: options.limit,
        offset: options.offset,
    };
    // Serializing plain maps, strings and numbers cannot fail
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    fx_hash(&bytes)
}

/// Fingerprint for a count over `filters`
pub fn count_fingerprint(collection: &str, filters: &Filters) -> u64 {
    query_fingerprint(collection, filters, &QueryOptions::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filters(pairs: &[(&str, serde_json::Value)]) -> Filters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = filters(&[("category", json!("streaming")), ("active", json!(true))]);
        let b = filters(&[("active", json!(true)), ("category", json!("streaming"))]);
        let opts = QueryOptions::default();
        assert_eq!(
            query_fingerprint("services", &a, &opts),
            query_fingerprint("services", &b, &opts)
        );
    }

    #[test]
    fn test_every_parameter_participates() {
        let f = filters(&[("category", json!("streaming"))]);
        let base = query_fingerprint("services", &f, &QueryOptions::default());

        assert_ne!(base, query_fingerprint("users", &f, &QueryOptions::default()));
        assert_ne!(
            base,
            query_fingerprint("services", &f, &QueryOptions::default().with_limit(5))
        );
        assert_ne!(
            base,
            query_fingerprint("services", &f, &QueryOptions::default().with_offset(5))
        );
        assert_ne!(
            base,
            query_fingerprint(
                "services",
                &f,
                &QueryOptions::default().ordered_by(OrderBy::asc("price"))
            )
        );
        let other = filters(&[("category", json!("music"))]);
        assert_ne!(base, query_fingerprint("services", &other, &QueryOptions::default()));
    }

    #[test]
    fn test_nested_filter_values_are_canonical() {
        let a = filters(&[("meta", json!({"b": 1, "a": 2}))]);
        let b = filters(&[("meta", json!({"a": 2, "b": 1}))]);
        assert_eq!(count_fingerprint("x", &a), count_fingerprint("x", &b));
    }
}
