//! Governor Configuration
//!
//! Every knob the governor reads lives in [`GovernorConfig`]. The struct
//! deserializes from YAML with camelCase keys; any omitted key falls back to
//! the defaults below, which are sized for a free-tier document store.
//!
//! ```yaml
//! dailyReadLimit: 50000
//! safetyMargin: 0.8
//! defaultTTLByCollection:
//!   orders: 120000
//! statsTTL: 30000
//! ```
//!
//! Entries under `defaultTTLByCollection` are merged over the built-in ones,
//! so naming one collection keeps the others. `usersTTL`, `servicesTTL` and
//! `statsTTL` are shorthands that take precedence over the map.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Default time-to-live for collections without an explicit entry (5 min)
pub const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

/// Maximum operations the backend accepts in a single batch commit
pub const DEFAULT_MAX_BATCH_OPS: usize = 500;

/// Configuration for the whole governor object graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernorConfig {
    // Quota limits
    pub daily_read_limit: u64,
    pub daily_write_limit: u64,
    pub daily_delete_limit: u64,
    pub per_second_read_limit: u64,
    pub per_second_write_limit: u64,
    pub per_second_delete_limit: u64,

    /// Fraction of each nominal limit direct operations may consume (0-1)
    pub safety_margin: f64,

    /// Usage ratio at which the governor enters Warning mode
    pub warning_threshold: f64,

    /// Usage ratio at which the governor enters Emergency mode
    pub emergency_threshold: f64,

    /// Hour (UTC) at which daily counters reset
    pub daily_reset_hour_utc: u32,

    // Cache
    /// Per-collection TTL in milliseconds
    #[serde(
        rename = "defaultTTLByCollection",
        alias = "ttlByCollection",
        deserialize_with = "merge_over_default_ttls"
    )]
    pub ttl_by_collection: HashMap<String, u64>,

    #[serde(rename = "usersTTL", skip_serializing_if = "Option::is_none")]
    pub users_ttl_ms: Option<u64>,

    #[serde(rename = "servicesTTL", skip_serializing_if = "Option::is_none")]
    pub services_ttl_ms: Option<u64>,

    #[serde(rename = "statsTTL", skip_serializing_if = "Option::is_none")]
    pub stats_ttl_ms: Option<u64>,

    /// TTL for collections missing from `ttl_by_collection`
    pub default_ttl_ms: u64,

    /// TTL for query results; falls back to the collection TTL when unset
    pub query_ttl_ms: Option<u64>,

    /// TTL for count results
    pub count_ttl_ms: u64,

    /// How long an expired entry is kept around as a stale fallback
    pub stale_grace_ms: u64,

    pub max_cache_entries: usize,

    /// Number of oldest entries dropped when the ceiling is exceeded
    pub eviction_batch: usize,

    // Batcher
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_batch_ops_per_commit: usize,
    pub max_commit_retries: u32,
    pub retry_backoff_ms: u64,

    // Listeners
    pub max_active_listeners: usize,
    pub poll_interval_ms: u64,

    // Backend / background tasks
    pub backend_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub stats_interval_ms: u64,
}

fn default_ttl_by_collection() -> HashMap<String, u64> {
    HashMap::from([
        ("users".to_string(), 5 * 60 * 1000),
        ("services".to_string(), 30 * 60 * 1000),
        ("stats".to_string(), 60 * 1000),
    ])
}

fn merge_over_default_ttls<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = HashMap::<String, u64>::deserialize(deserializer)?;
    let mut ttls = default_ttl_by_collection();
    ttls.extend(overrides);
    Ok(ttls)
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            daily_read_limit: 50_000,
            daily_write_limit: 20_000,
            daily_delete_limit: 20_000,
            per_second_read_limit: 100,
            per_second_write_limit: 50,
            per_second_delete_limit: 50,
            safety_margin: 0.8,
            warning_threshold: 0.70,
            emergency_threshold: 0.95,
            daily_reset_hour_utc: 0,
            ttl_by_collection: default_ttl_by_collection(),
            users_ttl_ms: None,
            services_ttl_ms: None,
            stats_ttl_ms: None,
            default_ttl_ms: DEFAULT_TTL_MS,
            query_ttl_ms: None,
            count_ttl_ms: 60 * 1000,
            stale_grace_ms: 10 * 60 * 1000,
            max_cache_entries: 10_000,
            eviction_batch: 500,
            batch_size: 50,
            flush_interval_ms: 5_000,
            max_batch_ops_per_commit: DEFAULT_MAX_BATCH_OPS,
            max_commit_retries: 3,
            retry_backoff_ms: 200,
            max_active_listeners: 50,
            poll_interval_ms: 30_000,
            backend_timeout_ms: 10_000,
            sweep_interval_ms: 60_000,
            stats_interval_ms: 5 * 60 * 1000,
        }
    }
}

impl GovernorConfig {
    /// Load configuration from a YAML file and validate it
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parse configuration from a YAML string and validate it
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: GovernorConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(Error::Config(format!(
                "safetyMargin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        if !(0.0 < self.warning_threshold && self.warning_threshold < self.emergency_threshold)
        {
            return Err(Error::Config(format!(
                "warningThreshold ({}) must be positive and below emergencyThreshold ({})",
                self.warning_threshold, self.emergency_threshold
            )));
        }
        if self.daily_reset_hour_utc > 23 {
            return Err(Error::Config(format!(
                "dailyResetHourUtc must be 0-23, got {}",
                self.daily_reset_hour_utc
            )));
        }
        if self.max_batch_ops_per_commit == 0 {
            return Err(Error::Config("maxBatchOpsPerCommit must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batchSize must be > 0".into()));
        }
        if self.max_cache_entries == 0 {
            return Err(Error::Config("maxCacheEntries must be > 0".into()));
        }
        if self.flush_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "flushIntervalMs and pollIntervalMs must be > 0".into(),
            ));
        }
        if self.sweep_interval_ms == 0 || self.stats_interval_ms == 0 {
            return Err(Error::Config(
                "sweepIntervalMs and statsIntervalMs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// TTL for documents of a collection
    pub fn ttl_for(&self, collection: &str) -> Duration {
        let shorthand = match collection {
            "users" => self.users_ttl_ms,
            "services" => self.services_ttl_ms,
            "stats" => self.stats_ttl_ms,
            _ => None,
        };
        let ms = shorthand
            .or_else(|| self.ttl_by_collection.get(collection).copied())
            .unwrap_or(self.default_ttl_ms);
        Duration::from_millis(ms)
    }

    /// TTL for query results over a collection
    pub fn query_ttl_for(&self, collection: &str) -> Duration {
        match self.query_ttl_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.ttl_for(collection),
        }
    }

    pub fn count_ttl(&self) -> Duration {
        Duration::from_millis(self.count_ttl_ms)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_millis(self.stale_grace_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GovernorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl_for("users"), Duration::from_secs(300));
        assert_eq!(config.ttl_for("services"), Duration::from_secs(1800));
        assert_eq!(config.ttl_for("stats"), Duration::from_secs(60));
        assert_eq!(config.ttl_for("orders"), Duration::from_millis(DEFAULT_TTL_MS));
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
dailyWriteLimit: 10
safetyMargin: 0.5
defaultTTLByCollection:
  payments: 1000
"#;
        let config = GovernorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.daily_write_limit, 10);
        assert_eq!(config.safety_margin, 0.5);
        assert_eq!(config.ttl_for("payments"), Duration::from_secs(1));
        // untouched keys keep defaults, built-in collection TTLs included
        assert_eq!(config.daily_read_limit, 50_000);
        assert_eq!(config.ttl_for("users"), Duration::from_secs(300));
        assert_eq!(config.ttl_for("services"), Duration::from_secs(1800));
        assert_eq!(config.ttl_for("stats"), Duration::from_secs(60));
    }

    #[test]
    fn test_collection_ttl_shorthands() {
        let yaml = r#"
servicesTTL: 600000
statsTTL: 15000
defaultTTLByCollection:
  stats: 90000
  users: 120000
"#;
        let config = GovernorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.ttl_for("services"), Duration::from_secs(600));
        // shorthand beats the map entry
        assert_eq!(config.ttl_for("stats"), Duration::from_secs(15));
        assert_eq!(config.ttl_for("users"), Duration::from_secs(120));
        assert_eq!(config.users_ttl_ms, None);

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("statsTTL"));
        assert!(!yaml.contains("usersTTL"));
    }

    #[test]
    fn test_query_ttl_falls_back_to_collection() {
        let mut config = GovernorConfig::default();
        assert_eq!(config.query_ttl_for("services"), Duration::from_secs(1800));
        config.query_ttl_ms = Some(2_000);
        assert_eq!(config.query_ttl_for("services"), Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_margin_rejected() {
        let config = GovernorConfig {
            safety_margin: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let config = GovernorConfig {
            warning_threshold: 0.96,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GovernorConfig {
            daily_reset_hour_utc: 24,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
