//! Governor statistics
//!
//! One serializable snapshot of every component, served as `/stats` and fed
//! to the Prometheus exporter.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batcher::BatcherStats;
use crate::cache::CacheStats;
use crate::quota::{GovernorMode, QuotaSnapshot};
use crate::sync::SyncStats;

/// Counters for the façade read path
#[derive(Debug, Default)]
pub struct ReadPathMetrics {
    backend_reads: AtomicU64,
    stale_served: AtomicU64,
    denied: AtomicU64,
    backend_errors: AtomicU64,
}

impl ReadPathMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A miss went to the backend and succeeded
    pub fn record_backend_read(&self) {
        self.backend_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// A stale entry answered in place of the backend
    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Admission refused a backend read
    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReadPathStats {
        ReadPathStats {
            backend_reads: self.backend_reads.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPathStats {
    pub backend_reads: u64,
    pub stale_served: u64,
    pub denied: u64,
    pub backend_errors: u64,
}

/// Snapshot returned by `SmartStore::stats`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorStats {
    pub mode: GovernorMode,
    pub hit_rate: f64,
    pub cache: CacheStats,
    pub quota: QuotaSnapshot,
    pub reads: ReadPathStats,
    pub batcher: BatcherStats,
    pub listeners: SyncStats,
    pub uptime_secs: u64,
    pub generated_at: DateTime<Utc>,
}

impl GovernorStats {
    /// Daily read usage in percent of the nominal limit
    pub fn read_usage_percent(&self) -> f64 {
        self.quota.reads.daily_percent
    }

    pub fn write_usage_percent(&self) -> f64 {
        self.quota.writes.daily_percent
    }

    pub fn delete_usage_percent(&self) -> f64 {
        self.quota.deletes.daily_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_path_snapshot() {
        let metrics = ReadPathMetrics::new();
        metrics.record_backend_read();
        metrics.record_backend_read();
        metrics.record_denied();
        metrics.record_stale_served();
        metrics.record_backend_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.backend_reads, 2);
        assert_eq!(snap.denied, 1);
        assert_eq!(snap.stale_served, 1);
        assert_eq!(snap.backend_errors, 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["backendReads"], 2);
    }
}
