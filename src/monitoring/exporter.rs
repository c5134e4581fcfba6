//! Prometheus exporter
//!
//! Mirrors [`GovernorStats`] snapshots into a private registry. Values are
//! copied from the snapshot on every update, so every series is a gauge.

use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use super::stats::GovernorStats;
use crate::error::Result;
use crate::quota::{GovernorMode, QuotaUsage};

const NAMESPACE: &str = "docgate";

/// Registry plus handles to every exported series
pub struct PrometheusExporter {
    registry: Registry,
    mode: IntGauge,
    usage_ratio: Gauge,
    quota_daily_used: IntGaugeVec,
    quota_daily_limit: IntGaugeVec,
    quota_window_used: IntGaugeVec,
    cache_entries: IntGauge,
    cache_hits: IntGauge,
    cache_misses: IntGauge,
    cache_evictions: IntGauge,
    cache_hit_ratio: Gauge,
    stale_served: IntGauge,
    reads_denied: IntGauge,
    batch_queued: IntGauge,
    batch_committed: IntGauge,
    batch_dropped: IntGauge,
    listeners_active: IntGauge,
    listeners_paused: IntGauge,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let exporter = Self {
            mode: IntGauge::with_opts(opts(
                "governor_mode",
                "Governor mode (0 normal, 1 warning, 2 emergency)",
            ))?,
            usage_ratio: Gauge::with_opts(opts(
                "quota_usage_ratio",
                "Highest used/limit ratio over all quota counters",
            ))?,
            quota_daily_used: IntGaugeVec::new(
                opts("quota_daily_used", "Operations used today"),
                &["scope"],
            )?,
            quota_daily_limit: IntGaugeVec::new(
                opts("quota_daily_limit", "Nominal daily operation limit"),
                &["scope"],
            )?,
            quota_window_used: IntGaugeVec::new(
                opts("quota_window_used", "Operations used in the current second"),
                &["scope"],
            )?,
            cache_entries: IntGauge::with_opts(opts("cache_entries", "Entries in the cache"))?,
            cache_hits: IntGauge::with_opts(opts("cache_hits", "Cache hits since start"))?,
            cache_misses: IntGauge::with_opts(opts("cache_misses", "Cache misses since start"))?,
            cache_evictions: IntGauge::with_opts(opts(
                "cache_evictions",
                "Entries evicted for capacity since start",
            ))?,
            cache_hit_ratio: Gauge::with_opts(opts("cache_hit_ratio", "Cache hit ratio"))?,
            stale_served: IntGauge::with_opts(opts(
                "reads_stale_served",
                "Reads answered with stale data",
            ))?,
            reads_denied: IntGauge::with_opts(opts(
                "reads_denied",
                "Backend reads refused by admission",
            ))?,
            batch_queued: IntGauge::with_opts(opts("batch_queued", "Writes waiting in the batcher"))?,
            batch_committed: IntGauge::with_opts(opts(
                "batch_committed",
                "Writes committed by the batcher since start",
            ))?,
            batch_dropped: IntGauge::with_opts(opts(
                "batch_dropped",
                "Writes dropped after failed commits",
            ))?,
            listeners_active: IntGauge::with_opts(opts("listeners_active", "Registered listeners"))?,
            listeners_paused: IntGauge::with_opts(opts(
                "listeners_paused",
                "Listeners paused by emergency mode",
            ))?,
            registry,
        };
        exporter.register_all()?;
        Ok(exporter)
    }

    fn register_all(&self) -> Result<()> {
        let r = &self.registry;
        r.register(Box::new(self.mode.clone()))?;
        r.register(Box::new(self.usage_ratio.clone()))?;
        r.register(Box::new(self.quota_daily_used.clone()))?;
        r.register(Box::new(self.quota_daily_limit.clone()))?;
        r.register(Box::new(self.quota_window_used.clone()))?;
        r.register(Box::new(self.cache_entries.clone()))?;
        r.register(Box::new(self.cache_hits.clone()))?;
        r.register(Box::new(self.cache_misses.clone()))?;
        r.register(Box::new(self.cache_evictions.clone()))?;
        r.register(Box::new(self.cache_hit_ratio.clone()))?;
        r.register(Box::new(self.stale_served.clone()))?;
        r.register(Box::new(self.reads_denied.clone()))?;
        r.register(Box::new(self.batch_queued.clone()))?;
        r.register(Box::new(self.batch_committed.clone()))?;
        r.register(Box::new(self.batch_dropped.clone()))?;
        r.register(Box::new(self.listeners_active.clone()))?;
        r.register(Box::new(self.listeners_paused.clone()))?;
        Ok(())
    }

    /// Copy a snapshot into the gauges
    pub fn update(&self, stats: &GovernorStats) {
        self.mode.set(mode_value(stats.mode));
        self.usage_ratio.set(stats.quota.usage_ratio);

        for usage in [&stats.quota.reads, &stats.quota.writes, &stats.quota.deletes] {
            self.update_scope(usage);
        }

        self.cache_entries.set(stats.cache.size as i64);
        self.cache_hits.set(stats.cache.hits as i64);
        self.cache_misses.set(stats.cache.misses as i64);
        self.cache_evictions.set(stats.cache.evictions as i64);
        self.cache_hit_ratio.set(stats.hit_rate);
        self.stale_served.set(stats.reads.stale_served as i64);
        self.reads_denied.set(stats.reads.denied as i64);
        self.batch_queued.set(stats.batcher.queued as i64);
        self.batch_committed.set(stats.batcher.committed as i64);
        self.batch_dropped.set(stats.batcher.dropped as i64);
        self.listeners_active.set(stats.listeners.active as i64);
        self.listeners_paused.set(stats.listeners.paused as i64);
    }

    fn update_scope(&self, usage: &QuotaUsage) {
        let scope = usage.scope.to_string();
        let labels = [scope.as_str()];
        self.quota_daily_used
            .with_label_values(&labels)
            .set(usage.daily_used as i64);
        self.quota_daily_limit
            .with_label_values(&labels)
            .set(usage.daily_limit as i64);
        self.quota_window_used
            .with_label_values(&labels)
            .set(usage.window_used as i64);
    }

    /// Render the registry in the text exposition format.
    /// Returns the content type and body.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

fn mode_value(mode: GovernorMode) -> i64 {
    match mode {
        GovernorMode::Normal => 0,
        GovernorMode::Warning => 1,
        GovernorMode::Emergency => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_registers_and_encodes() {
        let exporter = PrometheusExporter::new().unwrap();
        exporter.mode.set(2);
        exporter
            .quota_daily_used
            .with_label_values(&["read"])
            .set(42);

        let (content_type, body) = exporter.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("docgate_governor_mode 2"));
        assert!(text.contains("docgate_quota_daily_used{scope=\"read\"} 42"));
    }

    #[test]
    fn test_two_exporters_do_not_collide() {
        // Private registries, so independent governors can each export
        assert!(PrometheusExporter::new().is_ok());
        assert!(PrometheusExporter::new().is_ok());
    }

    #[test]
    fn test_mode_value() {
        assert_eq!(mode_value(GovernorMode::Normal), 0);
        assert_eq!(mode_value(GovernorMode::Emergency), 2);
    }
}
