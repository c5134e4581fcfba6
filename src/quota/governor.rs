//! Quota Governor
//!
//! Admission control for the metered store. Three scopes (read, write,
//! delete) each carry a daily and a per-second counter. Direct operations are
//! admitted against `limit × safetyMargin`; the batcher commits against the
//! nominal limit, so the margin is the reserve deferred writes drain into.
//!
//! ```text
//!   usage ratio  0%           70%              95%          100%
//!                ├────────────┼────────────────┼─────────────┤
//!   mode          Normal       Warning          Emergency
//!                              (slower polls)   (cache-only reads,
//!                                                deferred writes)
//! ```
//!
//! Modes escalate on every recorded operation and only step down when the
//! counters that pushed them up are reset.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::counters::{QuotaCounter, QuotaScope, QuotaUsage};
use crate::clock::{next_daily_boundary, Clock};
use crate::config::GovernorConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;

/// Length of the rate-limit window
const WINDOW: Duration = Duration::from_secs(1);

/// Operating state derived from quota usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorMode {
    Normal = 0,
    Warning = 1,
    Emergency = 2,
}

impl GovernorMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GovernorMode::Normal,
            1 => GovernorMode::Warning,
            _ => GovernorMode::Emergency,
        }
    }
}

impl std::fmt::Display for GovernorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GovernorMode::Normal => write!(f, "normal"),
            GovernorMode::Warning => write!(f, "warning"),
            GovernorMode::Emergency => write!(f, "emergency"),
        }
    }
}

/// Point-in-time view of all counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub mode: GovernorMode,
    pub usage_ratio: f64,
    pub reads: QuotaUsage,
    pub writes: QuotaUsage,
    pub deletes: QuotaUsage,
    pub next_daily_reset: DateTime<Utc>,
}

/// Tracks consumed quota and decides admission
pub struct QuotaGovernor {
    reads: QuotaCounter,
    writes: QuotaCounter,
    deletes: QuotaCounter,
    safety_margin: f64,
    warning_threshold: f64,
    emergency_threshold: f64,
    reset_hour_utc: u32,
    mode: AtomicU8,
    /// Origin for per-second window indices
    epoch: Instant,
    next_daily_reset: RwLock<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPublisher>,
}

impl QuotaGovernor {
    pub fn new(
        config: &GovernorConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let next = next_daily_boundary(clock.now_utc(), config.daily_reset_hour_utc);
        Self {
            reads: QuotaCounter::new(
                QuotaScope::Read,
                config.daily_read_limit,
                config.per_second_read_limit,
            ),
            writes: QuotaCounter::new(
                QuotaScope::Write,
                config.daily_write_limit,
                config.per_second_write_limit,
            ),
            deletes: QuotaCounter::new(
                QuotaScope::Delete,
                config.daily_delete_limit,
                config.per_second_delete_limit,
            ),
            safety_margin: config.safety_margin,
            warning_threshold: config.warning_threshold,
            emergency_threshold: config.emergency_threshold,
            reset_hour_utc: config.daily_reset_hour_utc,
            mode: AtomicU8::new(GovernorMode::Normal as u8),
            epoch: Instant::now(),
            next_daily_reset: RwLock::new(next),
            clock,
            events,
        }
    }

    fn counter(&self, scope: QuotaScope) -> &QuotaCounter {
        match scope {
            QuotaScope::Read => &self.reads,
            QuotaScope::Write => &self.writes,
            QuotaScope::Delete => &self.deletes,
        }
    }

    fn counters(&self) -> [&QuotaCounter; 3] {
        [&self.reads, &self.writes, &self.deletes]
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Whether `n` direct operations of `scope` may proceed now.
    /// Always false in Emergency mode.
    pub fn admits(&self, scope: QuotaScope, n: u64) -> bool {
        self.roll();
        if self.current_mode() == GovernorMode::Emergency {
            return false;
        }
        self.counter(scope).admits(n, self.safety_margin)
    }

    pub fn can_read(&self, n: u64) -> bool {
        self.admits(QuotaScope::Read, n)
    }

    pub fn can_write(&self, n: u64) -> bool {
        self.admits(QuotaScope::Write, n)
    }

    pub fn can_delete(&self, n: u64) -> bool {
        self.admits(QuotaScope::Delete, n)
    }

    /// Whether a batch of `n` operations fits under the nominal limit.
    /// Ignores mode and margin.
    pub fn can_commit(&self, scope: QuotaScope, n: u64) -> bool {
        self.roll();
        self.counter(scope).admits_hard(n)
    }

    pub fn can_commit_writes(&self, n: u64) -> bool {
        self.can_commit(QuotaScope::Write, n)
    }

    pub fn can_commit_deletes(&self, n: u64) -> bool {
        self.can_commit(QuotaScope::Delete, n)
    }

    /// Operations of `scope` still committable today under the nominal limit
    pub fn remaining_hard(&self, scope: QuotaScope) -> u64 {
        self.roll();
        self.counter(scope).remaining_hard()
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    pub fn record(&self, scope: QuotaScope, n: u64) {
        if n == 0 {
            return;
        }
        self.counter(scope).record(n);
        self.escalate();
    }

    /// Account for `n` operations committed in one batch
    pub fn record_batch(&self, scope: QuotaScope, n: u64) {
        if n == 0 {
            return;
        }
        self.counter(scope).record_batch(n);
        self.escalate();
    }

    pub fn record_read(&self, n: u64) {
        self.record(QuotaScope::Read, n);
    }

    pub fn record_write(&self, n: u64) {
        self.record(QuotaScope::Write, n);
    }

    pub fn record_delete(&self, n: u64) {
        self.record(QuotaScope::Delete, n);
    }

    /// Overwrite today's usage for a scope with an externally reported figure
    pub fn seed_daily_usage(&self, scope: QuotaScope, used: u64) {
        info!(%scope, used, "Seeding daily quota usage");
        self.counter(scope).seed_daily(used);
        self.recompute();
    }

    // =========================================================================
    // Mode
    // =========================================================================

    /// Current mode, after rolling any elapsed window or day
    pub fn mode(&self) -> GovernorMode {
        self.roll();
        self.current_mode()
    }

    fn current_mode(&self) -> GovernorMode {
        GovernorMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Highest used/limit ratio over every counter
    pub fn usage_ratio(&self) -> f64 {
        self.counters()
            .iter()
            .map(|c| c.usage_ratio())
            .fold(0.0, f64::max)
    }

    fn derive_mode(&self, ratio: f64) -> GovernorMode {
        if ratio >= self.emergency_threshold {
            GovernorMode::Emergency
        } else if ratio >= self.warning_threshold {
            GovernorMode::Warning
        } else {
            GovernorMode::Normal
        }
    }

    /// Raise the mode if usage calls for it; never lowers it
    fn escalate(&self) {
        let ratio = self.usage_ratio();
        let target = self.derive_mode(ratio);
        let mut current = self.mode.load(Ordering::Acquire);
        while (target as u8) > current {
            match self.mode.compare_exchange(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.announce(GovernorMode::from_u8(current), target, ratio);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Set the mode from current usage; used after counters reset
    fn recompute(&self) {
        let ratio = self.usage_ratio();
        let target = self.derive_mode(ratio);
        let previous = GovernorMode::from_u8(self.mode.swap(target as u8, Ordering::AcqRel));
        if previous != target {
            self.announce(previous, target, ratio);
        }
    }

    fn announce(&self, from: GovernorMode, to: GovernorMode, ratio: f64) {
        if to == GovernorMode::Emergency {
            warn!(%from, %to, usage_ratio = ratio, "Governor entering emergency mode");
        } else {
            info!(%from, %to, usage_ratio = ratio, "Governor mode changed");
        }
        self.events.publish(DomainEvent::ModeChanged {
            from: from.to_string(),
            to: to.to_string(),
            usage_ratio: ratio,
            timestamp: self.clock.now_utc(),
        });
    }

    // =========================================================================
    // Resets
    // =========================================================================

    /// Roll the per-second window and the day if their boundaries have passed
    fn roll(&self) {
        let index = self.epoch.elapsed().as_secs() / WINDOW.as_secs();
        let mut rolled = false;
        for counter in self.counters() {
            rolled |= counter.roll_window(index);
        }
        if !self.reset_daily_if_due() && rolled {
            self.recompute();
        }
    }

    /// Zero the per-second counters
    pub fn reset_window(&self) {
        for counter in self.counters() {
            counter.reset_window();
        }
        self.recompute();
    }

    /// Zero every counter and schedule the next daily boundary
    #[instrument(skip(self))]
    pub fn reset_daily(&self) {
        let now = self.clock.now_utc();
        *self.next_daily_reset.write() = next_daily_boundary(now, self.reset_hour_utc);
        self.clear_daily(now);
    }

    /// Reset the day if the boundary has passed. Returns true if it did.
    pub fn reset_daily_if_due(&self) -> bool {
        let now = self.clock.now_utc();
        if now < *self.next_daily_reset.read() {
            return false;
        }
        {
            let mut next = self.next_daily_reset.write();
            // Another caller got here first
            if now < *next {
                return false;
            }
            *next = next_daily_boundary(now, self.reset_hour_utc);
        }
        self.clear_daily(now);
        true
    }

    fn clear_daily(&self, now: DateTime<Utc>) {
        let reads = self.reads.reset_daily();
        let writes = self.writes.reset_daily();
        let deletes = self.deletes.reset_daily();
        info!(reads, writes, deletes, "Daily quota reset");
        self.events.publish(DomainEvent::DailyQuotaReset {
            reads,
            writes,
            deletes,
            timestamp: now,
        });
        self.recompute();
    }

    pub fn next_daily_reset(&self) -> DateTime<Utc> {
        *self.next_daily_reset.read()
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub fn usage(&self, scope: QuotaScope) -> QuotaUsage {
        self.counter(scope).usage(self.safety_margin)
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            mode: self.mode(),
            usage_ratio: self.usage_ratio(),
            reads: self.usage(QuotaScope::Read),
            writes: self.usage(QuotaScope::Write),
            deletes: self.usage(QuotaScope::Delete),
            next_daily_reset: self.next_daily_reset(),
        }
    }

    pub fn safety_margin(&self) -> f64 {
        self.safety_margin
    }

    /// Background loop: rolls windows every second and the day at its boundary
    #[instrument(skip(self, cancel))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(next_daily_reset = %self.next_daily_reset(), "Starting quota ticker");

        let mut tick = interval(WINDOW);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Quota ticker shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.roll();
                    debug!(mode = %self.current_mode(), "Quota tick");
                }
            }
        }
    }
}

impl std::fmt::Debug for QuotaGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGovernor")
            .field("mode", &self.current_mode())
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("deletes", &self.deletes)
            .field("safety_margin", &self.safety_margin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryEventCollector;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    type Parts = (QuotaGovernor, Arc<ManualClock>, Arc<InMemoryEventCollector>);

    fn governor(config: GovernorConfig) -> Parts {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap(),
        ));
        let events = Arc::new(InMemoryEventCollector::new());
        let gov = QuotaGovernor::new(&config, clock.clone(), events.clone());
        (gov, clock, events)
    }

    fn config(daily_read: u64, daily_write: u64) -> GovernorConfig {
        GovernorConfig {
            daily_read_limit: daily_read,
            daily_write_limit: daily_write,
            per_second_read_limit: 1_000_000,
            per_second_write_limit: 1_000_000,
            per_second_delete_limit: 1_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_read_admission_stops_at_margin_until_daily_reset() {
        let (gov, clock, _) = governor(GovernorConfig {
            safety_margin: 0.5,
            warning_threshold: 0.9,
            emergency_threshold: 0.99,
            ..config(100, 100)
        });
        for _ in 0..50 {
            assert!(gov.can_read(1));
            gov.record_read(1);
        }
        assert!(!gov.can_read(1));

        // Still refused later the same day
        clock.advance(chrono::Duration::hours(6));
        assert!(!gov.can_read(1));

        // Midnight passes
        clock.advance(chrono::Duration::hours(6));
        assert!(gov.can_read(1));
        assert_eq!(gov.usage(QuotaScope::Read).daily_used, 0);
    }

    #[test]
    fn test_batch_commit_does_not_trip_window_mode() {
        let (gov, _, events) = governor(GovernorConfig::default());
        gov.record_batch(QuotaScope::Write, 500);
        assert_eq!(gov.mode(), GovernorMode::Normal);
        assert!(gov.can_read(1));
        assert!(events.events_of_type("ModeChanged").is_empty());

        // Direct writes in the same window still see it as full
        assert!(!gov.can_write(1));
        gov.record_write(48);
        assert_eq!(gov.mode(), GovernorMode::Emergency);
    }

    #[test]
    fn test_margin_vs_hard_limit() {
        let (gov, _, _) = governor(config(1_000, 10));
        gov.record_write(8);
        assert!(!gov.can_write(1));
        assert!(gov.can_commit_writes(2));
        assert!(!gov.can_commit_writes(3));
        assert_eq!(gov.remaining_hard(QuotaScope::Write), 2);
    }

    #[test]
    fn test_mode_escalation_and_reset() {
        let (gov, _, events) = governor(config(100, 100));
        assert_eq!(gov.mode(), GovernorMode::Normal);

        gov.record_read(70);
        assert_eq!(gov.mode(), GovernorMode::Warning);

        gov.record_read(25);
        assert_eq!(gov.mode(), GovernorMode::Emergency);
        // Emergency refuses direct reads even with budget left on other scopes
        assert!(!gov.can_write(1));

        gov.reset_daily();
        assert_eq!(gov.mode(), GovernorMode::Normal);

        let modes: Vec<String> = events
            .events_of_type("ModeChanged")
            .into_iter()
            .filter_map(|e| match e {
                DomainEvent::ModeChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(modes, vec!["warning", "emergency", "normal"]);
        assert_eq!(events.events_of_type("DailyQuotaReset").len(), 1);
    }

    #[test]
    fn test_mode_does_not_step_down_without_reset() {
        let (gov, _, _) = governor(config(100, 100));
        gov.record_read(80);
        assert_eq!(gov.mode(), GovernorMode::Warning);
        // Seeding lower usage recomputes
        gov.seed_daily_usage(QuotaScope::Read, 10);
        assert_eq!(gov.mode(), GovernorMode::Normal);
    }

    #[test]
    fn test_window_usage_drives_mode() {
        let (gov, _, _) = governor(GovernorConfig {
            per_second_write_limit: 10,
            ..config(100_000, 100_000)
        });
        gov.record_write(10);
        assert_eq!(gov.current_mode(), GovernorMode::Emergency);
        gov.reset_window();
        assert_eq!(gov.current_mode(), GovernorMode::Normal);
    }

    #[test]
    fn test_reset_daily_if_due_is_idempotent() {
        let (gov, clock, events) = governor(config(100, 100));
        assert!(!gov.reset_daily_if_due());
        clock.advance(chrono::Duration::hours(13));
        assert!(gov.reset_daily_if_due());
        assert!(!gov.reset_daily_if_due());
        assert_eq!(events.events_of_type("DailyQuotaReset").len(), 1);
        assert_eq!(
            gov.next_daily_reset(),
            Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let (gov, _, _) = governor(config(100, 100));
        gov.record_read(10);
        let snap = gov.snapshot();
        assert_eq!(snap.reads.daily_used, 10);
        assert_eq!(snap.reads.daily_budget, 80);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["mode"], "normal");
        assert_eq!(json["reads"]["scope"], "read");
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (gov, _, _) = governor(config(100, 100));
        let gov = Arc::new(gov);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(gov.clone().run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
