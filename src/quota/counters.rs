//! Per-scope quota counters.
//!
//! Increments are the hottest path in the governor, so every counter is a
//! cache-padded atomic. The per-second window rolls lazily: each counter
//! remembers the index of the window it is counting, and the first caller to
//! observe a newer index zeroes it.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use serde::Serialize;

/// Which operations a counter meters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaScope {
    Read,
    Write,
    Delete,
}

impl std::fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaScope::Read => write!(f, "read"),
            QuotaScope::Write => write!(f, "write"),
            QuotaScope::Delete => write!(f, "delete"),
        }
    }
}

/// Portion of `limit` usable under `margin`, never zero for a non-zero limit
pub fn budget(limit: u64, margin: f64) -> u64 {
    if limit == 0 {
        return 0;
    }
    ((limit as f64 * margin).floor() as u64).max(1)
}

/// Daily and per-second counters for one scope
#[derive(Debug)]
pub struct QuotaCounter {
    scope: QuotaScope,
    daily_limit: u64,
    window_limit: u64,
    daily_used: CachePadded<AtomicU64>,
    window_used: CachePadded<AtomicU64>,
    /// Part of `window_used` spent by batch commits
    window_batched: CachePadded<AtomicU64>,
    window_index: CachePadded<AtomicU64>,
}

impl QuotaCounter {
    pub fn new(scope: QuotaScope, daily_limit: u64, window_limit: u64) -> Self {
        Self {
            scope,
            daily_limit,
            window_limit,
            daily_used: CachePadded::new(AtomicU64::new(0)),
            window_used: CachePadded::new(AtomicU64::new(0)),
            window_batched: CachePadded::new(AtomicU64::new(0)),
            window_index: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn scope(&self) -> QuotaScope {
        self.scope
    }

    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    pub fn window_limit(&self) -> u64 {
        self.window_limit
    }

    pub fn daily_used(&self) -> u64 {
        self.daily_used.load(Ordering::Acquire)
    }

    pub fn window_used(&self) -> u64 {
        self.window_used.load(Ordering::Acquire)
    }

    /// Count `n` operations against both windows
    pub fn record(&self, n: u64) {
        self.daily_used.fetch_add(n, Ordering::AcqRel);
        self.window_used.fetch_add(n, Ordering::AcqRel);
    }

    /// Count `n` operations committed as one batch. They fill the window like
    /// any other operation but do not count towards its usage ratio: a single
    /// commit may legitimately carry several windows' worth of writes.
    pub fn record_batch(&self, n: u64) {
        self.daily_used.fetch_add(n, Ordering::AcqRel);
        self.window_used.fetch_add(n, Ordering::AcqRel);
        self.window_batched.fetch_add(n, Ordering::AcqRel);
    }

    /// Whether `n` more operations fit under `margin` of both limits
    pub fn admits(&self, n: u64, margin: f64) -> bool {
        self.daily_used() + n <= budget(self.daily_limit, margin)
            && self.window_used() + n <= budget(self.window_limit, margin)
    }

    /// Whether `n` more operations fit under the nominal daily limit while the
    /// current window still has room. The window check is "not yet full"
    /// rather than "fits", so a batch larger than one window can still drain.
    pub fn admits_hard(&self, n: u64) -> bool {
        self.daily_used() + n <= self.daily_limit && self.window_used() < self.window_limit
    }

    /// Operations left under the nominal daily limit
    pub fn remaining_hard(&self) -> u64 {
        self.daily_limit.saturating_sub(self.daily_used())
    }

    /// Highest used/limit ratio of the two windows. The window ratio covers
    /// direct operations only.
    pub fn usage_ratio(&self) -> f64 {
        let ratio = |used: u64, limit: u64| {
            if limit == 0 {
                0.0
            } else {
                used as f64 / limit as f64
            }
        };
        let direct = self
            .window_used()
            .saturating_sub(self.window_batched.load(Ordering::Acquire));
        ratio(self.daily_used(), self.daily_limit).max(ratio(direct, self.window_limit))
    }

    /// Daily usage as a percentage of the nominal limit
    pub fn daily_percent(&self) -> f64 {
        if self.daily_limit == 0 {
            0.0
        } else {
            self.daily_used() as f64 * 100.0 / self.daily_limit as f64
        }
    }

    /// Zero the window if `index` is newer than the one being counted.
    /// Returns true if this call rolled the window.
    pub fn roll_window(&self, index: u64) -> bool {
        let current = self.window_index.load(Ordering::Acquire);
        if index <= current {
            return false;
        }
        if self
            .window_index
            .compare_exchange(current, index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.clear_window();
            true
        } else {
            false
        }
    }

    pub fn reset_window(&self) {
        self.clear_window();
    }

    fn clear_window(&self) {
        self.window_used.store(0, Ordering::Release);
        self.window_batched.store(0, Ordering::Release);
    }

    pub fn reset_daily(&self) -> u64 {
        self.clear_window();
        self.daily_used.swap(0, Ordering::AcqRel)
    }

    /// Overwrite the daily counter, e.g. from the store's own usage report
    pub fn seed_daily(&self, used: u64) {
        self.daily_used.store(used, Ordering::Release);
    }

    pub fn usage(&self, margin: f64) -> QuotaUsage {
        QuotaUsage {
            scope: self.scope,
            daily_used: self.daily_used(),
            daily_limit: self.daily_limit,
            daily_budget: budget(self.daily_limit, margin),
            daily_percent: self.daily_percent(),
            window_used: self.window_used(),
            window_limit: self.window_limit,
        }
    }
}

/// Point-in-time usage of one scope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub scope: QuotaScope,
    pub daily_used: u64,
    pub daily_limit: u64,
    /// Daily operations admissible for direct calls (limit × margin)
    pub daily_budget: u64,
    pub daily_percent: f64,
    pub window_used: u64,
    pub window_limit: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget() {
        assert_eq!(budget(10, 0.8), 8);
        assert_eq!(budget(50_000, 0.8), 40_000);
        assert_eq!(budget(1, 0.5), 1);
        assert_eq!(budget(0, 0.8), 0);
    }

    #[test]
    fn test_admission_with_margin() {
        let counter = QuotaCounter::new(QuotaScope::Write, 10, 100);
        for _ in 0..8 {
            assert!(counter.admits(1, 0.8));
            counter.record(1);
        }
        assert!(!counter.admits(1, 0.8));
        // Hard admission still has the reserve
        assert!(counter.admits_hard(2));
        assert!(!counter.admits_hard(3));
        assert_eq!(counter.remaining_hard(), 2);
    }

    #[test]
    fn test_window_limits_admission() {
        let counter = QuotaCounter::new(QuotaScope::Read, 1_000, 5);
        counter.record(4);
        assert!(!counter.admits(1, 0.8));
        assert!(counter.roll_window(1));
        assert!(counter.admits(1, 0.8));
        // Rolling to the same index again is a no-op
        counter.record(2);
        assert!(!counter.roll_window(1));
        assert_eq!(counter.window_used(), 2);
        assert_eq!(counter.daily_used(), 6);
    }

    #[test]
    fn test_usage_ratio_takes_max() {
        let counter = QuotaCounter::new(QuotaScope::Read, 100, 10);
        counter.record(5);
        assert!((counter.usage_ratio() - 0.5).abs() < 1e-9);
        counter.reset_window();
        assert!((counter.usage_ratio() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_batch_volume_fills_window_but_not_ratio() {
        let counter = QuotaCounter::new(QuotaScope::Write, 20_000, 50);
        counter.record_batch(500);
        assert_eq!(counter.window_used(), 500);
        assert_eq!(counter.daily_used(), 500);
        // 500 / 20_000 daily; the window share is ignored
        assert!((counter.usage_ratio() - 0.025).abs() < 1e-9);
        assert!(!counter.admits(1, 0.8));

        counter.record(40);
        assert!((counter.usage_ratio() - 0.8).abs() < 1e-9);

        assert!(counter.roll_window(1));
        counter.record(5);
        assert!((counter.usage_ratio() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_reset_daily_returns_previous() {
        let counter = QuotaCounter::new(QuotaScope::Delete, 100, 10);
        counter.record(7);
        assert_eq!(counter.reset_daily(), 7);
        assert_eq!(counter.daily_used(), 0);
        assert_eq!(counter.window_used(), 0);
    }
}
