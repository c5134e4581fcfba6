//! Wall-clock source for scheduled resets.
//!
//! TTLs and per-second windows use monotonic [`std::time::Instant`]; only the
//! daily quota boundary needs calendar time, and that comes from a [`Clock`]
//! so tests can move the day forward without sleeping.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use parking_lot::RwLock;

/// Source of current UTC time
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.write();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Next instant strictly after `now` at which the day rolls over at `hour` UTC.
pub fn next_daily_boundary(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}
