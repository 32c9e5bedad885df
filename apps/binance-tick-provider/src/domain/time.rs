//! Hour arithmetic and the clock abstraction.
//!
//! Provider windows are aligned to UTC hours. The current time is read
//! through [`Clock`] so tests can pin "now" without sleeping.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;

const SECONDS_PER_HOUR: i64 = 3600;

/// One hour, the width of every cached history window.
#[must_use]
pub const fn one_hour() -> TimeDelta {
    TimeDelta::seconds(SECONDS_PER_HOUR)
}

/// Truncate a timestamp to the start of its UTC hour.
#[must_use]
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(SECONDS_PER_HOUR);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

/// True when the timestamp sits exactly on an hour boundary.
#[must_use]
pub fn is_hour_aligned(ts: DateTime<Utc>) -> bool {
    floor_to_hour(ts) == ts
}

/// Source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Jump to a specific instant.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    /// Move forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.write();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
