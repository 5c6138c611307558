//! Wall-clock abstraction.
//!
//! Everything that compares against "now" (leases, cron ticks, poll windows,
//! the 365-day activity cutoff) reads time through a [`Clock`], so tests can
//! pin and advance it.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// `at + by`, saturating at the representable maximum.
#[must_use]
pub fn after(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - by`, saturating at the representable minimum.
#[must_use]
pub fn before(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Move the clock forward (or backward, for negative `by`).
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock, after, before};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn manual_clock_is_frozen_until_moved() {
        let start = Utc.with_ymd_and_hms(2014, 1, 2, 3, 4, 5).single().expect("valid date");
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn offsets_saturate_instead_of_panicking() {
        let start = Utc.with_ymd_and_hms(2014, 1, 2, 3, 4, 5).single().expect("valid date");
        let ten_years = std::time::Duration::from_secs(10 * 365 * 24 * 3600);
        assert_eq!(after(start, ten_years) - start, Duration::days(3650));
        assert_eq!(before(start, std::time::Duration::from_secs(1)), start - Duration::seconds(1));
        assert_eq!(
            after(start, std::time::Duration::from_secs(u64::MAX)),
            chrono::DateTime::<Utc>::MAX_UTC
        );
    }
}
