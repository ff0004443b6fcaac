//! Clock abstraction so that leases, expiries and retention windows can be
//! tested deterministically.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Abstraction over wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Returns `instant + duration`, saturating at the maximum representable time.
#[must_use]
pub fn after(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Returns `instant - duration`, saturating at the minimum representable time.
#[must_use]
pub fn before(instant: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| instant.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Returns the time left until `deadline`, or `None` once it has passed.
#[must_use]
pub fn remaining(now: DateTime<Utc>, deadline: DateTime<Utc>) -> Option<Duration> {
    (deadline - now).to_std().ok().filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_after_and_before_shift_by_duration() {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();

        assert_eq!(
            after(now, Duration::from_secs(90)),
            Utc.with_ymd_and_hms(2026, 1, 15, 10, 1, 30).unwrap()
        );
        assert_eq!(
            before(now, Duration::from_secs(3600)),
            Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_after_saturates_instead_of_overflowing() {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();

        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_remaining_is_none_once_deadline_passed() {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let deadline = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 30).unwrap();

        assert_eq!(remaining(now, deadline), Some(Duration::from_secs(30)));
        assert_eq!(remaining(deadline, deadline), None);
        assert_eq!(remaining(deadline, now), None);
    }
}
