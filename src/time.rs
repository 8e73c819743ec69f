//! Monotonic "stopwatch" time source shared by every component.
//!
//! Spec §5: all bucket arithmetic and lockout expiry use a process-wide
//! monotonic clock; wall-clock UTC is reserved for `ConnectionLimiter`'s
//! daily rollover and diagnostic report timestamps.

use std::sync::OnceLock;
use std::time::Instant;

/// Ticks per second of [`now_ticks`]. Chosen as nanoseconds so that
/// `ticks_to_ms` and sub-millisecond refill rates stay exact integers.
pub const STOPWATCH_FREQ: i64 = 1_000_000_000;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Current monotonic tick count since an arbitrary, process-local epoch.
///
/// Never decreases within a process. Two calls to `now_ticks()` from
/// different threads are comparable; the value has no meaning across
/// process restarts.
pub fn now_ticks() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

/// Convert a tick delta to whole milliseconds, rounding up.
///
/// Saturates at `i32::MAX` so callers can hand the result straight to a
/// `retry_after_ms: i32` field without an extra checked cast.
pub fn ticks_to_ms_ceil(ticks: i64) -> i32 {
    if ticks <= 0 {
        return 0;
    }
    let ms = (ticks.saturating_mul(1000) + (STOPWATCH_FREQ - 1)) / STOPWATCH_FREQ;
    ms.min(i32::MAX as i64) as i32
}

/// Convert a whole-second count to ticks.
pub fn secs_to_ticks(secs: i64) -> i64 {
    secs.saturating_mul(STOPWATCH_FREQ)
}

/// Wall-clock UTC seconds since the Unix epoch. Used only where the spec
/// calls for calendar semantics — `PolicyEntry.last_used_utc` and
/// `ConnectionLimiter`'s daily rollover — everywhere else uses
/// [`now_ticks`].
pub fn now_utc_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Day number (days since the Unix epoch) for a UTC-seconds timestamp, used
/// to detect date rollover without pulling in a calendar crate.
pub fn utc_day_number(utc_secs: i64) -> i64 {
    utc_secs.div_euclid(86_400)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ticks_is_monotonic() {
        let a = now_ticks();
        let b = now_ticks();
        assert!(b >= a);
    }

    #[test]
    fn ticks_to_ms_rounds_up() {
        assert_eq!(ticks_to_ms_ceil(0), 0);
        assert_eq!(ticks_to_ms_ceil(1), 1);
        assert_eq!(ticks_to_ms_ceil(STOPWATCH_FREQ / 1000), 1);
        assert_eq!(ticks_to_ms_ceil(STOPWATCH_FREQ / 1000 + 1), 2);
        assert_eq!(ticks_to_ms_ceil(STOPWATCH_FREQ), 1000);
    }

    #[test]
    fn ticks_to_ms_saturates() {
        assert_eq!(ticks_to_ms_ceil(i64::MAX), i32::MAX);
    }

    #[test]
    fn secs_to_ticks_roundtrip() {
        assert_eq!(secs_to_ticks(1), STOPWATCH_FREQ);
        assert_eq!(secs_to_ticks(30), STOPWATCH_FREQ * 30);
    }

    #[test]
    fn now_utc_secs_is_recent() {
        let now = now_utc_secs();
        assert!(now > 1_700_000_000);
    }

    #[test]
    fn utc_day_number_rolls_over_at_midnight() {
        let day = utc_day_number(86_400 * 10);
        assert_eq!(day, 10);
        assert_eq!(utc_day_number(86_400 * 10 - 1), 9);
    }
}
