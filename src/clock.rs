//! Time sources used by the scheduler and timer wheel.
//!
//! Mirrors the shape of a typical `clock` module: thin, `#[inline(always)]`
//! wrappers around `clock_gettime`, plus the millisecond-granularity
//! monotonic clock the timer wheel is built on.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A duration the scheduler treats as "no timeout" / "infinite".
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Value used by the timer wheel to mean "no pending timer".
pub const INVALID_MILLIS: u64 = u64::MAX;

/// The wall clock time in seconds since the Unix epoch.
#[inline(always)]
pub fn time() -> f64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_secs_f64()
}

/// The wall clock time in nanoseconds since the Unix epoch.
#[inline(always)]
pub fn time64() -> u64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_nanos() as u64
}

/// A monotonic instant, unaffected by wall-clock adjustments. This is what
/// the scheduler and timer wheel use internally.
#[inline(always)]
pub fn monotonic() -> Instant {
    Instant::now()
}

/// Monotonic time expressed as milliseconds since an arbitrary fixed origin,
/// matching the `millis_t currentTimeMillis()` primitive the timer wheel's
/// deadlines are keyed on.
#[inline(always)]
pub fn current_time_millis() -> u64 {
    thread_local! {
        static ORIGIN: Instant = Instant::now();
    }
    ORIGIN.with(|origin| origin.elapsed().as_millis() as u64)
}

/// Convert a [`Duration`] from now into an absolute millisecond deadline.
#[inline(always)]
pub fn deadline_millis_from_now(timeout: Duration) -> u64 {
    current_time_millis().saturating_add(timeout.as_millis() as u64)
}
