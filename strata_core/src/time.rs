// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Monotonic host time.
//!
//! [`HostTime`] represents a point on the platform's monotonic clock in
//! nanoseconds. [`Duration`] is a span in the same units. All arithmetic is
//! checked or saturating; times never wrap silently.
//!
//! The composition pipeline never reads a wall clock: every timestamp either
//! arrives from the hardware composer (vsync, present fences) or is produced
//! by the [`Clock`] installed in the compositor context, which test harnesses
//! replace with a manually advanced clock.

use core::fmt;
use core::ops::{Add, Sub};
use std::sync::Arc;

/// A point in time expressed as monotonic nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostTime(pub u64);

impl HostTime {
    /// Returns the raw nanosecond value.
    #[inline]
    #[must_use]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Returns the duration between `self` and an earlier time, or zero if
    /// `earlier` is after `self`.
    #[inline]
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }

    /// Checked addition of a duration.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, duration: Duration) -> Option<Self> {
        match self.0.checked_add(duration.0) {
            Some(t) => Some(Self(t)),
            None => None,
        }
    }

    /// Checked subtraction of a duration.
    #[inline]
    #[must_use]
    pub const fn checked_sub(self, duration: Duration) -> Option<Self> {
        match self.0.checked_sub(duration.0) {
            Some(t) => Some(Self(t)),
            None => None,
        }
    }

    /// Saturating addition of a duration.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.0))
    }
}

impl Add<Duration> for HostTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub<Duration> for HostTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Sub for HostTime {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Self) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl fmt::Debug for HostTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostTime({})", self.0)
    }
}

/// A duration in nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(pub u64);

impl Duration {
    /// A zero-length duration.
    pub const ZERO: Self = Self(0);

    /// Creates a duration from whole milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms * 1_000_000)
    }

    /// Creates a duration from whole seconds.
    #[inline]
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Returns the raw nanosecond value.
    #[inline]
    #[must_use]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Saturating addition.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Converts to a `std::time::Duration` for condvar waits.
    #[inline]
    #[must_use]
    pub const fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0)
    }
}

impl Add for Duration {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Duration({})", self.0)
    }
}

/// Snaps `value` onto the grid `{ideal + n * period}`, choosing the grid
/// point nearest to `value`.
///
/// Used to remove sub-millisecond scheduling jitter from client-visible
/// compositor-to-present latency: the observed latency is replaced by the
/// nearest whole number of vsync periods around the configured ideal
/// latency. Values more than half a period below `ideal` clamp to `ideal`
/// itself; the grid has no representable point below it.
#[must_use]
pub fn snap_to_period(value: Duration, ideal: Duration, period: Duration) -> Duration {
    if period.0 == 0 {
        return value;
    }
    let bias = period.0 / 2;
    let above = value.0.saturating_add(bias).saturating_sub(ideal.0);
    let snapped = (above / period.0) * period.0;
    Duration(ideal.0.saturating_add(snapped))
}

/// Source of monotonic time for the compositor context.
///
/// Production code uses [`SystemClock`]; tests install a manually advanced
/// clock from the harness crate.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current monotonic time.
    fn now(&self) -> HostTime;
}

/// Shared handle to a [`Clock`].
pub type SharedClock = Arc<dyn Clock>;

/// A [`Clock`] backed by `std::time::Instant`.
#[derive(Debug)]
pub struct SystemClock {
    epoch: std::time::Instant,
}

impl SystemClock {
    /// Creates a clock whose zero point is the moment of construction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> HostTime {
        let elapsed = self.epoch.elapsed();
        #[expect(
            clippy::cast_possible_truncation,
            reason = "u64 nanoseconds cover ~584 years of uptime"
        )]
        HostTime(elapsed.as_nanos() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_time_duration_ops() {
        let t = HostTime(1000);
        let d = Duration(200);
        assert_eq!((t + d).nanos(), 1200);
        assert_eq!((t - d).nanos(), 800);
        assert_eq!(t.saturating_duration_since(HostTime(1500)), Duration::ZERO);
        assert_eq!(t.saturating_duration_since(HostTime(400)), Duration(600));
    }

    #[test]
    fn checked_ops_detect_overflow() {
        assert!(HostTime(u64::MAX).checked_add(Duration(1)).is_none());
        assert!(HostTime(0).checked_sub(Duration(1)).is_none());
        assert_eq!(
            HostTime(5).checked_add(Duration(5)),
            Some(HostTime(10)),
            "in-range addition should succeed"
        );
    }

    #[test]
    fn duration_constructors() {
        assert_eq!(Duration::from_millis(1), Duration(1_000_000));
        assert_eq!(Duration::from_secs(1), Duration(1_000_000_000));
    }

    #[test]
    fn snap_rounds_to_nearest_period() {
        let period = Duration::from_millis(16);
        let ideal = Duration::ZERO;
        // 15ms observed latency snaps up to one period.
        assert_eq!(
            snap_to_period(Duration::from_millis(15), ideal, period),
            Duration::from_millis(16)
        );
        // 7ms snaps down to zero.
        assert_eq!(
            snap_to_period(Duration::from_millis(7), ideal, period),
            Duration::ZERO
        );
        // Exact multiples are unchanged.
        assert_eq!(
            snap_to_period(Duration::from_millis(32), ideal, period),
            Duration::from_millis(32)
        );
    }

    #[test]
    fn snap_grid_is_anchored_at_the_ideal_latency() {
        let period = Duration::from_millis(16);
        let ideal = Duration::from_millis(11);
        // The ideal itself is on the grid and maps to itself.
        assert_eq!(snap_to_period(ideal, ideal, period), ideal);
        // One period up: 25ms is nearest to ideal + period = 27ms.
        assert_eq!(
            snap_to_period(Duration::from_millis(25), ideal, period),
            Duration::from_millis(27)
        );
        // Nothing below the ideal is representable on the grid.
        assert_eq!(
            snap_to_period(Duration::from_millis(2), ideal, period),
            ideal
        );
    }

    #[test]
    fn snap_with_zero_period_is_identity() {
        let v = Duration(12345);
        assert_eq!(snap_to_period(v, Duration(99), Duration::ZERO), v);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a, "monotonic clock must not run backwards");
    }
}
