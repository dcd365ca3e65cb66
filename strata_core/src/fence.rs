// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Synchronization fences.
//!
//! A [`Fence`] is a one-shot completion flag carrying the time at which it
//! fired. Producers attach an acquire fence to each queued frame; the latch
//! pass refuses to latch a frame whose fence is still pending. The hardware
//! composer returns a present fence per composited frame; the scheduler polls
//! it to decide whether the frame made its vsync deadline.
//!
//! Fences are cheap shared handles. Signaling is monotonic: the first
//! `signal` wins and later calls are ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::time::HostTime;

const UNSIGNALED: u64 = u64::MAX;

/// A shareable one-shot fence.
#[derive(Clone, Debug)]
pub struct Fence {
    // Signal time in nanoseconds; `UNSIGNALED` while pending.
    state: Arc<AtomicU64>,
}

impl Fence {
    /// Creates a fence that has not yet fired.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: Arc::new(AtomicU64::new(UNSIGNALED)),
        }
    }

    /// Creates a fence that already fired at `at`.
    #[must_use]
    pub fn signaled(at: HostTime) -> Self {
        let fence = Self::pending();
        fence.signal(at);
        fence
    }

    /// Marks the fence as fired at `at`. No-op if already signaled.
    ///
    /// `HostTime(u64::MAX)` is not a representable signal time.
    pub fn signal(&self, at: HostTime) {
        debug_assert_ne!(at.nanos(), UNSIGNALED, "signal time is reserved");
        let _ = self.state.compare_exchange(
            UNSIGNALED,
            at.nanos(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the fence has fired.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) != UNSIGNALED
    }

    /// The time the fence fired, or `None` while pending.
    #[must_use]
    pub fn signal_time(&self) -> Option<HostTime> {
        match self.state.load(Ordering::Acquire) {
            UNSIGNALED => None,
            nanos => Some(HostTime(nanos)),
        }
    }

    /// Whether the fence fired at or before `deadline`.
    ///
    /// A pending fence never satisfies any deadline.
    #[must_use]
    pub fn signaled_by(&self, deadline: HostTime) -> bool {
        self.signal_time().is_some_and(|t| t <= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_fence_reports_unsignaled() {
        let fence = Fence::pending();
        assert!(!fence.is_signaled());
        assert_eq!(fence.signal_time(), None);
        assert!(!fence.signaled_by(HostTime(u64::MAX - 1)));
    }

    #[test]
    fn signal_records_time_once() {
        let fence = Fence::pending();
        fence.signal(HostTime(100));
        fence.signal(HostTime(999));
        assert_eq!(
            fence.signal_time(),
            Some(HostTime(100)),
            "first signal wins"
        );
    }

    #[test]
    fn clones_share_state() {
        let fence = Fence::pending();
        let other = fence.clone();
        other.signal(HostTime(42));
        assert!(fence.is_signaled());
        assert_eq!(fence.signal_time(), Some(HostTime(42)));
    }

    #[test]
    fn signaled_by_compares_against_deadline() {
        let fence = Fence::signaled(HostTime(500));
        assert!(fence.signaled_by(HostTime(500)));
        assert!(fence.signaled_by(HostTime(501)));
        assert!(!fence.signaled_by(HostTime(499)));
    }
}
