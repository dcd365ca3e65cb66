// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The scheduler: vsync plumbing between the composer and the frame loop.
//!
//! Owns the [`VsyncDistributor`] and the two standard connections ("app"
//! for producers, "sf" for the compositor's own wakeup), guards composer
//! events by connection [`Generation`], and accumulates the frame-missed
//! statistics the present cycle feeds back.

use tracing::debug;

use crate::config::PhaseOffsets;
use crate::hwc::{Generation, TaggedEvent};
use crate::time::{Duration, HostTime};
use crate::vsync::{SampleOutcome, VsyncConnection, VsyncDistributor};

/// Rolling frame-miss counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameMissedStats {
    /// Frames that missed their vsync, any composition path.
    pub total: u64,
    /// Misses on frames the hardware composited alone.
    pub hwc: u64,
    /// Misses on frames that took the GPU fallback path.
    pub gpu: u64,
}

/// Vsync scheduling state for the primary timeline.
#[derive(Debug)]
pub struct Scheduler {
    distributor: VsyncDistributor,
    generation: Generation,
    phase_offsets: PhaseOffsets,
    missed: FrameMissedStats,
}

impl Scheduler {
    /// Creates the scheduler and its two standard connections, returning
    /// `(scheduler, app_connection, sf_connection)`.
    #[must_use]
    pub fn new(
        initial_period: Duration,
        phase_offsets: PhaseOffsets,
    ) -> (Self, VsyncConnection, VsyncConnection) {
        let mut distributor = VsyncDistributor::new(initial_period);
        let app = distributor.create_connection("app", phase_offsets.app);
        let sf = distributor.create_connection("sf", phase_offsets.sf);
        (
            Self {
                distributor,
                generation: Generation::default(),
                phase_offsets,
                missed: FrameMissedStats::default(),
            },
            app,
            sf,
        )
    }

    /// The distributor, for vsync control.
    pub fn distributor(&mut self) -> &mut VsyncDistributor {
        &mut self.distributor
    }

    /// Current composer-connection generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Invalidates all in-flight composer events (composer reconnect).
    pub fn bump_generation(&mut self) -> Generation {
        self.generation = self.generation.next();
        self.generation
    }

    /// Whether an event belongs to the live composer connection.
    ///
    /// Stale events are logged and must be dropped by the caller.
    #[must_use]
    pub fn accepts(&self, event: &TaggedEvent) -> bool {
        let live = event.generation == self.generation;
        if !live {
            debug!(?event.generation, current = ?self.generation, "stale composer event dropped");
        }
        live
    }

    /// Feeds a hardware vsync into the model.
    pub fn on_hardware_vsync(
        &mut self,
        timestamp: HostTime,
        reported_period: Option<Duration>,
    ) -> SampleOutcome {
        self.distributor
            .on_hardware_vsync(timestamp, reported_period)
    }

    /// The vsync a frame started now would present at.
    #[must_use]
    pub fn expected_present_time(&self, now: HostTime) -> HostTime {
        self.distributor.next_vsync_after(now)
    }

    /// Current phase offsets.
    #[must_use]
    pub fn phase_offsets(&self) -> PhaseOffsets {
        self.phase_offsets
    }

    /// Re-targets both standard connections.
    pub fn set_phase_offsets(&mut self, offsets: PhaseOffsets) {
        self.phase_offsets = offsets;
        self.distributor.set_phase_offset("app", offsets.app);
        self.distributor.set_phase_offset("sf", offsets.sf);
    }

    /// The latency from compositor wakeup to present implied by the "sf"
    /// offset: the compositor wakes `sf` after one vsync and targets the
    /// next.
    #[must_use]
    pub fn ideal_present_latency(&self) -> Duration {
        let period = self.distributor.period();
        period.saturating_sub(Duration(
            self.phase_offsets.sf.nanos() % period.nanos().max(1),
        ))
    }

    /// Records a missed frame from present feedback.
    pub fn record_missed(&mut self, gpu_fallback: bool) {
        self.missed.total += 1;
        if gpu_fallback {
            self.missed.gpu += 1;
        } else {
            self.missed.hwc += 1;
        }
    }

    /// Miss counters so far.
    #[must_use]
    pub fn missed_stats(&self) -> FrameMissedStats {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwc::{ComposerEvent, DisplayId};

    const PERIOD: Duration = Duration(16_666_666);

    fn scheduler() -> Scheduler {
        Scheduler::new(PERIOD, PhaseOffsets::default()).0
    }

    fn vsync_event(generation: Generation) -> TaggedEvent {
        TaggedEvent {
            generation,
            event: ComposerEvent::Vsync {
                display: DisplayId(1),
                timestamp: HostTime(0),
                period: None,
            },
        }
    }

    #[test]
    fn stale_generation_events_are_rejected() {
        let mut s = scheduler();
        let old = s.generation();
        assert!(s.accepts(&vsync_event(old)));
        let new = s.bump_generation();
        assert!(!s.accepts(&vsync_event(old)));
        assert!(s.accepts(&vsync_event(new)));
    }

    #[test]
    fn missed_stats_split_by_composition_path() {
        let mut s = scheduler();
        s.record_missed(false);
        s.record_missed(true);
        s.record_missed(false);
        assert_eq!(
            s.missed_stats(),
            FrameMissedStats {
                total: 3,
                hwc: 2,
                gpu: 1
            }
        );
    }

    #[test]
    fn ideal_latency_derives_from_sf_offset() {
        let offsets = PhaseOffsets {
            app: Duration::from_millis(1),
            sf: Duration::from_millis(5),
        };
        let (s, _app, _sf) = Scheduler::new(PERIOD, offsets);
        assert_eq!(
            s.ideal_present_latency(),
            PERIOD.saturating_sub(Duration::from_millis(5))
        );
    }

    #[test]
    fn expected_present_is_next_modelled_vsync() {
        let (mut s, _app, _sf) = Scheduler::new(Duration(10), PhaseOffsets::default());
        s.distributor().resync(None);
        for t in [0_u64, 10, 20] {
            let _ = s.on_hardware_vsync(HostTime(t), None);
        }
        assert_eq!(s.expected_present_time(HostTime(25)), HostTime(30));
    }
}
