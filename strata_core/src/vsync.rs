// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! VSync distribution.
//!
//! The distributor maintains a period/phase model of one hardware vsync
//! timeline and fans events out to named consumer connections, each shifted
//! by its own phase offset. Consumers receive [`VsyncEvent`]s over a
//! [`crossbeam_channel`] and never touch the model directly.
//!
//! The timeline is a small state machine:
//!
//! ```text
//! Disabled -> Resync -> Enabled -> Disabled
//! ```
//!
//! Entering `Resync` asks for hardware vsync samples; once enough samples
//! arrive and the modelled period error falls under the threshold, the
//! timeline is `Enabled` and the model can predict timestamps on its own.
//! Disabling permanently (display power-off) makes the timeline unavailable
//! until it is explicitly re-enabled.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use crate::time::{Duration, HostTime};

/// Samples required before the model is trusted at all.
pub const MIN_RESYNC_SAMPLES: usize = 3;
/// Rolling sample window size.
pub const MAX_RESYNC_SAMPLES: usize = 32;

/// One vsync delivered to a consumer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VsyncEvent {
    /// When the consumer should wake, i.e. hardware vsync plus the
    /// connection's phase offset.
    pub timestamp: HostTime,
    /// The hardware vsync this wakeup is aimed at.
    pub expected_present: HostTime,
    /// The modelled vsync period at dispatch time.
    pub period: Duration,
}

/// Consumer end of a distributor connection.
#[derive(Debug)]
pub struct VsyncConnection {
    name: String,
    receiver: Receiver<VsyncEvent>,
}

impl VsyncConnection {
    /// The name given at creation ("app", "sf", ...).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event channel.
    #[must_use]
    pub fn events(&self) -> &Receiver<VsyncEvent> {
        &self.receiver
    }
}

#[derive(Debug)]
struct ConnectionSlot {
    name: String,
    phase_offset: Duration,
    sender: Sender<VsyncEvent>,
}

/// Timeline state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimelineState {
    /// No events flow; hardware vsync is not wanted.
    Disabled,
    /// Collecting samples until the model converges.
    Resync,
    /// Model converged; events flow.
    Enabled,
}

/// What one hardware vsync sample did to the model.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleOutcome {
    /// The model still wants hardware vsync samples.
    pub needs_more_samples: bool,
    /// An in-flight period change was observed to complete on this sample.
    pub period_change_completed: bool,
}

/// Per-hardware-timeline vsync model and fan-out.
#[derive(Debug)]
pub struct VsyncDistributor {
    state: TimelineState,
    hardware_available: bool,
    samples: VecDeque<u64>,
    period: Duration,
    phase: Duration,
    pending_period: Option<Duration>,
    connections: Vec<ConnectionSlot>,
}

impl VsyncDistributor {
    /// Creates a disabled distributor with an initial period guess.
    ///
    /// # Panics
    ///
    /// Panics if `initial_period` is zero.
    #[must_use]
    pub fn new(initial_period: Duration) -> Self {
        assert!(
            initial_period > Duration::ZERO,
            "vsync period must be nonzero"
        );
        Self {
            state: TimelineState::Disabled,
            hardware_available: true,
            samples: VecDeque::new(),
            period: initial_period,
            phase: Duration::ZERO,
            pending_period: None,
            connections: Vec::new(),
        }
    }

    /// Current timeline state.
    #[must_use]
    pub fn state(&self) -> TimelineState {
        self.state
    }

    /// Current modelled period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether a requested period change has not yet been observed.
    #[must_use]
    pub fn period_change_in_flight(&self) -> bool {
        self.pending_period.is_some()
    }

    /// Registers a named consumer, returning its receiving end.
    pub fn create_connection(&mut self, name: &str, phase_offset: Duration) -> VsyncConnection {
        let (sender, receiver) = unbounded();
        self.connections.push(ConnectionSlot {
            name: name.to_owned(),
            phase_offset,
            sender,
        });
        VsyncConnection {
            name: name.to_owned(),
            receiver,
        }
    }

    /// Adjusts the phase offset of an existing connection.
    pub fn set_phase_offset(&mut self, name: &str, phase_offset: Duration) {
        for conn in &mut self.connections {
            if conn.name == name {
                conn.phase_offset = phase_offset;
            }
        }
    }

    /// Begins (or restarts) resynchronization against hardware vsync.
    ///
    /// A `known_period` seeds the model, e.g. after a confirmed refresh-rate
    /// switch. No-op while the timeline is permanently unavailable.
    pub fn resync(&mut self, known_period: Option<Duration>) {
        if !self.hardware_available {
            debug!("resync ignored: timeline unavailable");
            return;
        }
        if let Some(period) = known_period {
            self.period = period;
        }
        self.samples.clear();
        self.state = TimelineState::Resync;
    }

    /// Stops event flow. `permanently` additionally marks the timeline
    /// unavailable (display powering off) until [`enable`](Self::enable).
    pub fn disable(&mut self, permanently: bool) {
        self.state = TimelineState::Disabled;
        self.samples.clear();
        if permanently {
            self.hardware_available = false;
        }
    }

    /// Makes the timeline available again and starts a resync.
    pub fn enable(&mut self) {
        self.hardware_available = true;
        self.resync(None);
    }

    /// Requests a period change; completion is detected from subsequent
    /// hardware samples.
    pub fn set_period(&mut self, period: Duration) {
        if period == self.period {
            return;
        }
        self.pending_period = Some(period);
    }

    /// Feeds one hardware vsync sample into the model and dispatches to
    /// connections.
    ///
    /// `reported_period` is the period the hardware claims to be running at,
    /// when it reports one alongside the timestamp.
    pub fn on_hardware_vsync(
        &mut self,
        timestamp: HostTime,
        reported_period: Option<Duration>,
    ) -> SampleOutcome {
        if self.state == TimelineState::Disabled {
            debug!(?timestamp, "vsync sample while disabled; dropped");
            return SampleOutcome::default();
        }

        let mut outcome = SampleOutcome {
            needs_more_samples: true,
            period_change_completed: false,
        };

        if let Some(pending) = self.pending_period {
            let observed = reported_period.or_else(|| {
                self.samples
                    .back()
                    .map(|&prev| timestamp.saturating_duration_since(HostTime(prev)))
            });
            if observed.is_some_and(|p| period_matches(p, pending)) {
                self.period = pending;
                self.pending_period = None;
                self.samples.clear();
                outcome.period_change_completed = true;
            }
        }

        self.samples.push_back(timestamp.nanos());
        if self.samples.len() > MAX_RESYNC_SAMPLES {
            self.samples.pop_front();
        }

        if self.samples.len() >= MIN_RESYNC_SAMPLES {
            self.update_model();
            if self.state == TimelineState::Resync && self.model_error() <= self.error_threshold() {
                self.state = TimelineState::Enabled;
            }
            outcome.needs_more_samples = self.state != TimelineState::Enabled;
        }

        self.dispatch(timestamp);
        outcome
    }

    /// Dispatches a software vsync using the current model, bypassing the
    /// sample path. Used by vsync injection and tests.
    pub fn inject_vsync(&mut self, timestamp: HostTime) {
        if self.state == TimelineState::Disabled {
            return;
        }
        self.dispatch(timestamp);
    }

    /// The first modelled vsync strictly after `now`.
    #[must_use]
    pub fn next_vsync_after(&self, now: HostTime) -> HostTime {
        let period = self.period.nanos();
        let phase = self.phase.nanos() % period;
        let since_phase = now.nanos().saturating_sub(phase);
        let periods = since_phase / period + 1;
        HostTime(phase + periods * period)
    }

    fn dispatch(&mut self, timestamp: HostTime) {
        let period = self.period;
        self.phase = Duration(timestamp.nanos() % period.nanos());
        self.connections.retain(|conn| {
            let wakeup = timestamp + conn.phase_offset;
            let event = VsyncEvent {
                timestamp: wakeup,
                expected_present: timestamp + period,
                period,
            };
            let alive = conn.sender.send(event).is_ok();
            if !alive {
                warn!(name = %conn.name, "vsync connection receiver dropped");
            }
            alive
        });
    }

    fn update_model(&mut self) {
        let mut diffs = Vec::with_capacity(self.samples.len());
        let mut prev = None;
        for &s in &self.samples {
            if let Some(p) = prev {
                diffs.push(s - p);
            }
            prev = Some(s);
        }
        if diffs.is_empty() {
            return;
        }
        // Honor an in-flight period change request only through the
        // completion path; the rolling mean otherwise tracks drift.
        if self.pending_period.is_none() {
            let mean = diffs.iter().sum::<u64>() / diffs.len() as u64;
            if mean > 0 {
                self.period = Duration(mean);
            }
        }
        if let Some(&last) = self.samples.back() {
            self.phase = Duration(last % self.period.nanos());
        }
    }

    fn model_error(&self) -> u64 {
        let period = self.period.nanos();
        if period == 0 || self.samples.len() < 2 {
            return u64::MAX;
        }
        let mut sum = 0_u64;
        let mut count = 0_u64;
        let mut prev: Option<u64> = None;
        for &s in &self.samples {
            if let Some(p) = prev {
                let diff = s - p;
                let err = diff.abs_diff(period);
                sum = sum.saturating_add(err * err);
                count += 1;
            }
            prev = Some(s);
        }
        if count == 0 { u64::MAX } else { sum / count }
    }

    fn error_threshold(&self) -> u64 {
        // Accept jitter up to ~1.5% of the period.
        let tolerance = self.period.nanos() / 64;
        tolerance * tolerance
    }
}

fn period_matches(observed: Duration, expected: Duration) -> bool {
    observed.nanos().abs_diff(expected.nanos()) <= expected.nanos() / 64
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration(16_666_666);

    fn feed_perfect(d: &mut VsyncDistributor, start: u64, count: usize) -> SampleOutcome {
        let mut outcome = SampleOutcome::default();
        for i in 0..count {
            outcome = d.on_hardware_vsync(HostTime(start + i as u64 * PERIOD.nanos()), None);
        }
        outcome
    }

    #[test]
    fn resync_converges_on_stable_samples() {
        let mut d = VsyncDistributor::new(PERIOD);
        d.resync(None);
        assert_eq!(d.state(), TimelineState::Resync);
        let outcome = feed_perfect(&mut d, 1_000_000, MIN_RESYNC_SAMPLES);
        assert_eq!(d.state(), TimelineState::Enabled);
        assert!(!outcome.needs_more_samples);
        assert_eq!(d.period(), PERIOD);
    }

    #[test]
    fn jittery_samples_keep_resyncing() {
        let mut d = VsyncDistributor::new(PERIOD);
        d.resync(None);
        // Alternate between wildly different intervals.
        let mut t = 1_000_000_u64;
        let mut outcome = SampleOutcome::default();
        for i in 0..6 {
            t += if i % 2 == 0 { 10_000_000 } else { 24_000_000 };
            outcome = d.on_hardware_vsync(HostTime(t), None);
        }
        assert_eq!(d.state(), TimelineState::Resync);
        assert!(outcome.needs_more_samples);
    }

    #[test]
    fn samples_while_disabled_are_dropped() {
        let mut d = VsyncDistributor::new(PERIOD);
        let conn = d.create_connection("sf", Duration::ZERO);
        let outcome = d.on_hardware_vsync(HostTime(1_000_000), None);
        assert!(!outcome.needs_more_samples);
        assert!(conn.events().try_recv().is_err(), "no event while disabled");
    }

    #[test]
    fn connections_receive_phase_shifted_events() {
        let mut d = VsyncDistributor::new(PERIOD);
        let app = d.create_connection("app", Duration::from_millis(1));
        let sf = d.create_connection("sf", Duration::from_millis(4));
        d.resync(None);
        d.inject_vsync(HostTime(100_000_000));

        let app_ev = app.events().try_recv().unwrap();
        let sf_ev = sf.events().try_recv().unwrap();
        assert_eq!(
            app_ev.timestamp,
            HostTime(100_000_000) + Duration::from_millis(1)
        );
        assert_eq!(
            sf_ev.timestamp,
            HostTime(100_000_000) + Duration::from_millis(4)
        );
        assert_eq!(app_ev.expected_present, HostTime(100_000_000) + PERIOD);
        assert_eq!(app_ev.period, PERIOD);
    }

    #[test]
    fn period_change_completes_when_observed() {
        let mut d = VsyncDistributor::new(PERIOD);
        d.resync(None);
        feed_perfect(&mut d, 0, MIN_RESYNC_SAMPLES);

        let new_period = Duration(8_333_333);
        d.set_period(new_period);
        assert!(d.period_change_in_flight());

        // Hardware still running the old period: not complete yet.
        let outcome = d.on_hardware_vsync(HostTime(3 * PERIOD.nanos()), Some(PERIOD));
        assert!(!outcome.period_change_completed);

        // Hardware reports the new period.
        let outcome = d.on_hardware_vsync(
            HostTime(3 * PERIOD.nanos() + new_period.nanos()),
            Some(new_period),
        );
        assert!(outcome.period_change_completed);
        assert!(!d.period_change_in_flight());
        assert_eq!(d.period(), new_period);
    }

    #[test]
    fn permanent_disable_blocks_resync_until_enable() {
        let mut d = VsyncDistributor::new(PERIOD);
        d.disable(true);
        d.resync(None);
        assert_eq!(d.state(), TimelineState::Disabled);
        d.enable();
        assert_eq!(d.state(), TimelineState::Resync);
    }

    #[test]
    fn next_vsync_after_follows_phase() {
        let mut d = VsyncDistributor::new(Duration(10));
        d.resync(None);
        // Samples at 3, 13, 23: phase 3, period 10.
        for t in [3_u64, 13, 23] {
            let _ = d.on_hardware_vsync(HostTime(t), None);
        }
        assert_eq!(d.next_vsync_after(HostTime(24)), HostTime(33));
        assert_eq!(
            d.next_vsync_after(HostTime(33)),
            HostTime(43),
            "strictly after"
        );
    }
}
