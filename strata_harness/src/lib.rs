// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test doubles for the Strata frame pipeline.
//!
//! - [`ManualClock`] — a [`Clock`] tests advance by hand.
//! - [`FenceTimeline`] — schedules fence signals at chosen times.
//! - [`FakeComposer`] / [`ComposerController`] — a scripted
//!   [`HwComposer`] that records every call and emits generation-tagged
//!   events on demand.
//! - [`JankTracker`] — rolling miss-rate grading for assertions about
//!   pacing quality.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use strata_core::config::{ConfigId, RefreshRateConfig};
use strata_core::fence::Fence;
use strata_core::hwc::{
    ComposerError, ComposerEvent, ComposerFrame, CompositionResult, DisplayId, Generation,
    HwComposer, PowerMode, TaggedEvent,
};
use strata_core::time::{Clock, Duration, HostTime};

/// A [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// A clock starting at `start`, shared so tests keep a handle after
    /// installing it.
    #[must_use]
    pub fn new(start: HostTime) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start.nanos()),
        })
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.nanos(), Ordering::SeqCst);
    }

    /// Jumps the clock to an absolute time. Panics if it would go
    /// backwards.
    pub fn set(&self, to: HostTime) {
        let prev = self.now.swap(to.nanos(), Ordering::SeqCst);
        assert!(prev <= to.nanos(), "manual clock must not run backwards");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> HostTime {
        HostTime(self.now.load(Ordering::SeqCst))
    }
}

/// Schedules fence signals against a manual clock.
#[derive(Debug, Default)]
pub struct FenceTimeline {
    scheduled: Mutex<Vec<(HostTime, Fence)>>,
}

impl FenceTimeline {
    /// An empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pending fence that will fire at `at` once the timeline
    /// advances there.
    pub fn fence_at(&self, at: HostTime) -> Fence {
        let fence = Fence::pending();
        self.scheduled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((at, fence.clone()));
        fence
    }

    /// Signals every fence due at or before `now`.
    pub fn advance_to(&self, now: HostTime) {
        let mut scheduled = self
            .scheduled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        scheduled.retain(|(at, fence)| {
            if *at <= now {
                fence.signal(*at);
                false
            } else {
                true
            }
        });
    }
}

/// A call the fake composer recorded, in invocation order.
#[derive(Clone, Debug, PartialEq)]
pub enum ComposerOp {
    /// `set_power_mode`.
    SetPowerMode(DisplayId, PowerMode),
    /// `set_vsync_enabled`.
    SetVsyncEnabled(DisplayId, bool),
    /// `set_active_config`.
    SetActiveConfig(DisplayId, ConfigId),
    /// `compose` for the given display.
    Compose(DisplayId),
}

#[derive(Debug)]
struct ComposerInner {
    configs: HashMap<DisplayId, Vec<RefreshRateConfig>>,
    ops: Vec<ComposerOp>,
    frames: Vec<ComposerFrame>,
    present_fences: Vec<Fence>,
    gpu_fallback: bool,
    fail_compose: bool,
    auto_ack_configs: bool,
    events: Sender<TaggedEvent>,
    generation: Generation,
}

/// Scripted [`HwComposer`] implementation handed to the compositor.
#[derive(Debug)]
pub struct FakeComposer {
    inner: Arc<Mutex<ComposerInner>>,
}

/// The test's side of a [`FakeComposer`]: inject events, inspect calls.
#[derive(Debug)]
pub struct ComposerController {
    inner: Arc<Mutex<ComposerInner>>,
}

/// Creates a fake composer with the given per-display config tables.
///
/// Returns the composer (give it to the compositor), the controller (keep
/// it in the test) and the event receiver (give it to the compositor).
#[must_use]
pub fn fake_composer(
    configs: HashMap<DisplayId, Vec<RefreshRateConfig>>,
) -> (FakeComposer, ComposerController, Receiver<TaggedEvent>) {
    let (events, receiver) = unbounded();
    let inner = Arc::new(Mutex::new(ComposerInner {
        configs,
        ops: Vec::new(),
        frames: Vec::new(),
        present_fences: Vec::new(),
        gpu_fallback: false,
        fail_compose: false,
        auto_ack_configs: false,
        events,
        generation: Generation::default(),
    }));
    (
        FakeComposer {
            inner: Arc::clone(&inner),
        },
        ComposerController { inner },
        receiver,
    )
}

impl ComposerInner {
    fn emit(&self, event: ComposerEvent) {
        let _ = self.events.send(TaggedEvent {
            generation: self.generation,
            event,
        });
    }
}

impl HwComposer for FakeComposer {
    fn configs(&self, display: DisplayId) -> Vec<RefreshRateConfig> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .configs
            .get(&display)
            .cloned()
            .unwrap_or_default()
    }

    fn compose(&mut self, frame: &ComposerFrame) -> Result<CompositionResult, ComposerError> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.ops.push(ComposerOp::Compose(frame.display));
        if inner.fail_compose {
            return Err(ComposerError::Failed);
        }
        inner.frames.push(frame.clone());
        let fence = Fence::pending();
        inner.present_fences.push(fence.clone());
        Ok(CompositionResult {
            present_fence: fence,
            gpu_fallback: inner.gpu_fallback,
        })
    }

    fn set_power_mode(&mut self, display: DisplayId, mode: PowerMode) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .ops
            .push(ComposerOp::SetPowerMode(display, mode));
    }

    fn set_active_config(&mut self, display: DisplayId, config: ConfigId) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.ops.push(ComposerOp::SetActiveConfig(display, config));
        if inner.auto_ack_configs {
            inner.emit(ComposerEvent::ConfigConfirmed { display, config });
        }
    }

    fn set_vsync_enabled(&mut self, display: DisplayId, enabled: bool) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .ops
            .push(ComposerOp::SetVsyncEnabled(display, enabled));
    }
}

impl ComposerController {
    fn inner(&self) -> std::sync::MutexGuard<'_, ComposerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Emits a hardware vsync event.
    pub fn send_vsync(&self, display: DisplayId, timestamp: HostTime, period: Option<Duration>) {
        self.inner().emit(ComposerEvent::Vsync {
            display,
            timestamp,
            period,
        });
    }

    /// Emits a hotplug event.
    pub fn send_hotplug(&self, display: DisplayId, connected: bool) {
        self.inner()
            .emit(ComposerEvent::Hotplug { display, connected });
    }

    /// Emits a hardware refresh request.
    pub fn send_refresh_request(&self, display: DisplayId) {
        self.inner()
            .emit(ComposerEvent::RefreshRequested { display });
    }

    /// Acknowledges a config switch.
    pub fn confirm_config(&self, display: DisplayId, config: ConfigId) {
        self.inner()
            .emit(ComposerEvent::ConfigConfirmed { display, config });
    }

    /// Tags subsequently emitted events with `generation`.
    pub fn set_generation(&self, generation: Generation) {
        self.inner().generation = generation;
    }

    /// Auto-acknowledge `set_active_config` calls with a confirmation
    /// event.
    pub fn set_auto_ack_configs(&self, on: bool) {
        self.inner().auto_ack_configs = on;
    }

    /// Makes subsequent composes report GPU fallback.
    pub fn set_gpu_fallback(&self, on: bool) {
        self.inner().gpu_fallback = on;
    }

    /// Makes subsequent composes fail.
    pub fn set_fail_compose(&self, on: bool) {
        self.inner().fail_compose = on;
    }

    /// All recorded calls, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<ComposerOp> {
        self.inner().ops.clone()
    }

    /// All composed frames, in order.
    #[must_use]
    pub fn frames(&self) -> Vec<ComposerFrame> {
        self.inner().frames.clone()
    }

    /// Number of compose calls so far.
    #[must_use]
    pub fn compose_count(&self) -> usize {
        self.inner()
            .ops
            .iter()
            .filter(|op| matches!(op, ComposerOp::Compose(_)))
            .count()
    }

    /// Present fences returned from compose, in order.
    #[must_use]
    pub fn present_fences(&self) -> Vec<Fence> {
        self.inner().present_fences.clone()
    }

    /// Signals the present fence of the `index`-th composed frame.
    pub fn signal_present(&self, index: usize, at: HostTime) {
        let inner = self.inner();
        inner.present_fences[index].signal(at);
    }
}

/// Pacing grade over a rolling window of frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JankGrade {
    /// Under 2% of frames missed.
    Smooth,
    /// Under 10% missed.
    Acceptable,
    /// 10% or more missed.
    Janky,
}

/// Rolling frame-miss tracker for test assertions.
#[derive(Debug)]
pub struct JankTracker {
    window: VecDeque<bool>,
    capacity: usize,
}

impl JankTracker {
    /// A tracker remembering the last `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be nonzero");
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records one frame.
    pub fn record(&mut self, missed: bool) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(missed);
    }

    /// Fraction of recorded frames that missed, 0.0 when empty.
    #[must_use]
    pub fn miss_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let missed = self.window.iter().filter(|m| **m).count();
        missed as f64 / self.window.len() as f64
    }

    /// Grades the current window.
    #[must_use]
    pub fn grade(&self) -> JankGrade {
        let rate = self.miss_rate();
        if rate < 0.02 {
            JankGrade::Smooth
        } else if rate < 0.10 {
            JankGrade::Acceptable
        } else {
            JankGrade::Janky
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_demand() {
        let clock = ManualClock::new(HostTime(100));
        assert_eq!(clock.now(), HostTime(100));
        clock.advance(Duration(50));
        assert_eq!(clock.now(), HostTime(150));
    }

    #[test]
    fn fence_timeline_signals_due_fences() {
        let timeline = FenceTimeline::new();
        let early = timeline.fence_at(HostTime(10));
        let late = timeline.fence_at(HostTime(100));
        timeline.advance_to(HostTime(50));
        assert_eq!(early.signal_time(), Some(HostTime(10)));
        assert!(!late.is_signaled());
    }

    #[test]
    fn fake_composer_records_ops_in_order() {
        let (mut composer, controller, _events) = fake_composer(HashMap::new());
        composer.set_vsync_enabled(DisplayId(1), true);
        composer.set_power_mode(DisplayId(1), PowerMode::Normal);
        assert_eq!(
            controller.ops(),
            vec![
                ComposerOp::SetVsyncEnabled(DisplayId(1), true),
                ComposerOp::SetPowerMode(DisplayId(1), PowerMode::Normal),
            ]
        );
    }

    #[test]
    fn auto_ack_emits_confirmation() {
        let (mut composer, controller, events) = fake_composer(HashMap::new());
        controller.set_auto_ack_configs(true);
        composer.set_active_config(DisplayId(1), ConfigId(2));
        let tagged = events.try_recv().unwrap();
        assert_eq!(
            tagged.event,
            ComposerEvent::ConfigConfirmed {
                display: DisplayId(1),
                config: ConfigId(2)
            }
        );
    }

    #[test]
    fn jank_grading_thresholds() {
        let mut tracker = JankTracker::new(100);
        for _ in 0..99 {
            tracker.record(false);
        }
        tracker.record(true);
        assert_eq!(tracker.grade(), JankGrade::Smooth);

        let mut tracker = JankTracker::new(100);
        for i in 0..100 {
            tracker.record(i % 20 == 0);
        }
        assert_eq!(tracker.grade(), JankGrade::Acceptable);

        let mut tracker = JankTracker::new(10);
        for i in 0..10 {
            tracker.record(i % 2 == 0);
        }
        assert_eq!(tracker.grade(), JankGrade::Janky);
    }
}
