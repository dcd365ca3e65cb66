// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The compositor context and the composition/present cycle.
//!
//! [`Compositor`] is an explicit context struct owning every piece of
//! composition state; there are no globals. One main thread drives it:
//!
//! ```text
//! invalidate -> flush/apply transactions -> commit -> latch -> refresh
//!            -> compose each display -> present feedback
//! ```
//!
//! Producers interact through a [`CompositorHandle`]: layer and
//! virtual-display management and transaction submission mutate the shared
//! [`CurrentState`] under its lock, while operations that must drive the
//! hardware composer (power, config switches, capture, debug) travel to the
//! main thread as [`Command`]s with bounded reply waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, info, warn};

use crate::config::{ConfigId, PhaseOffsets, RefreshRateConfig, RefreshRateConfigs};
use crate::display::{DisplayManager, Projection};
use crate::error::{Result, Status};
use crate::fence::Fence;
use crate::hwc::{
    ComposerEvent, ComposerFrame, ComposerLayer, DisplayId, HwComposer, PowerMode, TaggedEvent,
};
use crate::layer::{LayerId, LayerMap};
use crate::message::{EventLoop, LoopHandle, Signal};
use crate::scheduler::{FrameMissedStats, Scheduler};
use crate::time::{Duration, HostTime, SharedClock, snap_to_period};
use crate::trace::Tracer;
use crate::transaction::{CommitFeedback, Transaction, TransactionQueue};
use crate::vsync::{TimelineState, VsyncConnection};

/// Tunables of the frame pipeline.
#[derive(Clone, Copy, Debug)]
pub struct CompositorConfig {
    /// Vsync period assumed before the first display connects.
    pub initial_period: Duration,
    /// Wakeup offsets for the standard vsync connections.
    pub phase_offsets: PhaseOffsets,
    /// How far in the future a desired present time may defer a
    /// transaction before it stops deferring (producer-bug escape valve).
    pub escape_valve: Duration,
    /// Bound on every blocking client wait.
    pub sync_timeout: Duration,
    /// Slack granted to a present fence before the frame counts as missed.
    pub present_grace: Duration,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            initial_period: Duration(16_666_666),
            phase_offsets: PhaseOffsets::default(),
            escape_valve: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(5),
            present_grace: Duration::from_millis(1),
        }
    }
}

/// Scheduler facts mirrored into the shared state for dumps and clients.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerSnapshot {
    /// Modelled vsync period.
    pub period: Duration,
    /// Vsync timeline state, as a static label.
    pub timeline: &'static str,
    /// The vsync the current cycle aims at.
    pub expected_present: HostTime,
    /// Frame-miss counters.
    pub missed: FrameMissedStats,
    /// Cycle counter.
    pub cycle: u64,
}

/// Everything producers may touch, guarded by the single state lock.
#[derive(Debug)]
pub struct CurrentState {
    /// All layers (current and drawing property sets).
    pub layers: LayerMap,
    /// Per-token transaction queues.
    pub queue: TransactionQueue,
    /// Ready transactions awaiting the main thread.
    pub pending_apply: Vec<Transaction>,
    /// The connected display set.
    pub displays: DisplayManager,
    /// Global color transform staged by clients (current side), row-major
    /// 4x4; `None` means identity.
    pub color_matrix: Option<[f32; 16]>,
    /// Global color transform as of the last commit (drawing side).
    pub color_matrix_drawing: Option<[f32; 16]>,
    /// Expected present time of the upcoming cycle.
    pub expected_present: HostTime,
    /// Commits performed so far.
    pub committed_count: u64,
    /// Animation transactions submitted but not yet applied.
    pub animation_pending: u64,
    /// Mirrored scheduler facts.
    pub sched: SchedulerSnapshot,
}

/// Shared state plus the condvars for bounded client waits.
#[derive(Debug)]
pub struct SharedState {
    /// The state lock.
    pub state: Mutex<CurrentState>,
    /// Signaled after every commit.
    pub tx_done: Condvar,
    /// Signaled when an animation transaction is applied.
    pub animation_done: Condvar,
}

impl SharedState {
    /// Locks the state, riding through poisoning.
    pub fn lock(&self) -> MutexGuard<'_, CurrentState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A capture of one display's drawing state.
#[derive(Clone, Debug)]
pub struct Screenshot {
    /// The captured display.
    pub display: DisplayId,
    /// Visible layers in stacking order, as the composer would see them.
    pub layers: Vec<ComposerLayer>,
}

/// Debug backdoor operations; a closed set, dispatched by match.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DebugCommand {
    /// Composite the next frame even if nothing changed.
    ForceRepaint,
    /// Treat all composition as GPU fallback (or stop doing so).
    DisableHwComposition(bool),
    /// Re-target the vsync connections.
    SetPhaseOffsets(PhaseOffsets),
}

/// Main-thread operations requested by clients.
#[derive(Debug)]
pub enum Command {
    /// Change a display's power mode.
    SetPowerMode {
        /// Target display.
        display: DisplayId,
        /// Requested mode.
        mode: PowerMode,
        /// Outcome channel.
        reply: Sender<Result<()>>,
    },
    /// Request a refresh-rate switch.
    SetDesiredConfig {
        /// Target display.
        display: DisplayId,
        /// Requested config.
        config: ConfigId,
        /// Outcome channel.
        reply: Sender<Result<()>>,
    },
    /// Capture a display's drawing state.
    Capture {
        /// Target display.
        display: DisplayId,
        /// Outcome channel.
        reply: Sender<Result<Screenshot>>,
    },
    /// Run a debug backdoor operation.
    Debug {
        /// The operation.
        command: DebugCommand,
        /// Outcome channel.
        reply: Sender<Result<()>>,
    },
    /// Register a new vsync consumer connection.
    CreateVsyncConnection {
        /// Connection name for diagnostics.
        name: String,
        /// Wakeup offset from hardware vsync.
        phase_offset: Duration,
        /// Receives the connection.
        reply: Sender<VsyncConnection>,
    },
    /// Subscribe to hotplug notifications `(display, connected)`.
    RegisterHotplugListener {
        /// Receives the subscription channel.
        reply: Sender<Receiver<(DisplayId, bool)>>,
    },
}

struct PendingPresent {
    cycle: u64,
    fence: Fence,
    expected_present: HostTime,
    composite_time: HostTime,
    gpu_fallback: bool,
}

/// Unresolved present fences kept before the oldest are written off as
/// missed. A fence that never signals must not grow the backlog forever.
const PRESENT_BACKLOG: usize = 8;

/// The compositor context. One per process, owned by the main thread.
pub struct Compositor {
    config: CompositorConfig,
    clock: SharedClock,
    hwc: Box<dyn HwComposer>,
    composer_events: Receiver<TaggedEvent>,
    event_loop: EventLoop,
    loop_handle: LoopHandle,
    commands: Receiver<Command>,
    command_sender: Sender<Command>,
    shared: Arc<SharedState>,
    scheduler: Scheduler,
    app_connection: Option<VsyncConnection>,
    sf_connection: VsyncConnection,
    tracer: Tracer,
    cycle: u64,
    forced_repaint: bool,
    retry_pending: bool,
    hwc_disabled: bool,
    pending_presents: Vec<PendingPresent>,
    hotplug_listeners: Vec<Sender<(DisplayId, bool)>>,
}

impl core::fmt::Debug for Compositor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Compositor")
            .field("cycle", &self.cycle)
            .field("forced_repaint", &self.forced_repaint)
            .field("retry_pending", &self.retry_pending)
            .field("pending_presents", &self.pending_presents.len())
            .finish_non_exhaustive()
    }
}

impl Compositor {
    /// Creates the compositor on the calling (main) thread.
    ///
    /// `composer_events` delivers generation-tagged callbacks from the
    /// composer service.
    #[must_use]
    pub fn new(
        hwc: Box<dyn HwComposer>,
        composer_events: Receiver<TaggedEvent>,
        clock: SharedClock,
        config: CompositorConfig,
    ) -> Self {
        let event_loop = EventLoop::new(config.sync_timeout);
        let loop_handle = event_loop.handle();
        let (scheduler, app_connection, sf_connection) =
            Scheduler::new(config.initial_period, config.phase_offsets);
        let (command_sender, commands) = unbounded();
        let shared = Arc::new(SharedState {
            state: Mutex::new(CurrentState {
                layers: LayerMap::new(),
                queue: TransactionQueue::new(config.escape_valve),
                pending_apply: Vec::new(),
                displays: DisplayManager::new(),
                color_matrix: None,
                color_matrix_drawing: None,
                expected_present: HostTime(0),
                committed_count: 0,
                animation_pending: 0,
                sched: SchedulerSnapshot::default(),
            }),
            tx_done: Condvar::new(),
            animation_done: Condvar::new(),
        });
        Self {
            config,
            clock,
            hwc,
            composer_events,
            event_loop,
            loop_handle,
            commands,
            command_sender,
            shared,
            scheduler,
            app_connection: Some(app_connection),
            sf_connection,
            tracer: Tracer::disabled(),
            cycle: 0,
            forced_repaint: false,
            retry_pending: false,
            hwc_disabled: false,
            pending_presents: Vec::new(),
            hotplug_listeners: Vec::new(),
        }
    }

    /// The producer-facing handle.
    #[must_use]
    pub fn handle(&self) -> CompositorHandle {
        CompositorHandle {
            shared: Arc::clone(&self.shared),
            loop_handle: self.loop_handle.clone(),
            commands: self.command_sender.clone(),
            sync_timeout: self.config.sync_timeout,
        }
    }

    /// The application-side vsync connection; available once.
    pub fn take_app_connection(&mut self) -> Option<VsyncConnection> {
        self.app_connection.take()
    }

    /// Installs a trace sink.
    pub fn set_tracer(&mut self, tracer: Tracer) {
        self.tracer = tracer;
    }

    /// Shared state, for diagnostics.
    #[must_use]
    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Runs one main-thread iteration without blocking: drains client
    /// commands and composer events, then services pending signals.
    ///
    /// Tests drive the pipeline deterministically by interleaving `tick`
    /// with injected vsyncs; production wraps it in [`run`](Self::run).
    pub fn tick(&mut self) {
        self.drain_commands();
        self.drain_composer_events();
        let first = self.event_loop.dispatch_pending();
        if first.invalidate {
            self.on_invalidate();
        }
        let second = self.event_loop.dispatch_pending();
        if second.invalidate {
            self.on_invalidate();
        }
        if first.refresh || second.refresh {
            self.on_refresh();
        }
    }

    /// Runs the main loop until shutdown is requested via the loop handle.
    pub fn run(&mut self) {
        loop {
            let woken = self.event_loop.wait_and_dispatch();
            if woken.shutdown {
                info!("compositor shutting down");
                break;
            }
            self.drain_commands();
            self.drain_composer_events();
            if woken.invalidate {
                self.on_invalidate();
            }
            let extra = self.event_loop.dispatch_pending();
            if extra.invalidate {
                self.on_invalidate();
            }
            if woken.refresh || extra.refresh {
                self.on_refresh();
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetPowerMode {
                display,
                mode,
                reply,
            } => {
                let _ = reply.send(self.set_power_mode(display, mode));
            }
            Command::SetDesiredConfig {
                display,
                config,
                reply,
            } => {
                let _ = reply.send(self.set_desired_config(display, config));
            }
            Command::Capture { display, reply } => {
                let _ = reply.send(self.capture(display));
            }
            Command::Debug { command, reply } => {
                let _ = reply.send(self.run_debug(command));
            }
            Command::CreateVsyncConnection {
                name,
                phase_offset,
                reply,
            } => {
                let conn = self
                    .scheduler
                    .distributor()
                    .create_connection(&name, phase_offset);
                let _ = reply.send(conn);
            }
            Command::RegisterHotplugListener { reply } => {
                let (sender, receiver) = unbounded();
                self.hotplug_listeners.push(sender);
                let _ = reply.send(receiver);
            }
        }
    }

    fn drain_composer_events(&mut self) {
        while let Ok(tagged) = self.composer_events.try_recv() {
            if !self.scheduler.accepts(&tagged) {
                continue;
            }
            match tagged.event {
                ComposerEvent::Vsync {
                    display,
                    timestamp,
                    period,
                } => {
                    self.on_hardware_vsync(display, timestamp, period);
                }
                ComposerEvent::Hotplug { display, connected } => {
                    self.on_hotplug(display, connected);
                }
                ComposerEvent::RefreshRequested { display: id } => {
                    debug!(display = ?id, "hardware requested a recomposite");
                    self.forced_repaint = true;
                    self.loop_handle.signal(Signal::Invalidate);
                }
                ComposerEvent::ConfigConfirmed { display, config } => {
                    self.on_config_confirmed(display, config);
                }
            }
        }
        // Keep the compositor's own connection drained; its arrival doubles
        // as the pacing edge for deferred work.
        let mut saw_sf_vsync = false;
        while self.sf_connection.events().try_recv().is_ok() {
            saw_sf_vsync = true;
        }
        if saw_sf_vsync && self.retry_pending {
            self.retry_pending = false;
            self.loop_handle.signal(Signal::Invalidate);
        }
    }

    fn on_hardware_vsync(
        &mut self,
        display: DisplayId,
        timestamp: HostTime,
        period: Option<Duration>,
    ) {
        let primary = self.shared.lock().displays.primary();
        if primary.is_some() && primary != Some(display) {
            return;
        }
        let outcome = self.scheduler.on_hardware_vsync(timestamp, period);
        let expected = self.scheduler.expected_present_time(timestamp);
        self.tracer.vsync(timestamp, expected);
        if outcome.period_change_completed {
            debug!(period = ?self.scheduler.distributor().period(), "vsync period change took effect");
        }
        self.check_present_feedback();
    }

    fn on_hotplug(&mut self, id: DisplayId, connected: bool) {
        if connected {
            let configs = self.hwc.configs(id);
            if configs.is_empty() {
                warn!(display = ?id, "hotplug connect with no configs; ignored");
                return;
            }
            let active = configs[0].id;
            let tracker = RefreshRateConfigs::new(configs, active);
            let period = tracker.current().vsync_period;
            let became_primary = self.shared.lock().displays.connect(id, tracker);
            if became_primary {
                // The first physical display seeds the vsync timeline.
                self.scheduler.distributor().resync(Some(period));
                self.hwc.set_vsync_enabled(id, true);
            }
        } else {
            let mut st = self.shared.lock();
            if st.displays.disconnect(id).is_err() {
                warn!(display = ?id, "disconnect for unknown display");
                return;
            }
        }
        self.hotplug_listeners
            .retain(|l| l.send((id, connected)).is_ok());
        self.loop_handle.signal(Signal::Invalidate);
    }

    fn on_config_confirmed(&mut self, id: DisplayId, config: ConfigId) {
        let mut st = self.shared.lock();
        let Some(device) = st.displays.get_mut(id) else {
            warn!(display = ?id, "config confirmation for unknown display");
            return;
        };
        let Some(tracker) = device.configs.as_mut() else {
            return;
        };
        if !tracker.confirm(config) {
            return;
        }
        let period = tracker.current().vsync_period;
        let next = tracker.begin_switch();
        let is_primary = st.displays.primary() == Some(id);
        drop(st);

        if is_primary {
            self.scheduler.distributor().set_period(period);
        }
        if let Some(next) = next {
            self.hwc.set_active_config(id, next);
        }
        info!(display = ?id, ?config, "refresh-rate switch confirmed");
        self.loop_handle.signal(Signal::Invalidate);
    }

    /// Changes a display's power mode. Main-thread entry point; clients go
    /// through [`CompositorHandle::set_power_mode`].
    pub fn set_power_mode(&mut self, id: DisplayId, mode: PowerMode) -> Result<()> {
        let (is_virtual, old, is_primary) = {
            let st = self.shared.lock();
            let device = st.displays.get(id).ok_or(Status::NoSuchDisplay)?;
            (
                device.is_virtual,
                device.power_mode,
                st.displays.primary() == Some(id),
            )
        };
        if is_virtual {
            return Err(Status::BadValue);
        }
        if old == mode {
            return Ok(());
        }
        info!(display = ?id, ?old, ?mode, "power transition");

        match mode {
            PowerMode::Normal | PowerMode::Doze => {
                // Power up, then vsync, then exactly one full repaint.
                self.hwc.set_power_mode(id, mode);
                if is_primary {
                    self.hwc.set_vsync_enabled(id, true);
                    self.scheduler.distributor().enable();
                }
                self.shared
                    .lock()
                    .displays
                    .get_mut(id)
                    .expect("checked above")
                    .power_mode = mode;
                self.forced_repaint = true;
                self.loop_handle.signal(Signal::Invalidate);
            }
            PowerMode::Off | PowerMode::DozeSuspend => {
                // Vsync off before the panel, so no cycle ever targets a
                // powered-down display.
                if is_primary {
                    self.hwc.set_vsync_enabled(id, false);
                    self.scheduler.distributor().disable(mode == PowerMode::Off);
                }
                self.hwc.set_power_mode(id, mode);
                self.shared
                    .lock()
                    .displays
                    .get_mut(id)
                    .expect("checked above")
                    .power_mode = mode;
            }
        }
        Ok(())
    }

    /// Requests a refresh-rate switch. Main-thread entry point.
    pub fn set_desired_config(&mut self, display: DisplayId, config: ConfigId) -> Result<()> {
        let request = {
            let mut st = self.shared.lock();
            let device = st.displays.get_mut(display).ok_or(Status::NoSuchDisplay)?;
            let tracker = device.configs.as_mut().ok_or(Status::BadValue)?;
            tracker.set_desired(config)?;
            tracker.begin_switch()
        };
        if let Some(id) = request {
            self.hwc.set_active_config(display, id);
        }
        Ok(())
    }

    /// Captures a display's drawing state. Main-thread entry point.
    pub fn capture(&mut self, display: DisplayId) -> Result<Screenshot> {
        let st = self.shared.lock();
        if st.displays.get(display).is_none() {
            return Err(Status::NoSuchDisplay);
        }
        let layers = build_display_layers(&st, display);
        Ok(Screenshot { display, layers })
    }

    /// Dispatches a debug backdoor command. Main-thread entry point.
    pub fn run_debug(&mut self, command: DebugCommand) -> Result<()> {
        match command {
            DebugCommand::ForceRepaint => {
                self.forced_repaint = true;
                self.loop_handle.signal(Signal::Invalidate);
            }
            DebugCommand::DisableHwComposition(disabled) => {
                self.hwc_disabled = disabled;
            }
            DebugCommand::SetPhaseOffsets(offsets) => {
                self.scheduler.set_phase_offsets(offsets);
            }
        }
        Ok(())
    }

    /// The invalidate half of the cycle: flush, apply, commit, latch.
    fn on_invalidate(&mut self) {
        let now = self.clock.now();
        self.check_present_feedback();
        let expected = self.scheduler.expected_present_time(now);
        self.cycle += 1;

        let (applied, callbacks, latched, retry, any_new, early) = {
            let mut st = self.shared.lock();
            st.expected_present = expected;

            let mut ready: Vec<Transaction> = st.pending_apply.drain(..).collect();
            ready.extend(st.queue.flush(expected));
            let applied = ready.len();
            // Transactions still gated (fence or future present time) must
            // be retried on a later vsync; nothing else re-polls them.
            let deferred = st.queue.pending_count() > 0;

            let mut callbacks = Vec::new();
            let mut early = false;
            for mut tx in ready {
                if tx.animation {
                    st.animation_pending = st.animation_pending.saturating_sub(1);
                }
                early |= tx.early_wakeup;
                for (layer_id, change) in tx.changes.drain(..) {
                    match st.layers.get_mut(layer_id) {
                        Some(layer) => {
                            change.props.apply_to(&mut layer.current);
                            if let Some(frame) = change.frame {
                                layer.frames.queue(frame);
                            }
                        }
                        None => debug!(?layer_id, "transaction change for dead layer dropped"),
                    }
                }
                if let Some(cb) = tx.completion.take() {
                    callbacks.push(cb);
                }
            }

            st.layers.commit_all();
            st.layers.commit_offscreen();
            st.color_matrix_drawing = st.color_matrix;
            st.committed_count += 1;

            let outcome = st.layers.latch_all(self.cycle, expected);
            let latched: Vec<(u64, u64)> = outcome
                .latched
                .iter()
                .filter_map(|(id, n)| st.layers.get(*id).map(|l| (l.sequence, *n)))
                .collect();
            let any_new = outcome.latched_any();

            st.sched = SchedulerSnapshot {
                period: self.scheduler.distributor().period(),
                timeline: timeline_label(self.scheduler.distributor().state()),
                expected_present: expected,
                missed: self.scheduler.missed_stats(),
                cycle: self.cycle,
            };
            (
                applied,
                callbacks,
                latched,
                outcome.retry_needed || deferred,
                any_new,
                early,
            )
        };

        // Callbacks set the flags synchronous submitters wait on; they must
        // run before the condvars fire or a waiter can miss its wakeup.
        let feedback = CommitFeedback {
            latch_time: now,
            expected_present: expected,
        };
        for cb in callbacks {
            cb(feedback);
        }
        self.shared.tx_done.notify_all();
        self.shared.animation_done.notify_all();

        if applied > 0 {
            self.tracer.transactions_applied(applied);
        }
        self.tracer.committed(self.cycle);
        for (sequence, frame_number) in latched {
            self.tracer.latched(sequence, frame_number);
        }

        if any_new || early || self.forced_repaint {
            self.loop_handle.signal(Signal::Refresh);
        }
        if retry {
            // Work is still waiting (a deferred transaction, or queued
            // frames that could not latch); re-run the cycle at the next
            // vsync rather than compositing nothing now.
            self.retry_pending = true;
        }
    }

    /// The refresh half of the cycle: compose every display that wants a
    /// frame.
    fn on_refresh(&mut self) {
        let now = self.clock.now();
        let expected = self.scheduler.expected_present_time(now);

        let frames: Vec<ComposerFrame> = {
            let st = self.shared.lock();
            let color_matrix = st.color_matrix_drawing;
            st.displays
                .iter()
                .filter(|d| d.wants_frames())
                .map(|d| ComposerFrame {
                    display: d.id,
                    layers: build_display_layers(&st, d.id),
                    color_matrix,
                    expected_present: expected,
                })
                .collect()
        };

        let mut any_fallback = false;
        for frame in &frames {
            self.tracer.composite_begin(self.cycle, frame.display);
            match self.hwc.compose(frame) {
                Ok(result) => {
                    let gpu_fallback = result.gpu_fallback || self.hwc_disabled;
                    any_fallback |= gpu_fallback;
                    self.pending_presents.push(PendingPresent {
                        cycle: self.cycle,
                        fence: result.present_fence,
                        expected_present: expected,
                        composite_time: now,
                        gpu_fallback,
                    });
                }
                Err(err) => {
                    warn!(display = ?frame.display, %err, "composition failed; frame skipped");
                }
            }
        }
        if !frames.is_empty() {
            self.tracer.composite_end(self.cycle, any_fallback);
        }
        self.forced_repaint = false;
    }

    /// Resolves present fences of earlier frames: latency reporting, missed
    /// counters, and backpressure.
    fn check_present_feedback(&mut self) {
        let grace = self.config.present_grace;
        let period = self.scheduler.distributor().period();
        let ideal = self.scheduler.ideal_present_latency();

        let mut resolved = Vec::new();
        self.pending_presents.retain(|p| {
            if let Some(actual) = p.fence.signal_time() {
                resolved.push((
                    p.cycle,
                    actual,
                    p.expected_present,
                    p.composite_time,
                    p.gpu_fallback,
                ));
                false
            } else {
                true
            }
        });

        for (cycle, actual, expected, composite_time, gpu_fallback) in resolved {
            let missed = actual > expected.saturating_add(grace);
            if missed {
                self.scheduler.record_missed(gpu_fallback);
                self.tracer.frame_missed(cycle, !gpu_fallback);
                if !gpu_fallback {
                    // Hardware-only misses mean the pipeline itself is
                    // late; start the next cycle immediately instead of
                    // waiting out another vsync.
                    self.loop_handle.signal(Signal::Invalidate);
                }
            }
            let raw = actual.saturating_duration_since(composite_time);
            let latency = snap_to_period(raw, ideal, period);
            self.tracer.present_feedback(cycle, latency);
        }

        if self.pending_presents.len() > PRESENT_BACKLOG {
            let excess = self.pending_presents.len() - PRESENT_BACKLOG;
            for stale in self.pending_presents.drain(..excess) {
                warn!(
                    cycle = stale.cycle,
                    "present fence never signaled; frame written off as missed"
                );
                self.scheduler.record_missed(stale.gpu_fallback);
                self.tracer.frame_missed(stale.cycle, !stale.gpu_fallback);
            }
        }
    }
}

fn timeline_label(state: TimelineState) -> &'static str {
    match state {
        TimelineState::Disabled => "disabled",
        TimelineState::Resync => "resync",
        TimelineState::Enabled => "enabled",
    }
}

/// Builds the composer's view of one display from the drawing snapshot.
fn build_display_layers(st: &CurrentState, display: DisplayId) -> Vec<ComposerLayer> {
    let Some(device) = st.displays.get(display) else {
        return Vec::new();
    };
    let projection = device.projection.transform();
    let mut layers: Vec<ComposerLayer> = st
        .layers
        .arena()
        .iter()
        .filter(|(_, l)| {
            !l.offscreen && l.drawing.visible() && l.drawing.layer_stack == device.layer_stack
        })
        .filter_map(|(_, l)| {
            // Mirrors show their source's content.
            let content = match l.clone_of {
                Some(source) => st.layers.get(source)?.frames.active(),
                None => l.frames.active(),
            };
            let buffer = content.map(|f| f.buffer);
            if buffer.is_none() && l.drawing.color.is_none() {
                return None;
            }
            Some(ComposerLayer {
                sequence: l.sequence,
                buffer,
                color: l.drawing.color,
                transform: projection * l.drawing.transform,
                crop: l.drawing.crop,
                alpha: l.drawing.alpha,
                z: l.drawing.z,
            })
        })
        .collect();
    layers.sort_by_key(|l| l.z);
    layers
}

/// Producer-side handle to the compositor.
#[derive(Clone, Debug)]
pub struct CompositorHandle {
    shared: Arc<SharedState>,
    loop_handle: LoopHandle,
    commands: Sender<Command>,
    sync_timeout: Duration,
}

impl CompositorHandle {
    /// The shared state, for diagnostics.
    #[must_use]
    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// The event-loop handle.
    #[must_use]
    pub fn loop_handle(&self) -> LoopHandle {
        self.loop_handle.clone()
    }

    /// Creates a layer.
    pub fn create_layer(&self, name: &str, parent: Option<LayerId>) -> Result<LayerId> {
        let mut st = self.shared.lock();
        let id = st.layers.create(name, parent)?;
        drop(st);
        self.loop_handle.signal(Signal::Invalidate);
        Ok(id)
    }

    /// Creates a mirror layer.
    pub fn create_mirror(&self, name: &str, source: LayerId) -> Result<LayerId> {
        let mut st = self.shared.lock();
        let id = st.layers.create_mirror(name, source)?;
        drop(st);
        self.loop_handle.signal(Signal::Invalidate);
        Ok(id)
    }

    /// Releases a layer's client handle.
    pub fn release_layer(&self, id: LayerId) -> Result<()> {
        let mut st = self.shared.lock();
        st.layers.release_handle(id)?;
        drop(st);
        self.loop_handle.signal(Signal::Invalidate);
        Ok(())
    }

    /// Creates a dormant virtual display.
    #[must_use]
    pub fn create_virtual_display(&self, layer_stack: u32, secure: bool) -> DisplayId {
        self.shared
            .lock()
            .displays
            .create_virtual(layer_stack, secure)
    }

    /// Destroys a virtual display.
    pub fn destroy_virtual_display(&self, id: DisplayId) -> Result<()> {
        self.shared.lock().displays.destroy_virtual(id)
    }

    /// Attaches a producer surface to a virtual display, waking it.
    pub fn attach_virtual_surface(&self, id: DisplayId) -> Result<()> {
        let mut st = self.shared.lock();
        let device = st.displays.get_mut(id).ok_or(Status::NoSuchDisplay)?;
        if !device.is_virtual {
            return Err(Status::BadValue);
        }
        device.surface_attached = true;
        drop(st);
        self.loop_handle.signal(Signal::Invalidate);
        Ok(())
    }

    /// Sets the global color transform applied at composition, row-major
    /// 4x4; `None` restores identity. Takes effect at the next commit.
    pub fn set_color_matrix(&self, matrix: Option<[f32; 16]>) {
        self.shared.lock().color_matrix = matrix;
        self.loop_handle.signal(Signal::Invalidate);
    }

    /// Sets a display's projection (orientation, viewport, frame).
    pub fn set_projection(&self, display: DisplayId, projection: Projection) -> Result<()> {
        let mut st = self.shared.lock();
        let device = st.displays.get_mut(display).ok_or(Status::NoSuchDisplay)?;
        device.projection = projection;
        drop(st);
        self.loop_handle.signal(Signal::Invalidate);
        Ok(())
    }

    /// Reads a display's projection back.
    pub fn projection(&self, display: DisplayId) -> Result<Projection> {
        let st = self.shared.lock();
        st.displays
            .get(display)
            .map(|d| d.projection)
            .ok_or(Status::NoSuchDisplay)
    }

    /// Restricts which refresh-rate configs a display may select.
    pub fn set_allowed_configs(&self, display: DisplayId, ids: &[ConfigId]) -> Result<()> {
        let mut st = self.shared.lock();
        let device = st.displays.get_mut(display).ok_or(Status::NoSuchDisplay)?;
        let tracker = device.configs.as_mut().ok_or(Status::BadValue)?;
        tracker.set_allowed(ids)
    }

    /// The configs a display exposes, with the currently active one.
    pub fn display_configs(&self, id: DisplayId) -> Result<(Vec<RefreshRateConfig>, ConfigId)> {
        let st = self.shared.lock();
        let device = st.displays.get(id).ok_or(Status::NoSuchDisplay)?;
        let tracker = device.configs.as_ref().ok_or(Status::BadValue)?;
        Ok((tracker.all().to_vec(), tracker.current().id))
    }

    /// Submits a transaction.
    ///
    /// Synchronous transactions block until their commit, bounded by the
    /// sync timeout; animation transactions first wait for the previous
    /// animation transaction to be applied, same bound. Timed-out waits
    /// warn and return [`Status::TimedOut`], but the transaction itself
    /// remains queued and will still apply.
    pub fn submit(&self, mut tx: Transaction) -> Result<()> {
        let mut st = self.shared.lock();

        if tx.animation && st.animation_pending > 0 {
            let (guard, timeout) = self
                .shared
                .animation_done
                .wait_timeout_while(st, self.sync_timeout.to_std(), |s| s.animation_pending > 0)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            st = guard;
            if timeout.timed_out() && st.animation_pending > 0 {
                warn!("previous animation transaction still pending; not waiting further");
            }
        }
        if tx.animation {
            st.animation_pending += 1;
        }

        let sync_flag = if tx.synchronous {
            let flag = Arc::new(AtomicBool::new(false));
            let mine = Arc::clone(&flag);
            let original = tx.completion.take();
            tx.completion = Some(Box::new(move |feedback| {
                if let Some(cb) = original {
                    cb(feedback);
                }
                mine.store(true, Ordering::Release);
            }));
            Some(flag)
        } else {
            None
        };

        let expected = st.expected_present;
        if let Some(ready) = st.queue.submit(tx, expected) {
            st.pending_apply.push(ready);
        }
        self.loop_handle.signal(Signal::Invalidate);

        if let Some(flag) = sync_flag {
            let (_guard, timeout) = self
                .shared
                .tx_done
                .wait_timeout_while(st, self.sync_timeout.to_std(), |_| {
                    !flag.load(Ordering::Acquire)
                })
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if timeout.timed_out() && !flag.load(Ordering::Acquire) {
                warn!(
                    "synchronous transaction abandoned after {:?}",
                    self.sync_timeout
                );
                return Err(Status::TimedOut);
            }
        }
        Ok(())
    }

    /// Sends a main-thread command and waits (bounded) for the outcome.
    fn request<T>(&self, command: Command, reply: Receiver<Result<T>>) -> Result<T> {
        self.commands.send(command).map_err(|_| Status::Dead)?;
        self.loop_handle.post(Box::new(|| {}));
        match reply.recv_timeout(self.sync_timeout.to_std()) {
            Ok(result) => result,
            Err(_) => {
                warn!("main-thread command not serviced in time");
                Err(Status::TimedOut)
            }
        }
    }

    /// Changes a display's power mode.
    pub fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.request(
            Command::SetPowerMode {
                display,
                mode,
                reply: tx,
            },
            rx,
        )
    }

    /// Requests a refresh-rate switch; returns once validated, not once
    /// confirmed.
    pub fn set_desired_config(&self, display: DisplayId, config: ConfigId) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.request(
            Command::SetDesiredConfig {
                display,
                config,
                reply: tx,
            },
            rx,
        )
    }

    /// Captures a display's drawing state.
    pub fn capture(&self, display: DisplayId) -> Result<Screenshot> {
        let (tx, rx) = bounded(1);
        self.request(Command::Capture { display, reply: tx }, rx)
    }

    /// Runs a debug backdoor command.
    pub fn debug(&self, command: DebugCommand) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.request(Command::Debug { command, reply: tx }, rx)
    }

    /// Registers an additional vsync consumer connection.
    pub fn create_vsync_connection(
        &self,
        name: &str,
        phase_offset: Duration,
    ) -> Result<VsyncConnection> {
        let (tx, rx) = bounded(1);
        self.commands
            .send(Command::CreateVsyncConnection {
                name: name.to_owned(),
                phase_offset,
                reply: tx,
            })
            .map_err(|_| Status::Dead)?;
        self.loop_handle.post(Box::new(|| {}));
        rx.recv_timeout(self.sync_timeout.to_std())
            .map_err(|_| Status::TimedOut)
    }

    /// Subscribes to hotplug notifications.
    pub fn register_hotplug_listener(&self) -> Result<Receiver<(DisplayId, bool)>> {
        let (tx, rx) = bounded(1);
        self.commands
            .send(Command::RegisterHotplugListener { reply: tx })
            .map_err(|_| Status::Dead)?;
        self.loop_handle.post(Box::new(|| {}));
        rx.recv_timeout(self.sync_timeout.to_std())
            .map_err(|_| Status::TimedOut)
    }
}
