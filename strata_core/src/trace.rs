// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frame-loop instrumentation.
//!
//! [`TraceSink`] receives one callback per pipeline event, every method
//! defaulted to a no-op so sinks implement only what they care about.
//! [`Tracer`] is the owning wrapper the compositor calls through; with no
//! sink installed every call is a branch on `None`.

use crate::hwc::DisplayId;
use crate::time::{Duration, HostTime};

/// Receiver of frame-loop events.
#[expect(unused_variables, reason = "default methods ignore their arguments")]
pub trait TraceSink: Send {
    /// A vsync reached the compositor.
    fn vsync(&mut self, timestamp: HostTime, expected_present: HostTime) {}

    /// Ready transactions were applied this cycle.
    fn transactions_applied(&mut self, count: usize) {}

    /// Current state was committed to the drawing snapshot.
    fn committed(&mut self, cycle: u64) {}

    /// A layer latched a frame.
    fn latched(&mut self, layer_sequence: u64, frame_number: u64) {}

    /// Composition of one display's frame started.
    fn composite_begin(&mut self, cycle: u64, display: DisplayId) {}

    /// Composition finished.
    fn composite_end(&mut self, cycle: u64, gpu_fallback: bool) {}

    /// The present fence of an earlier frame resolved.
    fn present_feedback(&mut self, cycle: u64, latency: Duration) {}

    /// A frame missed its vsync deadline.
    fn frame_missed(&mut self, cycle: u64, hwc_only: bool) {}
}

/// Owning wrapper around an optional [`TraceSink`].
#[derive(Default)]
pub struct Tracer {
    sink: Option<Box<dyn TraceSink>>,
}

impl core::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}

impl Tracer {
    /// A tracer with no sink.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A tracer forwarding to `sink`.
    #[must_use]
    pub fn new(sink: Box<dyn TraceSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Installs or clears the sink.
    pub fn set_sink(&mut self, sink: Option<Box<dyn TraceSink>>) {
        self.sink = sink;
    }

    /// Whether events are being recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// See [`TraceSink::vsync`].
    pub fn vsync(&mut self, timestamp: HostTime, expected_present: HostTime) {
        if let Some(sink) = &mut self.sink {
            sink.vsync(timestamp, expected_present);
        }
    }

    /// See [`TraceSink::transactions_applied`].
    pub fn transactions_applied(&mut self, count: usize) {
        if let Some(sink) = &mut self.sink {
            sink.transactions_applied(count);
        }
    }

    /// See [`TraceSink::committed`].
    pub fn committed(&mut self, cycle: u64) {
        if let Some(sink) = &mut self.sink {
            sink.committed(cycle);
        }
    }

    /// See [`TraceSink::latched`].
    pub fn latched(&mut self, layer_sequence: u64, frame_number: u64) {
        if let Some(sink) = &mut self.sink {
            sink.latched(layer_sequence, frame_number);
        }
    }

    /// See [`TraceSink::composite_begin`].
    pub fn composite_begin(&mut self, cycle: u64, display: DisplayId) {
        if let Some(sink) = &mut self.sink {
            sink.composite_begin(cycle, display);
        }
    }

    /// See [`TraceSink::composite_end`].
    pub fn composite_end(&mut self, cycle: u64, gpu_fallback: bool) {
        if let Some(sink) = &mut self.sink {
            sink.composite_end(cycle, gpu_fallback);
        }
    }

    /// See [`TraceSink::present_feedback`].
    pub fn present_feedback(&mut self, cycle: u64, latency: Duration) {
        if let Some(sink) = &mut self.sink {
            sink.present_feedback(cycle, latency);
        }
    }

    /// See [`TraceSink::frame_missed`].
    pub fn frame_missed(&mut self, cycle: u64, hwc_only: bool) {
        if let Some(sink) = &mut self.sink {
            sink.frame_missed(cycle, hwc_only);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingSink {
        events: Vec<&'static str>,
    }

    impl TraceSink for CountingSink {
        fn vsync(&mut self, _: HostTime, _: HostTime) {
            self.events.push("vsync");
        }
        fn committed(&mut self, _: u64) {
            self.events.push("committed");
        }
    }

    #[test]
    fn disabled_tracer_swallows_events() {
        let mut tracer = Tracer::disabled();
        assert!(!tracer.is_enabled());
        tracer.vsync(HostTime(0), HostTime(1));
        tracer.frame_missed(3, true);
    }

    #[test]
    fn sink_receives_only_implemented_events() {
        let mut tracer = Tracer::new(Box::new(CountingSink::default()));
        assert!(tracer.is_enabled());
        tracer.vsync(HostTime(0), HostTime(1));
        tracer.committed(1);
        // Unimplemented events default to no-ops without panicking.
        tracer.composite_end(1, false);
    }
}
