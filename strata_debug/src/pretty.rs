// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Human-readable trace output.
//!
//! [`PrettyPrintSink`] implements [`TraceSink`] and writes one line per
//! event to a [`Write`](std::io::Write) destination (default: stderr).
//! Timestamps are printed in microseconds.

use std::io::Write;

use strata_core::hwc::DisplayId;
use strata_core::time::{Duration, HostTime};
use strata_core::trace::TraceSink;

/// Writes human-readable trace lines to a [`Write`](std::io::Write)
/// destination.
pub struct PrettyPrintSink<W: Write = Box<dyn Write>> {
    writer: W,
}

impl<W: Write> std::fmt::Debug for PrettyPrintSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrettyPrintSink").finish_non_exhaustive()
    }
}

impl PrettyPrintSink {
    /// Creates a sink that writes to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            writer: Box::new(std::io::stderr()),
        }
    }

    /// Creates a sink that writes to a boxed writer.
    #[must_use]
    pub fn new(writer: Box<dyn Write>) -> Self {
        Self { writer }
    }
}

impl<W: Write> PrettyPrintSink<W> {
    /// Creates a sink that writes to the given destination.
    #[must_use]
    pub fn with_writer(writer: W) -> Self {
        Self { writer }
    }
}

fn us(t: HostTime) -> f64 {
    t.nanos() as f64 / 1000.0
}

fn dur_us(d: Duration) -> f64 {
    d.nanos() as f64 / 1000.0
}

impl<W: Write + Send> TraceSink for PrettyPrintSink<W> {
    fn vsync(&mut self, timestamp: HostTime, expected_present: HostTime) {
        let _ = writeln!(
            self.writer,
            "[vsync] at={:.1}µs expected_present={:.1}µs",
            us(timestamp),
            us(expected_present),
        );
    }

    fn transactions_applied(&mut self, count: usize) {
        let _ = writeln!(self.writer, "[tx:applied] count={count}");
    }

    fn committed(&mut self, cycle: u64) {
        let _ = writeln!(self.writer, "[commit] cycle={cycle}");
    }

    fn latched(&mut self, layer_sequence: u64, frame_number: u64) {
        let _ = writeln!(
            self.writer,
            "[latch] layer={layer_sequence} frame={frame_number}"
        );
    }

    fn composite_begin(&mut self, cycle: u64, display: DisplayId) {
        let _ = writeln!(
            self.writer,
            "[composite:begin] cycle={cycle} display={}",
            display.0
        );
    }

    fn composite_end(&mut self, cycle: u64, gpu_fallback: bool) {
        let _ = writeln!(
            self.writer,
            "[composite:end] cycle={cycle} gpu_fallback={gpu_fallback}"
        );
    }

    fn present_feedback(&mut self, cycle: u64, latency: Duration) {
        let _ = writeln!(
            self.writer,
            "[present] cycle={cycle} latency={:.1}µs",
            dur_us(latency),
        );
    }

    fn frame_missed(&mut self, cycle: u64, hwc_only: bool) {
        let _ = writeln!(self.writer, "[missed] cycle={cycle} hwc_only={hwc_only}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(events: impl FnOnce(&mut PrettyPrintSink<Vec<u8>>)) -> String {
        let mut sink = PrettyPrintSink::with_writer(Vec::new());
        events(&mut sink);
        String::from_utf8(sink.writer).unwrap()
    }

    #[test]
    fn one_line_per_event() {
        let out = capture(|sink| {
            sink.vsync(HostTime(16_666_666), HostTime(33_333_332));
            sink.committed(3);
            sink.latched(42, 7);
        });
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[vsync]"));
        assert!(lines[1].contains("cycle=3"));
        assert!(lines[2].contains("layer=42"));
    }

    #[test]
    fn missed_frames_are_labelled() {
        let out = capture(|sink| sink.frame_missed(9, true));
        assert_eq!(out.trim(), "[missed] cycle=9 hwc_only=true");
    }
}
