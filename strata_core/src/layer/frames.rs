// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-layer queues of produced frames.
//!
//! Producers append [`QueuedFrame`]s; the latch pass consumes them. Latching
//! is conservative in exactly one direction: a frame timestamped for a
//! future vsync is left queued (never dropped for being early), while a
//! frame superseded by a newer eligible one is released unshown.

use std::collections::VecDeque;

use crate::fence::Fence;
use crate::time::HostTime;

/// Opaque handle to a producer-supplied graphics buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// One frame handed over by a producer.
#[derive(Clone, Debug)]
pub struct QueuedFrame {
    /// The buffer carrying the pixels.
    pub buffer: BufferId,
    /// Fires when the producer's writes to the buffer are complete.
    pub acquire_fence: Fence,
    /// The earliest vsync this frame wants to be shown at.
    pub desired_present: HostTime,
    /// Producer-assigned monotonic frame counter.
    pub frame_number: u64,
}

/// Why a latch attempt did not take a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatchResult {
    /// A frame was latched; its number is reported.
    Latched(u64),
    /// Nothing queued.
    Empty,
    /// The head frame is aimed at a later vsync; retry next cycle.
    NotDue,
    /// A due frame's acquire fence has not signaled; retry next cycle.
    FencePending,
    /// This queue already latched during the given cycle.
    AlreadyLatched,
}

/// FIFO of produced frames plus the currently displayed one.
#[derive(Debug, Default)]
pub struct FrameQueue {
    queue: VecDeque<QueuedFrame>,
    active: Option<QueuedFrame>,
    last_latch_cycle: Option<u64>,
    queued_total: u64,
    latched_total: u64,
    dropped_total: u64,
}

impl FrameQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a produced frame.
    pub fn queue(&mut self, frame: QueuedFrame) {
        debug_assert!(
            self.queue
                .back()
                .is_none_or(|prev| prev.frame_number < frame.frame_number),
            "frame numbers must be strictly increasing"
        );
        self.queue.push_back(frame);
        self.queued_total += 1;
    }

    /// Number of frames waiting to latch.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    /// The frame currently on screen, if any.
    #[must_use]
    pub fn active(&self) -> Option<&QueuedFrame> {
        self.active.as_ref()
    }

    /// Lifetime counters `(queued, latched, dropped)`.
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.queued_total, self.latched_total, self.dropped_total)
    }

    /// Attempts to latch for the given cycle.
    ///
    /// At most one frame latches per cycle. Among the frames due at
    /// `expected_present`, the newest one whose acquire fence has signaled
    /// is taken; older due frames it supersedes are released unshown. A due
    /// frame with a pending fence blocks nothing newer, but if no due frame
    /// has signaled the previous content stays visible.
    pub fn latch(&mut self, cycle: u64, expected_present: HostTime) -> LatchResult {
        if self.last_latch_cycle == Some(cycle) {
            return LatchResult::AlreadyLatched;
        }
        if self.queue.is_empty() {
            return LatchResult::Empty;
        }

        // Length of the prefix of frames due at this vsync.
        let due = self
            .queue
            .iter()
            .take_while(|f| f.desired_present <= expected_present)
            .count();
        if due == 0 {
            return LatchResult::NotDue;
        }

        // Newest due frame whose producer has finished writing.
        let Some(pick) = self
            .queue
            .iter()
            .take(due)
            .rposition(|f| f.acquire_fence.is_signaled())
        else {
            return LatchResult::FencePending;
        };

        for _ in 0..pick {
            let _ = self.queue.pop_front();
            self.dropped_total += 1;
        }
        let frame = self
            .queue
            .pop_front()
            .expect("picked index is within the queue");
        let number = frame.frame_number;
        self.active = Some(frame);
        self.last_latch_cycle = Some(cycle);
        self.latched_total += 1;
        LatchResult::Latched(number)
    }

    /// Drains the whole queue without displaying anything.
    ///
    /// Offscreen layers use this so producers are never left blocked on a
    /// full queue. Returns the number of frames released.
    pub fn latch_and_release(&mut self) -> usize {
        let released = self.queue.len();
        self.dropped_total += released as u64;
        self.queue.clear();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(number: u64, desired: u64, signaled: bool) -> QueuedFrame {
        QueuedFrame {
            buffer: BufferId(number),
            acquire_fence: if signaled {
                Fence::signaled(HostTime(0))
            } else {
                Fence::pending()
            },
            desired_present: HostTime(desired),
            frame_number: number,
        }
    }

    #[test]
    fn latches_due_frame() {
        let mut q = FrameQueue::new();
        q.queue(frame(1, 100, true));
        assert_eq!(q.latch(1, HostTime(100)), LatchResult::Latched(1));
        assert_eq!(q.active().unwrap().frame_number, 1);
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn future_frame_is_left_queued() {
        let mut q = FrameQueue::new();
        q.queue(frame(1, 200, true));
        assert_eq!(q.latch(1, HostTime(100)), LatchResult::NotDue);
        assert_eq!(q.depth(), 1, "early frames are never dropped");
    }

    #[test]
    fn pending_fence_blocks_latch() {
        let mut q = FrameQueue::new();
        q.queue(frame(1, 50, false));
        assert_eq!(q.latch(1, HostTime(100)), LatchResult::FencePending);
        assert_eq!(q.depth(), 1);
        assert!(q.active().is_none(), "previous content stays visible");
    }

    #[test]
    fn newest_due_frame_supersedes_older() {
        let mut q = FrameQueue::new();
        q.queue(frame(1, 10, true));
        q.queue(frame(2, 20, true));
        q.queue(frame(3, 500, true));
        assert_eq!(q.latch(1, HostTime(100)), LatchResult::Latched(2));
        assert_eq!(q.depth(), 1, "future frame stays queued");
        let (_, latched, dropped) = q.stats();
        assert_eq!((latched, dropped), (1, 1));
    }

    #[test]
    fn at_most_one_latch_per_cycle() {
        let mut q = FrameQueue::new();
        q.queue(frame(1, 10, true));
        q.queue(frame(2, 20, true));
        assert_eq!(q.latch(7, HostTime(15)), LatchResult::Latched(1));
        assert_eq!(q.latch(7, HostTime(25)), LatchResult::AlreadyLatched);
        assert_eq!(q.latch(8, HostTime(25)), LatchResult::Latched(2));
    }

    #[test]
    fn unsignaled_newer_frame_does_not_block_older() {
        let mut q = FrameQueue::new();
        q.queue(frame(1, 10, true));
        q.queue(frame(2, 20, false));
        assert_eq!(q.latch(1, HostTime(100)), LatchResult::Latched(1));
        assert_eq!(q.depth(), 1, "unsignaled frame waits for a later cycle");
    }

    #[test]
    fn latch_and_release_drains_everything() {
        let mut q = FrameQueue::new();
        q.queue(frame(1, 10, false));
        q.queue(frame(2, 20, true));
        assert_eq!(q.latch_and_release(), 2);
        assert_eq!(q.depth(), 0);
        assert!(q.active().is_none());
    }
}
