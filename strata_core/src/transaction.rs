// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction pipeline.
//!
//! A [`Transaction`] is an atomic batch of layer changes. Every transaction
//! passes through the same states:
//!
//! ```text
//! QUEUED -> READY -> APPLIED -> COMMITTED
//! ```
//!
//! Transactions queue per [`ApplyToken`], FIFO within a token: a
//! transaction can never overtake an earlier one from the same token.
//! The readiness gate holds a transaction back while its desired present
//! time is at or past the expected present time, unless it is so far in
//! the future (the escape valve, 1 s by default) that waiting would be a
//! producer bug; it also holds frames back until their acquire fences
//! signal.
//!
//! This module is pure queue mechanics. Applying a ready transaction to
//! layer state, and the blocking semantics of synchronous and animation
//! transactions, live in [`crate::compositor`].

use std::collections::HashMap;
use std::collections::VecDeque;

use kurbo::{Affine, Rect};
use tracing::trace;

use crate::config::FrameRateVote;
use crate::layer::{LayerId, QueuedFrame};
use crate::time::{Duration, HostTime};

/// Groups transactions that must apply in submission order.
///
/// Typically one token per producing client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ApplyToken(pub u64);

/// Partial update of a layer's properties. `None` fields are untouched.
#[derive(Clone, Debug, Default)]
pub struct PropChanges {
    /// New stacking order.
    pub z: Option<i32>,
    /// New layer-to-stack transform.
    pub transform: Option<Affine>,
    /// New source crop (set to `Some(None)` to clear).
    pub crop: Option<Option<Rect>>,
    /// New plane alpha.
    pub alpha: Option<f32>,
    /// New solid fill color.
    pub color: Option<Option<[f32; 3]>>,
    /// New layer stack assignment.
    pub layer_stack: Option<u32>,
    /// New visibility flag.
    pub hidden: Option<bool>,
    /// New frame-rate vote.
    pub frame_rate: Option<FrameRateVote>,
}

impl PropChanges {
    /// Applies the set fields onto `props`.
    pub fn apply_to(&self, props: &mut crate::layer::LayerProps) {
        if let Some(z) = self.z {
            props.z = z;
        }
        if let Some(transform) = self.transform {
            props.transform = transform;
        }
        if let Some(crop) = self.crop {
            props.crop = crop;
        }
        if let Some(alpha) = self.alpha {
            props.alpha = alpha;
        }
        if let Some(color) = self.color {
            props.color = color;
        }
        if let Some(layer_stack) = self.layer_stack {
            props.layer_stack = layer_stack;
        }
        if let Some(hidden) = self.hidden {
            props.hidden = hidden;
        }
        if let Some(frame_rate) = self.frame_rate {
            props.frame_rate = frame_rate;
        }
    }
}

/// One layer's slice of a transaction.
#[derive(Debug, Default)]
pub struct LayerChange {
    /// Property updates.
    pub props: PropChanges,
    /// A produced frame to enqueue, if the client submitted one.
    pub frame: Option<QueuedFrame>,
}

/// Timestamps delivered to completion callbacks after commit.
#[derive(Clone, Copy, Debug)]
pub struct CommitFeedback {
    /// When the commit's latch pass ran.
    pub latch_time: HostTime,
    /// The vsync the committed content is aimed at.
    pub expected_present: HostTime,
}

/// Invoked once the transaction's changes are committed.
pub type CompletionCallback = Box<dyn FnOnce(CommitFeedback) + Send>;

/// An atomic batch of layer changes.
#[derive(Default)]
pub struct Transaction {
    /// Ordering domain; same-token transactions apply FIFO.
    pub token: ApplyToken,
    /// Per-layer changes.
    pub changes: Vec<(LayerId, LayerChange)>,
    /// Earliest present time the batch is aimed at; zero means "as soon as
    /// possible".
    pub desired_present: HostTime,
    /// The submitter blocks until the batch commits.
    pub synchronous: bool,
    /// Asks the cycle that applies this batch to composite promptly, even
    /// if no layer latched new content.
    pub early_wakeup: bool,
    /// Part of a window animation; serialized against other animation
    /// transactions.
    pub animation: bool,
    /// Fired after commit.
    pub completion: Option<CompletionCallback>,
}

impl core::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("token", &self.token)
            .field("changes", &self.changes.len())
            .field("desired_present", &self.desired_present)
            .field("synchronous", &self.synchronous)
            .field("early_wakeup", &self.early_wakeup)
            .field("animation", &self.animation)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

impl Transaction {
    /// Whether every queued frame's acquire fence has signaled.
    #[must_use]
    pub fn fences_signaled(&self) -> bool {
        self.changes
            .iter()
            .filter_map(|(_, c)| c.frame.as_ref())
            .all(|f| f.acquire_fence.is_signaled())
    }
}

struct Pending {
    seq: u64,
    tx: Transaction,
}

/// Per-token FIFO queues with the shared readiness gate.
pub struct TransactionQueue {
    queues: HashMap<ApplyToken, VecDeque<Pending>>,
    escape_valve: Duration,
    next_seq: u64,
}

impl core::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("tokens", &self.queues.len())
            .field("pending", &self.pending_count())
            .field("escape_valve", &self.escape_valve)
            .finish()
    }
}

impl TransactionQueue {
    /// Creates an empty queue set.
    ///
    /// `escape_valve` bounds how far in the future a desired present time
    /// may defer a transaction before it is treated as malformed and let
    /// through anyway.
    #[must_use]
    pub fn new(escape_valve: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            escape_valve,
            next_seq: 0,
        }
    }

    /// Total transactions queued across all tokens.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Whether `tx` may apply at `expected_present`.
    ///
    /// `ready = (desired < expected) || (desired >= expected + valve)`,
    /// and all acquire fences signaled. The second disjunct is the escape
    /// valve: a timestamp absurdly far in the future deliberately fails to
    /// defer.
    #[must_use]
    pub fn is_ready(&self, tx: &Transaction, expected_present: HostTime) -> bool {
        let desired = tx.desired_present;
        let timely = desired < expected_present
            || desired >= expected_present.saturating_add(self.escape_valve);
        timely && tx.fences_signaled()
    }

    /// Accepts a transaction.
    ///
    /// Returns the transaction back when it should apply immediately:
    /// nothing from the same token is queued ahead of it and the readiness
    /// gate passes. Otherwise it is queued and `None` is returned.
    pub fn submit(&mut self, tx: Transaction, expected_present: HostTime) -> Option<Transaction> {
        let queue_nonempty = self.queues.get(&tx.token).is_some_and(|q| !q.is_empty());
        if !queue_nonempty && self.is_ready(&tx, expected_present) {
            return Some(tx);
        }
        trace!(token = ?tx.token, "transaction queued");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queues
            .entry(tx.token)
            .or_default()
            .push_back(Pending { seq, tx });
        None
    }

    /// Drains every token's queue while its head is ready, returning the
    /// drained transactions in original submission order. Emptied token
    /// queues are removed.
    pub fn flush(&mut self, expected_present: HostTime) -> Vec<Transaction> {
        let mut ready = Vec::new();
        for queue in self.queues.values_mut() {
            while let Some(head) = queue.front() {
                // Borrow dance: readiness only needs the tx itself.
                let ok = {
                    let desired = head.tx.desired_present;
                    let timely = desired < expected_present
                        || desired >= expected_present.saturating_add(self.escape_valve);
                    timely && head.tx.fences_signaled()
                };
                if !ok {
                    break;
                }
                ready.push(queue.pop_front().expect("front was just observed"));
            }
        }
        self.queues.retain(|_, q| !q.is_empty());
        ready.sort_by_key(|p| p.seq);
        ready.into_iter().map(|p| p.tx).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::Fence;
    use crate::layer::BufferId;

    const VALVE: Duration = Duration::from_secs(1);

    fn tx(token: u64, desired: u64) -> Transaction {
        Transaction {
            token: ApplyToken(token),
            desired_present: HostTime(desired),
            ..Default::default()
        }
    }

    fn tx_with_fence(token: u64, fence: Fence) -> Transaction {
        let mut t = tx(token, 0);
        t.changes.push((
            // The id never gets dereferenced by the queue.
            crate::layer::LayerMap::new().create("x", None).unwrap(),
            LayerChange {
                frame: Some(QueuedFrame {
                    buffer: BufferId(1),
                    acquire_fence: fence,
                    desired_present: HostTime(0),
                    frame_number: 1,
                }),
                ..Default::default()
            },
        ));
        t
    }

    #[test]
    fn timely_transaction_applies_immediately() {
        let mut q = TransactionQueue::new(VALVE);
        let returned = q.submit(tx(1, 0), HostTime(1_000));
        assert!(returned.is_some());
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn future_transaction_queues() {
        let mut q = TransactionQueue::new(VALVE);
        let expected = HostTime(1_000_000);
        let desired = expected + Duration::from_millis(32);
        assert!(q.submit(tx(1, desired.nanos()), expected).is_none());
        assert_eq!(q.pending_count(), 1);

        // Not ready at the same vsync.
        assert!(q.flush(expected).is_empty());
        // Ready once the expected present passes the desired time.
        let later = desired + Duration(1);
        assert_eq!(q.flush(later).len(), 1);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn escape_valve_lets_absurd_timestamps_through() {
        let mut q = TransactionQueue::new(VALVE);
        let expected = HostTime(1_000_000);
        let absurd = expected.saturating_add(Duration::from_secs(30));
        assert!(
            q.submit(tx(1, absurd.nanos()), expected).is_some(),
            "timestamps past the valve do not defer"
        );
    }

    #[test]
    fn same_token_is_fifo() {
        let mut q = TransactionQueue::new(VALVE);
        let expected = HostTime(1_000_000);
        let future = (expected + Duration::from_millis(16)).nanos();
        assert!(q.submit(tx(1, future), expected).is_none());
        // Second same-token transaction is timely but must not overtake.
        assert!(q.submit(tx(1, 0), expected).is_none());

        let later = HostTime(future + 1);
        let drained = q.flush(later);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].desired_present, HostTime(future));
        assert_eq!(drained[1].desired_present, HostTime(0));
    }

    #[test]
    fn other_tokens_are_not_blocked() {
        let mut q = TransactionQueue::new(VALVE);
        let expected = HostTime(1_000_000);
        let future = (expected + Duration::from_millis(16)).nanos();
        assert!(q.submit(tx(1, future), expected).is_none());
        assert!(
            q.submit(tx(2, 0), expected).is_some(),
            "an unrelated token applies immediately"
        );
    }

    #[test]
    fn pending_fence_defers_until_signal() {
        let mut q = TransactionQueue::new(VALVE);
        let fence = Fence::pending();
        let expected = HostTime(1_000_000);
        assert!(
            q.submit(tx_with_fence(1, fence.clone()), expected)
                .is_none()
        );
        assert!(q.flush(expected).is_empty());

        fence.signal(HostTime(10));
        let drained = q.flush(expected);
        assert_eq!(
            drained.len(),
            1,
            "fence-gated deferral resolves exactly once"
        );
        assert!(q.flush(expected).is_empty());
    }

    #[test]
    fn flush_preserves_cross_token_submission_order() {
        let mut q = TransactionQueue::new(VALVE);
        let expected = HostTime(1_000_000);
        let future = (expected + Duration::from_millis(16)).nanos();
        assert!(q.submit(tx(2, future), expected).is_none());
        assert!(q.submit(tx(1, future), expected).is_none());

        let drained = q.flush(HostTime(future + 1));
        assert_eq!(drained[0].token, ApplyToken(2));
        assert_eq!(drained[1].token, ApplyToken(1));
    }
}
