// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Main-thread event loop and message queue.
//!
//! The compositor is single-consumer: one main thread drains this queue and
//! owns all composition state. Producers interact through a [`LoopHandle`]:
//!
//! - [`post`](LoopHandle::post) / [`post_delayed`](LoopHandle::post_delayed)
//!   enqueue a task without blocking the caller.
//! - [`post_sync`](LoopHandle::post_sync) enqueues and blocks until the task
//!   has run, bounded by the configured sync timeout. Calling it from the
//!   loop's own thread returns [`Status::WouldBlock`] instead of
//!   deadlocking.
//! - [`signal`](LoopHandle::signal) requests one of the two recurring frame
//!   signals. Signals are idempotent: requesting one repeatedly before it is
//!   serviced is equivalent to requesting it once.
//!
//! [`EventLoop::wait_and_dispatch`] blocks until at least one task or signal
//! is ready, runs all ready tasks in enqueue order, and reports which
//! signals were drained.

use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::Instant;

use tracing::warn;

use crate::error::Status;
use crate::time::Duration;

/// A unit of work executed on the main thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The two recurring, coalesced frame signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Something changed; the pipeline may need to produce a new frame.
    Invalidate,
    /// A frame must be composited now.
    Refresh,
}

/// What a single [`EventLoop::wait_and_dispatch`] call drained.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchOutcome {
    /// An invalidate signal was pending and has been consumed.
    pub invalidate: bool,
    /// A refresh signal was pending and has been consumed.
    pub refresh: bool,
    /// Number of tasks executed.
    pub tasks_run: usize,
    /// The loop has been asked to shut down.
    pub shutdown: bool,
}

struct DelayedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for DelayedTask {}
impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedTask {
    // Reversed so the BinaryHeap pops the earliest-due task first.
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    immediate: VecDeque<(u64, Task)>,
    delayed: BinaryHeap<DelayedTask>,
    invalidate: bool,
    refresh: bool,
    shutdown: bool,
    next_seq: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
    owner: ThreadId,
    sync_timeout: Duration,
}

impl core::fmt::Debug for Shared {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shared")
            .field("owner", &self.owner)
            .field("sync_timeout", &self.sync_timeout)
            .finish_non_exhaustive()
    }
}

/// The main thread's end of the queue.
///
/// Construct it on the thread that will drain it; that thread's identity is
/// what [`LoopHandle::post_sync`] checks to refuse reentrant blocking.
#[derive(Debug)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Creates an event loop owned by the calling thread.
    #[must_use]
    pub fn new(sync_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
                owner: std::thread::current().id(),
                sync_timeout,
            }),
        }
    }

    /// Returns a cloneable producer handle.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocks until at least one task or signal is ready, runs all ready
    /// tasks in enqueue order, and returns the drained signals.
    pub fn wait_and_dispatch(&mut self) -> DispatchOutcome {
        let (tasks, outcome) = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            loop {
                if state.shutdown || state.invalidate || state.refresh {
                    break;
                }
                let now = Instant::now();
                if !state.immediate.is_empty() {
                    break;
                }
                if let Some(head) = state.delayed.peek() {
                    if head.due <= now {
                        break;
                    }
                    let wait = head.due - now;
                    let (s, _) = self
                        .shared
                        .ready
                        .wait_timeout(state, wait)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    state = s;
                } else {
                    state = self
                        .shared
                        .ready
                        .wait(state)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            }
            (Self::take_ready(&mut state), Self::take_signals(&mut state))
        };
        self.run_tasks(tasks, outcome)
    }

    /// Runs whatever is ready right now without blocking.
    ///
    /// Used by tests and by the refresh path to drain follow-up work posted
    /// during the current cycle.
    pub fn dispatch_pending(&mut self) -> DispatchOutcome {
        let (tasks, outcome) = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (Self::take_ready(&mut state), Self::take_signals(&mut state))
        };
        self.run_tasks(tasks, outcome)
    }

    fn take_ready(state: &mut QueueState) -> Vec<(u64, Task)> {
        let now = Instant::now();
        let mut ready: Vec<(u64, Task)> = state.immediate.drain(..).collect();
        while let Some(head) = state.delayed.peek() {
            if head.due > now {
                break;
            }
            let t = state
                .delayed
                .pop()
                .expect("peeked head must still be present");
            ready.push((t.seq, t.task));
        }
        // Enqueue order across immediate and expired delayed tasks.
        ready.sort_by_key(|(seq, _)| *seq);
        ready
    }

    fn take_signals(state: &mut QueueState) -> DispatchOutcome {
        let outcome = DispatchOutcome {
            invalidate: state.invalidate,
            refresh: state.refresh,
            tasks_run: 0,
            shutdown: state.shutdown,
        };
        state.invalidate = false;
        state.refresh = false;
        outcome
    }

    fn run_tasks(
        &mut self,
        tasks: Vec<(u64, Task)>,
        mut outcome: DispatchOutcome,
    ) -> DispatchOutcome {
        outcome.tasks_run = tasks.len();
        for (_, task) in tasks {
            task();
        }
        outcome
    }
}

/// Cloneable, `Send` producer handle to an [`EventLoop`].
#[derive(Clone, Debug)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Enqueues a task for the main thread without blocking.
    pub fn post(&self, task: Task) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.immediate.push_back((seq, task));
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Enqueues a task to run no earlier than `delay` from now.
    pub fn post_delayed(&self, task: Task, delay: Duration) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.push(DelayedTask {
            due: Instant::now() + delay.to_std(),
            seq,
            task,
        });
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Enqueues a task and blocks until the main thread has run it.
    ///
    /// Returns [`Status::WouldBlock`] when called from the loop's own
    /// thread (running the task inline would reorder against queued work,
    /// and waiting would deadlock). Returns [`Status::TimedOut`] when the
    /// main thread does not service the task within the sync timeout; the
    /// task may still run later, but the caller is unblocked.
    pub fn post_sync(&self, task: Task) -> Result<(), Status> {
        if std::thread::current().id() == self.shared.owner {
            return Err(Status::WouldBlock);
        }
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let done2 = Arc::clone(&done);
        self.post(Box::new(move || {
            task();
            let (lock, cv) = &*done2;
            *lock
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = true;
            cv.notify_all();
        }));

        let (lock, cv) = &*done;
        let guard = lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (guard, timeout) = cv
            .wait_timeout_while(guard, self.shared.sync_timeout.to_std(), |finished| {
                !*finished
            })
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if timeout.timed_out() && !*guard {
            warn!("post_sync abandoned after {:?}", self.shared.sync_timeout);
            return Err(Status::TimedOut);
        }
        Ok(())
    }

    /// Requests a coalesced frame signal.
    pub fn signal(&self, signal: Signal) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match signal {
            Signal::Invalidate => state.invalidate = true,
            Signal::Refresh => state.refresh = true,
        }
        drop(state);
        self.shared.ready.notify_all();
    }

    /// Asks the loop to shut down; `wait_and_dispatch` reports it on its
    /// next return.
    pub fn shutdown(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.shutdown = true;
        drop(state);
        self.shared.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn test_loop() -> EventLoop {
        EventLoop::new(Duration::from_millis(500))
    }

    #[test]
    fn tasks_run_in_enqueue_order() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = Arc::clone(&log);
            handle.post(Box::new(move || log.lock().unwrap().push(i)));
        }
        let outcome = ev.wait_and_dispatch();
        assert_eq!(outcome.tasks_run, 4);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn signals_coalesce() {
        let mut ev = test_loop();
        let handle = ev.handle();
        handle.signal(Signal::Invalidate);
        handle.signal(Signal::Invalidate);
        handle.signal(Signal::Invalidate);
        let outcome = ev.wait_and_dispatch();
        assert!(outcome.invalidate);
        assert!(!outcome.refresh);

        // Nothing left pending.
        let outcome = ev.dispatch_pending();
        assert!(!outcome.invalidate, "signal must be consumed exactly once");
    }

    #[test]
    fn both_signals_drain_together() {
        let mut ev = test_loop();
        let handle = ev.handle();
        handle.signal(Signal::Refresh);
        handle.signal(Signal::Invalidate);
        let outcome = ev.wait_and_dispatch();
        assert!(outcome.invalidate && outcome.refresh);
    }

    #[test]
    fn delayed_task_waits_for_due_time() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let start = Instant::now();
        handle.post_delayed(
            Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(30),
        );
        let outcome = ev.wait_and_dispatch();
        assert_eq!(outcome.tasks_run, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(
            start.elapsed() >= std::time::Duration::from_millis(25),
            "delayed task ran too early"
        );
    }

    #[test]
    fn post_sync_runs_on_consumer_and_unblocks_caller() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);

        let waiter = std::thread::spawn(move || {
            handle.post_sync(Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }))
        });

        // Main thread services the queue.
        let outcome = ev.wait_and_dispatch();
        assert_eq!(outcome.tasks_run, 1);
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_sync_from_owner_thread_is_refused() {
        let ev = test_loop();
        let handle = ev.handle();
        let result = handle.post_sync(Box::new(|| {}));
        assert_eq!(result, Err(Status::WouldBlock));
    }

    #[test]
    fn post_sync_times_out_when_unserviced() {
        let ev = EventLoop::new(Duration::from_millis(20));
        let handle = ev.handle();
        let waiter = std::thread::spawn(move || handle.post_sync(Box::new(|| {})));
        // Never dispatch; the waiter must still come back.
        assert_eq!(waiter.join().unwrap(), Err(Status::TimedOut));
    }

    #[test]
    fn shutdown_wakes_the_loop() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            handle.shutdown();
        });
        let outcome = ev.wait_and_dispatch();
        assert!(outcome.shutdown);
        t.join().unwrap();
    }

    #[test]
    fn immediate_and_expired_delayed_interleave_by_enqueue_order() {
        let mut ev = test_loop();
        let handle = ev.handle();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        handle.post_delayed(
            Box::new(move || l.lock().unwrap().push("delayed")),
            Duration::ZERO,
        );
        let l = Arc::clone(&log);
        handle.post(Box::new(move || l.lock().unwrap().push("immediate")));

        let _ = ev.wait_and_dispatch();
        assert_eq!(*log.lock().unwrap(), vec!["delayed", "immediate"]);
    }
}
