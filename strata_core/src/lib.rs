// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! VSync-synchronized frame production for a display compositor.
//!
//! `strata_core` implements the pipeline between content producers and a
//! hardware composer: transaction intake, buffer latching, composition
//! pacing and present feedback, all driven by one main thread.
//!
//! # Architecture
//!
//! ```text
//!   HwComposer events (vsync, hotplug, config ack)
//!       │
//!       ▼
//!   Scheduler / VsyncDistributor ──► expected present time
//!       │
//!       ▼
//!   invalidate ──► TransactionQueue::flush ──► apply ──► commit
//!                                                           │
//!                        ┌──────────────────────────────────┘
//!                        ▼
//!   LayerMap::latch_all ──► refresh ──► HwComposer::compose
//!                                              │
//!                        ┌─────────────────────┘
//!                        ▼
//!   present fence ──► feedback (latency, missed frames, backpressure)
//! ```
//!
//! **[`message`]** — Single-consumer main loop with coalesced invalidate
//! and refresh signals and bounded synchronous posts.
//!
//! **[`vsync`]** — Period/phase model of the hardware vsync timeline with
//! phase-offset consumer connections.
//!
//! **[`config`] / [`scheduler`]** — Refresh-rate configs, switch
//! bookkeeping, content-driven rate selection and frame-miss statistics.
//!
//! **[`transaction`]** — Per-token FIFO queues behind the readiness gate;
//! synchronous and animation transaction semantics.
//!
//! **[`layer`]** — Generational layer arena, double-buffered properties
//! and the per-cycle latch pass.
//!
//! **[`display`] / [`hwc`]** — Display devices, projections, power modes,
//! and the composer abstraction with generation-tagged events.
//!
//! **[`compositor`]** — The context struct tying it all together and the
//! invalidate/refresh cycle.
//!
//! **[`service`]** — Permission-checked client surface and the debug
//! backdoor.
//!
//! **[`trace`]** — [`TraceSink`](trace::TraceSink) trait and
//! [`Tracer`](trace::Tracer) wrapper for frame-loop instrumentation.

pub mod compositor;
pub mod config;
pub mod display;
pub mod error;
pub mod fence;
pub mod hwc;
pub mod layer;
pub mod message;
pub mod scheduler;
pub mod service;
pub mod time;
pub mod trace;
pub mod transaction;
pub mod vsync;

pub use compositor::{Compositor, CompositorConfig, CompositorHandle, DebugCommand};
pub use error::{Result, Status};
pub use service::{CallerIdentity, CompositorService};
pub use time::{Clock, Duration, HostTime, SharedClock, SystemClock};
pub use transaction::{ApplyToken, Transaction};
