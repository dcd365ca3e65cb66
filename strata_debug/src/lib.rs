// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Diagnostics for the Strata compositor.
//!
//! Two consumers are served here:
//!
//! - **Bug reports**: [`dump::dump_text`] and [`dump::dump_json`] render
//!   the compositor's shared state, with a bounded lock acquisition so a
//!   wedged pipeline still yields a (partial) dump.
//! - **Live tracing**: [`pretty::PrettyPrintSink`] implements
//!   [`TraceSink`](strata_core::trace::TraceSink) and prints one line per
//!   frame-loop event.

pub mod dump;
pub mod pretty;

pub use dump::{DEFAULT_LOCK_TIMEOUT, dump_json, dump_text};
pub use pretty::PrettyPrintSink;
