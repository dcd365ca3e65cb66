// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client-facing status codes.
//!
//! Caller errors (bad arguments, unknown handles, permission failures) are
//! reported as [`Status`] values without mutating pipeline state. Timing and
//! backpressure conditions are *not* errors: they are retried on a later
//! cycle and never surface through this type.

use thiserror::Error;

/// Status returned by client-facing compositor operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum Status {
    /// An argument was out of range or otherwise invalid.
    #[error("bad value")]
    BadValue,
    /// The referenced display does not exist (or has been disconnected).
    #[error("no such display")]
    NoSuchDisplay,
    /// The referenced layer handle is stale or was never allocated.
    #[error("no such layer")]
    NoSuchLayer,
    /// The caller lacks the permission required for this operation.
    #[error("permission denied")]
    PermissionDenied,
    /// A bounded wait expired before the pipeline serviced the request.
    #[error("timed out")]
    TimedOut,
    /// The requested refresh-rate config is outside the allowed policy set.
    #[error("config not allowed")]
    ConfigNotAllowed,
    /// The operation would block the thread that must service it.
    #[error("would block the main thread")]
    WouldBlock,
    /// The event loop or compositor has shut down.
    #[error("compositor is shutting down")]
    Dead,
}

/// Convenience alias for client-facing results.
pub type Result<T, E = Status> = core::result::Result<T, E>;
