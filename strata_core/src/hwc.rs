// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hardware composer abstraction.
//!
//! The composer is an opaque service behind the [`HwComposer`] trait:
//! production backends wrap a real display service, tests script a fake.
//! All composer callbacks arrive as [`ComposerEvent`]s tagged with the
//! [`Generation`] the compositor assigned when it (re)connected; events
//! from a previous connection are stale and must be ignored.

use kurbo::{Affine, Rect};
use thiserror::Error;

use crate::config::{ConfigId, RefreshRateConfig};
use crate::fence::Fence;
use crate::layer::BufferId;
use crate::time::{Duration, HostTime};

/// Hardware display identifier, assigned by the composer service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(pub u64);

/// Identifies one connection to the composer service.
///
/// Bumped each time the compositor (re)binds; used to discard callbacks
/// that were in flight across a reconnect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Generation(pub u64);

impl Generation {
    /// The next generation.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Display power states, ordered from fully off to fully on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PowerMode {
    /// Panel and vsync off.
    Off,
    /// Low-power always-on display; self-refresh.
    Doze,
    /// Doze with the render path suspended too.
    DozeSuspend,
    /// Fully on.
    Normal,
}

impl PowerMode {
    /// Whether the display can be composited to in this mode.
    #[must_use]
    pub fn accepts_frames(self) -> bool {
        matches!(self, Self::Normal | Self::Doze)
    }
}

/// One layer as handed to the composer.
#[derive(Clone, Debug)]
pub struct ComposerLayer {
    /// The source layer's sequence number, for traces and dumps.
    pub sequence: u64,
    /// The latched buffer, or `None` for a solid color layer.
    pub buffer: Option<BufferId>,
    /// Fill color when `buffer` is `None`.
    pub color: Option<[f32; 3]>,
    /// Layer-to-display transform.
    pub transform: Affine,
    /// Source crop.
    pub crop: Option<Rect>,
    /// Plane alpha.
    pub alpha: f32,
    /// Stacking order.
    pub z: i32,
}

/// Everything the composer needs for one display's frame.
#[derive(Clone, Debug)]
pub struct ComposerFrame {
    /// Target display.
    pub display: DisplayId,
    /// Layers in stacking order.
    pub layers: Vec<ComposerLayer>,
    /// Global color transform, row-major 4x4, if not identity.
    pub color_matrix: Option<[f32; 16]>,
    /// The vsync this frame is aimed at.
    pub expected_present: HostTime,
}

/// What the composer did with one frame.
#[derive(Debug)]
pub struct CompositionResult {
    /// Fires when the frame is on screen.
    pub present_fence: Fence,
    /// The composer punted some layers to the GPU fallback path.
    pub gpu_fallback: bool,
}

/// Composer-side failures. These degrade the cycle, never crash it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ComposerError {
    /// The composer service connection is gone.
    #[error("composer connection lost")]
    Dead,
    /// The composer rejected or failed the frame.
    #[error("composition failed")]
    Failed,
}

/// Asynchronous callback from the composer service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposerEvent {
    /// A hardware vsync fired.
    Vsync {
        /// Source display.
        display: DisplayId,
        /// Vsync timestamp on the monotonic clock.
        timestamp: HostTime,
        /// Period the hardware reports running at, when known.
        period: Option<Duration>,
    },
    /// A display was (dis)connected.
    Hotplug {
        /// Affected display.
        display: DisplayId,
        /// `true` for connect, `false` for disconnect.
        connected: bool,
    },
    /// The hardware wants a recomposite (e.g. self-refresh ended).
    RefreshRequested {
        /// Affected display.
        display: DisplayId,
    },
    /// A previously requested config switch took effect.
    ConfigConfirmed {
        /// Affected display.
        display: DisplayId,
        /// The now-active config.
        config: ConfigId,
    },
}

/// A composer event plus the connection generation it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaggedEvent {
    /// Connection generation at emission time.
    pub generation: Generation,
    /// The event itself.
    pub event: ComposerEvent,
}

/// The composer service surface the compositor drives.
pub trait HwComposer: Send + core::fmt::Debug {
    /// Refresh-rate configs a display exposes.
    fn configs(&self, display: DisplayId) -> Vec<RefreshRateConfig>;

    /// Composites one frame; returns its present fence.
    fn compose(&mut self, frame: &ComposerFrame) -> Result<CompositionResult, ComposerError>;

    /// Sets a display's power mode.
    fn set_power_mode(&mut self, display: DisplayId, mode: PowerMode);

    /// Requests a config switch; acknowledged later via
    /// [`ComposerEvent::ConfigConfirmed`].
    fn set_active_config(&mut self, display: DisplayId, config: ConfigId);

    /// Enables or disables vsync callbacks for a display.
    fn set_vsync_enabled(&mut self, display: DisplayId, enabled: bool);
}
