// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Displays and their projections.
//!
//! A [`DisplayDevice`] is the compositor-side record of one output: its
//! layer stack binding, refresh-rate configs, power mode and projection.
//! [`DisplayManager`] tracks the connected set. Hotplug connects create
//! devices (the first physical connect nominates the primary); disconnects
//! remove the device while the layers that targeted it stay alive,
//! unreachable until rebound.
//!
//! Power-mode and config-switch *orchestration* (ordering against vsync
//! enablement and repaints) lives in [`crate::compositor`]; this module
//! only holds the per-display state.

use std::collections::BTreeMap;

use kurbo::{Affine, Point, Rect};
use tracing::info;

use crate::config::RefreshRateConfigs;
use crate::error::{Result, Status};
use crate::hwc::{DisplayId, PowerMode};

/// Virtual display ids are carved out of a range no hardware id reaches.
const VIRTUAL_ID_BASE: u64 = 1 << 40;

/// Display rotation in 90-degree steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Orientation {
    /// No rotation.
    #[default]
    Rotate0,
    /// 90 degrees clockwise.
    Rotate90,
    /// Upside down.
    Rotate180,
    /// 270 degrees clockwise.
    Rotate270,
}

/// Maps layer-stack space onto the display panel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    /// Panel rotation.
    pub orientation: Orientation,
    /// The region of layer-stack space shown.
    pub viewport: Rect,
    /// Where it lands on the panel.
    pub frame: Rect,
}

impl Projection {
    /// Identity projection over the given panel size.
    #[must_use]
    pub fn fill(width: f64, height: f64) -> Self {
        let rect = Rect::new(0.0, 0.0, width, height);
        Self {
            orientation: Orientation::Rotate0,
            viewport: rect,
            frame: rect,
        }
    }

    /// The affine taking viewport points to panel points.
    ///
    /// A degenerate (zero-area) viewport maps as identity; it shows up
    /// before the first projection is configured.
    #[must_use]
    pub fn transform(&self) -> Affine {
        if self.viewport.width() == 0.0 || self.viewport.height() == 0.0 {
            return Affine::IDENTITY;
        }
        // Normalize the viewport to the unit square, rotate there, then
        // scale out to the frame.
        let rotate = match self.orientation {
            Orientation::Rotate0 => Affine::IDENTITY,
            Orientation::Rotate90 => Affine::new([0.0, 1.0, -1.0, 0.0, 1.0, 0.0]),
            Orientation::Rotate180 => Affine::new([-1.0, 0.0, 0.0, -1.0, 1.0, 1.0]),
            Orientation::Rotate270 => Affine::new([0.0, -1.0, 1.0, 0.0, 0.0, 1.0]),
        };
        Affine::translate((self.frame.x0, self.frame.y0))
            * Affine::scale_non_uniform(self.frame.width(), self.frame.height())
            * rotate
            * Affine::scale_non_uniform(1.0 / self.viewport.width(), 1.0 / self.viewport.height())
            * Affine::translate((-self.viewport.x0, -self.viewport.y0))
    }
}

/// Compositor-side record of one output.
#[derive(Clone, Debug)]
pub struct DisplayDevice {
    /// Hardware or virtual id.
    pub id: DisplayId,
    /// Created by a client rather than hotplug.
    pub is_virtual: bool,
    /// Which layer stack this display shows.
    pub layer_stack: u32,
    /// Refresh-rate tracking; `None` for virtual displays.
    pub configs: Option<RefreshRateConfigs>,
    /// Last power mode set.
    pub power_mode: PowerMode,
    /// Secure displays may show protected content.
    pub secure: bool,
    /// Layer-stack-to-panel mapping.
    pub projection: Projection,
    /// Virtual displays are dormant until a producer surface is attached.
    pub surface_attached: bool,
}

impl DisplayDevice {
    /// Whether frames should be produced for this display at all.
    #[must_use]
    pub fn wants_frames(&self) -> bool {
        if self.is_virtual {
            self.surface_attached
        } else {
            self.power_mode.accepts_frames()
        }
    }
}

/// The connected display set.
#[derive(Debug, Default)]
pub struct DisplayManager {
    devices: BTreeMap<DisplayId, DisplayDevice>,
    primary: Option<DisplayId>,
    next_virtual: u64,
}

impl DisplayManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The primary physical display, once one connected.
    #[must_use]
    pub fn primary(&self) -> Option<DisplayId> {
        self.primary
    }

    /// Looks up a display.
    #[must_use]
    pub fn get(&self, id: DisplayId) -> Option<&DisplayDevice> {
        self.devices.get(&id)
    }

    /// Looks up a display mutably.
    pub fn get_mut(&mut self, id: DisplayId) -> Option<&mut DisplayDevice> {
        self.devices.get_mut(&id)
    }

    /// All displays in id order.
    pub fn iter(&self) -> impl Iterator<Item = &DisplayDevice> {
        self.devices.values()
    }

    /// Handles a hotplug connect. Returns `true` when this display became
    /// the primary.
    pub fn connect(&mut self, id: DisplayId, configs: RefreshRateConfigs) -> bool {
        let became_primary = self.primary.is_none();
        if became_primary {
            self.primary = Some(id);
        }
        info!(?id, primary = became_primary, "display connected");
        self.devices.insert(
            id,
            DisplayDevice {
                id,
                is_virtual: false,
                layer_stack: 0,
                configs: Some(configs),
                power_mode: PowerMode::Off,
                secure: false,
                projection: Projection::fill(0.0, 0.0),
                surface_attached: false,
            },
        );
        became_primary
    }

    /// Handles a hotplug disconnect.
    ///
    /// The device is removed from the set; layers bound to its stack stay
    /// alive but become unreachable until another display binds the stack.
    pub fn disconnect(&mut self, id: DisplayId) -> Result<()> {
        self.devices.remove(&id).ok_or(Status::NoSuchDisplay)?;
        if self.primary == Some(id) {
            self.primary = self.devices.values().find(|d| !d.is_virtual).map(|d| d.id);
        }
        info!(?id, "display disconnected");
        Ok(())
    }

    /// Creates a dormant virtual display.
    pub fn create_virtual(&mut self, layer_stack: u32, secure: bool) -> DisplayId {
        let id = DisplayId(VIRTUAL_ID_BASE + self.next_virtual);
        self.next_virtual += 1;
        self.devices.insert(
            id,
            DisplayDevice {
                id,
                is_virtual: true,
                layer_stack,
                configs: None,
                power_mode: PowerMode::Normal,
                secure,
                projection: Projection::fill(0.0, 0.0),
                surface_attached: false,
            },
        );
        id
    }

    /// Destroys a virtual display. Physical displays only leave via
    /// hotplug.
    pub fn destroy_virtual(&mut self, id: DisplayId) -> Result<()> {
        match self.devices.get(&id) {
            Some(d) if d.is_virtual => {
                self.devices.remove(&id);
                Ok(())
            }
            Some(_) => Err(Status::BadValue),
            None => Err(Status::NoSuchDisplay),
        }
    }
}

/// Maps the four viewport corners through the projection, for tests and
/// sanity checks.
#[must_use]
pub fn project_corners(projection: &Projection) -> [Point; 4] {
    let t = projection.transform();
    let v = projection.viewport;
    [
        t * Point::new(v.x0, v.y0),
        t * Point::new(v.x1, v.y0),
        t * Point::new(v.x1, v.y1),
        t * Point::new(v.x0, v.y1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigId, RefreshRateConfig};
    use crate::time::Duration;

    fn configs() -> RefreshRateConfigs {
        RefreshRateConfigs::new(
            vec![RefreshRateConfig {
                id: ConfigId(0),
                vsync_period: Duration(16_666_666),
                fps: 60,
            }],
            ConfigId(0),
        )
    }

    fn assert_close(a: Point, b: Point) {
        assert!((a - b).hypot() < 1e-9, "expected {b:?}, got {a:?}");
    }

    #[test]
    fn identity_projection_round_trips() {
        let p = Projection::fill(800.0, 600.0);
        let corners = project_corners(&p);
        assert_close(corners[0], Point::new(0.0, 0.0));
        assert_close(corners[2], Point::new(800.0, 600.0));
    }

    #[test]
    fn rotated_projection_maps_viewport_onto_frame() {
        let p = Projection {
            orientation: Orientation::Rotate90,
            viewport: Rect::new(0.0, 0.0, 800.0, 600.0),
            frame: Rect::new(0.0, 0.0, 600.0, 800.0),
        };
        let corners = project_corners(&p);
        // Top-left of the viewport lands at the top-right of the panel.
        assert_close(corners[0], Point::new(600.0, 0.0));
        assert_close(corners[1], Point::new(600.0, 800.0));
        assert_close(corners[2], Point::new(0.0, 800.0));
        assert_close(corners[3], Point::new(0.0, 0.0));
    }

    #[test]
    fn offset_viewport_scales_into_frame() {
        let p = Projection {
            orientation: Orientation::Rotate0,
            viewport: Rect::new(100.0, 100.0, 300.0, 200.0),
            frame: Rect::new(0.0, 0.0, 400.0, 200.0),
        };
        let corners = project_corners(&p);
        assert_close(corners[0], Point::new(0.0, 0.0));
        assert_close(corners[2], Point::new(400.0, 200.0));
    }

    #[test]
    fn first_connect_is_primary() {
        let mut dm = DisplayManager::new();
        assert!(dm.connect(DisplayId(1), configs()));
        assert!(!dm.connect(DisplayId(2), configs()));
        assert_eq!(dm.primary(), Some(DisplayId(1)));
    }

    #[test]
    fn disconnect_promotes_next_physical_display() {
        let mut dm = DisplayManager::new();
        dm.connect(DisplayId(1), configs());
        dm.connect(DisplayId(2), configs());
        dm.disconnect(DisplayId(1)).unwrap();
        assert_eq!(dm.primary(), Some(DisplayId(2)));
        assert_eq!(dm.disconnect(DisplayId(1)), Err(Status::NoSuchDisplay));
    }

    #[test]
    fn virtual_display_is_dormant_until_surface_attached() {
        let mut dm = DisplayManager::new();
        let id = dm.create_virtual(7, false);
        assert!(!dm.get(id).unwrap().wants_frames());
        dm.get_mut(id).unwrap().surface_attached = true;
        assert!(dm.get(id).unwrap().wants_frames());
    }

    #[test]
    fn destroy_virtual_rejects_physical_displays() {
        let mut dm = DisplayManager::new();
        dm.connect(DisplayId(1), configs());
        assert_eq!(dm.destroy_virtual(DisplayId(1)), Err(Status::BadValue));
        let v = dm.create_virtual(0, false);
        dm.destroy_virtual(v).unwrap();
        assert!(dm.get(v).is_none());
    }
}
