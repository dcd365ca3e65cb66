// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Double-buffered layer properties.

use kurbo::{Affine, Rect};

use crate::config::FrameRateVote;

/// The client-settable state of one layer.
///
/// Each layer holds two copies: the *current* set, mutated by committed
/// transactions under the state lock, and the *drawing* set, a snapshot the
/// main thread reads without locking during composition. `commit` copies
/// current over drawing.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerProps {
    /// Stacking order within the layer stack; higher draws on top.
    pub z: i32,
    /// Layer-to-stack transform.
    pub transform: Affine,
    /// Source crop applied to the layer's buffer, if any.
    pub crop: Option<Rect>,
    /// Global plane alpha, `0.0..=1.0`.
    pub alpha: f32,
    /// Solid fill color (linear RGB) for bufferless color layers.
    pub color: Option<[f32; 3]>,
    /// Which display stack this layer belongs to.
    pub layer_stack: u32,
    /// Explicitly hidden by the client.
    pub hidden: bool,
    /// The layer's say in refresh-rate selection.
    pub frame_rate: FrameRateVote,
}

impl Default for LayerProps {
    fn default() -> Self {
        Self {
            z: 0,
            transform: Affine::IDENTITY,
            crop: None,
            alpha: 1.0,
            color: None,
            layer_stack: 0,
            hidden: false,
            frame_rate: FrameRateVote::NoVote,
        }
    }
}

impl LayerProps {
    /// Whether the layer can contribute pixels at all.
    #[must_use]
    pub fn visible(&self) -> bool {
        !self.hidden && self.alpha > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_props_are_visible() {
        let props = LayerProps::default();
        assert!(props.visible());
    }

    #[test]
    fn hidden_or_transparent_is_invisible() {
        let hidden = LayerProps {
            hidden: true,
            ..Default::default()
        };
        assert!(!hidden.visible());
        let clear = LayerProps {
            alpha: 0.0,
            ..Default::default()
        };
        assert!(!clear.visible());
    }
}
