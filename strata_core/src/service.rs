// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The client-facing service surface.
//!
//! Every entry point takes the [`CallerIdentity`] the transport layer
//! authenticated and checks it before doing anything; an unauthorized call
//! returns [`Status::PermissionDenied`] with no side effects. General
//! clients may manage their own layers and submit transactions. Display
//! control, virtual displays, capture and the debug backdoor are reserved
//! for privileged callers; the backdoor additionally requires the shell
//! allow-list.

use crossbeam_channel::Receiver;
use tracing::warn;

use crate::compositor::{CompositorHandle, DebugCommand, Screenshot};
use crate::config::{ConfigId, RefreshRateConfig};
use crate::display::Projection;
use crate::error::{Result, Status};
use crate::hwc::{DisplayId, PowerMode};
use crate::layer::LayerId;
use crate::time::Duration;
use crate::transaction::Transaction;
use crate::vsync::VsyncConnection;

/// Root.
pub const UID_ROOT: u32 = 0;
/// The platform/system server.
pub const UID_SYSTEM: u32 = 1000;
/// The graphics stack itself.
pub const UID_GRAPHICS: u32 = 1003;
/// The debugging shell.
pub const UID_SHELL: u32 = 2000;

/// Authenticated identity of a calling process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    /// User id the transport authenticated.
    pub uid: u32,
    /// Process id, for logs.
    pub pid: u32,
}

impl CallerIdentity {
    /// A caller with the given uid.
    #[must_use]
    pub fn new(uid: u32, pid: u32) -> Self {
        Self { uid, pid }
    }

    /// System-level callers: root, system server, graphics stack.
    #[must_use]
    pub fn privileged(&self) -> bool {
        matches!(self.uid, UID_ROOT | UID_SYSTEM | UID_GRAPHICS)
    }

    /// May read composed frame content.
    #[must_use]
    pub fn can_capture(&self) -> bool {
        self.privileged()
    }

    /// May request state dumps.
    #[must_use]
    pub fn can_dump(&self) -> bool {
        self.privileged() || self.uid == UID_SHELL
    }

    /// May use the debug backdoor.
    #[must_use]
    pub fn can_debug(&self) -> bool {
        matches!(self.uid, UID_ROOT | UID_GRAPHICS | UID_SHELL)
    }
}

/// Permission-checked facade over a [`CompositorHandle`].
#[derive(Clone, Debug)]
pub struct CompositorService {
    handle: CompositorHandle,
}

impl CompositorService {
    /// Wraps a handle.
    #[must_use]
    pub fn new(handle: CompositorHandle) -> Self {
        Self { handle }
    }

    fn require_privileged(&self, caller: CallerIdentity) -> Result<()> {
        if caller.privileged() {
            Ok(())
        } else {
            warn!(
                uid = caller.uid,
                pid = caller.pid,
                "privileged operation denied"
            );
            Err(Status::PermissionDenied)
        }
    }

    /// Creates a layer. Open to all clients.
    pub fn create_layer(
        &self,
        _caller: CallerIdentity,
        name: &str,
        parent: Option<LayerId>,
    ) -> Result<LayerId> {
        self.handle.create_layer(name, parent)
    }

    /// Creates a mirror layer. Privileged: it grants read access to
    /// another client's content.
    pub fn create_mirror(
        &self,
        caller: CallerIdentity,
        name: &str,
        source: LayerId,
    ) -> Result<LayerId> {
        self.require_privileged(caller)?;
        self.handle.create_mirror(name, source)
    }

    /// Releases a layer handle.
    pub fn release_layer(&self, _caller: CallerIdentity, id: LayerId) -> Result<()> {
        self.handle.release_layer(id)
    }

    /// Submits a transaction. Open to all clients.
    pub fn submit(&self, _caller: CallerIdentity, tx: Transaction) -> Result<()> {
        self.handle.submit(tx)
    }

    /// Creates a virtual display. Privileged; secure ones additionally
    /// require a system-level caller.
    pub fn create_virtual_display(
        &self,
        caller: CallerIdentity,
        layer_stack: u32,
        secure: bool,
    ) -> Result<DisplayId> {
        self.require_privileged(caller)?;
        if secure && !matches!(caller.uid, UID_ROOT | UID_SYSTEM) {
            return Err(Status::PermissionDenied);
        }
        Ok(self.handle.create_virtual_display(layer_stack, secure))
    }

    /// Destroys a virtual display.
    pub fn destroy_virtual_display(&self, caller: CallerIdentity, id: DisplayId) -> Result<()> {
        self.require_privileged(caller)?;
        self.handle.destroy_virtual_display(id)
    }

    /// Attaches a producer surface to a virtual display.
    pub fn attach_virtual_surface(&self, caller: CallerIdentity, id: DisplayId) -> Result<()> {
        self.require_privileged(caller)?;
        self.handle.attach_virtual_surface(id)
    }

    /// Queries a display's refresh-rate configs. Open to all clients.
    pub fn display_configs(
        &self,
        _caller: CallerIdentity,
        id: DisplayId,
    ) -> Result<(Vec<RefreshRateConfig>, ConfigId)> {
        self.handle.display_configs(id)
    }

    /// Restricts the refresh-rate policy set of a display.
    pub fn set_allowed_configs(
        &self,
        caller: CallerIdentity,
        display: DisplayId,
        ids: &[ConfigId],
    ) -> Result<()> {
        self.require_privileged(caller)?;
        self.handle.set_allowed_configs(display, ids)
    }

    /// Sets the global color transform applied at composition.
    pub fn set_color_matrix(
        &self,
        caller: CallerIdentity,
        matrix: Option<[f32; 16]>,
    ) -> Result<()> {
        self.require_privileged(caller)?;
        self.handle.set_color_matrix(matrix);
        Ok(())
    }

    /// Sets a display's projection.
    pub fn set_projection(
        &self,
        caller: CallerIdentity,
        display: DisplayId,
        projection: Projection,
    ) -> Result<()> {
        self.require_privileged(caller)?;
        self.handle.set_projection(display, projection)
    }

    /// Queries a display's projection. Open to all clients.
    pub fn projection(&self, _caller: CallerIdentity, display: DisplayId) -> Result<Projection> {
        self.handle.projection(display)
    }

    /// Changes a display's power mode.
    pub fn set_power_mode(
        &self,
        caller: CallerIdentity,
        display: DisplayId,
        mode: PowerMode,
    ) -> Result<()> {
        self.require_privileged(caller)?;
        self.handle.set_power_mode(display, mode)
    }

    /// Requests a refresh-rate switch.
    pub fn set_desired_config(
        &self,
        caller: CallerIdentity,
        display: DisplayId,
        config: ConfigId,
    ) -> Result<()> {
        self.require_privileged(caller)?;
        self.handle.set_desired_config(display, config)
    }

    /// Captures a display's drawing state; blocks bounded on the main
    /// thread.
    pub fn capture(&self, caller: CallerIdentity, display: DisplayId) -> Result<Screenshot> {
        if !caller.can_capture() {
            warn!(uid = caller.uid, "capture denied");
            return Err(Status::PermissionDenied);
        }
        self.handle.capture(display)
    }

    /// Registers a vsync listener connection. Open to all clients.
    pub fn register_vsync_listener(
        &self,
        caller: CallerIdentity,
        phase_offset: Duration,
    ) -> Result<VsyncConnection> {
        let name = format!("client-{}", caller.pid);
        self.handle.create_vsync_connection(&name, phase_offset)
    }

    /// Subscribes to hotplug notifications. Open to all clients.
    pub fn register_hotplug_listener(
        &self,
        _caller: CallerIdentity,
    ) -> Result<Receiver<(DisplayId, bool)>> {
        self.handle.register_hotplug_listener()
    }

    /// Runs a debug backdoor command. Allow-listed callers only.
    pub fn debug(&self, caller: CallerIdentity, command: DebugCommand) -> Result<()> {
        if !caller.can_debug() {
            warn!(uid = caller.uid, ?command, "debug backdoor denied");
            return Err(Status::PermissionDenied);
        }
        self.handle.debug(command)
    }

    /// Verifies dump permission for diagnostic consumers.
    pub fn check_dump(&self, caller: CallerIdentity) -> Result<()> {
        if caller.can_dump() {
            Ok(())
        } else {
            Err(Status::PermissionDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM: CallerIdentity = CallerIdentity {
        uid: UID_SYSTEM,
        pid: 1,
    };
    const SHELL: CallerIdentity = CallerIdentity {
        uid: UID_SHELL,
        pid: 2,
    };
    const APP: CallerIdentity = CallerIdentity {
        uid: 10_042,
        pid: 3,
    };

    #[test]
    fn privilege_classification() {
        assert!(SYSTEM.privileged());
        assert!(!SHELL.privileged());
        assert!(!APP.privileged());
    }

    #[test]
    fn dump_extends_to_shell_but_not_apps() {
        assert!(SYSTEM.can_dump());
        assert!(SHELL.can_dump());
        assert!(!APP.can_dump());
    }

    #[test]
    fn debug_backdoor_allow_list() {
        assert!(SHELL.can_debug());
        assert!(CallerIdentity::new(UID_ROOT, 1).can_debug());
        assert!(
            !SYSTEM.can_debug(),
            "system server is not on the backdoor list"
        );
        assert!(!APP.can_debug());
    }
}
