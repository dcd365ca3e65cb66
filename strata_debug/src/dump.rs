// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! State dumps.
//!
//! [`dump_text`] and [`dump_json`] render the compositor's shared state for
//! bug reports. Acquiring the state lock is bounded: if the lock cannot be
//! taken within the timeout (a wedged pipeline is exactly when dumps
//! matter), a partial dump labelled as such is produced instead of hanging
//! the diagnostic caller.

use std::fmt::Write as _;
use std::sync::{MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use strata_core::compositor::{CurrentState, SharedState};

/// Default bound on state-lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

fn lock_bounded(shared: &SharedState, timeout: Duration) -> Option<MutexGuard<'_, CurrentState>> {
    let deadline = Instant::now() + timeout;
    loop {
        match shared.state.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Renders the pipeline state as text, one section per subsystem.
#[must_use]
pub fn dump_text(shared: &SharedState, timeout: Duration) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "strata state dump");
    let Some(st) = lock_bounded(shared, timeout) else {
        let _ = writeln!(
            out,
            "  PARTIAL DUMP: state lock not acquired within {timeout:?}"
        );
        return out;
    };

    let s = st.sched;
    let _ = writeln!(out, "scheduler:");
    let _ = writeln!(
        out,
        "  cycle={} timeline={} period={}ns expected_present={}ns",
        s.cycle,
        s.timeline,
        s.period.nanos(),
        s.expected_present.nanos(),
    );
    let _ = writeln!(
        out,
        "  missed: total={} hwc={} gpu={}",
        s.missed.total, s.missed.hwc, s.missed.gpu
    );

    let _ = writeln!(out, "transactions:");
    let _ = writeln!(
        out,
        "  pending={} awaiting_apply={} committed={} animation_pending={}",
        st.queue.pending_count(),
        st.pending_apply.len(),
        st.committed_count,
        st.animation_pending,
    );

    let _ = writeln!(out, "displays:");
    for device in st.displays.iter() {
        let config = device
            .configs
            .as_ref()
            .map_or_else(|| "-".to_owned(), |c| format!("{}", c.current().id.0));
        let _ = writeln!(
            out,
            "  id={} virtual={} stack={} power={:?} config={} secure={}",
            device.id.0,
            device.is_virtual,
            device.layer_stack,
            device.power_mode,
            config,
            device.secure,
        );
    }

    let _ = writeln!(out, "layers ({}):", st.layers.arena().len());
    for (_, layer) in st.layers.arena().iter() {
        let (queued, latched, dropped) = layer.frames.stats();
        let _ = writeln!(
            out,
            "  {} seq={} stack={} z={} visible={} offscreen={} depth={} q/l/d={}/{}/{}",
            layer.name,
            layer.sequence,
            layer.drawing.layer_stack,
            layer.drawing.z,
            layer.drawing.visible(),
            layer.offscreen,
            layer.frames.depth(),
            queued,
            latched,
            dropped,
        );
    }
    out
}

/// Renders the pipeline state as JSON.
#[must_use]
pub fn dump_json(shared: &SharedState, timeout: Duration) -> Value {
    let Some(st) = lock_bounded(shared, timeout) else {
        return json!({ "partial": true, "reason": "state lock not acquired" });
    };

    let displays: Vec<Value> = st
        .displays
        .iter()
        .map(|d| {
            json!({
                "id": d.id.0,
                "virtual": d.is_virtual,
                "layer_stack": d.layer_stack,
                "power_mode": format!("{:?}", d.power_mode),
                "config": d.configs.as_ref().map(|c| c.current().id.0),
                "secure": d.secure,
            })
        })
        .collect();

    let layers: Vec<Value> = st
        .layers
        .arena()
        .iter()
        .map(|(_, l)| {
            let (queued, latched, dropped) = l.frames.stats();
            json!({
                "name": l.name,
                "sequence": l.sequence,
                "layer_stack": l.drawing.layer_stack,
                "z": l.drawing.z,
                "visible": l.drawing.visible(),
                "offscreen": l.offscreen,
                "queue_depth": l.frames.depth(),
                "frames": { "queued": queued, "latched": latched, "dropped": dropped },
            })
        })
        .collect();

    json!({
        "partial": false,
        "scheduler": {
            "cycle": st.sched.cycle,
            "timeline": st.sched.timeline,
            "period_ns": st.sched.period.nanos(),
            "expected_present_ns": st.sched.expected_present.nanos(),
            "missed": {
                "total": st.sched.missed.total,
                "hwc": st.sched.missed.hwc,
                "gpu": st.sched.missed.gpu,
            },
        },
        "transactions": {
            "pending": st.queue.pending_count(),
            "awaiting_apply": st.pending_apply.len(),
            "committed": st.committed_count,
            "animation_pending": st.animation_pending,
        },
        "displays": displays,
        "layers": layers,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use strata_core::compositor::{Compositor, CompositorConfig};
    use strata_core::time::SystemClock;
    use strata_harness::fake_composer;

    use super::*;

    fn test_shared() -> Arc<SharedState> {
        let (composer, _controller, events) = fake_composer(HashMap::new());
        let compositor = Compositor::new(
            Box::new(composer),
            events,
            Arc::new(SystemClock::new()),
            CompositorConfig::default(),
        );
        compositor.shared()
    }

    #[test]
    fn text_dump_has_all_sections() {
        let shared = test_shared();
        {
            let mut st = shared.lock();
            let _ = st.layers.create("status-bar", None).unwrap();
        }
        let dump = dump_text(&shared, DEFAULT_LOCK_TIMEOUT);
        assert!(dump.contains("scheduler:"));
        assert!(dump.contains("transactions:"));
        assert!(dump.contains("layers (1):"));
        assert!(dump.contains("status-bar"));
    }

    #[test]
    fn json_dump_is_complete() {
        let shared = test_shared();
        let value = dump_json(&shared, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(value["partial"], false);
        assert!(value["scheduler"]["cycle"].is_u64());
        assert!(value["layers"].is_array());
    }

    #[test]
    fn held_lock_yields_partial_dump() {
        let shared = test_shared();
        let guard = shared.lock();
        let dump = dump_text(&shared, Duration::from_millis(20));
        assert!(dump.contains("PARTIAL DUMP"), "dump must not hang: {dump}");
        let value = dump_json(&shared, Duration::from_millis(20));
        assert_eq!(value["partial"], true);
        drop(guard);
    }
}
