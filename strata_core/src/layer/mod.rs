// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Layers: the units of composition.
//!
//! A layer pairs client-settable properties (double-buffered, see
//! [`LayerProps`]) with a queue of produced frames ([`FrameQueue`]). Layers
//! form a tree through explicit non-owning parent back-ids; mirrors carry a
//! `clone_of` tag instead of a second ownership edge.
//!
//! [`LayerMap`] owns every layer in a generational arena and implements the
//! lifecycle rules: creation through a factory that assigns the unique
//! sequence number, name and pooled texture handle; release of the client
//! handle; retention of released-but-parented layers; and the sweep that
//! moves unreachable subtrees into the offscreen set, where queued frames
//! are drained without ever reaching the screen.

mod arena;
mod frames;
mod props;

use std::sync::{Arc, Mutex};

use tracing::debug;

pub use arena::{LayerArena, LayerId};
pub use frames::{BufferId, FrameQueue, LatchResult, QueuedFrame};
pub use props::LayerProps;

use crate::config::FrameRateVote;
use crate::error::{Result, Status};
use crate::time::HostTime;

/// Handle to a pooled composition texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

#[derive(Debug, Default)]
struct PoolInner {
    next: u32,
    free: Vec<u32>,
}

/// Pooled texture-handle allocator.
///
/// Has its own lock so layer creation never contends with the composition
/// state lock.
#[derive(Debug, Default)]
pub struct TexturePool {
    inner: Mutex<PoolInner>,
}

impl TexturePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a handle, reusing a returned one when available.
    pub fn acquire(&self) -> TextureHandle {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(id) = inner.free.pop() {
            TextureHandle(id)
        } else {
            let id = inner.next;
            inner.next += 1;
            TextureHandle(id)
        }
    }

    /// Returns a handle to the pool.
    pub fn release(&self, handle: TextureHandle) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug_assert!(!inner.free.contains(&handle.0), "double release of texture");
        inner.free.push(handle.0);
    }
}

/// One composition layer.
#[derive(Debug)]
pub struct Layer {
    /// Process-unique, monotonically assigned at creation.
    pub sequence: u64,
    /// Debug name; unique per creation (the factory suffixes duplicates).
    pub name: String,
    /// Pooled texture backing this layer's content.
    pub texture: TextureHandle,
    /// Non-owning back-reference to the parent, if any.
    pub parent: Option<LayerId>,
    /// For mirror layers, the layer whose content this one shows.
    pub clone_of: Option<LayerId>,
    /// Producer-facing property set, mutated by committed transactions.
    pub current: LayerProps,
    /// Main-thread snapshot used for composition.
    pub drawing: LayerProps,
    /// Children visible to composition.
    pub children: Vec<LayerId>,
    /// Children added since the last commit.
    pub pending_children: Vec<LayerId>,
    /// Produced frames awaiting latch.
    pub frames: FrameQueue,
    /// Unreachable from any display; frames drain without showing.
    pub offscreen: bool,
    /// The client released its handle.
    pub handle_released: bool,
}

impl Layer {
    /// Creates a bare layer. Prefer [`LayerMap::create`], which assigns the
    /// sequence number and texture.
    #[must_use]
    pub fn new(sequence: u64, name: &str, texture: TextureHandle) -> Self {
        Self {
            sequence,
            name: name.to_owned(),
            texture,
            parent: None,
            clone_of: None,
            current: LayerProps::default(),
            drawing: LayerProps::default(),
            children: Vec::new(),
            pending_children: Vec::new(),
            frames: FrameQueue::new(),
            offscreen: false,
            handle_released: false,
        }
    }

    /// Copies the current property set over the drawing snapshot and folds
    /// pending children in.
    pub fn commit(&mut self) {
        self.children.append(&mut self.pending_children);
        self.drawing = self.current.clone();
    }
}

/// What one whole-arena latch pass produced.
#[derive(Debug, Default)]
pub struct LatchOutcome {
    /// Layers that took new content this cycle, with the frame number.
    pub latched: Vec<(LayerId, u64)>,
    /// Some queue holds frames that could not latch yet (future timestamp
    /// or pending fence); a follow-up cycle should be scheduled.
    pub retry_needed: bool,
}

impl LatchOutcome {
    /// Whether any layer produced new content.
    #[must_use]
    pub fn latched_any(&self) -> bool {
        !self.latched.is_empty()
    }
}

/// Owner of all layers plus the lifecycle bookkeeping.
#[derive(Debug)]
pub struct LayerMap {
    arena: LayerArena,
    offscreen: Vec<LayerId>,
    next_sequence: u64,
    textures: Arc<TexturePool>,
}

impl LayerMap {
    /// Creates an empty map with its own texture pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: LayerArena::new(),
            offscreen: Vec::new(),
            next_sequence: 1,
            textures: Arc::new(TexturePool::new()),
        }
    }

    /// The underlying arena, read-only.
    #[must_use]
    pub fn arena(&self) -> &LayerArena {
        &self.arena
    }

    /// Looks up a layer.
    #[must_use]
    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.arena.get(id)
    }

    /// Looks up a layer mutably.
    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.arena.get_mut(id)
    }

    /// Ids currently in the offscreen set.
    #[must_use]
    pub fn offscreen_ids(&self) -> &[LayerId] {
        &self.offscreen
    }

    /// Creates a layer, optionally parented.
    ///
    /// The new layer appears in the parent's pending-children list and
    /// becomes visible to composition at the next commit.
    pub fn create(&mut self, name: &str, parent: Option<LayerId>) -> Result<LayerId> {
        if let Some(p) = parent {
            if !self.arena.contains(p) {
                return Err(Status::NoSuchLayer);
            }
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let unique_name = format!("{name}#{sequence}");
        let texture = self.textures.acquire();
        let mut layer = Layer::new(sequence, &unique_name, texture);
        layer.parent = parent;
        let id = self.arena.insert(layer);
        if let Some(p) = parent {
            let parent_layer = self
                .arena
                .get_mut(p)
                .expect("parent existence checked above");
            parent_layer.pending_children.push(id);
        }
        Ok(id)
    }

    /// Creates a mirror of `source`: a layer that composes `source`'s
    /// content without owning it.
    pub fn create_mirror(&mut self, name: &str, source: LayerId) -> Result<LayerId> {
        if !self.arena.contains(source) {
            return Err(Status::NoSuchLayer);
        }
        let id = self.create(name, None)?;
        self.arena
            .get_mut(id)
            .expect("freshly created layer is live")
            .clone_of = Some(source);
        Ok(id)
    }

    /// Marks the client handle released and sweeps newly unreachable
    /// subtrees into the offscreen set.
    ///
    /// A released layer that still has a live on-screen parent is retained;
    /// it goes offscreen only once the parent chain releases.
    pub fn release_handle(&mut self, id: LayerId) -> Result<()> {
        let layer = self.arena.get_mut(id).ok_or(Status::NoSuchLayer)?;
        layer.handle_released = true;
        self.sweep();
        Ok(())
    }

    fn sweep(&mut self) {
        // Released layers with no live on-screen parent move offscreen,
        // along with their whole subtree. Iterate to a fixpoint since one
        // sweep can orphan further layers.
        loop {
            let mut roots = Vec::new();
            for (id, layer) in self.arena.iter() {
                if layer.offscreen || !layer.handle_released {
                    continue;
                }
                let parent_on_screen = layer
                    .parent
                    .and_then(|p| self.arena.get(p))
                    .is_some_and(|p| !p.offscreen);
                if !parent_on_screen {
                    roots.push(id);
                }
            }
            if roots.is_empty() {
                break;
            }
            for root in roots {
                self.mark_offscreen(root);
            }
        }
    }

    fn mark_offscreen(&mut self, root: LayerId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(layer) = self.arena.get_mut(id) else {
                continue;
            };
            if layer.offscreen {
                continue;
            }
            layer.offscreen = true;
            stack.extend(layer.children.iter().copied());
            stack.extend(layer.pending_children.iter().copied());
            debug!(name = %layer.name, "layer moved offscreen");
            self.offscreen.push(id);
        }
        // Detach the root from its (possibly still live) parent.
        if let Some(parent) = self.arena.get(root).and_then(|l| l.parent) {
            if let Some(p) = self.arena.get_mut(parent) {
                p.children.retain(|&c| c != root);
                p.pending_children.retain(|&c| c != root);
            }
        }
    }

    /// Commits every on-screen layer (current properties over drawing,
    /// pending children folded in).
    pub fn commit_all(&mut self) {
        for (_, layer) in self.arena.iter_mut() {
            if !layer.offscreen {
                layer.commit();
            }
        }
    }

    /// Commits offscreen layers separately, so client writes keep draining
    /// even though nothing will be shown.
    pub fn commit_offscreen(&mut self) {
        for (_, layer) in self.arena.iter_mut() {
            if layer.offscreen {
                layer.commit();
            }
        }
    }

    /// Runs the latch pass for one cycle.
    ///
    /// On-screen layers latch through [`FrameQueue::latch`]; offscreen
    /// layers drain their queues unshown. Offscreen layers whose handle is
    /// released and whose queue is empty are destroyed, returning their
    /// texture to the pool.
    pub fn latch_all(&mut self, cycle: u64, expected_present: HostTime) -> LatchOutcome {
        let mut outcome = LatchOutcome::default();
        for (id, layer) in self.arena.iter_mut() {
            if layer.offscreen {
                let _ = layer.frames.latch_and_release();
                continue;
            }
            match layer.frames.latch(cycle, expected_present) {
                LatchResult::Latched(n) => outcome.latched.push((id, n)),
                LatchResult::NotDue | LatchResult::FencePending => outcome.retry_needed = true,
                LatchResult::Empty | LatchResult::AlreadyLatched => {}
            }
        }
        self.destroy_drained_offscreen();
        outcome
    }

    fn destroy_drained_offscreen(&mut self) {
        let mut i = 0;
        while i < self.offscreen.len() {
            let id = self.offscreen[i];
            let done = self
                .arena
                .get(id)
                .is_none_or(|l| l.handle_released && l.frames.depth() == 0);
            if done {
                if let Some(layer) = self.arena.remove(id) {
                    self.textures.release(layer.texture);
                }
                self.offscreen.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Frame-rate votes of visible on-screen layers, for refresh-rate
    /// selection.
    #[must_use]
    pub fn votes(&self) -> Vec<FrameRateVote> {
        self.arena
            .iter()
            .filter(|(_, l)| !l.offscreen && l.drawing.visible())
            .map(|(_, l)| l.drawing.frame_rate)
            .filter(|v| *v != FrameRateVote::NoVote)
            .collect()
    }
}

impl Default for LayerMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::Fence;

    fn queue_signaled(map: &mut LayerMap, id: LayerId, number: u64, desired: u64) {
        map.get_mut(id).unwrap().frames.queue(QueuedFrame {
            buffer: BufferId(number),
            acquire_fence: Fence::signaled(HostTime(0)),
            desired_present: HostTime(desired),
            frame_number: number,
        });
    }

    #[test]
    fn factory_assigns_unique_names_and_sequences() {
        let mut map = LayerMap::new();
        let a = map.create("app", None).unwrap();
        let b = map.create("app", None).unwrap();
        let (la, lb) = (map.get(a).unwrap(), map.get(b).unwrap());
        assert_ne!(la.name, lb.name);
        assert_ne!(la.sequence, lb.sequence);
        assert_ne!(la.texture, lb.texture);
    }

    #[test]
    fn child_becomes_visible_at_commit() {
        let mut map = LayerMap::new();
        let parent = map.create("parent", None).unwrap();
        let child = map.create("child", Some(parent)).unwrap();
        assert!(map.get(parent).unwrap().children.is_empty());
        map.commit_all();
        assert_eq!(map.get(parent).unwrap().children, vec![child]);
    }

    #[test]
    fn create_under_dead_parent_fails() {
        let mut map = LayerMap::new();
        let parent = map.create("parent", None).unwrap();
        map.release_handle(parent).unwrap();
        // Parent went offscreen and is destroyed once drained.
        let _ = map.latch_all(1, HostTime(0));
        assert_eq!(map.create("child", Some(parent)), Err(Status::NoSuchLayer));
    }

    #[test]
    fn released_layer_with_live_parent_is_retained() {
        let mut map = LayerMap::new();
        let parent = map.create("parent", None).unwrap();
        let child = map.create("child", Some(parent)).unwrap();
        map.commit_all();

        map.release_handle(child).unwrap();
        assert!(
            !map.get(child).unwrap().offscreen,
            "parented layer is retained"
        );

        map.release_handle(parent).unwrap();
        assert!(map.get(parent).unwrap().offscreen);
        assert!(
            map.get(child).unwrap().offscreen,
            "subtree follows the root"
        );
    }

    #[test]
    fn offscreen_layers_drain_and_die() {
        let mut map = LayerMap::new();
        let a = map.create("a", None).unwrap();
        queue_signaled(&mut map, a, 1, 10);
        map.release_handle(a).unwrap();

        let outcome = map.latch_all(1, HostTime(100));
        assert!(!outcome.latched_any(), "offscreen frames never show");
        assert!(map.get(a).is_none(), "drained offscreen layer is destroyed");
        assert!(map.offscreen_ids().is_empty());
    }

    #[test]
    fn latch_pass_reports_retry_for_future_frames() {
        let mut map = LayerMap::new();
        let a = map.create("a", None).unwrap();
        queue_signaled(&mut map, a, 1, 1_000);
        let outcome = map.latch_all(1, HostTime(100));
        assert!(!outcome.latched_any());
        assert!(outcome.retry_needed);
    }

    #[test]
    fn mirror_references_source_without_ownership() {
        let mut map = LayerMap::new();
        let source = map.create("source", None).unwrap();
        let mirror = map.create_mirror("mirror", source).unwrap();
        assert_eq!(map.get(mirror).unwrap().clone_of, Some(source));
        // Releasing the mirror leaves the source untouched.
        map.release_handle(mirror).unwrap();
        assert!(!map.get(source).unwrap().offscreen);
    }

    #[test]
    fn texture_pool_reuses_released_handles() {
        let pool = TexturePool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a, b);
        pool.release(a);
        assert_eq!(pool.acquire(), a);
    }

    #[test]
    fn votes_ignore_hidden_and_offscreen_layers() {
        let mut map = LayerMap::new();
        let a = map.create("a", None).unwrap();
        let b = map.create("b", None).unwrap();
        map.get_mut(a).unwrap().current.frame_rate = FrameRateVote::Desired(90);
        map.get_mut(b).unwrap().current.frame_rate = FrameRateVote::Max;
        map.get_mut(b).unwrap().current.hidden = true;
        map.commit_all();
        assert_eq!(map.votes(), vec![FrameRateVote::Desired(90)]);
    }
}
