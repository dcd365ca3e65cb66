// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Generational layer storage.
//!
//! Layers live in slots addressed by [`LayerId`], a pair of slot index and
//! generation. Removing a layer bumps the slot's generation and pushes the
//! index onto a free list, so a stale id can never silently alias a layer
//! that later reuses the slot: lookups with a stale id return `None`, and
//! [`LayerArena::validate`] panics with a diagnostic.

use super::Layer;

/// Handle to a layer in a [`LayerArena`].
///
/// Ids are plain copyable data. They become stale when the layer is
/// removed and are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId {
    idx: u32,
    generation: u32,
}

impl LayerId {
    /// Slot index, for dumps.
    #[must_use]
    pub fn index(self) -> u32 {
        self.idx
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    layer: Option<Layer>,
}

/// Slot arena holding every live layer.
#[derive(Debug, Default)]
pub struct LayerArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl LayerArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a layer and returns its id.
    pub fn insert(&mut self, layer: Layer) -> LayerId {
        self.len += 1;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            debug_assert!(slot.layer.is_none(), "free-listed slot must be vacant");
            slot.layer = Some(layer);
            LayerId {
                idx,
                generation: slot.generation,
            }
        } else {
            let idx = u32::try_from(self.slots.len()).expect("layer count fits in u32");
            self.slots.push(Slot {
                generation: 0,
                layer: Some(layer),
            });
            LayerId { idx, generation: 0 }
        }
    }

    /// Removes a layer, invalidating its id.
    ///
    /// Returns `None` if the id is stale.
    pub fn remove(&mut self, id: LayerId) -> Option<Layer> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let layer = slot.layer.take()?;
        slot.generation += 1;
        self.free.push(id.idx);
        self.len -= 1;
        Some(layer)
    }

    /// Looks up a layer.
    #[must_use]
    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        let slot = self.slots.get(id.idx as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.layer.as_ref()
    }

    /// Looks up a layer mutably.
    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        let slot = self.slots.get_mut(id.idx as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.layer.as_mut()
    }

    /// Whether `id` refers to a live layer.
    #[must_use]
    pub fn contains(&self, id: LayerId) -> bool {
        self.get(id).is_some()
    }

    /// Panics with a diagnostic if `id` is stale.
    ///
    /// Used at entry points that must never be handed a dead layer.
    pub fn validate(&self, id: LayerId) {
        assert!(
            self.contains(id),
            "stale layer id: slot {} generation {}",
            id.idx,
            id.generation
        );
    }

    /// Iterates over all live layers with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &Layer)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            let layer = slot.layer.as_ref()?;
            #[expect(clippy::cast_possible_truncation, reason = "insert bounds idx to u32")]
            let id = LayerId {
                idx: idx as u32,
                generation: slot.generation,
            };
            Some((id, layer))
        })
    }

    /// Iterates mutably over all live layers with their ids.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (LayerId, &mut Layer)> {
        self.slots.iter_mut().enumerate().filter_map(|(idx, slot)| {
            let layer = slot.layer.as_mut()?;
            #[expect(clippy::cast_possible_truncation, reason = "insert bounds idx to u32")]
            let id = LayerId {
                idx: idx as u32,
                generation: slot.generation,
            };
            Some((id, layer))
        })
    }

    /// Ids of all live layers, in slot order.
    #[must_use]
    pub fn ids(&self) -> Vec<LayerId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Layer, TextureHandle};

    fn layer(name: &str) -> Layer {
        Layer::new(1, name, TextureHandle(0))
    }

    #[test]
    fn insert_and_lookup() {
        let mut arena = LayerArena::new();
        let id = arena.insert(layer("status-bar"));
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(id).unwrap().name, "status-bar");
    }

    #[test]
    fn stale_id_misses_after_slot_reuse() {
        let mut arena = LayerArena::new();
        let a = arena.insert(layer("a"));
        arena.remove(a).unwrap();
        let b = arena.insert(layer("b"));
        assert_eq!(a.index(), b.index(), "slot is reused");
        assert!(
            arena.get(a).is_none(),
            "stale id must not alias the new layer"
        );
        assert_eq!(arena.get(b).unwrap().name, "b");
    }

    #[test]
    fn remove_with_stale_id_is_none() {
        let mut arena = LayerArena::new();
        let a = arena.insert(layer("a"));
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    #[should_panic(expected = "stale layer id")]
    fn validate_panics_on_stale_id() {
        let mut arena = LayerArena::new();
        let a = arena.insert(layer("a"));
        arena.remove(a).unwrap();
        arena.validate(a);
    }

    #[test]
    fn iter_skips_vacant_slots() {
        let mut arena = LayerArena::new();
        let a = arena.insert(layer("a"));
        let _b = arena.insert(layer("b"));
        arena.remove(a).unwrap();
        let names: Vec<_> = arena.iter().map(|(_, l)| l.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }
}
