//! Group transform bookkeeping for multi-entity drag gestures.
//!
//! DESIGN
//! ======
//! On gesture start, every selected entity's offset from the anchor (the
//! entity under the pointer) is recorded once. Every subsequent move applies
//! the same offsets to the anchor's target position, so the group moves
//! rigidly no matter which member the user grabbed.
//!
//! This type is pure state: broadcasting previews, committing the batch
//! update, and throttling all live in the client. A member deleted remotely
//! mid-gesture is pruned rather than crashing the gesture; losing the anchor
//! aborts the whole gesture.

#[cfg(test)]
#[path = "transform_test.rs"]
mod transform_test;

use std::collections::HashMap;

use crate::entity::{Entity, EntityId};

/// An active multi-entity drag gesture.
#[derive(Debug, Clone)]
pub struct GroupDrag {
    anchor: EntityId,
    /// Member offsets `(dx, dy)` relative to the anchor's position at start.
    offsets: HashMap<EntityId, (f64, f64)>,
}

impl GroupDrag {
    /// Start a gesture dragging `anchor` together with `members`. The anchor
    /// is always part of the gesture. Returns `None` if the anchor doesn't
    /// exist; members that don't exist are skipped.
    #[must_use]
    pub fn begin(
        anchor: EntityId,
        members: impl IntoIterator<Item = EntityId>,
        entities: &HashMap<EntityId, Entity>,
    ) -> Option<Self> {
        let origin = entities.get(&anchor)?;
        let (ox, oy) = (origin.x, origin.y);

        let mut offsets = HashMap::new();
        offsets.insert(anchor, (0.0, 0.0));
        for id in members {
            if let Some(e) = entities.get(&id) {
                offsets.insert(id, (e.x - ox, e.y - oy));
            }
        }
        Some(Self { anchor, offsets })
    }

    /// The entity the user is directly manipulating.
    #[must_use]
    pub fn anchor(&self) -> EntityId {
        self.anchor
    }

    /// Ids participating in the gesture.
    pub fn members(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.offsets.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Member positions when the anchor sits at `(anchor_x, anchor_y)`.
    #[must_use]
    pub fn positions_at(&self, anchor_x: f64, anchor_y: f64) -> Vec<(EntityId, f64, f64)> {
        self.offsets
            .iter()
            .map(|(id, (dx, dy))| (*id, anchor_x + dx, anchor_y + dy))
            .collect()
    }

    /// Drop members that no longer exist (deleted remotely mid-gesture).
    /// Returns `false` when the gesture is dead: the anchor itself is gone.
    pub fn prune(&mut self, entities: &HashMap<EntityId, Entity>) -> bool {
        if !entities.contains_key(&self.anchor) {
            return false;
        }
        self.offsets.retain(|id, _| entities.contains_key(id));
        true
    }
}
