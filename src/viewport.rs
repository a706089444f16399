//! Viewport visibility filter — grid-indexed culling of off-screen entities.
//!
//! DESIGN
//! ======
//! The board can hold orders of magnitude more entities than fit on screen, so
//! the visible-set query must not scan the whole map. A uniform grid index
//! (cell -> entity ids) is maintained incrementally from entity bounds; a
//! query walks only the cells under the visible rectangle plus margin, then
//! verifies precise intersection against cached bounds. Entities spanning
//! more cells than a fixed cap are kept out of the grid and checked directly
//! on every query, so a finite-but-vast extent costs one comparison instead
//! of an unbounded cell expansion.
//!
//! Two exceptions are always included regardless of bounds: entities the
//! local client has selected and entities under an active local gesture.
//! Both keep manipulation handles attached while the user scrolls them
//! off-screen mid-interaction.

#[cfg(test)]
#[path = "viewport_test.rs"]
mod viewport_test;

use std::collections::{HashMap, HashSet};

use crate::entity::{Entity, EntityId};

// =============================================================================
// GEOMETRY
// =============================================================================

/// Axis-aligned rectangle in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Grow the rectangle by `margin` on every side.
    #[must_use]
    pub fn expand(&self, margin: f64) -> Self {
        Self {
            x: self.x - margin,
            y: self.y - margin,
            width: self.width + 2.0 * margin,
            height: self.height + 2.0 * margin,
        }
    }

    /// Whether two rectangles overlap (closed edges).
    #[must_use]
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x <= other.x + other.width
            && other.x <= self.x + self.width
            && self.y <= other.y + other.height
            && other.y <= self.y + self.height
    }
}

/// World-space axis-aligned bounds of an entity, accounting for rotation.
#[must_use]
pub fn entity_bounds(entity: &Entity) -> Rect {
    if entity.rotation == 0.0 {
        return Rect::new(entity.x, entity.y, entity.width, entity.height);
    }
    let theta = entity.rotation.to_radians();
    let (sin, cos) = (theta.sin().abs(), theta.cos().abs());
    let hw = entity.width / 2.0;
    let hh = entity.height / 2.0;
    let half_w = hw * cos + hh * sin;
    let half_h = hw * sin + hh * cos;
    let cx = entity.x + hw;
    let cy = entity.y + hh;
    Rect::new(cx - half_w, cy - half_h, 2.0 * half_w, 2.0 * half_h)
}

// =============================================================================
// SPATIAL INDEX
// =============================================================================

/// Cap on grid cells occupied by one entity. Bounds spanning more cells than
/// this are tracked in the oversized set and checked on every query instead;
/// without the cap, a finite-but-vast extent would expand into billions of
/// cell keys (or overflow the span arithmetic outright).
const MAX_CELLS_PER_ENTITY: i128 = 4096;

/// Uniform grid index over entity bounds.
pub struct SpatialIndex {
    cell: f64,
    cells: HashMap<(i64, i64), HashSet<EntityId>>,
    /// Entities whose bounds exceed the per-entity cell cap.
    oversized: HashSet<EntityId>,
    bounds: HashMap<EntityId, Rect>,
}

impl SpatialIndex {
    /// # Panics
    ///
    /// Panics if `cell` is not a positive finite number.
    #[must_use]
    pub fn new(cell: f64) -> Self {
        assert!(cell.is_finite() && cell > 0.0, "grid cell must be positive");
        Self {
            cell,
            cells: HashMap::new(),
            oversized: HashSet::new(),
            bounds: HashMap::new(),
        }
    }

    /// Insert or reposition an entity. A no-op when bounds are unchanged.
    pub fn insert(&mut self, entity: &Entity) {
        let rect = entity_bounds(entity);
        if self.bounds.get(&entity.id) == Some(&rect) {
            return;
        }
        self.remove(&entity.id);
        match self.cell_keys(&rect) {
            Some(keys) => {
                for key in keys {
                    self.cells.entry(key).or_default().insert(entity.id);
                }
            }
            None => {
                self.oversized.insert(entity.id);
            }
        }
        self.bounds.insert(entity.id, rect);
    }

    /// Remove an entity from the index.
    pub fn remove(&mut self, id: &EntityId) {
        let Some(rect) = self.bounds.remove(id) else {
            return;
        };
        if self.oversized.remove(id) {
            return;
        }
        let Some(keys) = self.cell_keys(&rect) else {
            return;
        };
        for key in keys {
            if let Some(ids) = self.cells.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.cells.remove(&key);
                }
            }
        }
    }

    /// Reconcile the index against the current entity set: stale ids are
    /// evicted, new or moved entities are (re)inserted.
    pub fn sync(&mut self, entities: &HashMap<EntityId, Entity>) {
        let stale: Vec<EntityId> = self
            .bounds
            .keys()
            .filter(|id| !entities.contains_key(*id))
            .copied()
            .collect();
        for id in stale {
            self.remove(&id);
        }
        for entity in entities.values() {
            self.insert(entity);
        }
    }

    /// Ids whose bounds intersect `region`. Cost is proportional to the cells
    /// under the region and the entities in them, not the total entity count.
    #[must_use]
    pub fn query(&self, region: &Rect) -> HashSet<EntityId> {
        let mut out = HashSet::new();
        let Some(keys) = self.cell_keys(region) else {
            // Region itself exceeds the cell cap: scan bounds directly.
            for (id, bounds) in &self.bounds {
                if bounds.intersects(region) {
                    out.insert(*id);
                }
            }
            return out;
        };
        for key in keys {
            let Some(ids) = self.cells.get(&key) else {
                continue;
            };
            for id in ids {
                if let Some(bounds) = self.bounds.get(id) {
                    if bounds.intersects(region) {
                        out.insert(*id);
                    }
                }
            }
        }
        for id in &self.oversized {
            if let Some(bounds) = self.bounds.get(id) {
                if bounds.intersects(region) {
                    out.insert(*id);
                }
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Cell keys under `rect`, or `None` when the rect spans more cells than
    /// the per-entity cap. Coordinate casts saturate and the span math runs
    /// wide, so extreme-but-finite geometry can never overflow here.
    #[allow(clippy::cast_possible_truncation)]
    fn cell_keys(&self, rect: &Rect) -> Option<Vec<(i64, i64)>> {
        let x0 = (rect.x / self.cell).floor() as i64;
        let y0 = (rect.y / self.cell).floor() as i64;
        let x1 = ((rect.x + rect.width) / self.cell).floor() as i64;
        let y1 = ((rect.y + rect.height) / self.cell).floor() as i64;
        let span_x = i128::from(x1.saturating_sub(x0)) + 1;
        let span_y = i128::from(y1.saturating_sub(y0)) + 1;
        if span_x * span_y > MAX_CELLS_PER_ENTITY {
            return None;
        }
        let mut keys = Vec::with_capacity((span_x * span_y) as usize);
        for cx in x0..=x1 {
            for cy in y0..=y1 {
                keys.push((cx, cy));
            }
        }
        Some(keys)
    }
}

// =============================================================================
// FILTER
// =============================================================================

/// Visibility filter over a maintained spatial index.
pub struct ViewportFilter {
    index: SpatialIndex,
    margin: f64,
}

impl ViewportFilter {
    #[must_use]
    pub fn new(cell: f64, margin: f64) -> Self {
        Self { index: SpatialIndex::new(cell), margin }
    }

    /// Keep the index in step with the reconciled entity set.
    pub fn sync(&mut self, entities: &HashMap<EntityId, Entity>) {
        self.index.sync(entities);
    }

    /// The working set for `view`: every entity whose bounds intersect the
    /// view plus margin, plus every locally-selected or locally-dragged
    /// entity that still exists.
    #[must_use]
    pub fn visible_set(
        &self,
        entities: &HashMap<EntityId, Entity>,
        view: &Rect,
        selected: &HashSet<EntityId>,
        dragging: &HashSet<EntityId>,
    ) -> HashSet<EntityId> {
        let region = view.expand(self.margin);
        let mut out = self.index.query(&region);
        for id in selected.iter().chain(dragging) {
            if entities.contains_key(id) {
                out.insert(*id);
            }
        }
        out
    }
}
