//! Spatial hash grid for broad-phase proximity queries
//!
//! Divides the world into uniform cells. Each entity is bucketed into every
//! cell its hitbox overlaps and remembers those cells, so remove/update cost
//! O(cells occupied) instead of a grid scan. Used both for collision pairs
//! and for per-client visibility queries.

use hashbrown::{HashMap, HashSet};
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::game::id_alloc::EntityId;
use crate::util::vec2::Vec2;

// ============================================================================
// Entity Spatial Grid Constants
// ============================================================================

/// Default cell size (world units). A typical entity spans at most 4 cells.
pub const ENTITY_GRID_CELL_SIZE: f32 = 256.0;

/// Initial capacity for grid cells (number of expected non-empty cells)
const ENTITY_GRID_INITIAL_CAPACITY: usize = 256;

/// Initial capacity for entity vectors within cells
const ENTITY_CELL_INITIAL_CAPACITY: usize = 8;

/// Grid cell key - (x, y) cell coordinates
pub type CellKey = (i32, i32);

/// Set of entity ids, hashed with FxHasher (keys are small integers)
pub type IdSet = HashSet<EntityId, FxBuildHasher>;

/// Cells an entity currently occupies (inline up to 4)
pub type CellList = SmallVec<[CellKey; 4]>;

// ============================================================================
// Shapes
// ============================================================================

/// Collision / visibility shape. Circle or axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Hitbox {
    Circle { center: Vec2, radius: f32 },
    Rect { min: Vec2, max: Vec2 },
}

/// Query regions use the same shapes as hitboxes
pub type Region = Hitbox;

impl Hitbox {
    pub fn circle(center: Vec2, radius: f32) -> Self {
        Hitbox::Circle {
            center,
            radius: radius.max(0.0),
        }
    }

    /// Rectangle from its center and half extents
    pub fn rect(center: Vec2, half_extents: Vec2) -> Self {
        let half = half_extents.max(Vec2::ZERO);
        Hitbox::Rect {
            min: center - half,
            max: center + half,
        }
    }

    pub fn center(&self) -> Vec2 {
        match *self {
            Hitbox::Circle { center, .. } => center,
            Hitbox::Rect { min, max } => (min + max) * 0.5,
        }
    }

    /// Same shape translated so its center is `center`
    pub fn moved_to(&self, center: Vec2) -> Self {
        match *self {
            Hitbox::Circle { radius, .. } => Hitbox::Circle { center, radius },
            Hitbox::Rect { min, max } => Hitbox::rect(center, (max - min) * 0.5),
        }
    }

    /// Bounding box as (min, max)
    pub fn bounds(&self) -> (Vec2, Vec2) {
        match *self {
            Hitbox::Circle { center, radius } => {
                (center - Vec2::splat(radius), center + Vec2::splat(radius))
            }
            Hitbox::Rect { min, max } => (min, max),
        }
    }

    /// Inclusive overlap test: shapes that merely touch overlap
    pub fn overlaps(&self, other: &Hitbox) -> bool {
        match (*self, *other) {
            (Hitbox::Circle { center: a, radius: ra }, Hitbox::Circle { center: b, radius: rb }) => {
                let reach = ra + rb;
                a.distance_sq_to(b) <= reach * reach
            }
            (Hitbox::Circle { center, radius }, Hitbox::Rect { min, max })
            | (Hitbox::Rect { min, max }, Hitbox::Circle { center, radius }) => {
                center.distance_sq_to(center.clamp(min, max)) <= radius * radius
            }
            (Hitbox::Rect { min: amin, max: amax }, Hitbox::Rect { min: bmin, max: bmax }) => {
                amin.x <= bmax.x && bmin.x <= amax.x && amin.y <= bmax.y && bmin.y <= amax.y
            }
        }
    }

    /// Minimum translation that moves `self` out of `other`.
    ///
    /// Returns `None` when the shapes do not strictly intersect (touching
    /// shapes need no separation).
    pub fn penetration(&self, other: &Hitbox) -> Option<Vec2> {
        match (*self, *other) {
            (Hitbox::Circle { center: a, radius: ra }, Hitbox::Circle { center: b, radius: rb }) => {
                let delta = a - b;
                let dist_sq = delta.length_sq();
                let reach = ra + rb;
                if dist_sq >= reach * reach {
                    return None;
                }
                let dist = dist_sq.sqrt();
                // concentric circles: push along +x
                let normal = if dist > 0.0 { delta * (1.0 / dist) } else { Vec2::RIGHT };
                Some(normal * (reach - dist))
            }
            (Hitbox::Circle { center, radius }, Hitbox::Rect { min, max }) => {
                circle_rect_penetration(center, radius, min, max)
            }
            (Hitbox::Rect { min, max }, Hitbox::Circle { center, radius }) => {
                circle_rect_penetration(center, radius, min, max).map(|v| -v)
            }
            (Hitbox::Rect { min: amin, max: amax }, Hitbox::Rect { min: bmin, max: bmax }) => {
                let overlap_x = amax.x.min(bmax.x) - amin.x.max(bmin.x);
                let overlap_y = amax.y.min(bmax.y) - amin.y.max(bmin.y);
                if overlap_x <= 0.0 || overlap_y <= 0.0 {
                    return None;
                }
                let a_center = (amin + amax) * 0.5;
                let b_center = (bmin + bmax) * 0.5;
                // resolve along the axis of least overlap
                if overlap_x < overlap_y {
                    let sign = if a_center.x < b_center.x { -1.0 } else { 1.0 };
                    Some(Vec2::new(overlap_x * sign, 0.0))
                } else {
                    let sign = if a_center.y < b_center.y { -1.0 } else { 1.0 };
                    Some(Vec2::new(0.0, overlap_y * sign))
                }
            }
        }
    }
}

/// Vector that pushes the circle out of the rectangle
fn circle_rect_penetration(center: Vec2, radius: f32, min: Vec2, max: Vec2) -> Option<Vec2> {
    let closest = center.clamp(min, max);
    let delta = center - closest;
    let dist_sq = delta.length_sq();

    if dist_sq > 0.0 {
        if dist_sq >= radius * radius {
            return None;
        }
        let dist = dist_sq.sqrt();
        return Some(delta * ((radius - dist) / dist));
    }

    // center inside the rect: exit through the nearest edge
    let exits = [
        (center.x - min.x, Vec2::new(-1.0, 0.0)),
        (max.x - center.x, Vec2::new(1.0, 0.0)),
        (center.y - min.y, Vec2::new(0.0, -1.0)),
        (max.y - center.y, Vec2::new(0.0, 1.0)),
    ];
    let (depth, normal) = exits
        .into_iter()
        .fold((f32::INFINITY, Vec2::ZERO), |best, exit| if exit.0 < best.0 { exit } else { best });
    Some(normal * (depth + radius))
}

// ============================================================================
// Grid
// ============================================================================

/// Per-entity bookkeeping kept by the grid
#[derive(Debug, Clone)]
struct GridEntry {
    hitbox: Hitbox,
    cells: CellList,
}

/// Spatial hash grid keyed by entity id
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    /// Cell size in world units
    cell_size: f32,
    /// Inverse cell size for fast position-to-cell conversion
    inv_cell_size: f32,
    /// Map from cell key to entities overlapping that cell
    cells: HashMap<CellKey, Vec<EntityId>>,
    /// Hitbox and occupied cells of every resident entity
    entries: HashMap<EntityId, GridEntry, FxBuildHasher>,
}

impl SpatialGrid {
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size > 0.0 { cell_size } else { ENTITY_GRID_CELL_SIZE };
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::with_capacity(ENTITY_GRID_INITIAL_CAPACITY),
            entries: HashMap::default(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Convert world position to cell key
    #[inline]
    fn position_to_cell(&self, position: Vec2) -> CellKey {
        (
            (position.x * self.inv_cell_size).floor() as i32,
            (position.y * self.inv_cell_size).floor() as i32,
        )
    }

    /// Inclusive range of cells touched by a shape's bounding box
    #[inline]
    fn cell_range(&self, shape: &Hitbox) -> (CellKey, CellKey) {
        let (min, max) = shape.bounds();
        (self.position_to_cell(min), self.position_to_cell(max))
    }

    fn cell_rect(&self, (cx, cy): CellKey) -> Hitbox {
        let min = Vec2::new(cx as f32 * self.cell_size, cy as f32 * self.cell_size);
        Hitbox::Rect {
            min,
            max: min + Vec2::splat(self.cell_size),
        }
    }

    /// Exactly the cells the hitbox overlaps (circles skip bounding-box corners)
    fn cells_for(&self, hitbox: &Hitbox) -> CellList {
        let ((x0, y0), (x1, y1)) = self.cell_range(hitbox);
        let mut cells = CellList::new();
        for cy in y0..=y1 {
            for cx in x0..=x1 {
                let key = (cx, cy);
                let keep = match hitbox {
                    Hitbox::Rect { .. } => true,
                    Hitbox::Circle { .. } => hitbox.overlaps(&self.cell_rect(key)),
                };
                if keep {
                    cells.push(key);
                }
            }
        }
        cells
    }

    fn link(&mut self, id: EntityId, cells: &[CellKey]) {
        for &key in cells {
            self.cells
                .entry(key)
                .or_insert_with(|| Vec::with_capacity(ENTITY_CELL_INITIAL_CAPACITY))
                .push(id);
        }
    }

    fn unlink(&mut self, id: EntityId, cells: &[CellKey]) {
        for key in cells {
            if let Some(cell) = self.cells.get_mut(key) {
                if let Some(idx) = cell.iter().position(|&other| other == id) {
                    cell.swap_remove(idx);
                }
                if cell.is_empty() {
                    self.cells.remove(key);
                }
            }
        }
    }

    /// Insert an entity. Inserting an id that is already resident re-buckets it.
    pub fn insert(&mut self, id: EntityId, hitbox: Hitbox) {
        if self.entries.contains_key(&id) {
            self.update(id, hitbox);
            return;
        }
        let cells = self.cells_for(&hitbox);
        self.link(id, &cells);
        self.entries.insert(id, GridEntry { hitbox, cells });
    }

    /// Remove an entity. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: EntityId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.unlink(id, &entry.cells);
                true
            }
            None => false,
        }
    }

    /// Re-bucket after a position or hitbox change.
    ///
    /// Cell membership is only touched when the occupied-cell set changes.
    pub fn update(&mut self, id: EntityId, hitbox: Hitbox) {
        let new_cells = self.cells_for(&hitbox);
        let Some(entry) = self.entries.get_mut(&id) else {
            self.link(id, &new_cells);
            self.entries.insert(id, GridEntry { hitbox, cells: new_cells });
            return;
        };

        entry.hitbox = hitbox;
        if entry.cells == new_cells {
            return;
        }
        let old_cells = std::mem::replace(&mut entry.cells, new_cells.clone());

        let stale: CellList = old_cells.iter().copied().filter(|c| !new_cells.contains(c)).collect();
        let fresh: CellList = new_cells.iter().copied().filter(|c| !old_cells.contains(c)).collect();
        self.unlink(id, &stale);
        self.link(id, &fresh);
    }

    /// Every entity whose hitbox overlaps `region` (touching included)
    pub fn query(&self, region: &Region) -> IdSet {
        let mut found = IdSet::default();
        self.query_into(region, &mut found);
        found
    }

    /// Same as [`query`](Self::query) but reuses the caller's set (cleared first)
    pub fn query_into(&self, region: &Region, found: &mut IdSet) {
        found.clear();
        if self.entries.is_empty() {
            return;
        }
        let ((x0, y0), (x1, y1)) = self.cell_range(region);
        for cy in y0..=y1 {
            for cx in x0..=x1 {
                let Some(cell) = self.cells.get(&(cx, cy)) else {
                    continue;
                };
                for &id in cell {
                    if found.contains(&id) {
                        continue;
                    }
                    if let Some(entry) = self.entries.get(&id) {
                        if entry.hitbox.overlaps(region) {
                            found.insert(id);
                        }
                    }
                }
            }
        }
    }

    /// Process each overlapping pair once, with the penetration of `a` into `b`
    ///
    /// Pairs that only touch are reported with a zero vector.
    pub fn for_each_overlapping_pair<F>(&self, mut callback: F)
    where
        F: FnMut(EntityId, EntityId, Vec2),
    {
        let mut seen: HashSet<(EntityId, EntityId), FxBuildHasher> = HashSet::default();
        for entities in self.cells.values() {
            for i in 0..entities.len() {
                for j in (i + 1)..entities.len() {
                    let (a, b) = if entities[i] < entities[j] {
                        (entities[i], entities[j])
                    } else {
                        (entities[j], entities[i])
                    };
                    if !seen.insert((a, b)) {
                        continue;
                    }
                    let (Some(ea), Some(eb)) = (self.entries.get(&a), self.entries.get(&b)) else {
                        continue;
                    };
                    if ea.hitbox.overlaps(&eb.hitbox) {
                        let push = ea.hitbox.penetration(&eb.hitbox).unwrap_or(Vec2::ZERO);
                        callback(a, b, push);
                    }
                }
            }
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn hitbox(&self, id: EntityId) -> Option<Hitbox> {
        self.entries.get(&id).map(|e| e.hitbox)
    }

    /// Cells currently occupied by `id` (empty if absent)
    pub fn cells_of(&self, id: EntityId) -> &[CellKey] {
        self.entries.get(&id).map_or(&[], |e| e.cells.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All resident ids in ascending order (the live-entity list for simulation)
    pub fn ids_sorted(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Get statistics about the grid
    pub fn stats(&self) -> SpatialGridStats {
        SpatialGridStats {
            non_empty_cells: self.cells.len(),
            total_entities: self.entries.len(),
            max_per_cell: self.cells.values().map(|c| c.len()).max().unwrap_or(0),
        }
    }
}

impl Default for SpatialGrid {
    fn default() -> Self {
        Self::new(ENTITY_GRID_CELL_SIZE)
    }
}

/// Statistics about the spatial grid
#[derive(Debug, Clone)]
pub struct SpatialGridStats {
    pub non_empty_cells: usize,
    pub total_entities: usize,
    pub max_per_cell: usize,
}
