//! Entity arena for one game instance
//!
//! Entities live in a flat table indexed by id. The grid, the dirty sets and
//! every client's visible set refer to entities by id only, so "is this still
//! alive" is a table lookup. All mutation funnels through `World` so the
//! grid and dirty sets never drift from entity state.

use std::collections::VecDeque;

use tracing::{debug, error};

use crate::game::entity::{DirtySets, Entity, EntityKind, EntityState, EntityView};
use crate::game::id_alloc::{EntityId, IdAllocator, IdConfig, IdError};
use crate::game::spatial::{Hitbox, SpatialGrid};
use crate::net::schema::SchemaRegistry;
use crate::util::vec2::Vec2;

/// World bounds, grid resolution and id policy
#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub width: f32,
    pub height: f32,
    pub cell_size: f32,
    pub ids: IdConfig,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 4096.0,
            height: 4096.0,
            cell_size: crate::game::spatial::ENTITY_GRID_CELL_SIZE,
            ids: IdConfig::default(),
        }
    }
}

/// Misuse of the entity table. Logged at the call site, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("cannot spawn: {0}")]
    IdExhausted(#[from] IdError),
    #[error("no schema registered for {0:?}")]
    UnregisteredKind(EntityKind),
    #[error("entity {0} does not exist")]
    UnknownEntity(EntityId),
    #[error("entity {0} was destroyed")]
    Destroyed(EntityId),
    #[error("non-finite position")]
    NonFinitePosition,
}

/// Records regenerated by one serialization pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializeStats {
    pub full: usize,
    pub partial: usize,
}

/// Look up a live entity, logging misuse
fn live_mut(entities: &mut [Option<Entity>], id: EntityId) -> Result<&mut Entity, WorldError> {
    match entities.get_mut(id as usize).and_then(Option::as_mut) {
        Some(entity) if !entity.is_destroyed() => Ok(entity),
        Some(_) => {
            error!("mutation of destroyed entity {}", id);
            Err(WorldError::Destroyed(id))
        }
        None => {
            error!("mutation of unknown entity {}", id);
            Err(WorldError::UnknownEntity(id))
        }
    }
}

/// Entity table plus everything indexed by entity id
pub struct World {
    bounds_min: Vec2,
    bounds_max: Vec2,
    cell_size: f32,
    entities: Vec<Option<Entity>>,
    grid: SpatialGrid,
    dirty: DirtySets,
    ids: IdAllocator,
    schemas: SchemaRegistry,
    /// `(release at end of tick, id)`, oldest first
    pending_release: VecDeque<(u64, EntityId)>,
    release_delay_ticks: u64,
    tick: u64,
}

impl World {
    pub fn new(config: WorldConfig, schemas: SchemaRegistry) -> Self {
        Self {
            bounds_min: Vec2::ZERO,
            bounds_max: Vec2::new(config.width.max(0.0), config.height.max(0.0)),
            cell_size: config.cell_size,
            entities: Vec::new(),
            grid: SpatialGrid::new(config.cell_size),
            dirty: DirtySets::new(),
            ids: IdAllocator::new(config.ids),
            schemas,
            pending_release: VecDeque::new(),
            release_delay_ticks: config.ids.release_delay_ticks,
            tick: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create an entity centred on `position` (clamped to the world).
    ///
    /// The entity is fully serialized once and inserted into the grid before
    /// this returns, so the first client to see it gets a complete snapshot.
    pub fn spawn(&mut self, position: Vec2, shape: Hitbox, state: EntityState) -> Result<EntityId, WorldError> {
        let kind = state.kind();
        if !position.is_finite() {
            error!("spawn of {} at non-finite position {:?}", kind.name(), position);
            return Err(WorldError::NonFinitePosition);
        }
        let Some(schema) = self.schemas.get(kind) else {
            error!("spawn of {} without a registered schema", kind.name());
            return Err(WorldError::UnregisteredKind(kind));
        };
        let id = self.ids.allocate()?;

        let position = position.clamp(self.bounds_min, self.bounds_max);
        let hitbox = shape.moved_to(position);
        let mut entity = Entity::new(id, EntityView::new(position, state), hitbox);
        entity.init(schema);

        let slot = id as usize;
        if self.entities.len() <= slot {
            self.entities.resize_with(slot + 1, || None);
        }
        self.entities[slot] = Some(entity);
        self.grid.insert(id, hitbox);
        debug!("spawned {} {}", kind.name(), id);
        Ok(id)
    }

    /// Mark destroyed, leave the grid and queue the id for release at end of
    /// tick. Destroying twice is a no-op.
    pub fn destroy(&mut self, id: EntityId) -> bool {
        let Some(entity) = self.entities.get_mut(id as usize).and_then(Option::as_mut) else {
            return false;
        };
        if entity.is_destroyed() {
            return false;
        }
        entity.mark_destroyed();
        self.grid.remove(id);
        self.dirty.forget(id);
        self.pending_release
            .push_back((self.tick + self.release_delay_ticks, id));
        debug!("destroyed {} {}", entity.kind().name(), id);
        true
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// The single position setter: clamp, move hitbox, mark dirty, re-bucket
    pub fn set_position(&mut self, id: EntityId, position: Vec2) -> Result<Vec2, WorldError> {
        let entity = live_mut(&mut self.entities, id)?;
        if !position.is_finite() {
            error!("non-finite position {:?} for entity {}", position, id);
            return Err(WorldError::NonFinitePosition);
        }
        let position = position.clamp(self.bounds_min, self.bounds_max);
        entity.view.position = position;
        entity.hitbox = entity.hitbox.moved_to(position);
        entity.set_dirty(&mut self.dirty);
        self.grid.update(id, entity.hitbox);
        Ok(position)
    }

    /// Circle hitbox of the given radius around the current position
    pub fn set_radius(&mut self, id: EntityId, radius: f32) -> Result<(), WorldError> {
        let entity = live_mut(&mut self.entities, id)?;
        entity.hitbox = Hitbox::circle(entity.view.position, radius);
        self.grid.update(id, entity.hitbox);
        Ok(())
    }

    /// Mutable kind state. Callers mark the entity dirty afterwards.
    pub fn state_mut(&mut self, id: EntityId) -> Result<&mut EntityState, WorldError> {
        live_mut(&mut self.entities, id).map(|e| &mut e.view.state)
    }

    pub fn mark_dirty(&mut self, id: EntityId) -> Result<(), WorldError> {
        live_mut(&mut self.entities, id)?.set_dirty(&mut self.dirty);
        Ok(())
    }

    pub fn mark_full_dirty(&mut self, id: EntityId) -> Result<(), WorldError> {
        live_mut(&mut self.entities, id)?.set_full_dirty(&mut self.dirty);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tick phases
    // ------------------------------------------------------------------------

    /// Regenerate cached records: every full-dirty entity first (dropping it
    /// from the partial set), then the remaining partial-dirty ones.
    pub fn serialize_dirty(&mut self) -> SerializeStats {
        self.dirty.resolve_precedence();
        let mut stats = SerializeStats::default();

        for id in self.dirty.full_ids() {
            if let Some(entity) = self.entities[id as usize].as_mut() {
                if let Some(schema) = self.schemas.get(entity.kind()) {
                    entity.serialize_full(schema);
                    stats.full += 1;
                }
            }
        }
        for id in self.dirty.partial_ids() {
            if let Some(entity) = self.entities[id as usize].as_mut() {
                if let Some(schema) = self.schemas.get(entity.kind()) {
                    entity.serialize_partial(schema);
                    stats.partial += 1;
                }
            }
        }
        stats
    }

    /// Close the tick: clear dirty state and release ids whose delay elapsed.
    /// Must run after every client packet of this tick has been built.
    pub fn end_tick(&mut self) -> usize {
        self.dirty.clear();

        let mut released = 0;
        while let Some(&(due, id)) = self.pending_release.front() {
            if due > self.tick {
                break;
            }
            self.pending_release.pop_front();
            if let Some(slot) = self.entities.get_mut(id as usize) {
                *slot = None;
            }
            self.ids.release(id);
            released += 1;
        }
        self.tick += 1;
        released
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Any entity still in the table, including destroyed ones awaiting release
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id as usize).and_then(Option::as_ref)
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        self.entity(id).map_or(false, |e| !e.is_destroyed())
    }

    /// Live entities in id order (the grid is the source of truth)
    pub fn live_ids(&self) -> Vec<EntityId> {
        self.grid.ids_sorted()
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    pub fn dirty(&self) -> &DirtySets {
        &self.dirty
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn is_id_allocated(&self, id: EntityId) -> bool {
        self.ids.is_allocated(id)
    }

    pub fn entity_count(&self) -> usize {
        self.grid.len()
    }

    pub fn bounds(&self) -> (Vec2, Vec2) {
        (self.bounds_min, self.bounds_max)
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Index of the tick currently being simulated
    pub fn tick(&self) -> u64 {
        self.tick
    }
}
