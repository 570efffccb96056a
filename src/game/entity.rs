//! Entity model and dirty tracking
//!
//! Entities are plain data living in the world's arena table. Each one owns
//! two cached wire records that are regenerated at most once per tick, no
//! matter how many clients end up receiving them:
//!
//! - partial record: `[u16 id][u8 tag][partial fields][align]`
//! - full record: the partial record followed by `[full fields][align]`

use bitvec::prelude::*;

use crate::game::id_alloc::EntityId;
use crate::game::spatial::Hitbox;
use crate::net::bitstream::BitWriter;
use crate::net::schema::EntitySchema;
use crate::util::vec2::Vec2;

// ============================================================================
// Kinds
// ============================================================================

/// Closed set of replicated entity kinds. The discriminant is the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntityKind {
    Player = 0,
    Petal = 1,
    Mob = 2,
    Loot = 3,
    Projectile = 4,
}

impl EntityKind {
    pub const COUNT: usize = 5;

    pub const ALL: [EntityKind; Self::COUNT] = [
        EntityKind::Player,
        EntityKind::Petal,
        EntityKind::Mob,
        EntityKind::Loot,
        EntityKind::Projectile,
    ];

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Petal => "petal",
            EntityKind::Mob => "mob",
            EntityKind::Loot => "loot",
            EntityKind::Projectile => "projectile",
        }
    }
}

// ============================================================================
// Per-kind state
// ============================================================================

/// Rarity tier shared by petals, mobs and loot (0 = common)
pub type Rarity = u8;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerState {
    // partial
    pub angle: f32,
    pub attacking: bool,
    pub defending: bool,
    // full
    /// Health as a fraction of max health
    pub health: f32,
    pub level: u8,
    pub name: String,
    pub clan: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PetalState {
    pub angle: f32,
    pub definition: u8,
    pub rarity: Rarity,
    /// Player entity orbiting this petal (0 = none)
    pub owner: EntityId,
    pub health: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MobState {
    pub angle: f32,
    pub definition: u8,
    pub rarity: Rarity,
    pub health: f32,
    pub radius: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LootState {
    pub definition: u8,
    pub rarity: Rarity,
    pub count: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectileState {
    pub angle: f32,
    pub owner: EntityId,
    pub radius: f32,
    pub definition: u8,
}

/// Kind-specific replicated state
#[derive(Debug, Clone, PartialEq)]
pub enum EntityState {
    Player(PlayerState),
    Petal(PetalState),
    Mob(MobState),
    Loot(LootState),
    Projectile(ProjectileState),
}

impl EntityState {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityState::Player(_) => EntityKind::Player,
            EntityState::Petal(_) => EntityKind::Petal,
            EntityState::Mob(_) => EntityKind::Mob,
            EntityState::Loot(_) => EntityKind::Loot,
            EntityState::Projectile(_) => EntityKind::Projectile,
        }
    }

    /// Zeroed state for a kind, used by decoders before the first full record
    pub fn default_for(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Player => EntityState::Player(PlayerState::default()),
            EntityKind::Petal => EntityState::Petal(PetalState::default()),
            EntityKind::Mob => EntityState::Mob(MobState::default()),
            EntityKind::Loot => EntityState::Loot(LootState::default()),
            EntityKind::Projectile => EntityState::Projectile(ProjectileState::default()),
        }
    }

    /// Facing angle, for kinds that have one
    pub fn angle(&self) -> Option<f32> {
        match self {
            EntityState::Player(s) => Some(s.angle),
            EntityState::Petal(s) => Some(s.angle),
            EntityState::Mob(s) => Some(s.angle),
            EntityState::Projectile(s) => Some(s.angle),
            EntityState::Loot(_) => None,
        }
    }

    pub fn set_angle(&mut self, angle: f32) {
        match self {
            EntityState::Player(s) => s.angle = angle,
            EntityState::Petal(s) => s.angle = angle,
            EntityState::Mob(s) => s.angle = angle,
            EntityState::Projectile(s) => s.angle = angle,
            EntityState::Loot(_) => {}
        }
    }
}

/// The replicated portion of an entity, shared by the server table and
/// client replicas
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub position: Vec2,
    pub state: EntityState,
}

impl EntityView {
    pub fn new(position: Vec2, state: EntityState) -> Self {
        Self { position, state }
    }

    /// Zeroed view of a kind
    pub fn blank(kind: EntityKind) -> Self {
        Self {
            position: Vec2::ZERO,
            state: EntityState::default_for(kind),
        }
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        self.state.kind()
    }
}

// ============================================================================
// Dirty sets
// ============================================================================

/// Id-indexed partial/full dirty bit sets owned by one game instance
#[derive(Debug, Clone)]
pub struct DirtySets {
    partial: BitVec,
    full: BitVec,
}

impl DirtySets {
    pub fn new() -> Self {
        let len = EntityId::MAX as usize + 1;
        Self {
            partial: bitvec![0; len],
            full: bitvec![0; len],
        }
    }

    #[inline]
    pub fn mark_partial(&mut self, id: EntityId) {
        self.partial.set(id as usize, true);
    }

    #[inline]
    pub fn mark_full(&mut self, id: EntityId) {
        self.full.set(id as usize, true);
    }

    #[inline]
    pub fn is_partial(&self, id: EntityId) -> bool {
        self.partial[id as usize]
    }

    #[inline]
    pub fn is_full(&self, id: EntityId) -> bool {
        self.full[id as usize]
    }

    /// Drop an id from both sets (destroyed entities are never serialized)
    pub fn forget(&mut self, id: EntityId) {
        self.partial.set(id as usize, false);
        self.full.set(id as usize, false);
    }

    /// Full supersedes partial: remove every full-dirty id from the partial set
    pub fn resolve_precedence(&mut self) {
        for idx in self.full.iter_ones() {
            self.partial.set(idx, false);
        }
    }

    pub fn partial_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.partial.iter_ones().map(|idx| idx as EntityId)
    }

    pub fn full_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.full.iter_ones().map(|idx| idx as EntityId)
    }

    pub fn partial_count(&self) -> usize {
        self.partial.count_ones()
    }

    pub fn full_count(&self) -> usize {
        self.full.count_ones()
    }

    pub fn clear(&mut self) {
        self.partial.fill(false);
        self.full.fill(false);
    }
}

impl Default for DirtySets {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Entity
// ============================================================================

/// A simulated, replicated object
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub view: EntityView,
    pub hitbox: Hitbox,
    destroyed: bool,
    initialized: bool,
    partial_buffer: Vec<u8>,
    full_buffer: Vec<u8>,
    /// Length of the partial record copied at the head of `full_buffer`
    full_prefix: usize,
}

impl Entity {
    /// Uninitialized entity: not observable until [`init`](Self::init)
    pub fn new(id: EntityId, view: EntityView, hitbox: Hitbox) -> Self {
        Self {
            id,
            view,
            hitbox,
            destroyed: false,
            initialized: false,
            partial_buffer: Vec::new(),
            full_buffer: Vec::new(),
            full_prefix: 0,
        }
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        self.view.kind()
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }

    /// Size both record buffers from the schema budget, then serialize full once
    pub fn init(&mut self, schema: &EntitySchema) {
        self.partial_buffer = Vec::with_capacity(schema.partial_size);
        self.full_buffer = Vec::with_capacity(schema.full_size);
        self.serialize_full(schema);
        self.initialized = true;
    }

    /// Queue a partial refresh. Ignored until the entity is initialized.
    pub fn set_dirty(&self, dirty: &mut DirtySets) {
        if self.initialized && !self.destroyed {
            dirty.mark_partial(self.id);
        }
    }

    pub fn set_full_dirty(&self, dirty: &mut DirtySets) {
        if self.initialized && !self.destroyed {
            dirty.mark_full(self.id);
        }
    }

    /// Re-encode the partial record.
    ///
    /// The head of the full record is refreshed as well, so a client that
    /// first sees this entity later in the tick gets current partial fields.
    pub fn serialize_partial(&mut self, schema: &EntitySchema) {
        self.encode_partial(schema);
        let len = self.partial_buffer.len();
        if self.full_prefix == len && self.full_buffer.len() >= len {
            self.full_buffer[..len].copy_from_slice(&self.partial_buffer);
        } else {
            self.encode_full(schema);
        }
    }

    /// Re-encode both records
    pub fn serialize_full(&mut self, schema: &EntitySchema) {
        self.encode_partial(schema);
        self.encode_full(schema);
    }

    fn encode_partial(&mut self, schema: &EntitySchema) {
        let mut writer = BitWriter::from_vec(std::mem::take(&mut self.partial_buffer));
        writer.write_u16(self.id);
        writer.write_u8(self.kind().tag());
        (schema.serialize_partial)(&self.view, &mut writer);
        writer.align_to_byte();
        self.partial_buffer = writer.into_inner();
    }

    fn encode_full(&mut self, schema: &EntitySchema) {
        let mut writer = BitWriter::from_vec(std::mem::take(&mut self.full_buffer));
        writer.write_bytes_aligned(&self.partial_buffer);
        (schema.serialize_full)(&self.view, &mut writer);
        writer.align_to_byte();
        self.full_buffer = writer.into_inner();
        self.full_prefix = self.partial_buffer.len();
    }

    /// Cached `[id][tag][partial]` record
    #[inline]
    pub fn partial_record(&self) -> &[u8] {
        &self.partial_buffer
    }

    /// Cached `[id][tag][partial][full]` record
    #[inline]
    pub fn full_record(&self) -> &[u8] {
        &self.full_buffer
    }
}
