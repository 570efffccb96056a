//! Interest management: per-client visible-set diff and packet assembly
//!
//! Each tick every client's view region is queried against the spatial grid
//! and diffed with the set it received last tick:
//! - left entities are sent as deletions
//! - entered entities are always sent as full records
//! - visible full-dirty entities are sent full, partial-dirty ones partial
//!
//! Records are copied from the per-entity caches refreshed earlier in the
//! tick, so an entity seen by many clients is encoded once.
//!
//! Sections hold at most `MAX_SECTION_ITEMS` entries. Whatever does not fit
//! is carried over: entered entities enter again next tick, known ones are
//! owed a full record and unsent deletions stay in the visible set.
//!
//! The view extent follows camera zoom: zooming out widens the region,
//! padded by a fixed margin so entities don't pop in at the exact edge.

use tracing::debug;

use crate::game::id_alloc::EntityId;
use crate::game::spatial::{IdSet, Region};
use crate::game::world::World;
use crate::net::packet::{MapInfo, PacketBuilder, ScalarState, Section, MAX_SECTION_ITEMS};
use crate::util::vec2::Vec2;

// ============================================================================
// View Constants
// ============================================================================

/// Half the visible width at zoom=1.0 (1920 px screen, 1 unit per px)
const BASE_VIEW_HALF_WIDTH: f32 = 960.0;

/// Half the visible height at zoom=1.0 (1080 px screen)
const BASE_VIEW_HALF_HEIGHT: f32 = 540.0;

/// Padding beyond the visible edge, in world units
const DEFAULT_VIEW_MARGIN: f32 = 160.0;

/// Minimum zoom clamp to prevent extreme view sizes
/// Even at 0.1 zoom: 960/0.1 + 160 = 9760 half width (spectators)
const MIN_ZOOM_CLAMP: f32 = 0.1;

/// Initial capacity of the per-build id scratch lists
const SCRATCH_CAPACITY: usize = 256;

/// Shape of the region each client is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewShape {
    /// Screen-shaped rectangle
    Rect,
    /// Circle whose radius is the scaled half width
    Circle,
}

/// View region parameters
#[derive(Debug, Clone)]
pub struct InterestConfig {
    pub view_half_width: f32,
    pub view_half_height: f32,
    pub margin: f32,
    pub min_zoom: f32,
    pub shape: ViewShape,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            view_half_width: BASE_VIEW_HALF_WIDTH,
            view_half_height: BASE_VIEW_HALF_HEIGHT,
            margin: DEFAULT_VIEW_MARGIN,
            min_zoom: MIN_ZOOM_CLAMP,
            shape: ViewShape::Rect,
        }
    }
}

/// Half extents of the padded view at a zoom level
///
/// `half = base / max(zoom, min_zoom) + margin`
#[inline(always)]
fn view_half_extents(config: &InterestConfig, zoom: f32) -> Vec2 {
    let zoom = if zoom > config.min_zoom { zoom } else { config.min_zoom };
    Vec2::new(
        config.view_half_width / zoom + config.margin,
        config.view_half_height / zoom + config.margin,
    )
}

// ============================================================================
// Client state
// ============================================================================

/// Where a client is looking
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientView {
    pub camera: Vec2,
    pub zoom: f32,
    /// Entity the camera tracks each tick (usually the client's player)
    pub follow: Option<EntityId>,
}

impl Default for ClientView {
    fn default() -> Self {
        Self {
            camera: Vec2::ZERO,
            zoom: 1.0,
            follow: None,
        }
    }
}

/// Replication bookkeeping for one connected client
#[derive(Debug, Clone)]
pub struct ClientInterest {
    pub id: EntityId,
    pub name: String,
    pub view: ClientView,
    /// Entity ids the client currently knows about
    pub visible: IdSet,
    /// Known entities whose last update did not fit in a packet
    pub owed_full: IdSet,
    /// Scalar state as last sent
    pub last_scalar: Option<ScalarState>,
    pub map_sent: bool,
}

impl ClientInterest {
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            view: ClientView::default(),
            visible: IdSet::default(),
            owed_full: IdSet::default(),
            last_scalar: None,
            map_sent: false,
        }
    }

    /// Snap the camera to the followed entity, if it still exists
    pub fn follow_camera(&mut self, world: &World) {
        if let Some(target) = self.view.follow {
            match world.entity(target) {
                Some(entity) if !entity.is_destroyed() => self.view.camera = entity.view.position,
                _ => self.view.follow = None,
            }
        }
    }

    fn scalar_state(&self) -> ScalarState {
        ScalarState {
            camera: self.view.camera,
            zoom: self.view.zoom,
            follow: self.view.follow.unwrap_or(0),
        }
    }
}

/// Roster changes of the current tick, broadcast to every client
#[derive(Debug, Clone, Default)]
pub struct RosterDelta {
    pub joined: Vec<(EntityId, String)>,
    pub left: Vec<EntityId>,
}

impl RosterDelta {
    pub fn clear(&mut self) {
        self.joined.clear();
        self.left.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Statistics about one built packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestStats {
    pub visible: usize,
    pub entered: usize,
    pub left: usize,
    pub full: usize,
    pub partial: usize,
    pub bytes: usize,
}

// ============================================================================
// Interest Manager
// ============================================================================

/// Builds per-client update packets
pub struct InterestManager {
    config: InterestConfig,
    // scratch reused across builds
    in_view: IdSet,
    left: Vec<EntityId>,
    entered: Vec<EntityId>,
    refresh: Vec<EntityId>,
    partial: Vec<EntityId>,
}

impl InterestManager {
    pub fn new(config: InterestConfig) -> Self {
        Self {
            config,
            in_view: IdSet::default(),
            left: Vec::with_capacity(SCRATCH_CAPACITY),
            entered: Vec::with_capacity(SCRATCH_CAPACITY),
            refresh: Vec::with_capacity(SCRATCH_CAPACITY),
            partial: Vec::with_capacity(SCRATCH_CAPACITY),
        }
    }

    pub fn config(&self) -> &InterestConfig {
        &self.config
    }

    /// Padded view region centred on the camera
    pub fn region_for(&self, view: &ClientView) -> Region {
        let half = view_half_extents(&self.config, view.zoom);
        match self.config.shape {
            ViewShape::Rect => Region::rect(view.camera, half),
            ViewShape::Circle => Region::circle(view.camera, half.x),
        }
    }

    /// Diff the client's visible set against a fresh grid query and assemble
    /// its packet. Must run after the tick's dirty records were serialized.
    pub fn build_packet(
        &mut self,
        client: &mut ClientInterest,
        world: &World,
        roster: &RosterDelta,
        map: &MapInfo,
    ) -> (Vec<u8>, InterestStats) {
        let region = self.region_for(&client.view);
        world.grid().query_into(&region, &mut self.in_view);
        let dirty = world.dirty();
        let cap = MAX_SECTION_ITEMS;

        self.left.clear();
        self.entered.clear();
        self.refresh.clear();
        self.partial.clear();

        let in_view = &self.in_view;
        self.left
            .extend(client.visible.iter().copied().filter(|id| !in_view.contains(id)));

        for &id in in_view {
            if !client.visible.contains(&id) {
                // a client never learns of an entity through a partial record
                self.entered.push(id);
            } else if dirty.is_full(id) || client.owed_full.contains(&id) {
                self.refresh.push(id);
            } else if dirty.is_partial(id) {
                self.partial.push(id);
            }
        }

        // deterministic record order
        self.left.sort_unstable();
        self.entered.sort_unstable();
        self.refresh.sort_unstable();
        self.partial.sort_unstable();

        // entered entities get the full section first
        let entered_sent = self.entered.len().min(cap);
        let refresh_sent = self.refresh.len().min(cap - entered_sent);
        let partial_sent = self.partial.len().min(cap);
        let left_sent = self.left.len().min(cap);

        let full_records: Vec<&[u8]> = self.entered[..entered_sent]
            .iter()
            .chain(&self.refresh[..refresh_sent])
            .filter_map(|&id| world.entity(id).map(|e| e.full_record()))
            .collect();
        let partial_records: Vec<&[u8]> = self.partial[..partial_sent]
            .iter()
            .filter_map(|&id| world.entity(id).map(|e| e.partial_record()))
            .collect();

        let mut builder = PacketBuilder::new();
        builder.deleted(&self.left[..left_sent]);
        builder.entity_records(Section::FullEntities, &full_records);
        builder.entity_records(Section::PartialEntities, &partial_records);
        builder.new_clients(&roster.joined);
        builder.removed_clients(&roster.left);

        let scalar = client.scalar_state();
        if client.last_scalar.map_or(true, |last| !last.wire_eq(&scalar)) {
            builder.scalar_state(&scalar);
            client.last_scalar = Some(scalar);
        }
        if !client.map_sent {
            builder.map_info(map);
            client.map_sent = true;
        }
        let packet = builder.finish();

        // the stored set must match what the client now holds
        for id in &self.refresh[..refresh_sent] {
            client.owed_full.remove(id);
        }
        client
            .owed_full
            .extend(self.refresh[refresh_sent..].iter().chain(&self.partial[partial_sent..]));
        for id in &self.entered[entered_sent..] {
            self.in_view.remove(id);
        }
        // a deferred deletion may come back into view with updates it missed
        self.in_view.extend(&self.left[left_sent..]);
        client.owed_full.extend(&self.left[left_sent..]);
        let deferred_updates = self.refresh.len() - refresh_sent + self.partial.len() - partial_sent;
        let deferred_entering = self.entered.len() - entered_sent;
        let deferred_deletions = self.left.len() - left_sent;
        if deferred_updates + deferred_entering + deferred_deletions > 0 {
            debug!(
                "client {}: section cap reached, deferred {} entering, {} updates, {} deletions",
                client.id, deferred_entering, deferred_updates, deferred_deletions
            );
        }

        let stats = InterestStats {
            visible: self.in_view.len(),
            entered: entered_sent,
            left: left_sent,
            full: full_records.len(),
            partial: partial_records.len(),
            bytes: packet.len(),
        };
        std::mem::swap(&mut client.visible, &mut self.in_view);
        let visible = &client.visible;
        client.owed_full.retain(|id| visible.contains(id));
        (packet, stats)
    }
}

impl Default for InterestManager {
    fn default() -> Self {
        Self::new(InterestConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
