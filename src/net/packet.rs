//! Per-client update packet framing
//!
//! ```text
//! [u16 section bitmask]
//! [deleted:   u16 count, u16 id ...][align]         bit 0
//! [full:      u16 count, full records ...][align]   bit 1
//! [partial:   u16 count, partial records ...][align] bit 2
//! [new clients: u16 count, (u16 id, name) ...][align] bit 3
//! [removed clients: u16 count, u16 id ...][align]   bit 4
//! [scalar state][align]                             bit 5
//! [map info][align]                                 bit 6
//! ```
//!
//! Only sections whose bit is set are present, always in bit order. The
//! bitmask slot is reserved first and patched once the packet is complete.

use tracing::{debug, error};

use crate::game::entity::{EntityKind, EntityView};
use crate::game::id_alloc::EntityId;
use crate::net::bitstream::{quantize, BitReader, BitWriter, Placeholder};
use crate::net::protocol::DecodeError;
use crate::net::schema::SchemaRegistry;
use crate::net::schemas::{MAX_NAME_BYTES, POSITION_BITS, WORLD_COORD_MAX};
use crate::util::vec2::Vec2;

/// Hard cap on records or ids in one section, on both encode and decode
pub const MAX_SECTION_ITEMS: usize = 8192;

pub const ZOOM_MIN: f32 = 0.1;
pub const ZOOM_MAX: f32 = 4.0;
pub const ZOOM_BITS: u32 = 12;

/// Optional packet sections, valued by their bit in the mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Section {
    DeletedEntities = 0,
    FullEntities = 1,
    PartialEntities = 2,
    NewClients = 3,
    RemovedClients = 4,
    ScalarState = 5,
    MapInfo = 6,
}

impl Section {
    pub const ALL: [Section; 7] = [
        Section::DeletedEntities,
        Section::FullEntities,
        Section::PartialEntities,
        Section::NewClients,
        Section::RemovedClients,
        Section::ScalarState,
        Section::MapInfo,
    ];

    #[inline]
    pub fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Every bit a valid packet may set
    pub fn known_mask() -> u16 {
        Self::ALL.iter().fold(0, |mask, s| mask | s.bit())
    }
}

/// Per-client camera state sent when it changes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarState {
    pub camera: Vec2,
    pub zoom: f32,
    /// Followed entity (0 = free camera)
    pub follow: EntityId,
}

impl ScalarState {
    /// Equal after quantization, i.e. resending would not change the client
    pub fn wire_eq(&self, other: &ScalarState) -> bool {
        let pos = |v: f32| quantize(v, 0.0, WORLD_COORD_MAX, POSITION_BITS);
        let zoom = |v: f32| quantize(v, ZOOM_MIN, ZOOM_MAX, ZOOM_BITS);
        pos(self.camera.x) == pos(other.camera.x)
            && pos(self.camera.y) == pos(other.camera.y)
            && zoom(self.zoom) == zoom(other.zoom)
            && self.follow == other.follow
    }
}

/// Static arena description, sent once per client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    pub width: u16,
    pub height: u16,
    pub cell_size: u16,
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles one update packet. Sections must be appended in bit order;
/// empty sections are omitted entirely.
pub struct PacketBuilder {
    writer: BitWriter,
    mask_slot: Placeholder,
    mask: u16,
    last: Option<Section>,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::with_buffer(Vec::new())
    }

    /// Build into a recycled allocation
    pub fn with_buffer(buffer: Vec<u8>) -> Self {
        let mut writer = BitWriter::from_vec(buffer);
        let mask_slot = writer.reserve_u16();
        Self {
            writer,
            mask_slot,
            mask: 0,
            last: None,
        }
    }

    fn begin(&mut self, section: Section) -> bool {
        if self.last.map_or(false, |last| section <= last) {
            error!("packet section {:?} appended out of order, skipping", section);
            return false;
        }
        self.last = Some(section);
        self.mask |= section.bit();
        true
    }

    fn end(&mut self) {
        self.writer.align_to_byte();
    }

    pub fn deleted(&mut self, ids: &[EntityId]) {
        self.id_list(Section::DeletedEntities, ids);
    }

    pub fn removed_clients(&mut self, ids: &[EntityId]) {
        self.id_list(Section::RemovedClients, ids);
    }

    fn id_list(&mut self, section: Section, ids: &[EntityId]) {
        if ids.is_empty() || !self.begin(section) {
            return;
        }
        self.writer.write_array(ids, MAX_SECTION_ITEMS, |w, &id| w.write_u16(id));
        self.end();
    }

    /// Copy cached entity records (already byte aligned) into a section
    pub fn entity_records(&mut self, section: Section, records: &[&[u8]]) {
        debug_assert!(matches!(section, Section::FullEntities | Section::PartialEntities));
        if records.is_empty() || !self.begin(section) {
            return;
        }
        self.writer
            .write_array(records, MAX_SECTION_ITEMS, |w, record| w.write_bytes_aligned(record));
        self.end();
    }

    pub fn new_clients(&mut self, clients: &[(EntityId, String)]) {
        if clients.is_empty() || !self.begin(Section::NewClients) {
            return;
        }
        self.writer.write_array(clients, MAX_SECTION_ITEMS, |w, (id, name)| {
            w.write_u16(*id);
            w.write_string(name, MAX_NAME_BYTES);
        });
        self.end();
    }

    pub fn scalar_state(&mut self, scalar: &ScalarState) {
        if !self.begin(Section::ScalarState) {
            return;
        }
        let w = &mut self.writer;
        w.write_quantized(scalar.camera.x, 0.0, WORLD_COORD_MAX, POSITION_BITS);
        w.write_quantized(scalar.camera.y, 0.0, WORLD_COORD_MAX, POSITION_BITS);
        w.write_quantized(scalar.zoom, ZOOM_MIN, ZOOM_MAX, ZOOM_BITS);
        w.write_u16(scalar.follow);
        self.end();
    }

    pub fn map_info(&mut self, map: &MapInfo) {
        if !self.begin(Section::MapInfo) {
            return;
        }
        self.writer.write_u16(map.width);
        self.writer.write_u16(map.height);
        self.writer.write_u16(map.cell_size);
        self.end();
    }

    /// Bitmask of the sections written so far
    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// Patch the bitmask and hand out the packet bytes
    pub fn finish(mut self) -> Vec<u8> {
        self.writer.patch_u16(self.mask_slot, self.mask);
        self.writer.into_inner()
    }
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Decoded entity record
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub view: EntityView,
}

/// Everything carried by one update packet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedUpdate {
    pub mask: u16,
    pub deleted: Vec<EntityId>,
    pub full: Vec<EntityRecord>,
    pub partial: Vec<EntityRecord>,
    pub new_clients: Vec<(EntityId, String)>,
    pub removed_clients: Vec<EntityId>,
    pub scalar: Option<ScalarState>,
    pub map: Option<MapInfo>,
}

/// Decode a packet without client history: partial records are applied on
/// top of a blank view of their kind.
pub fn decode_update(bytes: &[u8], registry: &SchemaRegistry) -> Result<DecodedUpdate, DecodeError> {
    decode_update_with(bytes, registry, |_, kind| Ok(EntityView::blank(kind)))
}

/// Decode a packet, resolving the base view of each partial record through
/// `known` (a client replica returns its current view or
/// [`DecodeError::UnknownEntity`]).
pub fn decode_update_with<F>(
    bytes: &[u8],
    registry: &SchemaRegistry,
    mut known: F,
) -> Result<DecodedUpdate, DecodeError>
where
    F: FnMut(EntityId, EntityKind) -> Result<EntityView, DecodeError>,
{
    let mut r = BitReader::new(bytes);
    let mask = r.read_u16()?;
    let unknown = mask & !Section::known_mask();
    if unknown != 0 {
        return Err(DecodeError::UnknownSection(unknown));
    }

    let mut update = DecodedUpdate {
        mask,
        ..Default::default()
    };
    for section in Section::ALL {
        if mask & section.bit() == 0 {
            continue;
        }
        match section {
            Section::DeletedEntities => {
                update.deleted = r.read_array(MAX_SECTION_ITEMS, |r| r.read_u16())?;
            }
            Section::FullEntities => {
                update.full = read_records(&mut r, registry, true, &mut known)?;
            }
            Section::PartialEntities => {
                update.partial = read_records(&mut r, registry, false, &mut known)?;
            }
            Section::NewClients => {
                update.new_clients = r.read_array(MAX_SECTION_ITEMS, |r| {
                    let id = r.read_u16()?;
                    let name = r.read_string(MAX_NAME_BYTES)?;
                    Ok((id, name))
                })?;
            }
            Section::RemovedClients => {
                update.removed_clients = r.read_array(MAX_SECTION_ITEMS, |r| r.read_u16())?;
            }
            Section::ScalarState => {
                let x = r.read_quantized(0.0, WORLD_COORD_MAX, POSITION_BITS)?;
                let y = r.read_quantized(0.0, WORLD_COORD_MAX, POSITION_BITS)?;
                let zoom = r.read_quantized(ZOOM_MIN, ZOOM_MAX, ZOOM_BITS)?;
                let follow = r.read_u16()?;
                update.scalar = Some(ScalarState {
                    camera: Vec2::new(x, y),
                    zoom,
                    follow,
                });
            }
            Section::MapInfo => {
                update.map = Some(MapInfo {
                    width: r.read_u16()?,
                    height: r.read_u16()?,
                    cell_size: r.read_u16()?,
                });
            }
        }
        r.align_to_byte();
    }

    if !r.is_empty() {
        debug!("{} trailing bits after last section", r.bits_remaining());
    }
    Ok(update)
}

fn read_records<F>(
    r: &mut BitReader<'_>,
    registry: &SchemaRegistry,
    full: bool,
    known: &mut F,
) -> Result<Vec<EntityRecord>, DecodeError>
where
    F: FnMut(EntityId, EntityKind) -> Result<EntityView, DecodeError>,
{
    let declared = r.read_u16()? as usize;
    let count = declared.min(MAX_SECTION_ITEMS);
    if declared > count {
        debug!("record count {} exceeds cap {}, reading {}", declared, MAX_SECTION_ITEMS, count);
    }

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let id = r.read_u16()?;
        let (kind, schema) = registry.get_by_tag(r.read_u8()?)?;
        let mut view = if full {
            EntityView::blank(kind)
        } else {
            known(id, kind)?
        };
        (schema.deserialize_partial)(r, &mut view)?;
        r.align_to_byte();
        if full {
            (schema.deserialize_full)(r, &mut view)?;
            r.align_to_byte();
        }
        records.push(EntityRecord { id, view });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{Entity, EntityState, MobState};
    use crate::game::spatial::Hitbox;

    fn mob_entity(id: EntityId, x: f32) -> Entity {
        let registry = SchemaRegistry::standard();
        let state = EntityState::Mob(MobState {
            angle: 1.0,
            definition: 9,
            rarity: 1,
            health: 0.5,
            radius: 20.0,
        });
        let mut entity = Entity::new(id, EntityView::new(Vec2::new(x, 10.0), state), Hitbox::circle(Vec2::ZERO, 20.0));
        entity.init(registry.get(EntityKind::Mob).unwrap());
        entity
    }

    #[test]
    fn test_empty_packet_is_two_zero_bytes() {
        let builder = PacketBuilder::new();
        assert_eq!(builder.finish(), vec![0, 0]);

        // empty sections are omitted
        let mut builder = PacketBuilder::new();
        builder.deleted(&[]);
        builder.entity_records(Section::FullEntities, &[]);
        builder.new_clients(&[]);
        assert_eq!(builder.finish(), vec![0, 0]);
    }

    #[test]
    fn test_deleted_section_layout() {
        let mut builder = PacketBuilder::new();
        builder.deleted(&[16, 300]);
        let bytes = builder.finish();
        assert_eq!(bytes, vec![0b1, 0, 2, 0, 16, 0, 0x2c, 0x01]);

        let decoded = decode_update(&bytes, &SchemaRegistry::standard()).unwrap();
        assert_eq!(decoded.deleted, vec![16, 300]);
        assert!(decoded.full.is_empty());
    }

    #[test]
    fn test_bitmask_back_patched() {
        let mut builder = PacketBuilder::new();
        builder.removed_clients(&[3]);
        builder.map_info(&MapInfo {
            width: 4096,
            height: 2048,
            cell_size: 256,
        });
        assert_eq!(builder.mask(), Section::RemovedClients.bit() | Section::MapInfo.bit());
        let bytes = builder.finish();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), 0b101_0000);
    }

    #[test]
    fn test_full_and_partial_records_round_trip() {
        let registry = SchemaRegistry::standard();
        let a = mob_entity(20, 100.0);
        let b = mob_entity(21, 200.0);

        let mut builder = PacketBuilder::new();
        builder.entity_records(Section::FullEntities, &[a.full_record()]);
        builder.entity_records(Section::PartialEntities, &[b.partial_record()]);
        let bytes = builder.finish();
        // mask + two counts + records, no padding between aligned records
        assert_eq!(bytes.len(), 2 + 2 + a.full_record().len() + 2 + b.partial_record().len());

        let decoded = decode_update(&bytes, &registry).unwrap();
        assert_eq!(decoded.full.len(), 1);
        assert_eq!(decoded.full[0].id, 20);
        let EntityState::Mob(m) = &decoded.full[0].view.state else {
            panic!("expected mob");
        };
        assert_eq!(m.definition, 9);
        assert_eq!(decoded.partial[0].id, 21);
        assert!((decoded.partial[0].view.position.x - 200.0).abs() < 0.01);
    }

    #[test]
    fn test_partial_for_unknown_entity_rejected_with_history() {
        let registry = SchemaRegistry::standard();
        let b = mob_entity(21, 200.0);
        let mut builder = PacketBuilder::new();
        builder.entity_records(Section::PartialEntities, &[b.partial_record()]);
        let bytes = builder.finish();

        let result = decode_update_with(&bytes, &registry, |id, _| Err(DecodeError::UnknownEntity(id)));
        assert_eq!(result, Err(DecodeError::UnknownEntity(21)));
    }

    #[test]
    fn test_sections_out_of_order_are_skipped() {
        let mut builder = PacketBuilder::new();
        builder.removed_clients(&[1]);
        builder.deleted(&[2]);
        assert_eq!(builder.mask(), Section::RemovedClients.bit());
    }

    #[test]
    fn test_scalar_state_and_roster() {
        let mut builder = PacketBuilder::new();
        builder.new_clients(&[(1, "alice".to_string()), (2, "bob".to_string())]);
        let scalar = ScalarState {
            camera: Vec2::new(1234.5, 42.0),
            zoom: 1.25,
            follow: 77,
        };
        builder.scalar_state(&scalar);
        let bytes = builder.finish();

        let decoded = decode_update(&bytes, &SchemaRegistry::standard()).unwrap();
        assert_eq!(decoded.new_clients, vec![(1, "alice".to_string()), (2, "bob".to_string())]);
        let got = decoded.scalar.unwrap();
        assert!(got.wire_eq(&scalar));
        assert_eq!(got.follow, 77);
        assert!((got.zoom - 1.25).abs() < 0.001);
    }

    #[test]
    fn test_unknown_section_bit_rejected() {
        let bytes = [0x80, 0x00];
        assert_eq!(
            decode_update(&bytes, &SchemaRegistry::standard()),
            Err(DecodeError::UnknownSection(0x80))
        );
    }

    #[test]
    fn test_unknown_kind_tag_rejected() {
        // mask=full, count=1, id=16, tag=9
        let bytes = [0b10, 0, 1, 0, 16, 0, 9];
        assert_eq!(
            decode_update(&bytes, &SchemaRegistry::standard()),
            Err(DecodeError::UnknownEntityKind(9))
        );
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let mut builder = PacketBuilder::new();
        builder.deleted(&[16, 17, 18]);
        let bytes = builder.finish();
        let result = decode_update(&bytes[..bytes.len() - 1], &SchemaRegistry::standard());
        assert!(matches!(result, Err(DecodeError::Bits(_))));
    }
}
