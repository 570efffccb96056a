//! Built-in wire schemas for the five entity kinds
//!
//! Every partial group starts with the quantized position. Partial groups are
//! fixed width per kind; only full groups carry variable-length data.

use std::f32::consts::PI;

use crate::game::entity::{
    EntityKind, EntityState, EntityView, LootState, MobState, PetalState, PlayerState, ProjectileState,
};
use crate::net::bitstream::{BitReader, BitResult, BitWriter};
use crate::net::protocol::DecodeError;
use crate::net::schema::EntitySchema;
use crate::util::vec2::Vec2;

// ============================================================================
// Field encodings
// ============================================================================

/// Upper bound of world coordinates on the wire
pub const WORLD_COORD_MAX: f32 = 16384.0;
pub const POSITION_BITS: u32 = 20;
pub const ANGLE_BITS: u32 = 10;
/// Bits for ratios in `[0, 1]` (player and mob health)
pub const RATIO_BITS: u32 = 16;
pub const PETAL_HEALTH_BITS: u32 = 8;
pub const PETAL_DEFINITION_BITS: u32 = 6;
pub const DEFINITION_BITS: u32 = 7;
pub const RARITY_BITS: u32 = 3;
pub const MOB_RADIUS_MAX: f32 = 512.0;
pub const MOB_RADIUS_BITS: u32 = 12;
pub const PROJECTILE_RADIUS_MAX: f32 = 64.0;
pub const PROJECTILE_RADIUS_BITS: u32 = 10;
/// Player names are UTF-8 capped at this many bytes
pub const MAX_NAME_BYTES: usize = 24;
/// Clan tags are exactly this many 7-bit characters
pub const CLAN_TAG_LEN: usize = 4;

#[inline]
fn write_position(w: &mut BitWriter, position: Vec2) {
    w.write_quantized(position.x, 0.0, WORLD_COORD_MAX, POSITION_BITS);
    w.write_quantized(position.y, 0.0, WORLD_COORD_MAX, POSITION_BITS);
}

#[inline]
fn read_position(r: &mut BitReader<'_>) -> BitResult<Vec2> {
    let x = r.read_quantized(0.0, WORLD_COORD_MAX, POSITION_BITS)?;
    let y = r.read_quantized(0.0, WORLD_COORD_MAX, POSITION_BITS)?;
    Ok(Vec2::new(x, y))
}

/// Small enumerations saturate at the largest encodable value instead of
/// wrapping into a different one
#[inline]
fn write_small(w: &mut BitWriter, value: u8, bits: u32) {
    w.write_uint(u32::from(value).min((1u32 << bits) - 1), bits);
}

#[inline]
fn write_angle(w: &mut BitWriter, angle: f32) {
    w.write_quantized(angle, -PI, PI, ANGLE_BITS);
}

#[inline]
fn read_angle(r: &mut BitReader<'_>) -> BitResult<f32> {
    r.read_quantized(-PI, PI, ANGLE_BITS)
}

fn mismatch(expected: EntityKind, state: &EntityState) -> DecodeError {
    DecodeError::KindMismatch {
        expected,
        found: state.kind(),
    }
}

// Serializers only run on views whose kind matched the registry slot, so a
// foreign variant writes nothing beyond the position.

// ============================================================================
// Player
// ============================================================================

fn player_mut(view: &mut EntityView) -> Result<&mut PlayerState, DecodeError> {
    match &mut view.state {
        EntityState::Player(s) => Ok(s),
        other => Err(mismatch(EntityKind::Player, other)),
    }
}

fn write_player_partial(view: &EntityView, w: &mut BitWriter) {
    write_position(w, view.position);
    if let EntityState::Player(s) = &view.state {
        write_angle(w, s.angle);
        w.write_bool(s.attacking);
        w.write_bool(s.defending);
    }
}

fn write_player_full(view: &EntityView, w: &mut BitWriter) {
    if let EntityState::Player(s) = &view.state {
        w.write_quantized(s.health, 0.0, 1.0, RATIO_BITS);
        w.write_u8(s.level);
        w.write_string(&s.name, MAX_NAME_BYTES);
        w.write_ascii_fixed(&s.clan, CLAN_TAG_LEN);
    }
}

fn read_player_partial(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    view.position = read_position(r)?;
    let s = player_mut(view)?;
    s.angle = read_angle(r)?;
    s.attacking = r.read_bool()?;
    s.defending = r.read_bool()?;
    Ok(())
}

fn read_player_full(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    let s = player_mut(view)?;
    s.health = r.read_quantized(0.0, 1.0, RATIO_BITS)?;
    s.level = r.read_u8()?;
    s.name = r.read_string(MAX_NAME_BYTES)?;
    s.clan = r.read_ascii_fixed(CLAN_TAG_LEN)?;
    Ok(())
}

// ============================================================================
// Petal
// ============================================================================

fn petal_mut(view: &mut EntityView) -> Result<&mut PetalState, DecodeError> {
    match &mut view.state {
        EntityState::Petal(s) => Ok(s),
        other => Err(mismatch(EntityKind::Petal, other)),
    }
}

fn write_petal_partial(view: &EntityView, w: &mut BitWriter) {
    write_position(w, view.position);
    if let EntityState::Petal(s) = &view.state {
        write_angle(w, s.angle);
    }
}

fn write_petal_full(view: &EntityView, w: &mut BitWriter) {
    if let EntityState::Petal(s) = &view.state {
        write_small(w, s.definition, PETAL_DEFINITION_BITS);
        write_small(w, s.rarity, RARITY_BITS);
        w.write_u16(s.owner);
        w.write_quantized(s.health, 0.0, 1.0, PETAL_HEALTH_BITS);
    }
}

fn read_petal_partial(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    view.position = read_position(r)?;
    petal_mut(view)?.angle = read_angle(r)?;
    Ok(())
}

fn read_petal_full(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    let s = petal_mut(view)?;
    s.definition = r.read_uint(PETAL_DEFINITION_BITS)? as u8;
    s.rarity = r.read_uint(RARITY_BITS)? as u8;
    s.owner = r.read_u16()?;
    s.health = r.read_quantized(0.0, 1.0, PETAL_HEALTH_BITS)?;
    Ok(())
}

// ============================================================================
// Mob
// ============================================================================

fn mob_mut(view: &mut EntityView) -> Result<&mut MobState, DecodeError> {
    match &mut view.state {
        EntityState::Mob(s) => Ok(s),
        other => Err(mismatch(EntityKind::Mob, other)),
    }
}

fn write_mob_partial(view: &EntityView, w: &mut BitWriter) {
    write_position(w, view.position);
    if let EntityState::Mob(s) = &view.state {
        write_angle(w, s.angle);
    }
}

fn write_mob_full(view: &EntityView, w: &mut BitWriter) {
    if let EntityState::Mob(s) = &view.state {
        write_small(w, s.definition, DEFINITION_BITS);
        write_small(w, s.rarity, RARITY_BITS);
        w.write_quantized(s.health, 0.0, 1.0, RATIO_BITS);
        w.write_quantized(s.radius, 0.0, MOB_RADIUS_MAX, MOB_RADIUS_BITS);
    }
}

fn read_mob_partial(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    view.position = read_position(r)?;
    mob_mut(view)?.angle = read_angle(r)?;
    Ok(())
}

fn read_mob_full(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    let s = mob_mut(view)?;
    s.definition = r.read_uint(DEFINITION_BITS)? as u8;
    s.rarity = r.read_uint(RARITY_BITS)? as u8;
    s.health = r.read_quantized(0.0, 1.0, RATIO_BITS)?;
    s.radius = r.read_quantized(0.0, MOB_RADIUS_MAX, MOB_RADIUS_BITS)?;
    Ok(())
}

// ============================================================================
// Loot
// ============================================================================

fn loot_mut(view: &mut EntityView) -> Result<&mut LootState, DecodeError> {
    match &mut view.state {
        EntityState::Loot(s) => Ok(s),
        other => Err(mismatch(EntityKind::Loot, other)),
    }
}

fn write_loot_partial(view: &EntityView, w: &mut BitWriter) {
    write_position(w, view.position);
}

fn write_loot_full(view: &EntityView, w: &mut BitWriter) {
    if let EntityState::Loot(s) = &view.state {
        write_small(w, s.definition, DEFINITION_BITS);
        write_small(w, s.rarity, RARITY_BITS);
        w.write_u8(s.count);
    }
}

fn read_loot_partial(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    view.position = read_position(r)?;
    // loot has no partial state, but the view must still be loot
    loot_mut(view)?;
    Ok(())
}

fn read_loot_full(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    let s = loot_mut(view)?;
    s.definition = r.read_uint(DEFINITION_BITS)? as u8;
    s.rarity = r.read_uint(RARITY_BITS)? as u8;
    s.count = r.read_u8()?;
    Ok(())
}

// ============================================================================
// Projectile
// ============================================================================

fn projectile_mut(view: &mut EntityView) -> Result<&mut ProjectileState, DecodeError> {
    match &mut view.state {
        EntityState::Projectile(s) => Ok(s),
        other => Err(mismatch(EntityKind::Projectile, other)),
    }
}

fn write_projectile_partial(view: &EntityView, w: &mut BitWriter) {
    write_position(w, view.position);
    if let EntityState::Projectile(s) = &view.state {
        write_angle(w, s.angle);
    }
}

fn write_projectile_full(view: &EntityView, w: &mut BitWriter) {
    if let EntityState::Projectile(s) = &view.state {
        w.write_u16(s.owner);
        w.write_quantized(s.radius, 0.0, PROJECTILE_RADIUS_MAX, PROJECTILE_RADIUS_BITS);
        write_small(w, s.definition, DEFINITION_BITS);
    }
}

fn read_projectile_partial(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    view.position = read_position(r)?;
    projectile_mut(view)?.angle = read_angle(r)?;
    Ok(())
}

fn read_projectile_full(r: &mut BitReader<'_>, view: &mut EntityView) -> Result<(), DecodeError> {
    let s = projectile_mut(view)?;
    s.owner = r.read_u16()?;
    s.radius = r.read_quantized(0.0, PROJECTILE_RADIUS_MAX, PROJECTILE_RADIUS_BITS)?;
    s.definition = r.read_uint(DEFINITION_BITS)? as u8;
    Ok(())
}

// ============================================================================
// Table
// ============================================================================

/// Built-in schema for `kind`. Sizes are whole records including the
/// 3-byte `[id][tag]` header.
pub fn schema_for(kind: EntityKind) -> EntitySchema {
    match kind {
        EntityKind::Player => EntitySchema {
            partial_size: 10,
            full_size: 43,
            serialize_partial: write_player_partial,
            serialize_full: write_player_full,
            deserialize_partial: read_player_partial,
            deserialize_full: read_player_full,
        },
        EntityKind::Petal => EntitySchema {
            partial_size: 10,
            full_size: 15,
            serialize_partial: write_petal_partial,
            serialize_full: write_petal_full,
            deserialize_partial: read_petal_partial,
            deserialize_full: read_petal_full,
        },
        EntityKind::Mob => EntitySchema {
            partial_size: 10,
            full_size: 15,
            serialize_partial: write_mob_partial,
            serialize_full: write_mob_full,
            deserialize_partial: read_mob_partial,
            deserialize_full: read_mob_full,
        },
        EntityKind::Loot => EntitySchema {
            partial_size: 8,
            full_size: 11,
            serialize_partial: write_loot_partial,
            serialize_full: write_loot_full,
            deserialize_partial: read_loot_partial,
            deserialize_full: read_loot_full,
        },
        EntityKind::Projectile => EntitySchema {
            partial_size: 10,
            full_size: 15,
            serialize_partial: write_projectile_partial,
            serialize_full: write_projectile_full,
            deserialize_partial: read_projectile_partial,
            deserialize_full: read_projectile_full,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Entity;
    use crate::game::spatial::Hitbox;
    use crate::net::schema::SchemaRegistry;
    use proptest::prelude::*;

    const POS_EPS: f32 = WORLD_COORD_MAX / ((1u32 << POSITION_BITS) - 1) as f32 / 2.0 + 1e-3;
    const ANGLE_EPS: f32 = 2.0 * PI / ((1u32 << ANGLE_BITS) - 1) as f32 / 2.0 + 1e-5;

    /// Encode a record the way `Entity` does, then decode it into a blank view
    fn round_trip(view: &EntityView) -> EntityView {
        let registry = SchemaRegistry::standard();
        let schema = registry.get(view.kind()).unwrap();
        let mut entity = Entity::new(42, view.clone(), Hitbox::circle(view.position, 1.0));
        entity.init(schema);

        let bytes = entity.full_record();
        assert!(entity.partial_record().len() <= schema.partial_size);
        assert!(bytes.len() <= schema.full_size);

        let mut r = BitReader::new(bytes);
        assert_eq!(r.read_u16().unwrap(), 42);
        let (kind, schema) = registry.get_by_tag(r.read_u8().unwrap()).unwrap();
        let mut out = EntityView::blank(kind);
        (schema.deserialize_partial)(&mut r, &mut out).unwrap();
        r.align_to_byte();
        (schema.deserialize_full)(&mut r, &mut out).unwrap();
        r.align_to_byte();
        assert!(r.is_empty());
        out
    }

    fn close(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() <= eps
    }

    #[test]
    fn test_partial_sizes_are_fixed_per_kind() {
        let registry = SchemaRegistry::standard();
        for kind in EntityKind::ALL {
            let schema = registry.get(kind).unwrap();
            let mut a = Entity::new(1, EntityView::blank(kind), Hitbox::circle(Vec2::ZERO, 1.0));
            let mut b = Entity::new(
                u16::MAX,
                EntityView::new(Vec2::new(9000.0, 1.0), EntityState::default_for(kind)),
                Hitbox::circle(Vec2::ZERO, 1.0),
            );
            a.init(schema);
            b.init(schema);
            assert_eq!(a.partial_record().len(), b.partial_record().len(), "{}", kind.name());
        }
    }

    #[test]
    fn test_long_player_name_truncates() {
        let view = EntityView::new(
            Vec2::new(10.0, 10.0),
            EntityState::Player(PlayerState {
                name: "abcdefghijklmnopqrstuvwxyz0123456789".to_string(),
                clan: "TOOLONG".to_string(),
                ..Default::default()
            }),
        );
        let out = round_trip(&view);
        let EntityState::Player(p) = out.state else {
            panic!("expected player");
        };
        assert_eq!(p.name, "abcdefghijklmnopqrstuvwx");
        assert_eq!(p.clan, "TOOL");
    }

    #[test]
    fn test_out_of_range_values_clamp() {
        let view = EntityView::new(
            Vec2::new(-50.0, WORLD_COORD_MAX * 2.0),
            EntityState::Mob(MobState {
                radius: 10_000.0,
                health: 3.0,
                ..Default::default()
            }),
        );
        let out = round_trip(&view);
        assert_eq!(out.position, Vec2::new(0.0, WORLD_COORD_MAX));
        let EntityState::Mob(m) = out.state else {
            panic!("expected mob");
        };
        assert_eq!(m.radius, MOB_RADIUS_MAX);
        assert_eq!(m.health, 1.0);
    }

    #[test]
    fn test_oversized_definitions_saturate() {
        let mob = EntityView::new(
            Vec2::new(10.0, 10.0),
            EntityState::Mob(MobState {
                definition: 200,
                rarity: 9,
                ..Default::default()
            }),
        );
        let EntityState::Mob(m) = round_trip(&mob).state else {
            panic!("expected mob");
        };
        assert_eq!(m.definition, (1 << DEFINITION_BITS) - 1);
        assert_eq!(m.rarity, (1 << RARITY_BITS) - 1);

        let petal = EntityView::new(
            Vec2::new(10.0, 10.0),
            EntityState::Petal(PetalState {
                definition: 100,
                rarity: 2,
                ..Default::default()
            }),
        );
        let EntityState::Petal(p) = round_trip(&petal).state else {
            panic!("expected petal");
        };
        assert_eq!(p.definition, (1 << PETAL_DEFINITION_BITS) - 1);
        assert_eq!(p.rarity, 2);
    }

    #[test]
    fn test_kind_mismatch_is_error() {
        let registry = SchemaRegistry::standard();
        let schema = registry.get(EntityKind::Mob).unwrap();
        let mut w = BitWriter::new();
        (schema.serialize_partial)(&EntityView::blank(EntityKind::Mob), &mut w);
        let bytes = w.into_inner();

        let mut view = EntityView::blank(EntityKind::Loot);
        let result = (schema.deserialize_partial)(&mut BitReader::new(&bytes), &mut view);
        assert!(matches!(
            result,
            Err(DecodeError::KindMismatch {
                expected: EntityKind::Mob,
                found: EntityKind::Loot
            })
        ));
    }

    proptest! {
        #[test]
        fn prop_player_round_trip(
            x in 0.0f32..WORLD_COORD_MAX,
            y in 0.0f32..WORLD_COORD_MAX,
            angle in -PI..PI,
            attacking: bool,
            defending: bool,
            health in 0.0f32..=1.0,
            level: u8,
            name in "[a-zA-Z0-9 ]{0,24}",
            clan in "[A-Z]{0,4}",
        ) {
            let state = PlayerState { angle, attacking, defending, health, level, name: name.clone(), clan: clan.clone() };
            let out = round_trip(&EntityView::new(Vec2::new(x, y), EntityState::Player(state)));
            prop_assert!(out.position.approx_eq(Vec2::new(x, y), POS_EPS));
            let EntityState::Player(p) = out.state else { return Err(TestCaseError::fail("kind changed")); };
            prop_assert!(close(p.angle, angle, ANGLE_EPS));
            prop_assert_eq!(p.attacking, attacking);
            prop_assert_eq!(p.defending, defending);
            prop_assert!(close(p.health, health, 1.0 / 65535.0));
            prop_assert_eq!(p.level, level);
            prop_assert_eq!(p.name, name);
            prop_assert_eq!(p.clan, clan);
        }

        #[test]
        fn prop_petal_round_trip(
            x in 0.0f32..WORLD_COORD_MAX,
            angle in -PI..PI,
            definition in 0u8..64,
            rarity in 0u8..8,
            owner: u16,
            health in 0.0f32..=1.0,
        ) {
            let state = PetalState { angle, definition, rarity, owner, health };
            let out = round_trip(&EntityView::new(Vec2::new(x, x), EntityState::Petal(state)));
            let EntityState::Petal(p) = out.state else { return Err(TestCaseError::fail("kind changed")); };
            prop_assert!(close(p.angle, angle, ANGLE_EPS));
            prop_assert_eq!(p.definition, definition);
            prop_assert_eq!(p.rarity, rarity);
            prop_assert_eq!(p.owner, owner);
            prop_assert!(close(p.health, health, 1.0 / 255.0 / 2.0 + 1e-6));
        }

        #[test]
        fn prop_mob_round_trip(
            y in 0.0f32..WORLD_COORD_MAX,
            definition in 0u8..128,
            rarity in 0u8..8,
            health in 0.0f32..=1.0,
            radius in 0.0f32..MOB_RADIUS_MAX,
        ) {
            let state = MobState { angle: 0.0, definition, rarity, health, radius };
            let out = round_trip(&EntityView::new(Vec2::new(1.0, y), EntityState::Mob(state)));
            prop_assert!(close(out.position.y, y, POS_EPS));
            let EntityState::Mob(m) = out.state else { return Err(TestCaseError::fail("kind changed")); };
            prop_assert_eq!(m.definition, definition);
            prop_assert_eq!(m.rarity, rarity);
            prop_assert!(close(m.health, health, 1.0 / 65535.0));
            prop_assert!(close(m.radius, radius, MOB_RADIUS_MAX / 4095.0 / 2.0 + 1e-4));
        }

        #[test]
        fn prop_loot_and_projectile_round_trip(
            definition in 0u8..128,
            rarity in 0u8..8,
            count: u8,
            owner: u16,
            radius in 0.0f32..PROJECTILE_RADIUS_MAX,
        ) {
            let loot = LootState { definition, rarity, count };
            let out = round_trip(&EntityView::new(Vec2::new(5.0, 5.0), EntityState::Loot(loot.clone())));
            prop_assert_eq!(out.state, EntityState::Loot(loot));

            let proj = ProjectileState { angle: 1.0, owner, radius, definition };
            let out = round_trip(&EntityView::new(Vec2::new(5.0, 5.0), EntityState::Projectile(proj)));
            let EntityState::Projectile(p) = out.state else { return Err(TestCaseError::fail("kind changed")); };
            prop_assert_eq!(p.owner, owner);
            prop_assert_eq!(p.definition, definition);
            prop_assert!(close(p.radius, radius, PROJECTILE_RADIUS_MAX / 1023.0 / 2.0 + 1e-4));
        }
    }
}
