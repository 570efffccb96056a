//! Projectiles, contacts and loot
//!
//! Contacts come from the grid's overlapping-pair pass. Health changes are
//! full-record fields, so damaged mobs are marked full-dirty; pushes only
//! move entities and stay partial.

use tracing::debug;

use crate::game::constants::{collision, loot, petal, player, projectile};
use crate::game::entity::{EntityKind, EntityState, LootState};
use crate::game::id_alloc::EntityId;
use crate::game::spatial::Hitbox;
use crate::game::systems::arena::{ArenaDemo, EntityMap, Flight};
use crate::game::world::World;
use crate::util::vec2::Vec2;

/// Move projectiles and destroy the expired ones. Returns how many expired.
pub fn step_projectiles(world: &mut World, projectiles: &mut EntityMap<Flight>, dt: f32) -> usize {
    let (min, max) = world.bounds();
    let mut expired = Vec::new();

    for (&id, flight) in projectiles.iter_mut() {
        flight.ttl -= dt;
        let Some(position) = world.entity(id).filter(|e| !e.is_destroyed()).map(|e| e.view.position) else {
            expired.push(id);
            continue;
        };
        let next = position + flight.velocity * dt;
        let outside = next.x < min.x || next.x > max.x || next.y < min.y || next.y > max.y;
        if flight.ttl <= 0.0 || outside {
            expired.push(id);
        } else {
            let _ = world.set_position(id, next);
        }
    }

    for &id in &expired {
        projectiles.remove(&id);
        world.destroy(id);
    }
    expired.len()
}

/// Despawn loot nobody picked up in time
pub fn expire_loot(world: &mut World, drops: &mut EntityMap<f32>, dt: f32) -> usize {
    let mut expired = Vec::new();
    for (&id, ttl) in drops.iter_mut() {
        *ttl -= dt;
        if *ttl <= 0.0 || !world.is_alive(id) {
            expired.push(id);
        }
    }
    for &id in &expired {
        drops.remove(&id);
        world.destroy(id);
    }
    expired.len()
}

/// Remove health from a mob; kill it and drop loot at zero
fn damage_mob(world: &mut World, demo: &mut ArenaDemo, mob: EntityId, amount: f32) {
    let Ok(EntityState::Mob(state)) = world.state_mut(mob) else { return };
    state.health = (state.health - amount).max(0.0);
    let (health, definition, rarity) = (state.health, state.definition, state.rarity);

    if health > 0.0 {
        let _ = world.mark_full_dirty(mob);
        return;
    }

    let position = world.entity(mob).map(|e| e.view.position).unwrap_or(Vec2::ZERO);
    demo.mobs.remove(&mob);
    world.destroy(mob);

    let state = EntityState::Loot(LootState {
        definition,
        rarity,
        count: 1,
    });
    match world.spawn(position, Hitbox::circle(Vec2::ZERO, loot::RADIUS), state) {
        Ok(drop) => {
            demo.loot.insert(drop, loot::LIFETIME);
            debug!("mob {} died, dropped loot {}", mob, drop);
        }
        Err(e) => debug!("mob {} died without loot: {}", mob, e),
    }
}

/// Apply every contact of this tick
pub fn resolve_contacts(world: &mut World, demo: &mut ArenaDemo) {
    let mut pairs: Vec<(EntityId, EntityId, Vec2)> = Vec::new();
    world
        .grid()
        .for_each_overlapping_pair(|a, b, push| pairs.push((a, b, push)));
    // grid iteration order is unspecified
    pairs.sort_unstable_by_key(|&(a, b, _)| (a, b));

    for (a, b, push) in pairs {
        // earlier contacts may have destroyed either side
        let (Some(kind_a), Some(kind_b)) = (live_kind(world, a), live_kind(world, b)) else {
            continue;
        };

        use EntityKind::*;
        match (kind_a, kind_b) {
            (Projectile, Mob) | (Mob, Projectile) => {
                let (shot, mob) = if kind_a == Projectile { (a, b) } else { (b, a) };
                demo.projectiles.remove(&shot);
                world.destroy(shot);
                damage_mob(world, demo, mob, projectile::DAMAGE);
            }
            (Petal, Mob) | (Mob, Petal) => {
                let (petal_id, mob) = if kind_a == Petal { (a, b) } else { (b, a) };
                if owner_attacking(world, demo, petal_id) {
                    damage_mob(world, demo, mob, petal::DAMAGE);
                }
            }
            (Player, Loot) | (Loot, Player) => {
                let (player_id, drop) = if kind_a == Player { (a, b) } else { (b, a) };
                demo.loot.remove(&drop);
                world.destroy(drop);
                if let Ok(EntityState::Player(state)) = world.state_mut(player_id) {
                    state.level = state.level.saturating_add(1);
                    let growth = f32::from(state.level.saturating_sub(1)) * player::GROWTH_PER_LEVEL;
                    let _ = world.mark_full_dirty(player_id);
                    let _ = world.set_radius(player_id, player::RADIUS + growth);
                }
            }
            (Player, Mob) | (Mob, Player) | (Mob, Mob) | (Player, Player) => {
                separate(world, a, b, push);
            }
            _ => {}
        }
    }
}

fn live_kind(world: &World, id: EntityId) -> Option<EntityKind> {
    world.entity(id).filter(|e| !e.is_destroyed()).map(|e| e.kind())
}

fn owner_attacking(world: &World, demo: &ArenaDemo, petal_id: EntityId) -> bool {
    let Some(EntityState::Petal(state)) = world.entity(petal_id).map(|e| &e.view.state) else {
        return false;
    };
    demo.avatars
        .get(&state.owner)
        .map_or(false, |avatar| avatar.held.attacking)
}

/// Push both entities apart, each taking half of the resolved overlap
fn separate(world: &mut World, a: EntityId, b: EntityId, push: Vec2) {
    let step = push * (collision::PUSH_FACTOR * 0.5);
    if step.length_sq() == 0.0 {
        return;
    }
    if let Some(pa) = world.entity(a).map(|e| e.view.position) {
        let _ = world.set_position(a, pa + step);
    }
    if let Some(pb) = world.entity(b).map(|e| e.view.position) {
        let _ = world.set_position(b, pb - step);
    }
}
