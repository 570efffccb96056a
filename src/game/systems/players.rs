//! Client-controlled players and their orbiting petals
//!
//! Inputs are latched per player: the last input a client sent keeps
//! applying every tick until a newer one arrives.

use std::f32::consts::TAU;

use smallvec::SmallVec;
use tracing::warn;

use crate::game::constants::{petal, player, projectile};
use crate::game::entity::{EntityState, PetalState, PlayerState, ProjectileState};
use crate::game::game_loop::ClientInput;
use crate::game::id_alloc::EntityId;
use crate::game::spatial::Hitbox;
use crate::game::systems::arena::{EntityMap, Flight};
use crate::game::world::{World, WorldError};
use crate::net::protocol::PlayerInput;
use crate::util::vec2::Vec2;

/// Gameplay state of one player entity
#[derive(Debug, Clone, Default)]
pub struct Avatar {
    pub client: EntityId,
    pub petals: SmallVec<[EntityId; player::PETALS]>,
    /// Latest input received
    pub held: PlayerInput,
    /// Seconds until the next shot
    pub fire_cooldown: f32,
    /// Orbit phase of the first petal
    pub spin: f32,
}

/// Spawn a player entity plus its petals
pub fn spawn_avatar(
    world: &mut World,
    client: EntityId,
    name: &str,
    position: Vec2,
) -> Result<(EntityId, Avatar), WorldError> {
    let state = EntityState::Player(PlayerState {
        health: 1.0,
        level: 1,
        name: name.to_string(),
        ..Default::default()
    });
    let entity = world.spawn(position, Hitbox::circle(Vec2::ZERO, player::RADIUS), state)?;

    let mut avatar = Avatar {
        client,
        ..Default::default()
    };
    for i in 0..player::PETALS {
        let angle = i as f32 * TAU / player::PETALS as f32;
        let state = EntityState::Petal(PetalState {
            angle,
            definition: 1,
            rarity: 0,
            owner: entity,
            health: 1.0,
        });
        let at = position + Vec2::from_angle(angle) * petal::ORBIT_REST;
        match world.spawn(at, Hitbox::circle(Vec2::ZERO, petal::RADIUS), state) {
            Ok(id) => avatar.petals.push(id),
            Err(e) => {
                warn!("player {} spawned without all petals: {}", entity, e);
                break;
            }
        }
    }
    Ok((entity, avatar))
}

pub fn despawn_avatar(world: &mut World, entity: EntityId, avatar: &Avatar) {
    for &petal in &avatar.petals {
        world.destroy(petal);
    }
    world.destroy(entity);
}

/// Latch the newest input of every client onto its player
pub fn apply_inputs(avatars: &mut EntityMap<Avatar>, inputs: &[ClientInput]) {
    for input in inputs {
        let Some(entity) = input.entity else { continue };
        if let Some(avatar) = avatars.get_mut(&entity) {
            avatar.held = input.input.clone();
        }
    }
}

/// Move players by their held input and fire while attacking
pub fn step(world: &mut World, avatars: &mut EntityMap<Avatar>, projectiles: &mut EntityMap<Flight>, dt: f32) {
    let mut ids: Vec<EntityId> = avatars.keys().copied().collect();
    ids.sort_unstable();

    for id in ids {
        let Some(position) = world.entity(id).filter(|e| !e.is_destroyed()).map(|e| e.view.position) else {
            continue;
        };
        let Some(avatar) = avatars.get_mut(&id) else { continue };

        let mut movement = avatar.held.movement;
        if movement.length_sq() > 1.0 {
            movement = movement.normalize();
        }
        let moving = movement.length_sq() > 0.0;
        let (attacking, defending) = (avatar.held.attacking, avatar.held.defending);

        let mut changed = false;
        let mut facing = 0.0;
        if let Ok(EntityState::Player(state)) = world.state_mut(id) {
            if moving {
                state.angle = movement.angle();
            }
            changed = state.attacking != attacking || state.defending != defending || moving;
            state.attacking = attacking;
            state.defending = defending;
            facing = state.angle;
        }
        if moving {
            let _ = world.set_position(id, position + movement * (player::SPEED * dt));
        } else if changed {
            let _ = world.mark_dirty(id);
        }

        avatar.fire_cooldown = (avatar.fire_cooldown - dt).max(0.0);
        if attacking && avatar.fire_cooldown <= 0.0 {
            avatar.fire_cooldown = player::FIRE_INTERVAL;
            let direction = Vec2::from_angle(facing);
            let muzzle = position + direction * (player::RADIUS + projectile::RADIUS);
            let state = EntityState::Projectile(ProjectileState {
                angle: facing,
                owner: id,
                radius: projectile::RADIUS,
                definition: 0,
            });
            match world.spawn(muzzle, Hitbox::circle(Vec2::ZERO, projectile::RADIUS), state) {
                Ok(shot) => {
                    projectiles.insert(
                        shot,
                        Flight {
                            velocity: direction * projectile::SPEED,
                            ttl: projectile::LIFETIME,
                            owner: id,
                        },
                    );
                }
                Err(e) => warn!("player {} could not fire: {}", id, e),
            }
        }
    }
}

/// Spin every player's petals around it; the orbit widens while attacking
/// and tightens while defending
pub fn orbit_petals(world: &mut World, avatars: &mut EntityMap<Avatar>, dt: f32) {
    for (&id, avatar) in avatars.iter_mut() {
        let Some(center) = world.entity(id).filter(|e| !e.is_destroyed()).map(|e| e.view.position) else {
            continue;
        };
        let radius = if avatar.held.attacking {
            petal::ORBIT_ATTACK
        } else if avatar.held.defending {
            petal::ORBIT_DEFEND
        } else {
            petal::ORBIT_REST
        };
        avatar.spin = (avatar.spin + petal::SPIN_SPEED * dt) % TAU;

        let count = avatar.petals.len().max(1) as f32;
        for (i, &petal) in avatar.petals.iter().enumerate() {
            let angle = avatar.spin + i as f32 * TAU / count;
            if let Ok(state) = world.state_mut(petal) {
                state.set_angle(crate::game::systems::wander::wrap_angle(angle));
            }
            let _ = world.set_position(petal, center + Vec2::from_angle(angle) * radius);
        }
    }
}
