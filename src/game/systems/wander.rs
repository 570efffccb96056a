//! Wandering mob steering
//!
//! Mobs drift along a slowly turning heading and bounce off the world edge.
//! Moving marks them partial-dirty; nothing else about a mob changes here.

use std::f32::consts::{PI, TAU};

use rand::Rng;

use crate::game::constants::mob::*;
use crate::game::entity::{EntityState, MobState};
use crate::game::id_alloc::EntityId;
use crate::game::spatial::Hitbox;
use crate::game::systems::arena::EntityMap;
use crate::game::world::{World, WorldError};
use crate::util::vec2::Vec2;

/// Steering state of one mob
#[derive(Debug, Clone, Copy)]
pub struct Wander {
    pub heading: f32,
    /// Units per second
    pub speed: f32,
}

/// Wrap an angle into `[-PI, PI)`
#[inline]
pub fn wrap_angle(angle: f32) -> f32 {
    (angle + PI).rem_euclid(TAU) - PI
}

/// Spawn a random mob at `position`
pub fn spawn_mob<R: Rng>(world: &mut World, rng: &mut R, position: Vec2) -> Result<(EntityId, Wander), WorldError> {
    let radius = rng.gen_range(MIN_RADIUS..=MAX_RADIUS);
    let heading = rng.gen_range(-PI..PI);
    let state = EntityState::Mob(MobState {
        angle: heading,
        definition: rng.gen_range(0..DEFINITIONS),
        rarity: rng.gen_range(0..=MAX_RARITY),
        health: 1.0,
        radius,
    });
    let id = world.spawn(position, Hitbox::circle(Vec2::ZERO, radius), state)?;
    // bigger mobs are slower
    let speed = SPEED * (MIN_RADIUS / radius).sqrt();
    Ok((id, Wander { heading, speed }))
}

/// Advance every mob by one tick
pub fn step<R: Rng>(world: &mut World, mobs: &mut EntityMap<Wander>, rng: &mut R, dt: f32) {
    let (min, max) = world.bounds();
    let mut ids: Vec<EntityId> = mobs.keys().copied().collect();
    ids.sort_unstable();

    for id in ids {
        let Some(position) = world
            .entity(id)
            .filter(|e| !e.is_destroyed())
            .map(|e| e.view.position)
        else {
            mobs.remove(&id);
            continue;
        };
        let Some(steering) = mobs.get_mut(&id) else { continue };

        steering.heading += rng.gen_range(-TURN_RATE..=TURN_RATE) * dt;
        let next = position + Vec2::from_angle(steering.heading) * (steering.speed * dt);
        if next.x <= min.x || next.x >= max.x {
            steering.heading = PI - steering.heading;
        }
        if next.y <= min.y || next.y >= max.y {
            steering.heading = -steering.heading;
        }
        steering.heading = wrap_angle(steering.heading);
        let heading = steering.heading;

        if let Ok(state) = world.state_mut(id) {
            state.set_angle(heading);
        }
        let _ = world.set_position(id, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::WorldConfig;
    use crate::net::schema::SchemaRegistry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn world() -> World {
        World::new(
            WorldConfig {
                width: 1000.0,
                height: 1000.0,
                cell_size: 100.0,
                ..Default::default()
            },
            SchemaRegistry::standard(),
        )
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(2.5 * PI) - 0.5 * PI).abs() < 1e-4);
        assert!((wrap_angle(0.5) - 0.5).abs() < 1e-6);
        assert!((wrap_angle(-PI - 0.5) - (PI - 0.5)).abs() < 1e-4);
    }

    #[test]
    fn test_spawned_mob_is_within_ranges() {
        let mut world = world();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let (id, steering) = spawn_mob(&mut world, &mut rng, Vec2::new(500.0, 500.0)).unwrap();
            let EntityState::Mob(mob) = &world.entity(id).unwrap().view.state else {
                panic!("spawned a non-mob");
            };
            assert!(mob.radius >= MIN_RADIUS && mob.radius <= MAX_RADIUS);
            assert!(mob.rarity <= MAX_RARITY);
            assert!(steering.speed <= SPEED && steering.speed > 0.0);
        }
    }

    #[test]
    fn test_step_moves_and_marks_partial() {
        let mut world = world();
        let mut rng = StdRng::seed_from_u64(5);
        let mut mobs = EntityMap::default();
        let (id, steering) = spawn_mob(&mut world, &mut rng, Vec2::new(500.0, 500.0)).unwrap();
        mobs.insert(id, steering);

        step(&mut world, &mut mobs, &mut rng, 0.5);

        let moved = world.entity(id).unwrap().view.position;
        assert!(moved.distance_sq_to(Vec2::new(500.0, 500.0)) > 0.0);
        assert!(world.dirty().is_partial(id));
        assert!(!world.dirty().is_full(id));
    }

    #[test]
    fn test_step_stays_in_bounds_and_drops_dead_mobs() {
        let mut world = world();
        let mut rng = StdRng::seed_from_u64(9);
        let mut mobs = EntityMap::default();
        for i in 0..10 {
            let (id, steering) = spawn_mob(&mut world, &mut rng, Vec2::new(5.0 + i as f32, 995.0)).unwrap();
            mobs.insert(id, steering);
        }
        let doomed = *mobs.keys().next().unwrap();
        world.destroy(doomed);

        for _ in 0..200 {
            step(&mut world, &mut mobs, &mut rng, 0.1);
        }
        assert_eq!(mobs.len(), 9);
        for &id in mobs.keys() {
            let p = world.entity(id).unwrap().view.position;
            assert!(p.x >= 0.0 && p.x <= 1000.0 && p.y >= 0.0 && p.y <= 1000.0);
        }
    }
}
