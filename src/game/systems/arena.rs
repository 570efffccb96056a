//! Demo arena: the gameplay collaborator the binary runs
//!
//! Keeps wandering mobs at a target population, gives every client a player
//! with orbiting petals, fires projectiles while attacking and drops loot
//! from killed mobs. Everything goes through `World`, so dirty tracking and
//! the grid stay consistent without any replication code here.

use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxBuildHasher;
use tracing::{debug, warn};

use crate::game::entity::EntityKind;
use crate::game::game_loop::{Simulation, TickContext};
use crate::game::id_alloc::EntityId;
use crate::game::systems::players::Avatar;
use crate::game::systems::wander::Wander;
use crate::game::systems::{combat, players, wander};
use crate::game::world::World;
use crate::util::vec2::Vec2;

/// Per-entity side table keyed by entity id
pub type EntityMap<T> = HashMap<EntityId, T, FxBuildHasher>;

/// Mobs spawned per tick while below target, so a fresh arena fills gradually
const SPAWN_PER_TICK: usize = 5;

/// Keep spawns away from the world edge
const SPAWN_EDGE_MARGIN: f32 = 64.0;

/// In-flight projectile
#[derive(Debug, Clone, Copy)]
pub struct Flight {
    pub velocity: Vec2,
    /// Seconds left before it expires
    pub ttl: f32,
    /// Player entity that fired it
    pub owner: EntityId,
}

pub struct ArenaDemo {
    pub(crate) rng: StdRng,
    pub(crate) mobs: EntityMap<Wander>,
    pub(crate) projectiles: EntityMap<Flight>,
    /// Loot entity -> seconds left
    pub(crate) loot: EntityMap<f32>,
    pub(crate) avatars: EntityMap<Avatar>,
    target_mobs: usize,
    mob_cap: Option<usize>,
}

impl ArenaDemo {
    pub fn new(target_mobs: usize) -> Self {
        Self::from_rng(target_mobs, StdRng::from_entropy())
    }

    /// Deterministic arena for tests and benchmarks
    pub fn with_seed(target_mobs: usize, seed: u64) -> Self {
        Self::from_rng(target_mobs, StdRng::seed_from_u64(seed))
    }

    fn from_rng(target_mobs: usize, rng: StdRng) -> Self {
        Self {
            rng,
            mobs: EntityMap::default(),
            projectiles: EntityMap::default(),
            loot: EntityMap::default(),
            avatars: EntityMap::default(),
            target_mobs,
            mob_cap: None,
        }
    }

    /// Extra limit on the mob population (performance budget)
    pub fn set_mob_cap(&mut self, cap: Option<usize>) {
        self.mob_cap = cap;
    }

    pub fn target_mobs(&self) -> usize {
        self.target_mobs
    }

    /// Destroy up to `count` mobs, newest ids first
    pub fn shed_mobs(&mut self, world: &mut World, count: usize) -> usize {
        let mut ids: Vec<EntityId> = self.mobs.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut shed = 0;
        for id in ids.into_iter().take(count) {
            self.mobs.remove(&id);
            if world.destroy(id) {
                shed += 1;
            }
        }
        if shed > 0 {
            debug!("shed {} mobs under load", shed);
        }
        shed
    }

    pub fn mob_count(&self) -> usize {
        self.mobs.len()
    }

    pub fn projectile_count(&self) -> usize {
        self.projectiles.len()
    }

    pub fn loot_count(&self) -> usize {
        self.loot.len()
    }

    pub fn avatar_count(&self) -> usize {
        self.avatars.len()
    }

    fn random_position(&mut self, world: &World) -> Vec2 {
        let (min, max) = world.bounds();
        let margin = SPAWN_EDGE_MARGIN.min((max.x - min.x) / 4.0).min((max.y - min.y) / 4.0);
        Vec2::new(
            self.rng.gen_range(min.x + margin..=max.x - margin),
            self.rng.gen_range(min.y + margin..=max.y - margin),
        )
    }

    fn maintain_population(&mut self, world: &mut World) {
        let target = self.mob_cap.map_or(self.target_mobs, |cap| cap.min(self.target_mobs));
        let missing = target.saturating_sub(self.mobs.len()).min(SPAWN_PER_TICK);
        for _ in 0..missing {
            let position = self.random_position(world);
            match wander::spawn_mob(world, &mut self.rng, position) {
                Ok((id, steering)) => {
                    self.mobs.insert(id, steering);
                }
                Err(e) => {
                    warn!("mob spawn failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl Simulation for ArenaDemo {
    fn simulate(&mut self, world: &mut World, ctx: &TickContext<'_>) {
        players::apply_inputs(&mut self.avatars, ctx.inputs);
        players::step(world, &mut self.avatars, &mut self.projectiles, ctx.dt);
        players::orbit_petals(world, &mut self.avatars, ctx.dt);
        wander::step(world, &mut self.mobs, &mut self.rng, ctx.dt);
        combat::step_projectiles(world, &mut self.projectiles, ctx.dt);
        combat::resolve_contacts(world, self);
        combat::expire_loot(world, &mut self.loot, ctx.dt);
        self.maintain_population(world);
    }

    fn on_client_joined(&mut self, world: &mut World, client: EntityId, name: &str) -> Option<EntityId> {
        let position = self.random_position(world);
        match players::spawn_avatar(world, client, name, position) {
            Ok((entity, avatar)) => {
                self.avatars.insert(entity, avatar);
                Some(entity)
            }
            Err(e) => {
                warn!("no player entity for client {}: {}", client, e);
                None
            }
        }
    }

    fn on_client_left(&mut self, world: &mut World, _client: EntityId, entity: Option<EntityId>) {
        let Some(entity) = entity else { return };
        if let Some(avatar) = self.avatars.remove(&entity) {
            players::despawn_avatar(world, entity, &avatar);
        } else if world.entity(entity).map(|e| e.kind()) == Some(EntityKind::Player) {
            world.destroy(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::game_loop::{GameLoop, GameLoopConfig};
    use crate::game::input_buffer::ClientCommand;
    use crate::game::world::WorldConfig;
    use crate::net::replica::Replica;
    use crate::net::schema::SchemaRegistry;
    use crate::net::transport::ChannelTransport;

    fn config() -> GameLoopConfig {
        GameLoopConfig {
            world: WorldConfig {
                width: 2000.0,
                height: 2000.0,
                cell_size: 128.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_population_fills_gradually() {
        let mut game = GameLoop::new(config(), ArenaDemo::with_seed(12, 7));
        let mut transport = ChannelTransport::default();

        game.tick(&mut transport, Vec::new());
        assert_eq!(game.simulation().mob_count(), SPAWN_PER_TICK);
        for _ in 0..5 {
            game.tick(&mut transport, Vec::new());
        }
        assert_eq!(game.simulation().mob_count(), 12);
    }

    #[test]
    fn test_mob_cap_and_shedding() {
        let mut game = GameLoop::new(config(), ArenaDemo::with_seed(20, 1));
        let mut transport = ChannelTransport::default();
        game.simulation_mut().set_mob_cap(Some(5));
        for _ in 0..4 {
            game.tick(&mut transport, Vec::new());
        }
        assert_eq!(game.simulation().mob_count(), 5);

        let (world, demo) = game.parts_mut();
        assert_eq!(demo.shed_mobs(world, 2), 2);
        assert_eq!(demo.mob_count(), 3);
        assert_eq!(world.entity_count(), 3);
    }

    #[test]
    fn test_viewer_replica_tracks_world() {
        let mut game = GameLoop::new(config(), ArenaDemo::with_seed(10, 3));
        let mut transport = ChannelTransport::new(256);
        let rx = transport.register(1);
        let mut replica = Replica::new(SchemaRegistry::standard());

        let mut commands = vec![ClientCommand::Join {
            connection: 1,
            name: "viewer".into(),
        }];
        for _ in 0..60 {
            game.tick(&mut transport, commands.drain(..));
            while let Ok(packet) = rx.try_recv() {
                replica.apply(&packet).unwrap();
            }
        }

        // every entity the replica holds is alive and close to the server copy
        assert!(replica.entity_count() > 0);
        for (id, view) in replica.entities() {
            let entity = game.world().entity(id).expect("replica holds a released id");
            assert!(!entity.is_destroyed());
            assert_eq!(entity.kind(), view.kind());
            assert!(entity.view.position.approx_eq(view.position, 0.05));
        }
        assert_eq!(replica.client_name(1), Some("viewer"));
    }

    #[test]
    fn test_leave_removes_player_and_petals() {
        let mut game = GameLoop::new(config(), ArenaDemo::with_seed(0, 3));
        let mut transport = ChannelTransport::default();
        game.tick(
            &mut transport,
            vec![ClientCommand::Join {
                connection: 4,
                name: "p".into(),
            }],
        );
        assert_eq!(game.world().entity_count(), 1 + crate::game::constants::player::PETALS);

        game.tick(&mut transport, vec![ClientCommand::Leave { connection: 4 }]);
        assert_eq!(game.world().entity_count(), 0);
        assert_eq!(game.simulation().avatar_count(), 0);
    }
}
