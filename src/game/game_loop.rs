//! Authoritative tick loop
//!
//! ## Tick order
//!
//! ```text
//! 1. Apply queued client commands (join / leave / camera / input)
//! 2. Run the simulation
//! 3. Serialize dirty entities (full first, then partial)
//! 4. For every client: follow camera, build its packet
//! 5. Hand each packet to the transport
//! 6. Clear dirty sets, release ids, clear roster transients
//! ```
//!
//! Ids of entities and clients removed during a tick are released only in
//! step 6, after every packet that mentions them has been built.

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, info, warn};

use crate::game::id_alloc::{EntityId, IdAllocator, IdConfig, IdError};
use crate::game::input_buffer::{ClientCommand, ConnectionId};
use crate::game::world::{SerializeStats, World, WorldConfig};
use crate::net::interest::{ClientInterest, InterestConfig, InterestManager, RosterDelta};
use crate::net::packet::{MapInfo, ZOOM_MAX, ZOOM_MIN};
use crate::net::protocol::PlayerInput;
use crate::net::schema::SchemaRegistry;
use crate::net::schemas::MAX_NAME_BYTES;
use crate::net::transport::Transport;

/// Default simulation rate
pub const DEFAULT_TICK_RATE: u32 = 30;

/// Client ids share the wire id space with entities but come from their own
/// allocator; 0 means "nobody"
const CLIENT_ID_FLOOR: EntityId = 1;

/// Latest input of one client, handed to the simulation
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInput {
    pub client: EntityId,
    /// Entity the client controls, if the simulation gave it one
    pub entity: Option<EntityId>,
    pub input: PlayerInput,
}

/// Per-tick context passed to the simulation
#[derive(Debug)]
pub struct TickContext<'a> {
    pub tick: u64,
    /// Seconds per tick
    pub dt: f32,
    /// Latest input per client received since the previous tick
    pub inputs: &'a [ClientInput],
}

/// Gameplay rules plugged into the loop
pub trait Simulation {
    /// Advance the world by one tick
    fn simulate(&mut self, world: &mut World, ctx: &TickContext<'_>);

    /// A client joined. Return the entity its camera should follow.
    fn on_client_joined(&mut self, _world: &mut World, _client: EntityId, _name: &str) -> Option<EntityId> {
        None
    }

    /// A client left; `entity` is what `on_client_joined` returned
    fn on_client_left(&mut self, _world: &mut World, _client: EntityId, _entity: Option<EntityId>) {}
}

/// Loop parameters
#[derive(Debug, Clone)]
pub struct GameLoopConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    pub world: WorldConfig,
    pub interest: InterestConfig,
}

impl Default for GameLoopConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_clients: 256,
            world: WorldConfig::default(),
            interest: InterestConfig::default(),
        }
    }
}

/// Connected client state
#[derive(Debug)]
pub struct ConnectedClient {
    pub interest: ClientInterest,
    /// Entity handed out by the simulation on join
    pub entity: Option<EntityId>,
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub entities: usize,
    pub clients: usize,
    pub commands: usize,
    pub bytes_sent: usize,
    pub packets_sent: usize,
    /// Records regenerated in the serialization phase
    pub serialized: SerializeStats,
    pub full_records: usize,
    pub partial_records: usize,
    pub deleted_records: usize,
    pub entered: usize,
    pub ids_released: usize,
    /// Joins turned away (server full, no client id left)
    pub joins_refused: usize,
}

/// Why a join was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("connection already joined")]
    AlreadyJoined,
    #[error("server full ({0} clients)")]
    Full(usize),
    #[error(transparent)]
    Ids(#[from] IdError),
}

/// One game instance: world, clients and the simulation driving them
pub struct GameLoop<S: Simulation> {
    world: World,
    simulation: S,
    interest: InterestManager,
    clients: HashMap<ConnectionId, ConnectedClient, FxBuildHasher>,
    client_ids: IdAllocator,
    /// Client ids freed this tick, released in step 6
    released_clients: Vec<EntityId>,
    /// Connections whose join was refused this tick
    refused_joins: Vec<ConnectionId>,
    roster: RosterDelta,
    /// Latest input per connection this tick
    inputs: HashMap<ConnectionId, PlayerInput, FxBuildHasher>,
    input_scratch: Vec<ClientInput>,
    map: MapInfo,
    dt: f32,
    max_clients: usize,
}

impl<S: Simulation> GameLoop<S> {
    pub fn new(config: GameLoopConfig, simulation: S) -> Self {
        Self::with_schemas(config, SchemaRegistry::standard(), simulation)
    }

    pub fn with_schemas(config: GameLoopConfig, schemas: SchemaRegistry, simulation: S) -> Self {
        let map = MapInfo {
            width: clamp_u16(config.world.width),
            height: clamp_u16(config.world.height),
            cell_size: clamp_u16(config.world.cell_size),
        };
        let tick_rate = config.tick_rate.max(1);
        Self {
            world: World::new(config.world, schemas),
            simulation,
            interest: InterestManager::new(config.interest),
            clients: HashMap::with_hasher(FxBuildHasher),
            client_ids: IdAllocator::new(IdConfig {
                floor: CLIENT_ID_FLOOR,
                ceiling: EntityId::MAX,
                release_delay_ticks: 0,
            }),
            released_clients: Vec::new(),
            refused_joins: Vec::new(),
            roster: RosterDelta::default(),
            inputs: HashMap::with_hasher(FxBuildHasher),
            input_scratch: Vec::new(),
            map,
            dt: 1.0 / tick_rate as f32,
            max_clients: config.max_clients,
        }
    }

    // ------------------------------------------------------------------------
    // Client lifecycle (step 1)
    // ------------------------------------------------------------------------

    /// Admit a connection. Its first packet carries the map, the camera and
    /// the full roster.
    pub fn join(&mut self, connection: ConnectionId, name: &str) -> Result<EntityId, JoinError> {
        if self.clients.contains_key(&connection) {
            return Err(JoinError::AlreadyJoined);
        }
        if self.clients.len() >= self.max_clients {
            return Err(JoinError::Full(self.max_clients));
        }
        let client = self.client_ids.allocate()?;
        let name = sanitize_name(name);

        let entity = self.simulation.on_client_joined(&mut self.world, client, &name);
        let mut interest = ClientInterest::new(client, name.clone());
        interest.view.follow = entity;
        interest.follow_camera(&self.world);

        self.clients.insert(connection, ConnectedClient { interest, entity });
        self.roster.joined.push((client, name.clone()));
        info!("client {} ({}) joined on connection {}", client, name, connection);
        Ok(client)
    }

    /// Remove a connection. Returns its client id if it had joined.
    pub fn leave(&mut self, connection: ConnectionId) -> Option<EntityId> {
        let client = self.clients.remove(&connection)?;
        let id = client.interest.id;
        self.inputs.remove(&connection);
        self.simulation.on_client_left(&mut self.world, id, client.entity);
        self.roster.joined.retain(|(joined, _)| *joined != id);
        self.roster.left.push(id);
        self.released_clients.push(id);
        info!("client {} ({}) left", id, client.interest.name);
        Some(id)
    }

    fn apply_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Join { connection, name } => {
                match self.join(connection, &name) {
                    Ok(_) => {}
                    // the connection is already a live client
                    Err(JoinError::AlreadyJoined) => {
                        debug!("repeated join from connection {}", connection);
                    }
                    Err(e) => {
                        warn!("join from connection {} refused: {}", connection, e);
                        self.refused_joins.push(connection);
                    }
                }
            }
            ClientCommand::Leave { connection } => {
                if self.leave(connection).is_none() {
                    debug!("leave from unknown connection {}", connection);
                }
            }
            ClientCommand::Camera { connection, zoom } => {
                let Some(client) = self.clients.get_mut(&connection) else {
                    debug!("camera update from unknown connection {}", connection);
                    return;
                };
                if !zoom.is_finite() {
                    warn!("connection {} sent non-finite zoom", connection);
                    return;
                }
                client.interest.view.zoom = zoom.clamp(ZOOM_MIN, ZOOM_MAX);
            }
            ClientCommand::Input { connection, input } => {
                if !self.clients.contains_key(&connection) {
                    debug!("input from unknown connection {}", connection);
                    return;
                }
                if !input.movement.is_finite() {
                    warn!("connection {} sent non-finite movement", connection);
                    return;
                }
                match self.inputs.get(&connection) {
                    Some(last) if last.sequence > input.sequence => {}
                    _ => {
                        self.inputs.insert(connection, input);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// Run one tick with the commands queued since the previous one
    pub fn tick<T, I>(&mut self, transport: &mut T, commands: I) -> TickReport
    where
        T: Transport + ?Sized,
        I: IntoIterator<Item = ClientCommand>,
    {
        let tick = self.world.tick();
        let mut report = TickReport {
            tick,
            ..Default::default()
        };

        // 1. commands
        self.refused_joins.clear();
        for command in commands {
            report.commands += 1;
            self.apply_command(command);
        }
        self.input_scratch.clear();
        for (connection, input) in self.inputs.drain() {
            if let Some(client) = self.clients.get(&connection) {
                self.input_scratch.push(ClientInput {
                    client: client.interest.id,
                    entity: client.entity,
                    input,
                });
            }
        }
        self.input_scratch.sort_unstable_by_key(|i| i.client);

        // 2. simulation
        let ctx = TickContext {
            tick,
            dt: self.dt,
            inputs: &self.input_scratch,
        };
        self.simulation.simulate(&mut self.world, &ctx);

        // 3. serialization
        report.serialized = self.world.serialize_dirty();

        // 4 + 5. per-client packets
        let welcome = if self.clients.values().any(|c| !c.interest.map_sent) {
            Some(self.full_roster())
        } else {
            None
        };
        for (&connection, client) in self.clients.iter_mut() {
            client.interest.follow_camera(&self.world);
            let roster = match &welcome {
                Some(all) if !client.interest.map_sent => all,
                _ => &self.roster,
            };
            let (packet, stats) = self
                .interest
                .build_packet(&mut client.interest, &self.world, roster, &self.map);

            report.bytes_sent += stats.bytes;
            report.full_records += stats.full;
            report.partial_records += stats.partial;
            report.deleted_records += stats.left;
            report.entered += stats.entered;
            report.packets_sent += 1;
            transport.send(connection, packet);
        }

        // 6. end of tick
        report.ids_released = self.world.end_tick();
        for id in self.released_clients.drain(..) {
            self.client_ids.release(id);
        }
        self.roster.clear();

        report.entities = self.world.entity_count();
        report.clients = self.clients.len();
        report.joins_refused = self.refused_joins.len();
        debug!(
            "tick {}: {} entities, {} clients, {} bytes",
            tick, report.entities, report.clients, report.bytes_sent
        );
        report
    }

    /// Every connected client, for a newcomer's first packet
    fn full_roster(&self) -> RosterDelta {
        let mut joined: Vec<(EntityId, String)> = self
            .clients
            .values()
            .map(|c| (c.interest.id, c.interest.name.clone()))
            .collect();
        joined.sort_unstable_by_key(|(id, _)| *id);
        RosterDelta {
            joined,
            left: self.roster.left.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    /// World and simulation together, for out-of-tick maintenance
    pub fn parts_mut(&mut self) -> (&mut World, &mut S) {
        (&mut self.world, &mut self.simulation)
    }

    pub fn client(&self, connection: ConnectionId) -> Option<&ConnectedClient> {
        self.clients.get(&connection)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Connections refused during the last tick. Their owner should close
    /// them; the loop never sends to a connection that is not a client.
    pub fn refused_joins(&self) -> &[ConnectionId] {
        &self.refused_joins
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn is_client_id_allocated(&self, id: EntityId) -> bool {
        self.client_ids.is_allocated(id)
    }

    pub fn map(&self) -> &MapInfo {
        &self.map
    }

    pub fn tick_count(&self) -> u64 {
        self.world.tick()
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }
}

fn clamp_u16(value: f32) -> u16 {
    value.clamp(0.0, u16::MAX as f32) as u16
}

/// Trim, drop control characters and cut to the wire limit
fn sanitize_name(name: &str) -> String {
    let mut clean = String::with_capacity(name.len().min(MAX_NAME_BYTES));
    for c in name.trim().chars().filter(|c| !c.is_control()) {
        if clean.len() + c.len_utf8() > MAX_NAME_BYTES {
            break;
        }
        clean.push(c);
    }
    if clean.is_empty() {
        clean.push_str("unnamed");
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{EntityKind, EntityState, MobState, PlayerState};
    use crate::game::spatial::Hitbox;
    use crate::net::packet::decode_update;
    use crate::net::replica::Replica;
    use crate::net::transport::ChannelTransport;
    use crate::util::vec2::Vec2;

    /// Players spawn at a fixed point and move `movement * 100` per tick
    #[derive(Default)]
    struct Walkers {
        spawn: Vec2,
        simulated: u64,
        left: Vec<(EntityId, Option<EntityId>)>,
    }

    impl Simulation for Walkers {
        fn simulate(&mut self, world: &mut World, ctx: &TickContext<'_>) {
            self.simulated += 1;
            for input in ctx.inputs {
                let Some(entity) = input.entity else { continue };
                let Some(pos) = world.entity(entity).map(|e| e.view.position) else { continue };
                let _ = world.set_position(entity, pos + input.input.movement * 100.0);
            }
        }

        fn on_client_joined(&mut self, world: &mut World, _client: EntityId, name: &str) -> Option<EntityId> {
            let state = EntityState::Player(PlayerState {
                health: 1.0,
                name: name.to_string(),
                ..Default::default()
            });
            world
                .spawn(self.spawn, Hitbox::circle(Vec2::ZERO, 25.0), state)
                .ok()
        }

        fn on_client_left(&mut self, world: &mut World, client: EntityId, entity: Option<EntityId>) {
            self.left.push((client, entity));
            if let Some(entity) = entity {
                world.destroy(entity);
            }
        }
    }

    fn game() -> GameLoop<Walkers> {
        let config = GameLoopConfig {
            tick_rate: 20,
            max_clients: 2,
            world: WorldConfig {
                width: 4000.0,
                height: 4000.0,
                cell_size: 100.0,
                ..Default::default()
            },
            interest: InterestConfig::default(),
        };
        GameLoop::new(
            config,
            Walkers {
                spawn: Vec2::new(1000.0, 1000.0),
                ..Default::default()
            },
        )
    }

    fn join(connection: ConnectionId, name: &str) -> ClientCommand {
        ClientCommand::Join {
            connection,
            name: name.to_string(),
        }
    }

    fn walk(connection: ConnectionId, sequence: u32, movement: Vec2) -> ClientCommand {
        ClientCommand::Input {
            connection,
            input: PlayerInput {
                sequence,
                movement,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_first_packet_carries_everything() {
        let mut game = game();
        let mut transport = ChannelTransport::new(8);
        let rx = transport.register(1);

        let report = game.tick(&mut transport, vec![join(1, "ada")]);
        assert_eq!(report.clients, 1);
        assert_eq!(report.entered, 1);

        let packet = rx.try_recv().unwrap();
        let update = decode_update(&packet, game.world().schemas()).unwrap();
        assert_eq!(update.new_clients, vec![(1, "ada".to_string())]);
        assert_eq!(update.full.len(), 1);
        assert_eq!(update.full[0].view.kind(), EntityKind::Player);
        assert!(update.map.is_some());
        let scalar = update.scalar.unwrap();
        assert_eq!(scalar.follow, update.full[0].id);
    }

    #[test]
    fn test_quiet_tick_sends_empty_packet() {
        let mut game = game();
        let mut transport = ChannelTransport::new(8);
        let rx = transport.register(1);

        game.tick(&mut transport, vec![join(1, "ada")]);
        rx.try_recv().unwrap();

        let report = game.tick(&mut transport, Vec::new());
        assert_eq!(rx.try_recv().unwrap(), vec![0, 0]);
        assert_eq!(report.bytes_sent, 2);
        assert_eq!(report.full_records + report.partial_records, 0);
    }

    #[test]
    fn test_input_applies_at_tick_and_replicates_partially() {
        let mut game = game();
        let mut transport = ChannelTransport::new(8);
        let rx = transport.register(1);
        let mut replica = Replica::new(SchemaRegistry::standard());

        game.tick(&mut transport, vec![join(1, "ada")]);
        replica.apply(&rx.try_recv().unwrap()).unwrap();

        // a stale sequence number loses to the newest input
        let report = game.tick(
            &mut transport,
            vec![walk(1, 5, Vec2::new(1.0, 0.0)), walk(1, 4, Vec2::new(-1.0, 0.0))],
        );
        assert_eq!(report.partial_records, 1);
        replica.apply(&rx.try_recv().unwrap()).unwrap();

        let player = game.client(1).unwrap().entity.unwrap();
        let view = replica.entity(player).unwrap();
        assert!((view.position.x - 1100.0).abs() < 0.1);
        // camera followed the player
        assert!((replica.scalar().unwrap().camera.x - 1100.0).abs() < 0.1);
    }

    #[test]
    fn test_leave_deletes_and_releases_after_tick() {
        let mut game = game();
        let mut transport = ChannelTransport::new(8);
        let rx_a = transport.register(1);
        let rx_b = transport.register(2);

        game.tick(&mut transport, vec![join(1, "ada"), join(2, "bob")]);
        let first_b = decode_update(&rx_b.try_recv().unwrap(), game.world().schemas()).unwrap();
        assert_eq!(first_b.new_clients.len(), 2);
        rx_a.try_recv().unwrap();

        let player_a = game.client(1).unwrap().entity.unwrap();
        let client_a = game.client(1).unwrap().interest.id;

        game.tick(&mut transport, vec![ClientCommand::Leave { connection: 1 }]);
        let update = decode_update(&rx_b.try_recv().unwrap(), game.world().schemas()).unwrap();
        assert_eq!(update.deleted, vec![player_a]);
        assert_eq!(update.removed_clients, vec![client_a]);

        assert!(!game.world().is_id_allocated(player_a));
        assert!(!game.is_client_id_allocated(client_a));
        assert_eq!(game.simulation().left, vec![(client_a, Some(player_a))]);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_late_joiner_learns_existing_roster() {
        let mut game = game();
        let mut transport = ChannelTransport::new(8);
        let rx_a = transport.register(1);
        let rx_b = transport.register(2);

        game.tick(&mut transport, vec![join(1, "ada")]);
        rx_a.try_recv().unwrap();
        game.tick(&mut transport, vec![join(2, "bob")]);

        let to_a = decode_update(&rx_a.try_recv().unwrap(), game.world().schemas()).unwrap();
        let to_b = decode_update(&rx_b.try_recv().unwrap(), game.world().schemas()).unwrap();
        assert_eq!(to_a.new_clients, vec![(2, "bob".to_string())]);
        assert_eq!(
            to_b.new_clients,
            vec![(1, "ada".to_string()), (2, "bob".to_string())]
        );
    }

    #[test]
    fn test_admission_limits() {
        let mut game = game();
        assert_eq!(game.join(1, "a"), Ok(1));
        assert_eq!(game.join(1, "a"), Err(JoinError::AlreadyJoined));
        assert_eq!(game.join(2, "b"), Ok(2));
        assert_eq!(game.join(3, "c"), Err(JoinError::Full(2)));
    }

    #[test]
    fn test_refused_joins_are_reported_per_tick() {
        let mut game = game();
        let mut transport = ChannelTransport::new(8);

        let report = game.tick(&mut transport, vec![join(1, "a"), join(2, "b"), join(3, "c")]);
        assert_eq!(report.joins_refused, 1);
        assert_eq!(game.refused_joins(), &[3]);

        // a repeated join from a live client is not a refusal
        let report = game.tick(&mut transport, vec![join(1, "a")]);
        assert_eq!(report.joins_refused, 0);
        assert!(game.refused_joins().is_empty());
        assert_eq!(game.client_count(), 2);
    }

    #[test]
    fn test_commands_from_unknown_connections_are_ignored() {
        let mut game = game();
        let mut transport = ChannelTransport::new(8);
        let report = game.tick(
            &mut transport,
            vec![
                walk(9, 1, Vec2::new(1.0, 0.0)),
                ClientCommand::Camera { connection: 9, zoom: 2.0 },
                ClientCommand::Leave { connection: 9 },
            ],
        );
        assert_eq!(report.commands, 3);
        assert_eq!(report.clients, 0);
        assert_eq!(game.simulation().simulated, 1);
    }

    #[test]
    fn test_zoom_out_widens_view() {
        let mut game = game();
        let mut transport = ChannelTransport::new(8);
        let rx = transport.register(1);
        game.tick(&mut transport, vec![join(1, "ada")]);
        rx.try_recv().unwrap();

        // 1700 units right of the player: outside the zoom 1.0 view
        let state = EntityState::Mob(MobState {
            health: 1.0,
            radius: 10.0,
            ..Default::default()
        });
        let mob = game
            .world_mut()
            .spawn(Vec2::new(2700.0, 1000.0), Hitbox::circle(Vec2::ZERO, 10.0), state)
            .unwrap();
        game.tick(&mut transport, Vec::new());
        assert_eq!(rx.try_recv().unwrap(), vec![0, 0]);

        game.tick(&mut transport, vec![ClientCommand::Camera { connection: 1, zoom: 0.5 }]);
        let update = decode_update(&rx.try_recv().unwrap(), game.world().schemas()).unwrap();
        assert_eq!(update.full.iter().map(|r| r.id).collect::<Vec<_>>(), vec![mob]);
        assert!(update.scalar.is_some());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("  ada\n"), "ada");
        assert_eq!(sanitize_name(""), "unnamed");
        let long = "é".repeat(20);
        let clean = sanitize_name(&long);
        assert!(clean.len() <= MAX_NAME_BYTES);
        assert_eq!(clean.chars().count(), MAX_NAME_BYTES / 2);
    }
}
