//! Game session: one arena, its connections and the tokio tick driver
//!
//! Connection handlers only ever touch the command queue and their packet
//! receiver. Everything else is mutated by the tick under the session lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::game::game_loop::{GameLoop, TickReport};
use crate::game::input_buffer::{ClientCommand, CommandQueue, ConnectionId};
use crate::game::performance::PerformanceMonitor;
use crate::game::systems::arena::ArenaDemo;
use crate::metrics::Metrics;
use crate::net::transport::{ChannelTransport, ConnectionHandle};

/// Mobs removed per tick while overloaded
const SHED_PER_TICK: usize = 1;

/// Seconds between status log lines
const STATUS_LOG_INTERVAL_SECS: u64 = 30;

/// Both ends a connection handler needs
pub struct ClientLink {
    pub handle: ConnectionHandle,
    pub packets: Receiver<Vec<u8>>,
}

pub struct GameSession {
    game_loop: GameLoop<ArenaDemo>,
    transport: ChannelTransport,
    commands: CommandQueue,
    pub performance: PerformanceMonitor,
    metrics: Arc<Metrics>,
    tick_rate: u32,
    next_connection: ConnectionId,
    /// Connections closed since the last tick
    closing: Vec<ConnectionId>,
    last_report: TickReport,
}

impl GameSession {
    pub fn new(config: &ServerConfig, metrics: Arc<Metrics>) -> Self {
        Self::with_demo(config, ArenaDemo::new(config.demo_mobs), metrics)
    }

    pub fn with_demo(config: &ServerConfig, demo: ArenaDemo, metrics: Arc<Metrics>) -> Self {
        let tick_rate = config.tick_rate.max(1);
        info!(
            "Game session created: {}x{} world, {} Hz, up to {} clients",
            config.world_width, config.world_height, tick_rate, config.max_clients
        );
        Self {
            game_loop: GameLoop::new(config.game_loop_config(), demo),
            transport: ChannelTransport::new(config.outbound_capacity),
            commands: CommandQueue::new(config.command_capacity),
            performance: PerformanceMonitor::new(tick_rate),
            metrics,
            tick_rate,
            next_connection: 1,
            closing: Vec::new(),
            last_report: TickReport::default(),
        }
    }

    /// Open a connection. The client joins by sending `ClientMessage::Join`
    /// through the handle.
    pub fn connect(&mut self) -> ClientLink {
        let connection = self.next_connection;
        self.next_connection += 1;
        let packets = self.transport.register(connection);
        ClientLink {
            handle: ConnectionHandle::new(connection, self.commands.sender()),
            packets,
        }
    }

    /// Close a connection. Its client leaves at the next tick; packets built
    /// in that tick are no longer delivered.
    pub fn disconnect(&mut self, connection: ConnectionId) {
        if !self.closing.contains(&connection) {
            self.closing.push(connection);
        }
    }

    /// Run one tick: drain commands, advance the loop, adapt the demo
    /// population to the tick budget and publish metrics
    pub fn tick(&mut self) -> TickReport {
        self.performance.tick_start();

        let admit = self.performance.can_accept_clients();
        let mut refused: Vec<ConnectionId> = Vec::new();
        let commands: Vec<ClientCommand> = self
            .commands
            .drain()
            .into_iter()
            .filter(|command| match command {
                ClientCommand::Join { connection, .. } if !admit => {
                    warn!("refusing join from connection {}: server overloaded", connection);
                    refused.push(*connection);
                    false
                }
                _ => true,
            })
            .collect();

        let closing = std::mem::take(&mut self.closing);
        let leaves = closing
            .iter()
            .map(|&connection| ClientCommand::Leave { connection });
        let report = self
            .game_loop
            .tick(&mut self.transport, commands.into_iter().chain(leaves));
        refused.extend_from_slice(self.game_loop.refused_joins());
        // closing the outbound queue is the refusal signal
        for &connection in closing.iter().chain(&refused) {
            self.transport.unregister(connection);
        }

        self.adapt_content();

        if let Some(duration) = self.performance.tick_end(report.entities) {
            self.metrics.record_tick_time(duration);
        }
        self.metrics.record_tick_report(&report);
        self.metrics
            .performance_status
            .store(self.performance.status().as_gauge(), Ordering::Relaxed);
        self.metrics
            .budget_usage_percent
            .store(self.performance.budget_usage_percent() as u64, Ordering::Relaxed);
        self.metrics
            .packets_dropped
            .store(self.transport.dropped_count(), Ordering::Relaxed);
        if !refused.is_empty() {
            self.metrics
                .joins_rejected
                .fetch_add(refused.len() as u64, Ordering::Relaxed);
        }

        self.last_report = report;
        report
    }

    /// Grow, freeze or shrink the mob population with the tick budget
    fn adapt_content(&mut self) {
        let (world, demo) = self.game_loop.parts_mut();
        if self.performance.should_shed_content() {
            demo.shed_mobs(world, SHED_PER_TICK);
            demo.set_mob_cap(Some(demo.mob_count()));
        } else if self.performance.can_spawn_content() {
            demo.set_mob_cap(self.performance.calculate_entity_budget(demo.mob_count()));
        } else {
            // degraded: keep what exists, spawn nothing new
            demo.set_mob_cap(Some(demo.mob_count()));
        }
    }

    pub fn game_loop(&self) -> &GameLoop<ArenaDemo> {
        &self.game_loop
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn last_report(&self) -> &TickReport {
        &self.last_report
    }

    pub fn connection_count(&self) -> usize {
        self.transport.connection_count()
    }
}

/// Drive the session at its tick rate until the task is aborted
pub fn start_game_loop(session: Arc<RwLock<GameSession>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick_rate = session.read().await.tick_rate();
        let mut ticker = interval(Duration::from_secs_f64(1.0 / tick_rate as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Game loop started at {} Hz", tick_rate);
        let start = Instant::now();
        let mut tick_count: u64 = 0;
        let log_every = tick_rate as u64 * STATUS_LOG_INTERVAL_SECS;

        loop {
            ticker.tick().await;
            tick_count += 1;

            let mut guard = session.write().await;
            let report = guard.tick();

            if tick_count % log_every == 0 {
                let demo = guard.game_loop.simulation();
                info!(
                    "Game: {}s, tick {}, {} clients, {} entities ({} mobs, {} shots, {} loot) | Perf: {}",
                    start.elapsed().as_secs(),
                    report.tick,
                    report.clients,
                    report.entities,
                    demo.mob_count(),
                    demo.projectile_count(),
                    demo.loot_count(),
                    guard.performance.status_message()
                );
            }
        }
    })
}
