use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bloom_arena_server::config::ServerConfig;
use bloom_arena_server::game::input_buffer::QueueError;
use bloom_arena_server::game::session::{start_game_loop, GameSession};
use bloom_arena_server::metrics::{self, Metrics};
use bloom_arena_server::net::protocol::{ClientMessage, PlayerInput};
use bloom_arena_server::net::replica::Replica;
use bloom_arena_server::net::schema::SchemaRegistry;
use bloom_arena_server::util::vec2::Vec2;

/// How often a viewer drains its packets
const VIEWER_POLL_MS: u64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Bloom Arena Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {}x{} world, cell {}, {} Hz, {} mobs, {} viewers",
        config.world_width,
        config.world_height,
        config.grid_cell_size,
        config.tick_rate,
        config.demo_mobs,
        config.demo_viewers
    );

    let metrics = Arc::new(Metrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let session = Arc::new(RwLock::new(GameSession::new(&config, metrics)));
    let game = start_game_loop(session.clone());

    let viewers: Vec<_> = (0..config.demo_viewers)
        .map(|index| tokio::spawn(run_viewer(session.clone(), index)))
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for viewer in viewers {
        viewer.abort();
    }
    game.abort();
    info!("Server stopped");

    Ok(())
}

/// In-process client: joins, wanders around and keeps a replica of what it
/// is sent
async fn run_viewer(session: Arc<RwLock<GameSession>>, index: usize) {
    let link = session.write().await.connect();
    let connection = link.handle.connection();
    if let Err(e) = link.handle.submit(ClientMessage::Join {
        name: format!("viewer-{}", index),
    }) {
        warn!("viewer {} could not join: {}", index, e);
        return;
    }

    let mut replica = Replica::new(SchemaRegistry::standard());
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(Duration::from_millis(VIEWER_POLL_MS));
    let mut sequence: u32 = 0;
    let mut polls: u64 = 0;

    loop {
        ticker.tick().await;
        polls += 1;

        for packet in link.packets.try_iter() {
            // the replica logs and counts rejected packets itself
            let _ = replica.apply(&packet);
        }

        let mut messages = Vec::new();
        if polls % 10 == 0 {
            sequence = sequence.wrapping_add(1);
            let mut input = PlayerInput::new(sequence);
            input.movement = Vec2::from_angle(rng.gen_range(0.0..TAU));
            input.attacking = rng.gen_bool(0.3);
            input.defending = !input.attacking && rng.gen_bool(0.2);
            messages.push(ClientMessage::Input(input));
        }
        if polls % 100 == 0 {
            messages.push(ClientMessage::Camera {
                zoom: rng.gen_range(0.6..1.4),
            });
            info!(
                "viewer {}: {} entities, {} clients, {} packets ({} rejected)",
                index,
                replica.entity_count(),
                replica.client_count(),
                replica.packets_applied(),
                replica.packets_rejected()
            );
        }

        for message in messages {
            match link.handle.submit(message) {
                Ok(()) => {}
                Err(QueueError::Disconnected) => {
                    session.write().await.disconnect(connection);
                    return;
                }
                Err(e) => debug!("viewer {}: {}", index, e),
            }
        }
    }
}
