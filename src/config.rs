use std::str::FromStr;

use crate::game::constants::tick::TICK_RATE;
use crate::game::game_loop::GameLoopConfig;
use crate::game::id_alloc::{EntityId, IdConfig, DEFAULT_ID_FLOOR};
use crate::game::spatial::ENTITY_GRID_CELL_SIZE;
use crate::game::world::WorldConfig;
use crate::net::interest::{InterestConfig, ViewShape};
use crate::net::schemas::WORLD_COORD_MAX;
use crate::net::transport::DEFAULT_OUTBOUND_CAPACITY;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// World size in world units
    pub world_width: f32,
    pub world_height: f32,
    /// Spatial grid cell edge length
    pub grid_cell_size: f32,
    /// Smallest entity id handed out (ids below are reserved)
    pub entity_id_floor: EntityId,
    /// Extra ticks a destroyed entity's id stays unused
    pub entity_id_release_delay: u64,
    /// Padding around each client's view, in world units
    pub view_margin: f32,
    pub view_shape: ViewShape,
    /// Port of the Prometheus endpoint
    pub metrics_port: u16,
    pub max_clients: usize,
    /// Mob population of the demo arena
    pub demo_mobs: usize,
    /// In-process viewer clients spawned by the binary
    pub demo_viewers: usize,
    /// Packets buffered per client before drops
    pub outbound_capacity: usize,
    /// Commands buffered between ticks
    pub command_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: TICK_RATE,
            world_width: 4096.0,
            world_height: 4096.0,
            grid_cell_size: ENTITY_GRID_CELL_SIZE,
            entity_id_floor: DEFAULT_ID_FLOOR,
            entity_id_release_delay: 0,
            view_margin: InterestConfig::default().margin,
            view_shape: ViewShape::Rect,
            metrics_port: 9090,
            max_clients: 256,
            demo_mobs: 200,
            demo_viewers: 4,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            command_capacity: 1000,
        }
    }
}

/// Parse an environment variable, keeping `current` when it is unset and
/// warning when it is invalid or fails `valid`
fn env_or<T, F>(name: &str, current: T, valid: F) -> T
where
    T: FromStr,
    F: Fn(&T) -> bool,
{
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) if valid(&parsed) => parsed,
        Ok(_) => {
            tracing::warn!("{} value '{}' out of range, using default", name, raw);
            current
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            current
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let d = Self::default();
        let coord = |v: &f32| *v > 0.0 && *v <= WORLD_COORD_MAX;

        let view_shape = match std::env::var("VIEW_SHAPE") {
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "rect" => ViewShape::Rect,
                "circle" => ViewShape::Circle,
                _ => {
                    tracing::warn!("Invalid VIEW_SHAPE '{}', using default", raw);
                    d.view_shape
                }
            },
            Err(_) => d.view_shape,
        };

        Self {
            tick_rate: env_or("TICK_RATE", d.tick_rate, |v| (1..=240).contains(v)),
            world_width: env_or("WORLD_WIDTH", d.world_width, coord),
            world_height: env_or("WORLD_HEIGHT", d.world_height, coord),
            grid_cell_size: env_or("GRID_CELL_SIZE", d.grid_cell_size, |v| *v >= 1.0),
            entity_id_floor: env_or("ENTITY_ID_FLOOR", d.entity_id_floor, |v| *v >= 1),
            entity_id_release_delay: env_or("ENTITY_ID_RELEASE_DELAY", d.entity_id_release_delay, |v| *v <= 600),
            view_margin: env_or("VIEW_MARGIN", d.view_margin, |v| *v >= 0.0),
            view_shape,
            metrics_port: env_or("METRICS_PORT", d.metrics_port, |v| *v > 0),
            max_clients: env_or("MAX_CLIENTS", d.max_clients, |v| (1..=10_000).contains(v)),
            demo_mobs: env_or("DEMO_MOBS", d.demo_mobs, |v| *v <= 20_000),
            demo_viewers: env_or("DEMO_VIEWERS", d.demo_viewers, |v| *v <= 1_000),
            outbound_capacity: env_or("OUTBOUND_CAPACITY", d.outbound_capacity, |v| *v > 0),
            command_capacity: env_or("COMMAND_CAPACITY", d.command_capacity, |v| *v > 0),
        }
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        if !(self.world_width > 0.0 && self.world_height > 0.0) {
            return Err("world dimensions must be positive".to_string());
        }
        if self.world_width > WORLD_COORD_MAX || self.world_height > WORLD_COORD_MAX {
            return Err(format!("world dimensions cannot exceed {}", WORLD_COORD_MAX));
        }
        if !(self.grid_cell_size >= 1.0) {
            return Err("grid_cell_size must be at least 1".to_string());
        }
        if self.grid_cell_size > u16::MAX as f32 {
            return Err("grid_cell_size must fit in 16 bits".to_string());
        }
        if self.entity_id_floor == 0 {
            return Err("entity_id_floor must be at least 1 (0 means no entity)".to_string());
        }
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.demo_viewers > self.max_clients {
            return Err("demo_viewers cannot exceed max_clients".to_string());
        }
        Ok(())
    }

    /// Tick loop, world and interest parameters
    pub fn game_loop_config(&self) -> GameLoopConfig {
        GameLoopConfig {
            tick_rate: self.tick_rate,
            max_clients: self.max_clients,
            world: WorldConfig {
                width: self.world_width,
                height: self.world_height,
                cell_size: self.grid_cell_size,
                ids: IdConfig {
                    floor: self.entity_id_floor,
                    release_delay_ticks: self.entity_id_release_delay,
                    ..IdConfig::default()
                },
            },
            interest: InterestConfig {
                margin: self.view_margin,
                shape: self.view_shape,
                ..InterestConfig::default()
            },
        }
    }
}
