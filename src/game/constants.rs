/// Tick timing
pub mod tick {
    /// Server tick rate in Hz
    pub const TICK_RATE: u32 = 30;
    /// Delta time per tick in seconds
    pub const DT: f32 = 1.0 / TICK_RATE as f32;
    /// Tick duration in milliseconds
    pub const TICK_DURATION_MS: u64 = 1000 / TICK_RATE as u64;
}

/// Player entity constants
pub mod player {
    /// Hitbox radius
    pub const RADIUS: f32 = 25.0;
    /// Movement speed in units per second at full input
    pub const SPEED: f32 = 300.0;
    /// Seconds between shots while attacking
    pub const FIRE_INTERVAL: f32 = 0.4;
    /// Petals orbiting each player
    pub const PETALS: usize = 3;
    /// Radius gained per level
    pub const GROWTH_PER_LEVEL: f32 = 1.5;
}

/// Orbiting petal constants
pub mod petal {
    pub const RADIUS: f32 = 10.0;
    /// Orbit radius while idle, attacking and defending
    pub const ORBIT_REST: f32 = 60.0;
    pub const ORBIT_ATTACK: f32 = 95.0;
    pub const ORBIT_DEFEND: f32 = 35.0;
    /// Orbit speed in radians per second
    pub const SPIN_SPEED: f32 = 2.5;
    /// Health fraction removed from a mob per contact tick while attacking
    pub const DAMAGE: f32 = 0.05;
}

/// Wandering mob constants
pub mod mob {
    /// Smallest and largest spawned radius
    pub const MIN_RADIUS: f32 = 15.0;
    pub const MAX_RADIUS: f32 = 60.0;
    /// Wander speed in units per second
    pub const SPEED: f32 = 60.0;
    /// Maximum heading change per second (radians)
    pub const TURN_RATE: f32 = 1.5;
    /// Number of mob definitions to pick from
    pub const DEFINITIONS: u8 = 24;
    /// Highest rarity tier rolled
    pub const MAX_RARITY: u8 = 6;
}

/// Projectile constants
pub mod projectile {
    pub const RADIUS: f32 = 8.0;
    /// Flight speed in units per second
    pub const SPEED: f32 = 600.0;
    /// Seconds before a projectile expires
    pub const LIFETIME: f32 = 1.5;
    /// Health fraction removed from a mob per hit
    pub const DAMAGE: f32 = 0.25;
}

/// Loot drop constants
pub mod loot {
    pub const RADIUS: f32 = 12.0;
    /// Seconds before uncollected loot despawns
    pub const LIFETIME: f32 = 20.0;
}

/// Collision response constants
pub mod collision {
    /// Fraction of the penetration resolved per tick
    pub const PUSH_FACTOR: f32 = 0.5;
}
