pub mod arena;
pub mod combat;
pub mod players;
pub mod wander;
