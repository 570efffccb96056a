//! Bloom Arena Server Library
//!
//! Authoritative arena netcode: a spatial grid over the world, per-entity
//! dirty tracking with cached wire records, a bit-packed update protocol
//! and per-client interest management, driven by a fixed-rate tick loop.
//!
//! # Features
//!
//! - `metrics_extended` - Per-record replication counters (enabled by default)

pub mod config;
pub mod util;
pub mod game;
pub mod net;
pub mod metrics;
