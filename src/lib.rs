//! Authoritative simulation server for a multiplayer arena shooter
//!
//! Each room runs a fixed-rate [`game::simulation::Simulation`] owned by a
//! single [`game::GameMatch`] task. Connections only enqueue intents and read
//! from per-room broadcast channels.

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod matchmaking;
pub mod util;
pub mod ws;
