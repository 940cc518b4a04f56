//! Lobby queue and room creation

pub mod queue;
pub mod service;

pub use service::{MatchmakingService, PlayerSession};
