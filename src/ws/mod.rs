//! WebSocket boundary

pub mod handler;
pub mod protocol;
