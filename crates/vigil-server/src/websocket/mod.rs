//! WebSocket connection management, fan-out, liveness and client frames.

pub mod broadcast;
pub mod connection;
pub mod connection_log;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod session;
