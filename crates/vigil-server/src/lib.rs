//! # vigil-server
//!
//! Axum HTTP + `WebSocket` fan-out server.
//!
//! - `/ws`: authenticated upgrade, one reader/writer task pair per client
//! - Connection registry actor owning the live-connection set
//! - Channel fan-out with slow-consumer isolation
//! - Heartbeats, stale-connection reaping, credential-expiry enforcement
//! - Operational endpoints: `/health`, `/metrics`, `/ws/metrics`,
//!   `/ws/channels/{channel}`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::VigilServer;
