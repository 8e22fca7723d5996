//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_settings::VigilSettings;

/// Runtime configuration for [`crate::VigilServer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Upgrades beyond this many live connections get 503.
    pub max_connections: usize,
    /// Outbound queue depth per connection.
    pub send_queue_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-frame write deadline in seconds.
    pub write_timeout_secs: u64,
    /// Heartbeat, reaper and credential-check tick in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close connections silent for longer than this many seconds.
    pub stale_after_secs: u64,
    /// Pause between the reauthentication notice and the close frame.
    pub reauth_grace_ms: u64,
    /// How long graceful shutdown waits for background tasks.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1000,
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
            write_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            stale_after_secs: 90,
            reauth_grace_ms: 100,
            shutdown_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    /// `host:port` bind string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Heartbeat tick.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Staleness threshold.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Write deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Reauthentication grace period.
    pub fn reauth_grace(&self) -> Duration {
        Duration::from_millis(self.reauth_grace_ms)
    }

    /// How long shutdown waits for background tasks.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl From<&VigilSettings> for ServerConfig {
    fn from(s: &VigilSettings) -> Self {
        Self {
            host: s.server.host.clone(),
            port: s.server.port,
            max_connections: s.server.max_connections,
            send_queue_capacity: s.server.send_queue_capacity,
            max_message_size: s.server.max_message_size,
            write_timeout_secs: s.server.write_timeout_secs,
            heartbeat_interval_secs: s.heartbeat.interval_secs,
            stale_after_secs: s.heartbeat.stale_after_secs,
            reauth_grace_ms: s.heartbeat.reauth_grace_ms,
            shutdown_timeout_secs: s.server.shutdown_timeout_secs,
        }
    }
}
