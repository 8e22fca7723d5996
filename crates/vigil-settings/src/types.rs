//! Settings types.
//!
//! Every section uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides. Keys are camelCase on disk.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VigilSettings {
    /// HTTP/WebSocket listener.
    pub server: ServerSettings,
    /// Liveness and credential checks.
    pub heartbeat: HeartbeatSettings,
    /// Cross-instance bus.
    pub bus: BusSettings,
    /// Upgrade authentication and channel authorization.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// JSON snapshot used to seed the in-memory access directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_path: Option<String>,
}

/// Listener and per-connection limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks a free port).
    pub port: u16,
    /// Upgrades beyond this many live connections are refused with 503.
    pub max_connections: usize,
    /// Outbound queue depth per connection.
    pub send_queue_capacity: usize,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Per-frame write deadline.
    pub write_timeout_secs: u64,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1000,
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
            write_timeout_secs: 10,
            shutdown_timeout_secs: 5,
        }
    }
}

/// Heartbeat, reaper and credential-expiry timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Tick for heartbeats, reaping and credential checks.
    pub interval_secs: u64,
    /// Connections without a liveness proof for this long are closed.
    pub stale_after_secs: u64,
    /// Pause between `reauthentication_required` and the close frame.
    pub reauth_grace_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stale_after_secs: 90,
            reauth_grace_ms: 100,
        }
    }
}

/// Shared pub/sub bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// When false, the instance runs local-only.
    pub enabled: bool,
    /// Redis URL.
    pub url: String,
    /// Topic carrying all cross-instance traffic.
    pub topic: String,
    /// Publish attempts before giving up.
    pub publish_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * publish_backoff_ms`.
    pub publish_backoff_ms: u64,
    /// Fixed delay before resubscribing after the subscription drops.
    pub resubscribe_delay_secs: u64,
    /// Interval between bus pings.
    pub health_check_interval_secs: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379".to_string(),
            topic: "websocket:events".to_string(),
            publish_attempts: 3,
            publish_backoff_ms: 100,
            resubscribe_delay_secs: 5,
            health_check_interval_secs: 30,
        }
    }
}

/// Credential validation and authorization policy.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HMAC secret for upgrade tokens. Required at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Roles that bypass patient assignment checks.
    pub admin_roles: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            admin_roles: vec!["admin".to_string(), "administrator".to_string()],
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("admin_roles", &self.admin_roles)
            .finish()
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn require(ok: bool, msg: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(SettingsError::InvalidValue(msg.to_string()))
    }
}

impl VigilSettings {
    /// Reject combinations the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        require(self.server.max_connections > 0, "server.maxConnections must be > 0")?;
        require(
            self.server.send_queue_capacity > 0,
            "server.sendQueueCapacity must be > 0",
        )?;
        require(self.heartbeat.interval_secs > 0, "heartbeat.intervalSecs must be > 0")?;
        require(
            self.heartbeat.stale_after_secs >= self.heartbeat.interval_secs,
            "heartbeat.staleAfterSecs must be >= heartbeat.intervalSecs",
        )?;
        require(self.bus.publish_attempts > 0, "bus.publishAttempts must be > 0")?;
        require(!self.bus.topic.is_empty(), "bus.topic must not be empty")?;
        require(
            self.bus.health_check_interval_secs > 0,
            "bus.healthCheckIntervalSecs must be > 0",
        )?;
        Ok(())
    }
}
