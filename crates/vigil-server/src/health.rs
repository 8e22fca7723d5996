//! `/health` endpoint body.

use serde::Serialize;
use tokio::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when a configured bus is unreachable.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections on this instance.
    pub connections: usize,
    /// Whether cross-instance sync is configured.
    pub bus_enabled: bool,
    /// Last known bus reachability.
    pub bus_connected: bool,
    /// This replica's identity.
    pub instance_id: String,
}

/// Build a health response from live state.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    bus_enabled: bool,
    bus_connected: bool,
    instance_id: &str,
) -> HealthResponse {
    let status = if bus_enabled && !bus_connected {
        "degraded"
    } else {
        "ok"
    };
    HealthResponse {
        status,
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        bus_enabled,
        bus_connected,
        instance_id: instance_id.to_owned(),
    }
}
