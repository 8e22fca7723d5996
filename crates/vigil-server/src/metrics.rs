//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup; a
/// second call fails because a global recorder is already set.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants shared by the server modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Fan-outs that reached at least one subscriber (counter).
pub const WS_EVENTS_TOTAL: &str = "ws_events_total";
/// Individual messages enqueued to clients (counter).
pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
/// Messages skipped because a client queue was full (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Fan-out latency seconds (histogram).
pub const WS_FANOUT_DURATION_SECONDS: &str = "ws_fanout_duration_seconds";
/// Read/write failures (counter).
pub const WS_CONNECTION_ERRORS_TOTAL: &str = "ws_connection_errors_total";
/// Authentication and authorization failures (counter, labels: kind).
pub const WS_AUTH_ERRORS_TOTAL: &str = "ws_auth_errors_total";
/// Connections closed by the stale-connection reaper (counter).
pub const WS_REAPED_TOTAL: &str = "ws_reaped_total";
/// Heartbeats enqueued (counter).
pub const WS_HEARTBEATS_TOTAL: &str = "ws_heartbeats_total";
