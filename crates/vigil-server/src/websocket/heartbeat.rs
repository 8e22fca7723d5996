//! Periodic heartbeats and stale-connection reaping.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_core::ConnectionId;

use super::connection::ClientConnection;
use super::registry::RegistryHandle;

/// Ids of connections whose last liveness proof is older than `threshold`.
pub fn find_stale<'a, I>(connections: I, now: Instant, threshold: Duration) -> Vec<ConnectionId>
where
    I: IntoIterator<Item = &'a Arc<ClientConnection>>,
{
    connections
        .into_iter()
        .filter(|c| c.since_last_seen(now) > threshold)
        .map(|c| c.id.clone())
        .collect()
}

/// Every `interval`, ask the registry to send heartbeats and then reap stale
/// connections. The first tick fires one full interval after start.
pub async fn run_monitor(registry: RegistryHandle, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !registry.send_heartbeats() || !registry.reap() {
                    break;
                }
            }
        }
    }
    debug!("health monitor stopped");
}
