//! Channel fan-out over the live connection set.
//!
//! Subscribers are found by scanning every connection's subscription set, so
//! each delivery costs O(connections). There is no channel index to keep in
//! sync with connection teardown.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use vigil_core::ConnectionId;

use super::connection::{ClientConnection, SendOutcome};

/// A connection that drops this many messages in a row is evicted.
/// Any accepted message resets the streak.
pub const MAX_DROPS_BEFORE_EVICT: u64 = 100;

/// Result of one fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Subscribers whose queue accepted the message.
    pub recipients: usize,
    /// Subscribers skipped because their queue was full.
    pub skipped: usize,
    /// Subscribers past the drop limit; the caller should unregister them.
    pub evicted: Vec<ConnectionId>,
}

/// Enqueue `frame` on every connection subscribed to `channel`.
///
/// Never blocks: a full queue skips that subscriber only.
pub fn fan_out<'a, I>(connections: I, channel: &str, frame: &Arc<String>) -> FanOut
where
    I: IntoIterator<Item = &'a Arc<ClientConnection>>,
{
    let mut out = FanOut::default();
    for conn in connections {
        if !conn.is_subscribed(channel) {
            continue;
        }
        match conn.send(Arc::clone(frame)) {
            SendOutcome::Queued => out.recipients += 1,
            SendOutcome::Full => {
                out.skipped += 1;
                let streak = conn.consecutive_drops();
                warn!(
                    conn_id = %conn.id,
                    channel,
                    streak,
                    total = conn.drop_count(),
                    "outbound queue full, message skipped"
                );
                if streak >= MAX_DROPS_BEFORE_EVICT {
                    out.evicted.push(conn.id.clone());
                }
            }
            SendOutcome::Closed => debug!(conn_id = %conn.id, channel, "skipping closing connection"),
        }
    }
    out
}

/// User ids of the subscribers of `channel`, one per connection, sorted.
pub fn viewers<'a, I>(connections: I, channel: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a Arc<ClientConnection>>,
{
    let mut ids: Vec<String> = connections
        .into_iter()
        .filter(|c| c.is_subscribed(channel))
        .map(|c| c.principal.user_id.clone())
        .collect();
    ids.sort();
    ids
}

/// One row of `/ws/channels/{channel}`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SubscriberInfo {
    /// Connection id.
    pub client_id: String,
    /// Principal user id.
    pub user_id: String,
    /// Principal institution id.
    pub institution_id: String,
    /// Principal role.
    pub role: String,
}

/// Subscribers of `channel`, ordered by connection id.
pub fn subscribers<'a, I>(connections: I, channel: &str) -> Vec<SubscriberInfo>
where
    I: IntoIterator<Item = &'a Arc<ClientConnection>>,
{
    let mut rows: Vec<SubscriberInfo> = connections
        .into_iter()
        .filter(|c| c.is_subscribed(channel))
        .map(|c| SubscriberInfo {
            client_id: c.id.to_string(),
            user_id: c.principal.user_id.clone(),
            institution_id: c.principal.institution_id.clone(),
            role: c.principal.role.clone(),
        })
        .collect();
    rows.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    rows
}

// ─── Tests ───
