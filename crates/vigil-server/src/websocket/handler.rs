//! Client frame handling: subscribe, unsubscribe, pong.

use std::sync::Arc;

use tracing::{debug, info};
use vigil_auth::ChannelAuthorizer;
use vigil_core::{Channel, ClientFrame, Envelope};

use super::connection::ClientConnection;
use super::connection_log;
use super::registry::RegistryHandle;
use crate::stats::WsMetrics;

/// What a session needs to act on client frames.
#[derive(Clone)]
pub struct SessionContext {
    /// Registry handle.
    pub registry: RegistryHandle,
    /// Subscription authorizer.
    pub authorizer: ChannelAuthorizer,
    /// Shared counters.
    pub metrics: Arc<WsMetrics>,
}

/// What [`handle_text`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Subscription added (or already present).
    Subscribed(String),
    /// Subscription refused; the client got an `error` frame.
    Rejected {
        /// Requested channel.
        channel: String,
        /// Text sent to the client.
        error: String,
    },
    /// Unsubscribe processed.
    Unsubscribed(String),
    /// Liveness proof recorded.
    Pong,
    /// Unparsable or unknown frame; logged and dropped.
    Ignored,
}

/// Apply one inbound text frame to `conn`.
pub async fn handle_text(text: &str, conn: &ClientConnection, ctx: &SessionContext) -> FrameOutcome {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(conn_id = %conn.id, error = %e, len = text.len(), "ignoring unrecognized client frame");
            return FrameOutcome::Ignored;
        }
    };

    match frame {
        ClientFrame::Subscribe { channel } => subscribe(conn, ctx, channel).await,
        ClientFrame::Unsubscribe { channel } => {
            if conn.unsubscribe(&channel) {
                debug!(conn_id = %conn.id, channel = %channel, "unsubscribed");
                let _ = ctx.registry.refresh_viewers(channel.as_str());
            }
            FrameOutcome::Unsubscribed(channel)
        }
        ClientFrame::Pong => {
            conn.mark_alive();
            FrameOutcome::Pong
        }
    }
}

async fn subscribe(conn: &ClientConnection, ctx: &SessionContext, name: String) -> FrameOutcome {
    let channel = match Channel::parse(&name) {
        Ok(channel) => channel,
        Err(e) => return reject(conn, name, format!("invalid channel format: {e}")),
    };

    if let Err(e) = ctx.authorizer.authorize(&conn.principal, &channel).await {
        ctx.metrics.record_auth_error("authorization");
        connection_log::authorization_error(conn, channel.as_str(), &e);
        return reject(conn, name, format!("authorization failed: {e}"));
    }

    let _ = conn.subscribe(channel.as_str());
    info!(conn_id = %conn.id, user_id = %conn.principal.user_id, channel = %channel, "subscribed");
    let _ = ctx.registry.refresh_viewers(channel.as_str());
    FrameOutcome::Subscribed(name)
}

fn reject(conn: &ClientConnection, channel: String, error: String) -> FrameOutcome {
    let _ = conn.send_envelope(&Envelope::error(&channel, &error, "subscribe"));
    FrameOutcome::Rejected { channel, error }
}
