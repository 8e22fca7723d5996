//! Structured connection lifecycle records.
//!
//! Everything here logs under the `vigil::connections` target so operators
//! can route or filter connection churn separately from the rest.

use std::time::Duration;

use tracing::{debug, info, warn};
use vigil_core::Envelope;

use super::connection::{ClientConnection, DisconnectReason};

/// Target shared by every record in this module.
pub const TARGET: &str = "vigil::connections";

/// Connection accepted and registered.
pub fn connection_established(conn: &ClientConnection) {
    info!(
        target: TARGET,
        client_id = %conn.id,
        user_id = %conn.principal.user_id,
        institution_id = %conn.principal.institution_id,
        role = %conn.principal.role,
        remote_addr = conn.remote_addr.as_deref().unwrap_or("unknown"),
        "connection_established"
    );
}

/// Connection unregistered.
pub fn connection_closed(conn: &ClientConnection, reason: DisconnectReason, duration: Duration) {
    info!(
        target: TARGET,
        client_id = %conn.id,
        user_id = %conn.principal.user_id,
        reason = reason.as_str(),
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "connection_closed"
    );
}

/// A message was fanned out.
pub fn event_sent(message: &Envelope, recipients: usize) {
    debug!(
        target: TARGET,
        kind = %message.kind,
        channel = %message.channel,
        recipients,
        instance_id = message.instance_id.as_ref().map_or("", |i| i.as_str()),
        message_id = message.message_id.as_ref().map_or("", |m| m.as_str()),
        "event_sent"
    );
}

/// Read or write failure.
pub fn connection_error(conn: &ClientConnection, error: &dyn std::fmt::Display) {
    warn!(
        target: TARGET,
        client_id = %conn.id,
        user_id = %conn.principal.user_id,
        error = %error,
        "connection_error"
    );
}

/// Upgrade refused or credential expired mid-connection.
pub fn authentication_error(user_id: Option<&str>, remote_addr: Option<&str>, error: &dyn std::fmt::Display) {
    warn!(
        target: TARGET,
        user_id = user_id.unwrap_or("unknown"),
        remote_addr = remote_addr.unwrap_or("unknown"),
        error = %error,
        "authentication_error"
    );
}

/// Subscription rejected by the authorizer.
pub fn authorization_error(conn: &ClientConnection, channel: &str, error: &dyn std::fmt::Display) {
    warn!(
        target: TARGET,
        client_id = %conn.id,
        user_id = %conn.principal.user_id,
        institution_id = %conn.principal.institution_id,
        role = %conn.principal.role,
        channel,
        error = %error,
        "authorization_error"
    );
}
