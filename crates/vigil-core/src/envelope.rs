//! Wire envelope shared by browser clients and the cross-instance bus.
//!
//! ```json
//! {"type":"device_status","channel":"device:ESP32-01","data":{...},
//!  "timestamp":1718000000,"instance_id":"...","message_id":"..."}
//! ```
//!
//! `data` is held as pre-serialized JSON and never inspected. Only the
//! envelope fields carry meaning for routing.

use serde::{Deserialize, Serialize};
use serde_json::value::{RawValue, to_raw_value};
use serde_json::{Value, json};

use crate::ids::{InstanceId, MessageId};

/// Message kinds understood or produced by the core.
pub mod kinds {
    /// Generic collaborator event.
    pub const EVENT: &str = "event";
    /// Periodic server heartbeat.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Subscriber count update for a channel.
    pub const VIEWER_COUNT: &str = "viewer_count";
    /// Rejected client action.
    pub const ERROR: &str = "error";
    /// Credential expired; the connection is about to close.
    pub const REAUTHENTICATION_REQUIRED: &str = "reauthentication_required";
    /// Device came online / went offline.
    pub const DEVICE_STATUS: &str = "device_status";
    /// New alert for a patient.
    pub const ALERT_CREATED: &str = "alert_created";
    /// Device telemetry sample.
    pub const TELEMETRY: &str = "telemetry";
    /// Brace usage session started.
    pub const USAGE_SESSION_START: &str = "usage_session_start";
    /// Brace usage session ended.
    pub const USAGE_SESSION_END: &str = "usage_session_end";
    /// Aggregated dashboard statistics.
    pub const DASHBOARD_STATS: &str = "dashboard_stats";
}

/// Reason string carried by `reauthentication_required`.
pub const TOKEN_EXPIRED: &str = "token_expired";

/// An immutable server-to-client (and instance-to-instance) message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Target channel; empty for connection-scoped messages.
    #[serde(default)]
    pub channel: String,
    /// Opaque payload.
    pub data: Box<RawValue>,
    /// Unix seconds at construction.
    pub timestamp: i64,
    /// Originating replica. Always set on bus traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    /// Per-publish identity. Always set on bus traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

fn raw(value: &Value) -> Box<RawValue> {
    to_raw_value(value).unwrap_or_else(|_| RawValue::NULL.to_owned())
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Envelope {
    /// Build an envelope around an already-serialized payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, channel: impl Into<String>, data: Box<RawValue>) -> Self {
        Self {
            kind: kind.into(),
            channel: channel.into(),
            data,
            timestamp: now_unix(),
            instance_id: None,
            message_id: None,
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn from_payload<T: Serialize + ?Sized>(
        kind: impl Into<String>,
        channel: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(kind, channel, to_raw_value(payload)?))
    }

    /// Stamp origin identities for bus transport.
    #[must_use]
    pub fn with_origin(mut self, instance_id: InstanceId, message_id: MessageId) -> Self {
        self.instance_id = Some(instance_id);
        self.message_id = Some(message_id);
        self
    }

    /// `heartbeat` with `{timestamp}`.
    #[must_use]
    pub fn heartbeat() -> Self {
        let now = now_unix();
        let mut env = Self::new(kinds::HEARTBEAT, "", raw(&json!({ "timestamp": now })));
        env.timestamp = now;
        env
    }

    /// `viewer_count` with `{count, viewers}`.
    #[must_use]
    pub fn viewer_count(channel: &str, viewers: &[String]) -> Self {
        Self::new(
            kinds::VIEWER_COUNT,
            channel,
            raw(&json!({ "count": viewers.len(), "viewers": viewers })),
        )
    }

    /// `error` with `{error, action}`.
    #[must_use]
    pub fn error(channel: &str, error: &str, action: &str) -> Self {
        Self::new(
            kinds::ERROR,
            channel,
            raw(&json!({ "error": error, "action": action })),
        )
    }

    /// `reauthentication_required` with `{reason, message}`.
    #[must_use]
    pub fn reauthentication_required() -> Self {
        Self::new(
            kinds::REAUTHENTICATION_REQUIRED,
            "",
            raw(&json!({
                "reason": TOKEN_EXPIRED,
                "message": "Your session has expired. Please reconnect with a valid token.",
            })),
        )
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The payload as raw JSON text.
    #[must_use]
    pub fn data_json(&self) -> &str {
        self.data.get()
    }
}

/// Control frames a browser client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Join a channel.
    Subscribe {
        /// Requested channel name, not yet validated.
        channel: String,
    },
    /// Leave a channel.
    Unsubscribe {
        /// Channel name.
        channel: String,
    },
    /// Application-level liveness proof.
    Pong,
}

impl ClientFrame {
    /// Parse a client text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
