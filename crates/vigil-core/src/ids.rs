//! Branded ID newtypes.
//!
//! Connections, server instances and bus messages each get a distinct ID type
//! so an instance ID can never be compared against a message ID by accident.
//! All of them wrap a `String` and serialize transparently.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $generate:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random ID.
            #[must_use]
            pub fn new() -> Self {
                Self($generate)
            }

            /// The wrapped string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the wrapped value is empty.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id! {
    /// Unique identifier for an accepted WebSocket connection (UUID v7).
    ConnectionId,
    Uuid::now_v7().to_string()
}

branded_id! {
    /// Per-process identity of a server replica, used for loop prevention.
    ///
    /// 32 random hex characters, generated once at startup.
    InstanceId,
    Uuid::new_v4().simple().to_string()
}

branded_id! {
    /// Per-publish identity of a bus message, used for tracing and dedup.
    MessageId,
    Uuid::now_v7().simple().to_string()
}
