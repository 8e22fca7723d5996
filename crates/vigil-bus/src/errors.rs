//! Bus error types.

use thiserror::Error;
use vigil_core::ChannelError;

/// Failures publishing to or subscribing on the shared bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Redis client or connection error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// The bus is known to be unreachable.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    /// All publish attempts failed.
    #[error("publish failed after {attempts} attempts: {last}")]
    PublishFailed {
        /// Attempts made.
        attempts: u32,
        /// Last transport error.
        last: String,
    },
    /// Payload could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    /// Producer named an invalid channel.
    #[error("invalid channel: {0}")]
    Channel(#[from] ChannelError),
}
