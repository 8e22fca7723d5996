//! Server error types.

use thiserror::Error;

/// Errors starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address attempted.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Other socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// `listen` was called twice.
    #[error("server already started")]
    AlreadyStarted,
    /// Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
