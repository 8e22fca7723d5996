//! Authentication, authorization and directory errors.

use thiserror::Error;

/// Upgrade credential was missing or unacceptable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token in query, `Authorization` header or subprotocol list.
    #[error("no authentication token provided")]
    MissingToken,
    /// Signature, algorithm or structure check failed.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// `exp` is in the past.
    #[error("token has expired")]
    Expired,
    /// A required claim is absent.
    #[error("token missing {0}")]
    MissingClaim(String),
}

/// Subscription refused.
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Patient unknown, in another institution, or assigned to someone else.
    #[error("access denied: patient not found or not accessible")]
    PatientDenied,
    /// Device unknown or attached to an inaccessible patient.
    #[error("access denied: device not found or not accessible")]
    DeviceDenied,
    /// The ownership lookup itself failed.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Failure of the access directory backend.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Backend unavailable or returned an error.
    #[error("lookup failed: {0}")]
    Lookup(String),
    /// Snapshot file could not be read.
    #[error("failed to read directory snapshot: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot file is not valid JSON.
    #[error("failed to parse directory snapshot: {0}")]
    Json(#[from] serde_json::Error),
}
