//! # vigil-auth
//!
//! Who may connect, and what they may subscribe to.
//!
//! - [`token`]: pulls the bearer credential out of an upgrade request
//! - [`credential`]: validates it as an HMAC-signed JWT and yields a
//!   [`Credential`]
//! - [`directory`]: the patient/device ownership oracle consulted by the
//!   authorizer, with an in-memory implementation
//! - [`authorizer`]: per-channel subscription rules

#![deny(unsafe_code)]

pub mod authorizer;
pub mod credential;
pub mod directory;
pub mod errors;
pub mod token;

pub use authorizer::ChannelAuthorizer;
pub use credential::{Credential, JwtAuthenticator, expired_at};
pub use directory::{AccessDirectory, DeviceRecord, DirectorySnapshot, InMemoryDirectory, PatientRecord};
pub use errors::{AuthError, AuthzError, DirectoryError};
pub use token::{ExtractedToken, TokenSource, extract_token};
