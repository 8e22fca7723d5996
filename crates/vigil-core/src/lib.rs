//! # vigil-core
//!
//! Foundation types shared by every Vigil crate.
//!
//! - [`channel`]: the closed channel-name grammar (`dashboard`, `alerts:global`,
//!   `patient:<id>`, `device:<id>`)
//! - [`envelope`]: the JSON envelope carried to browsers and across the bus,
//!   plus the client control frames
//! - [`ids`]: branded identifiers for connections, instances and messages
//! - [`principal`]: the authenticated identity behind a connection
//! - [`sink`]: the seam through which foreign events re-enter local delivery
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod channel;
pub mod envelope;
pub mod ids;
pub mod logging;
pub mod principal;
pub mod sink;

pub use channel::{Channel, ChannelError, ChannelKind};
pub use envelope::{ClientFrame, Envelope, kinds};
pub use ids::{ConnectionId, InstanceId, MessageId};
pub use principal::Principal;
pub use sink::LocalSink;
