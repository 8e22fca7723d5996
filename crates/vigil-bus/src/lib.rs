//! # vigil-bus
//!
//! Keeps stateless replicas in step over one shared pub/sub topic.
//!
//! - [`bus`]: the [`Bus`] transport trait with in-memory and Redis backends
//! - [`synchronizer`]: stamps and publishes local events, re-injects foreign
//!   ones, drops its own echoes, resubscribes after failures
//! - [`publisher`]: typed helpers for the domain events producers emit

#![deny(unsafe_code)]

pub mod bus;
pub mod errors;
pub mod publisher;
pub mod synchronizer;

pub use bus::{Bus, MemoryBus, MessageStream, RedisBus};
pub use errors::BusError;
pub use publisher::EventPublisher;
pub use synchronizer::{IngestOutcome, SyncConfig, Synchronizer, is_self_originated};
