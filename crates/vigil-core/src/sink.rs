//! Local delivery seam.
//!
//! The bus synchronizer lives below the server crate, so it hands messages
//! back for local fan-out through this trait instead of calling the registry
//! directly.

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;

/// Something that fans a message out to locally connected subscribers.
#[async_trait]
pub trait LocalSink: Send + Sync {
    /// Queue `message` for local delivery.
    ///
    /// Returns `false` once the sink has shut down.
    async fn deliver(&self, message: Arc<Envelope>) -> bool;
}
