//! Per-client connection state shared by the session tasks and the registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use vigil_core::{ConnectionId, Envelope, Principal};

/// Why a connection left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent Close or hung up.
    ClientClosed,
    /// Reading from the socket failed.
    ReadError,
    /// Writing to the socket failed or timed out.
    WriteError,
    /// No liveness proof within the stale threshold.
    Timeout,
    /// Credential expired while connected.
    TokenExpired,
    /// Too many messages dropped on a full queue.
    SlowConsumer,
    /// Server is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::Timeout => "connection timeout",
            Self::TokenExpired => "token_expired",
            Self::SlowConsumer => "slow_consumer",
            Self::Shutdown => "server_shutdown",
        }
    }

    /// Close frame the server should send, if the socket is still usable.
    pub fn close_frame(self) -> Option<(u16, &'static str)> {
        match self {
            Self::ClientClosed | Self::ReadError | Self::WriteError => None,
            Self::Timeout => Some((1001, "connection timeout")),
            Self::TokenExpired => Some((1008, "token expired")),
            Self::SlowConsumer => Some((1013, "slow consumer")),
            Self::Shutdown => Some((1001, "server shutdown")),
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a non-blocking enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Message is in the outbound queue.
    Queued,
    /// Queue full; message skipped and counted as dropped.
    Full,
    /// Connection is closing or its writer is gone.
    Closed,
}

/// A connected, authenticated WebSocket client.
pub struct ClientConnection {
    /// Unique connection id.
    pub id: ConnectionId,
    /// Authenticated identity.
    pub principal: Principal,
    /// Credential expiry captured at upgrade.
    pub credential_expires_at: DateTime<Utc>,
    /// Peer address, when known.
    pub remote_addr: Option<String>,
    /// When the connection was accepted.
    pub connected_at: Instant,
    tx: mpsc::Sender<Arc<String>>,
    subscriptions: RwLock<HashSet<String>>,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
    consecutive_drops: AtomicU64,
    closing: CancellationToken,
    close_reason: Mutex<Option<DisconnectReason>>,
}

impl ClientConnection {
    /// New connection feeding `tx`.
    pub fn new(
        principal: Principal,
        credential_expires_at: DateTime<Utc>,
        remote_addr: Option<String>,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            principal,
            credential_expires_at,
            remote_addr,
            connected_at: now,
            tx,
            subscriptions: RwLock::new(HashSet::new()),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            consecutive_drops: AtomicU64::new(0),
            closing: CancellationToken::new(),
            close_reason: Mutex::new(None),
        }
    }

    /// Non-blocking enqueue of a pre-serialized frame.
    pub fn send(&self, message: Arc<String>) -> SendOutcome {
        if self.closing.is_cancelled() {
            return SendOutcome::Closed;
        }
        match self.tx.try_send(message) {
            Ok(()) => {
                self.consecutive_drops.store(0, Ordering::Relaxed);
                SendOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                let _ = self.consecutive_drops.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Full
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Serialize and enqueue a connection-scoped envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> SendOutcome {
        match envelope.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(conn_id = %self.id, kind = %envelope.kind, error = %e, "failed to serialize envelope");
                SendOutcome::Closed
            }
        }
    }

    /// Add `channel`. Returns `false` if already subscribed.
    pub fn subscribe(&self, channel: &str) -> bool {
        self.subscriptions.write().insert(channel.to_owned())
    }

    /// Remove `channel`. Returns `false` if not subscribed.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.subscriptions.write().remove(channel)
    }

    /// Exact-match membership test.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.read().contains(channel)
    }

    /// Copy of the subscription set.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// Record a liveness proof.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last liveness proof (or since connect).
    pub fn since_last_seen(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }

    /// Whether the credential has expired at `now`.
    pub fn credential_expired(&self, now: DateTime<Utc>) -> bool {
        vigil_auth::expired_at(self.credential_expires_at, now)
    }

    /// Begin closing. The first reason wins; later calls are ignored.
    /// Returns `true` for the call that actually started the close.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        let mut slot = self.close_reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.closing.cancel();
        true
    }

    /// Resolves once [`Self::close`] has been called.
    pub async fn closed(&self) {
        self.closing.cancelled().await;
    }

    /// Whether the connection is closing.
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Reason given to the first [`Self::close`].
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *self.close_reason.lock()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Total messages dropped on a full queue.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Drops since the last message the queue accepted.
    pub fn consecutive_drops(&self) -> u64 {
        self.consecutive_drops.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.principal.user_id)
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn principal(user: &str) -> Principal {
        Principal::new(user, "inst-1", "clinician")
    }

    pub(crate) fn make_connection_for(
        user: &str,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let expires = Utc::now() + chrono::Duration::hours(1);
        let conn = ClientConnection::new(principal(user), expires, None, tx);
        (Arc::new(conn), rx)
    }

    fn make_connection() -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        make_connection_for("u1", 8)
    }

    #[tokio::test]
    async fn send_queues_in_order() {
        let (conn, mut rx) = make_connection();
        assert_eq!(conn.send(Arc::new("a".into())), SendOutcome::Queued);
        assert_eq!(conn.send(Arc::new("b".into())), SendOutcome::Queued);
        assert_eq!(&*rx.recv().await.unwrap(), "a");
        assert_eq!(&*rx.recv().await.unwrap(), "b");
    }

    #[test]
    fn full_queue_counts_drop() {
        let (conn, _rx) = make_connection_for("u1", 1);
        assert_eq!(conn.send(Arc::new("1".into())), SendOutcome::Queued);
        assert_eq!(conn.send(Arc::new("2".into())), SendOutcome::Full);
        assert_eq!(conn.send(Arc::new("3".into())), SendOutcome::Full);
        assert_eq!(conn.drop_count(), 2);
        assert_eq!(conn.consecutive_drops(), 2);
    }

    #[test]
    fn accepted_send_resets_the_drop_streak() {
        let (conn, mut rx) = make_connection_for("u1", 1);
        assert_eq!(conn.send(Arc::new("1".into())), SendOutcome::Queued);
        assert_eq!(conn.send(Arc::new("2".into())), SendOutcome::Full);
        let _ = rx.try_recv().unwrap();
        assert_eq!(conn.send(Arc::new("3".into())), SendOutcome::Queued);
        assert_eq!(conn.consecutive_drops(), 0);
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn closed_receiver_is_not_a_drop() {
        let (conn, rx) = make_connection();
        drop(rx);
        assert_eq!(conn.send(Arc::new("x".into())), SendOutcome::Closed);
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn closing_rejects_sends() {
        let (conn, _rx) = make_connection();
        assert!(conn.close(DisconnectReason::Timeout));
        assert_eq!(conn.send(Arc::new("x".into())), SendOutcome::Closed);
    }

    #[test]
    fn first_close_reason_wins() {
        let (conn, _rx) = make_connection();
        assert!(conn.close(DisconnectReason::TokenExpired));
        assert!(!conn.close(DisconnectReason::ClientClosed));
        assert_eq!(conn.close_reason(), Some(DisconnectReason::TokenExpired));
        assert!(conn.is_closing());
    }

    #[test]
    fn subscriptions_are_exact_and_idempotent() {
        let (conn, _rx) = make_connection();
        assert!(conn.subscribe("patient:42"));
        assert!(!conn.subscribe("patient:42"));
        assert!(conn.is_subscribed("patient:42"));
        assert!(!conn.is_subscribed("patient:4"));
        assert!(conn.unsubscribe("patient:42"));
        assert!(!conn.unsubscribe("patient:42"));
        assert!(conn.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_tracks_pongs() {
        let (conn, _rx) = make_connection();
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(conn.since_last_seen(Instant::now()), Duration::from_secs(40));
        conn.mark_alive();
        assert_eq!(conn.since_last_seen(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn credential_expiry_boundary() {
        let (conn, _rx) = make_connection();
        let exp = conn.credential_expires_at;
        assert!(!conn.credential_expired(exp - chrono::Duration::seconds(1)));
        assert!(conn.credential_expired(exp));
    }

    #[test]
    fn close_frames() {
        assert_eq!(DisconnectReason::TokenExpired.close_frame(), Some((1008, "token expired")));
        assert_eq!(DisconnectReason::Timeout.close_frame().map(|f| f.0), Some(1001));
        assert!(DisconnectReason::ReadError.close_frame().is_none());
        assert_eq!(DisconnectReason::Timeout.as_str(), "connection timeout");
    }
}
