//! Connection registry actor.
//!
//! A single task owns the live-connection map. Registration, removal,
//! fan-out, heartbeats and reaping all arrive as [`Command`]s and are
//! applied one at a time, so no lock is ever held across connections.
//! Per-connection subscription sets keep their own lock and are mutated by
//! the session tasks directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{ConnectionId, Envelope, LocalSink};

use super::broadcast::{self, SubscriberInfo};
use super::connection::{ClientConnection, DisconnectReason, SendOutcome};
use super::connection_log;
use super::heartbeat::find_stale;
use crate::metrics::{WS_HEARTBEATS_TOTAL, WS_REAPED_TOTAL};
use crate::stats::WsMetrics;

/// Messages understood by the registry task.
#[derive(Debug)]
enum Command {
    Register(Arc<ClientConnection>),
    Unregister {
        id: ConnectionId,
        reason: DisconnectReason,
    },
    Deliver(Arc<Envelope>),
    RefreshViewers(String),
    Heartbeat,
    Reap,
    Subscribers {
        channel: String,
        reply: oneshot::Sender<Vec<SubscriberInfo>>,
    },
}

/// The actor. Build with [`channel`], then drive with [`Registry::run`].
pub struct Registry {
    connections: HashMap<ConnectionId, Arc<ClientConnection>>,
    rx: mpsc::UnboundedReceiver<Command>,
    active: Arc<AtomicUsize>,
    metrics: Arc<WsMetrics>,
    stale_after: Duration,
}

/// Create a registry and its handle.
pub fn channel(metrics: Arc<WsMetrics>, stale_after: Duration) -> (Registry, RegistryHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicUsize::new(0));
    let registry = Registry {
        connections: HashMap::new(),
        rx,
        active: Arc::clone(&active),
        metrics,
        stale_after,
    };
    (registry, RegistryHandle { tx, active })
}

impl Registry {
    /// Process commands until `cancel` fires or every handle is dropped.
    /// On cancellation every connection is closed with
    /// [`DisconnectReason::Shutdown`].
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("connection registry started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        self.close_all();
        debug!("connection registry stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register(conn) => self.register(conn),
            Command::Unregister { id, reason } => self.unregister(&id, reason),
            Command::Deliver(message) => self.deliver(&message),
            Command::RefreshViewers(channel) => self.refresh_viewers(&channel),
            Command::Heartbeat => self.heartbeat(),
            Command::Reap => self.reap(Instant::now()),
            Command::Subscribers { channel, reply } => {
                let _ = reply.send(broadcast::subscribers(self.connections.values(), &channel));
            }
        }
    }

    fn sync_active(&self) {
        self.active.store(self.connections.len(), Ordering::Relaxed);
    }

    fn register(&mut self, conn: Arc<ClientConnection>) {
        if conn.is_closing() {
            debug!(conn_id = %conn.id, "connection closed before registration");
            return;
        }
        self.metrics.record_connection_opened();
        connection_log::connection_established(&conn);
        let _ = self.connections.insert(conn.id.clone(), conn);
        self.sync_active();
    }

    fn unregister(&mut self, id: &ConnectionId, reason: DisconnectReason) {
        let Some(conn) = self.connections.remove(id) else {
            return;
        };
        self.sync_active();
        let _ = conn.close(reason);
        let reason = conn.close_reason().unwrap_or(reason);
        let duration = conn.age();
        self.metrics.record_connection_closed(reason.as_str(), duration);
        connection_log::connection_closed(&conn, reason, duration);

        for channel in conn.subscriptions() {
            self.refresh_viewers(&channel);
        }
    }

    fn deliver(&mut self, message: &Envelope) {
        let started = Instant::now();
        let frame = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(kind = %message.kind, channel = %message.channel, error = %e, "failed to serialize message");
                return;
            }
        };

        let out = broadcast::fan_out(self.connections.values(), &message.channel, &frame);
        if out.recipients == 0 && out.skipped == 0 {
            debug!(kind = %message.kind, channel = %message.channel, "no local subscribers");
            return;
        }

        self.metrics.record_event(out.recipients, started.elapsed());
        for _ in 0..out.skipped {
            self.metrics.record_drop();
        }
        connection_log::event_sent(message, out.recipients);

        for id in out.evicted {
            warn!(conn_id = %id, "evicting slow consumer");
            self.unregister(&id, DisconnectReason::SlowConsumer);
        }
    }

    fn refresh_viewers(&mut self, channel: &str) {
        let viewers = broadcast::viewers(self.connections.values(), channel);
        if viewers.is_empty() {
            return;
        }
        self.deliver(&Envelope::viewer_count(channel, &viewers));
    }

    fn heartbeat(&self) {
        let frame = match Envelope::heartbeat().to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(error = %e, "failed to serialize heartbeat");
                return;
            }
        };
        let mut sent = 0u64;
        for conn in self.connections.values() {
            match conn.send(Arc::clone(&frame)) {
                SendOutcome::Queued => sent += 1,
                SendOutcome::Full => {
                    self.metrics.record_drop();
                    warn!(conn_id = %conn.id, "heartbeat skipped, outbound queue full");
                }
                SendOutcome::Closed => {}
            }
        }
        counter!(WS_HEARTBEATS_TOTAL).increment(sent);
    }

    fn reap(&mut self, now: Instant) {
        let stale = find_stale(self.connections.values(), now, self.stale_after);
        for id in stale {
            info!(conn_id = %id, threshold = ?self.stale_after, "reaping stale connection");
            counter!(WS_REAPED_TOTAL).increment(1);
            self.unregister(&id, DisconnectReason::Timeout);
        }
    }

    fn close_all(&mut self) {
        let count = self.connections.len();
        for (_, conn) in self.connections.drain() {
            let _ = conn.close(DisconnectReason::Shutdown);
            let duration = conn.age();
            self.metrics
                .record_connection_closed(DisconnectReason::Shutdown.as_str(), duration);
            connection_log::connection_closed(&conn, DisconnectReason::Shutdown, duration);
        }
        self.sync_active();
        if count > 0 {
            info!(count, "closed all connections for shutdown");
        }
    }
}

/// Cloneable sender side of the registry.
///
/// Every method is fire-and-forget except [`Self::subscribers`]. Calls after
/// the registry has stopped are ignored and report `false`.
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<Command>,
    active: Arc<AtomicUsize>,
}

impl RegistryHandle {
    fn send(&self, cmd: Command) -> bool {
        self.tx.send(cmd).is_ok()
    }

    /// Add a connection.
    pub fn register(&self, conn: Arc<ClientConnection>) -> bool {
        self.send(Command::Register(conn))
    }

    /// Remove a connection. Idempotent.
    pub fn unregister(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        self.send(Command::Unregister { id, reason })
    }

    /// Fan `message` out to local subscribers of its channel.
    pub fn deliver(&self, message: Arc<Envelope>) -> bool {
        self.send(Command::Deliver(message))
    }

    /// Rebroadcast the viewer count of `channel` to its subscribers.
    pub fn refresh_viewers(&self, channel: impl Into<String>) -> bool {
        self.send(Command::RefreshViewers(channel.into()))
    }

    /// Enqueue a heartbeat on every connection.
    pub fn send_heartbeats(&self) -> bool {
        self.send(Command::Heartbeat)
    }

    /// Unregister every connection silent past the stale threshold.
    pub fn reap(&self) -> bool {
        self.send(Command::Reap)
    }

    /// Subscribers of `channel`. Empty if the registry has stopped.
    pub async fn subscribers(&self, channel: &str) -> Vec<SubscriberInfo> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Subscribers {
            channel: channel.to_owned(),
            reply,
        }) {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Live connections as of the last processed command.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LocalSink for RegistryHandle {
    async fn deliver(&self, message: Arc<Envelope>) -> bool {
        RegistryHandle::deliver(self, message)
    }
}

// ─── Tests ───
