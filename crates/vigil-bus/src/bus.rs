//! Shared pub/sub transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::{debug, warn};

use crate::errors::BusError;

/// Raw payloads received on a subscribed topic. Ends when the subscription
/// is lost.
pub type MessageStream = BoxStream<'static, String>;

/// A topic-based broadcast transport shared by all replicas.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `payload` to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;

    /// Subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), BusError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory bus
// ─────────────────────────────────────────────────────────────────────────────

const MEMORY_TOPIC_CAPACITY: usize = 1024;

struct MemoryBusInner {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    reachable: AtomicBool,
    published: AtomicU64,
}

/// Process-local bus. Clones share the same topics, so several server
/// instances in one process can be wired to one `MemoryBus`.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

impl MemoryBus {
    /// New, reachable bus with no topics.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBusInner {
                topics: Mutex::new(HashMap::new()),
                reachable: AtomicBool::new(true),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate an outage. Going unreachable ends every open subscription.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::Relaxed);
        if !reachable {
            self.inner.topics.lock().clear();
        }
    }

    /// Messages accepted by [`Bus::publish`] so far.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Open subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn check_reachable(&self) -> Result<(), BusError> {
        if self.inner.reachable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(BusError::Unavailable("memory bus unreachable".into()))
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.inner
            .topics
            .lock()
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(MEMORY_TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        self.check_reachable()?;
        // No subscribers is not an error for pub/sub.
        let _ = self.sender(topic).send(payload);
        let _ = self.inner.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError> {
        self.check_reachable()?;
        let rx = self.sender(topic).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(payload) => Some(payload),
                Err(lagged) => {
                    warn!(error = %lagged, "memory bus subscriber lagged");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), BusError> {
        self.check_reachable()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Redis bus
// ─────────────────────────────────────────────────────────────────────────────

const REDIS_FORWARD_BUFFER: usize = 1024;

/// Redis pub/sub backend.
///
/// Publishing and pings share one auto-reconnecting [`ConnectionManager`];
/// each subscription gets its own dedicated pub/sub connection.
pub struct RedisBus {
    client: redis::Client,
    manager: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl RedisBus {
    /// Parse `url`. No connection is made until first use.
    pub fn new(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            manager: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, BusError> {
        let mut guard = self.manager.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone()).await?;
        debug!("redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _receivers: i64 = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(topic).await?;

        let (tx, rx) = mpsc::channel(REDIS_FORWARD_BUFFER);
        let topic = topic.to_owned();
        drop(tokio::spawn(async move {
            let messages = pubsub.on_message().map(|msg| msg.get_payload::<String>());
            forward_until_closed(messages, &tx, &topic).await;
        }));

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Copy text payloads from `messages` into `tx` until either side ends.
///
/// Dropping the receiving stream ends the task even while the topic is
/// quiet, which releases the subscriber connection.
async fn forward_until_closed<S, E>(messages: S, tx: &mpsc::Sender<String>, topic: &str)
where
    S: futures::Stream<Item = Result<String, E>>,
    E: std::fmt::Display,
{
    let mut messages = std::pin::pin!(messages);
    loop {
        tokio::select! {
            () = tx.closed() => break,
            msg = messages.next() => match msg {
                Some(Ok(payload)) => {
                    if tx.send(payload).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => warn!(topic, error = %e, "non-text payload on bus topic"),
                None => break,
            },
        }
    }
    debug!(topic, "redis subscription closed");
}
