//! Cross-instance synchronizer.
//!
//! Every event published on this instance is delivered locally right away
//! and also pushed to the shared topic stamped with this instance's id and a
//! fresh message id. Every instance subscribes to the topic; an instance
//! receiving its own message drops it because it already delivered it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, gauge};
use serde_json::value::RawValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vigil_core::{Channel, Envelope, InstanceId, LocalSink, MessageId};
use vigil_settings::BusSettings;

use crate::bus::Bus;
use crate::errors::BusError;

/// Timing and retry knobs.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Topic carrying all cross-instance traffic.
    pub topic: String,
    /// Publish attempts before giving up.
    pub publish_attempts: u32,
    /// Attempt `n` (1-based) is followed by a `n * publish_backoff` pause.
    pub publish_backoff: Duration,
    /// Pause before resubscribing after the subscription drops.
    pub resubscribe_delay: Duration,
    /// Interval between reachability checks.
    pub health_check_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from(&BusSettings::default())
    }
}

impl From<&BusSettings> for SyncConfig {
    fn from(s: &BusSettings) -> Self {
        Self {
            topic: s.topic.clone(),
            publish_attempts: s.publish_attempts.max(1),
            publish_backoff: Duration::from_millis(s.publish_backoff_ms),
            resubscribe_delay: Duration::from_secs(s.resubscribe_delay_secs),
            health_check_interval: Duration::from_secs(s.health_check_interval_secs),
        }
    }
}

/// What [`Synchronizer::ingest`] did with a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Handed to local delivery.
    Delivered,
    /// Published by this instance; dropped.
    SelfOriginated,
    /// Not a valid stamped envelope; dropped.
    Malformed,
    /// Local delivery has shut down.
    SinkClosed,
}

impl IngestOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::SelfOriginated => "self_originated",
            Self::Malformed => "malformed",
            Self::SinkClosed => "sink_closed",
        }
    }
}

/// True when `message` was published by `local`.
///
/// This is the loop-prevention check: a replica must never redeliver its own
/// bus traffic, since it delivered locally at publish time.
pub fn is_self_originated(message: &Envelope, local: &InstanceId) -> bool {
    message.instance_id.as_ref() == Some(local)
}

/// Bridges local delivery and the shared bus.
pub struct Synchronizer {
    instance_id: InstanceId,
    bus: Option<Arc<dyn Bus>>,
    sink: Arc<dyn LocalSink>,
    config: SyncConfig,
    connected: AtomicBool,
}

impl Synchronizer {
    /// Synchronizer publishing through `bus`. `None` runs local-only.
    pub fn new(
        instance_id: InstanceId,
        bus: Option<Arc<dyn Bus>>,
        sink: Arc<dyn LocalSink>,
        config: SyncConfig,
    ) -> Self {
        let connected = bus.is_some();
        Self {
            instance_id,
            bus,
            sink,
            config,
            connected: AtomicBool::new(connected),
        }
    }

    /// This replica's identity.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Whether a bus is configured at all.
    pub fn bus_enabled(&self) -> bool {
        self.bus.is_some()
    }

    /// Last known bus reachability. Always false without a bus.
    pub fn is_connected(&self) -> bool {
        self.bus.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::Relaxed);
        if was != connected {
            if connected {
                info!(instance_id = %self.instance_id, "bus connection restored");
            } else {
                warn!(instance_id = %self.instance_id, "bus connection lost, delivering locally only");
            }
        }
        gauge!("bus_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Publish an event on `channel`.
    ///
    /// Local subscribers get it immediately. The stamped envelope then goes
    /// to the bus with bounded retries; a bus failure is returned but never
    /// undoes local delivery. The bus is skipped only while the health check
    /// or the subscriber loop reports it unreachable; a failed publish does
    /// not change that flag.
    #[instrument(skip_all, fields(kind = %kind, channel = %channel))]
    pub async fn publish(
        &self,
        kind: &str,
        channel: &Channel,
        payload: Box<RawValue>,
    ) -> Result<MessageId, BusError> {
        let message_id = MessageId::new();
        let envelope = Arc::new(
            Envelope::new(kind, channel.as_str(), payload)
                .with_origin(self.instance_id.clone(), message_id.clone()),
        );

        if !self.sink.deliver(Arc::clone(&envelope)).await {
            warn!("local delivery closed, event not delivered locally");
        }

        let Some(bus) = &self.bus else {
            return Ok(message_id);
        };
        if !self.connected.load(Ordering::Relaxed) {
            counter!("bus_publish_skipped_total").increment(1);
            return Err(BusError::Unavailable("bus disconnected".into()));
        }

        let text = envelope.to_json()?;
        self.publish_with_retry(bus.as_ref(), &text).await?;
        counter!("bus_messages_published_total").increment(1);
        debug!(message_id = %message_id, "published to bus");
        Ok(message_id)
    }

    async fn publish_with_retry(&self, bus: &dyn Bus, text: &str) -> Result<(), BusError> {
        let attempts = self.config.publish_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match bus.publish(&self.config.topic, text.to_owned()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "bus publish failed");
                    last = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.publish_backoff * attempt).await;
                    }
                }
            }
        }
        counter!("bus_publish_failures_total").increment(1);
        Err(BusError::PublishFailed { attempts, last })
    }

    /// Handle one raw message received from the bus.
    pub async fn ingest(&self, raw: &str) -> IngestOutcome {
        let outcome = self.ingest_inner(raw).await;
        counter!("bus_messages_received_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn ingest_inner(&self, raw: &str) -> IngestOutcome {
        let envelope = match Envelope::from_json(raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping malformed bus message");
                return IngestOutcome::Malformed;
            }
        };

        let stamped = envelope.instance_id.as_ref().is_some_and(|id| !id.is_empty())
            && envelope.message_id.as_ref().is_some_and(|id| !id.is_empty());
        if !stamped {
            warn!(kind = %envelope.kind, channel = %envelope.channel, "dropping bus message without origin ids");
            return IngestOutcome::Malformed;
        }

        if is_self_originated(&envelope, &self.instance_id) {
            return IngestOutcome::SelfOriginated;
        }

        debug!(
            kind = %envelope.kind,
            channel = %envelope.channel,
            origin = ?envelope.instance_id,
            message_id = ?envelope.message_id,
            "delivering foreign bus message"
        );
        if self.sink.deliver(Arc::new(envelope)).await {
            IngestOutcome::Delivered
        } else {
            IngestOutcome::SinkClosed
        }
    }

    /// Subscription loop: subscribe, ingest until the stream ends, wait,
    /// resubscribe. Returns on cancellation or when local delivery closes.
    pub async fn run_subscriber(self: Arc<Self>, cancel: CancellationToken) {
        let Some(bus) = self.bus.clone() else {
            return;
        };

        loop {
            match bus.subscribe(&self.config.topic).await {
                Ok(mut stream) => {
                    info!(topic = %self.config.topic, instance_id = %self.instance_id, "subscribed to bus");
                    self.set_connected(true);
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            next = stream.next() => match next {
                                Some(raw) => {
                                    if self.ingest(&raw).await == IngestOutcome::SinkClosed {
                                        return;
                                    }
                                }
                                None => {
                                    warn!(topic = %self.config.topic, "bus subscription ended");
                                    self.set_connected(false);
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    warn!(topic = %self.config.topic, error = %e, "bus subscribe failed");
                    self.set_connected(false);
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.resubscribe_delay) => {}
            }
        }
    }

    /// Periodic ping keeping [`Self::is_connected`] current.
    pub async fn run_health_check(self: Arc<Self>, cancel: CancellationToken) {
        let Some(bus) = self.bus.clone() else {
            return;
        };
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    match bus.ping().await {
                        Ok(()) => self.set_connected(true),
                        Err(e) => {
                            debug!(error = %e, "bus ping failed");
                            self.set_connected(false);
                        }
                    }
                }
            }
        }
    }

    /// Spawn the subscriber and health-check loops.
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        if self.bus.is_none() {
            return Vec::new();
        }
        vec![
            tokio::spawn(Arc::clone(self).run_subscriber(cancel.child_token())),
            tokio::spawn(Arc::clone(self).run_health_check(cancel.child_token())),
        ]
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("instance_id", &self.instance_id)
            .field("bus_enabled", &self.bus.is_some())
            .field("connected", &self.is_connected())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
