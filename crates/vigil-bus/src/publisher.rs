//! Typed entry points for event producers.
//!
//! Producers (telemetry ingestion, alert rules, session tracking) describe
//! what happened; this module picks the channel and message kind.

use std::sync::Arc;

use serde::Serialize;
use serde_json::value::to_raw_value;
use tracing::warn;
use vigil_core::{Channel, MessageId, kinds};

use crate::errors::BusError;
use crate::synchronizer::Synchronizer;

/// Cloneable handle for publishing domain events.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    sync: Arc<Synchronizer>,
}

impl EventPublisher {
    /// Wrap a synchronizer.
    pub fn new(sync: Arc<Synchronizer>) -> Self {
        Self { sync }
    }

    /// Publish `payload` as a message of `kind` on `channel`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        channel: &Channel,
        payload: &T,
    ) -> Result<MessageId, BusError> {
        let raw = to_raw_value(payload)?;
        self.sync.publish(kind, channel, raw).await
    }

    /// Generic `event` message.
    pub async fn event<T: Serialize + ?Sized>(
        &self,
        channel: &Channel,
        payload: &T,
    ) -> Result<MessageId, BusError> {
        self.publish(kinds::EVENT, channel, payload).await
    }

    /// `device_status` on `device:<id>`.
    pub async fn device_status<T: Serialize + ?Sized>(
        &self,
        device_id: &str,
        payload: &T,
    ) -> Result<MessageId, BusError> {
        let channel = Channel::device(device_id)?;
        self.publish(kinds::DEVICE_STATUS, &channel, payload).await
    }

    /// `telemetry` on `device:<id>`.
    pub async fn telemetry<T: Serialize + ?Sized>(
        &self,
        device_id: &str,
        payload: &T,
    ) -> Result<MessageId, BusError> {
        let channel = Channel::device(device_id)?;
        self.publish(kinds::TELEMETRY, &channel, payload).await
    }

    /// `alert_created` on `patient:<id>`.
    pub async fn alert_created<T: Serialize + ?Sized>(
        &self,
        patient_id: u32,
        payload: &T,
    ) -> Result<MessageId, BusError> {
        self.publish(kinds::ALERT_CREATED, &Channel::patient(patient_id), payload)
            .await
    }

    /// `usage_session_start` or `usage_session_end` on `patient:<id>`.
    pub async fn usage_session<T: Serialize + ?Sized>(
        &self,
        patient_id: u32,
        started: bool,
        payload: &T,
    ) -> Result<MessageId, BusError> {
        let kind = if started {
            kinds::USAGE_SESSION_START
        } else {
            kinds::USAGE_SESSION_END
        };
        self.publish(kind, &Channel::patient(patient_id), payload).await
    }

    /// `dashboard_stats` on `dashboard`.
    pub async fn dashboard_stats<T: Serialize + ?Sized>(
        &self,
        payload: &T,
    ) -> Result<MessageId, BusError> {
        self.publish(kinds::DASHBOARD_STATS, &Channel::dashboard(), payload)
            .await
    }

    /// Publish the same payload on several channels.
    ///
    /// Every channel is attempted; the first failure (if any) is returned.
    pub async fn publish_many<T: Serialize + ?Sized>(
        &self,
        channels: &[Channel],
        kind: &str,
        payload: &T,
    ) -> Result<Vec<MessageId>, BusError> {
        let raw = to_raw_value(payload)?;
        let mut ids = Vec::with_capacity(channels.len());
        let mut first_err = None;
        for channel in channels {
            match self.sync.publish(kind, channel, raw.clone()).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "multi-channel publish failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synchronizer::SyncConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use vigil_core::{Envelope, InstanceId, LocalSink};

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<Arc<Envelope>>>,
    }

    #[async_trait]
    impl LocalSink for RecordingSink {
        async fn deliver(&self, message: Arc<Envelope>) -> bool {
            self.seen.lock().push(message);
            true
        }
    }

    fn publisher() -> (EventPublisher, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let sync = Synchronizer::new(InstanceId::from("a"), None, sink.clone(), SyncConfig::default());
        (EventPublisher::new(Arc::new(sync)), sink)
    }

    fn routes(sink: &RecordingSink) -> Vec<(String, String)> {
        sink.seen
            .lock()
            .iter()
            .map(|e| (e.kind.clone(), e.channel.clone()))
            .collect()
    }

    #[tokio::test]
    async fn domain_events_route_to_their_channels() {
        let (p, sink) = publisher();
        let body = json!({"x": 1});
        let _ = p.device_status("ESP32-01", &body).await.unwrap();
        let _ = p.telemetry("ESP32-01", &body).await.unwrap();
        let _ = p.alert_created(42, &body).await.unwrap();
        let _ = p.usage_session(42, true, &body).await.unwrap();
        let _ = p.usage_session(42, false, &body).await.unwrap();
        let _ = p.dashboard_stats(&body).await.unwrap();

        assert_eq!(
            routes(&sink),
            vec![
                ("device_status".into(), "device:ESP32-01".into()),
                ("telemetry".into(), "device:ESP32-01".into()),
                ("alert_created".into(), "patient:42".into()),
                ("usage_session_start".into(), "patient:42".into()),
                ("usage_session_end".into(), "patient:42".into()),
                ("dashboard_stats".into(), "dashboard".into()),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_device_id_rejected_before_delivery() {
        let (p, sink) = publisher();
        assert!(matches!(
            p.device_status("a:b", &json!({})).await,
            Err(BusError::Channel(_))
        ));
        assert!(sink.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn publish_many_hits_every_channel() {
        let (p, sink) = publisher();
        let channels = [Channel::dashboard(), Channel::alerts_global(), Channel::patient(1)];
        let ids = p
            .publish_many(&channels, kinds::ALERT_CREATED, &json!({"severity": "high"}))
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(sink.seen.lock().len(), 3);
        assert_eq!(sink.seen.lock()[1].channel, "alerts:global");
    }
}
