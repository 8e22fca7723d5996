//! In-process WebSocket throughput and error counters.
//!
//! `WsMetrics` backs the JSON `/ws/metrics` snapshot. Every recording is also
//! forwarded to the `metrics` facade so Prometheus sees the same numbers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::metrics::{
    WS_AUTH_ERRORS_TOTAL, WS_BROADCAST_DROPS_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_CONNECTION_ERRORS_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_EVENTS_TOTAL, WS_FANOUT_DURATION_SECONDS, WS_MESSAGES_SENT_TOTAL,
};

/// Width of the events-per-second window.
const RATE_WINDOW_SECS: u64 = 60;

/// Point-in-time view served on `/ws/metrics`.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Live connections.
    pub active_connections: u64,
    /// Connections accepted since start.
    pub total_connections: u64,
    /// Messages enqueued per second, averaged over the last minute.
    pub events_per_second: f64,
    /// Messages enqueued since start.
    pub total_events_sent: u64,
    /// Mean fan-out latency.
    pub average_latency_ms: f64,
    /// Read/write failures.
    pub connection_errors: u64,
    /// Authentication and authorization failures.
    pub auth_errors: u64,
    /// Messages skipped on full queues.
    pub dropped_messages: u64,
    /// Seconds since start.
    pub uptime_seconds: u64,
}

/// Shared counters. Cheap to record from any task.
pub struct WsMetrics {
    started: Instant,
    active: AtomicU64,
    total: AtomicU64,
    events_sent: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
    connection_errors: AtomicU64,
    auth_errors: AtomicU64,
    dropped: AtomicU64,
    // (second since start, messages in that second)
    window: Mutex<VecDeque<(u64, u64)>>,
}

impl WsMetrics {
    /// Zeroed counters; uptime starts now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            active: AtomicU64::new(0),
            total: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            auth_errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            window: Mutex::new(VecDeque::with_capacity(RATE_WINDOW_SECS as usize)),
        }
    }

    /// A connection was registered.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_connection_opened(&self) {
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.total.fetch_add(1, Ordering::Relaxed);
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(active as f64);
    }

    /// A connection was unregistered after `duration`.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_connection_closed(&self, reason: &'static str, duration: Duration) {
        let prev = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(prev.saturating_sub(1) as f64);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// One fan-out enqueued `recipients` messages in `latency`.
    pub fn record_event(&self, recipients: usize, latency: Duration) {
        self.record_event_at(recipients, latency, Instant::now());
    }

    fn record_event_at(&self, recipients: usize, latency: Duration, now: Instant) {
        let n = recipients as u64;
        let _ = self.events_sent.fetch_add(n, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let _ = self.latency_sum_us.fetch_add(micros, Ordering::Relaxed);
        let _ = self.latency_count.fetch_add(1, Ordering::Relaxed);

        let second = self.second_of(now);
        {
            let mut window = self.window.lock();
            match window.back_mut() {
                Some((s, count)) if *s == second => *count += n,
                _ => window.push_back((second, n)),
            }
            prune(&mut window, second);
        }

        counter!(WS_EVENTS_TOTAL).increment(1);
        counter!(WS_MESSAGES_SENT_TOTAL).increment(n);
        histogram!(WS_FANOUT_DURATION_SECONDS).record(latency.as_secs_f64());
    }

    /// A message was skipped because the client queue was full.
    pub fn record_drop(&self) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
    }

    /// A read or write failed.
    pub fn record_connection_error(&self) {
        let _ = self.connection_errors.fetch_add(1, Ordering::Relaxed);
        counter!(WS_CONNECTION_ERRORS_TOTAL).increment(1);
    }

    /// Authentication (`"authentication"`) or authorization
    /// (`"authorization"`) failure.
    pub fn record_auth_error(&self, kind: &'static str) {
        let _ = self.auth_errors.fetch_add(1, Ordering::Relaxed);
        counter!(WS_AUTH_ERRORS_TOTAL, "kind" => kind).increment(1);
    }

    /// Live connection count.
    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let latency_count = self.latency_count.load(Ordering::Relaxed);
        let average_latency_ms = if latency_count == 0 {
            0.0
        } else {
            self.latency_sum_us.load(Ordering::Relaxed) as f64 / latency_count as f64 / 1000.0
        };

        let in_window: u64 = {
            let mut window = self.window.lock();
            prune(&mut window, self.second_of(now));
            window.iter().map(|(_, c)| c).sum()
        };

        MetricsSnapshot {
            timestamp: Utc::now(),
            active_connections: self.active.load(Ordering::Relaxed),
            total_connections: self.total.load(Ordering::Relaxed),
            events_per_second: in_window as f64 / RATE_WINDOW_SECS as f64,
            total_events_sent: self.events_sent.load(Ordering::Relaxed),
            average_latency_ms,
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            auth_errors: self.auth_errors.load(Ordering::Relaxed),
            dropped_messages: self.dropped.load(Ordering::Relaxed),
            uptime_seconds: now.saturating_duration_since(self.started).as_secs(),
        }
    }

    fn second_of(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_secs()
    }
}

impl Default for WsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(window: &mut VecDeque<(u64, u64)>, current: u64) {
    while let Some(&(second, _)) = window.front() {
        if second + RATE_WINDOW_SECS <= current {
            let _ = window.pop_front();
        } else {
            break;
        }
    }
}
