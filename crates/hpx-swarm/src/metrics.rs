//! Client metrics.
//!
//! [`SwarmMetrics`] reports counters through the global OpenTelemetry meter
//! provider (a no-op unless the application installs one).
//! [`StatisticsRecorder`] keeps per-request debug statistics when
//! `debug_statistics` is enabled.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use parking_lot::Mutex;
use tracing::info;

use crate::protocol::{RequestId, SubscriptionId};

/// OpenTelemetry instruments shared by the transports.
#[derive(Clone)]
pub struct SwarmMetrics {
    requests: Counter<u64>,
    request_errors: Counter<u64>,
    round_trip: Histogram<f64>,
    reconnects: Counter<u64>,
    sessions: Counter<u64>,
    push_updates: Counter<u64>,
}

impl Default for SwarmMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmMetrics {
    pub fn new() -> Self {
        let meter = global::meter("hpx-swarm");
        Self {
            requests: meter
                .u64_counter("swarm.requests")
                .with_description("Requests sent to the backend")
                .build(),
            request_errors: meter
                .u64_counter("swarm.request.errors")
                .with_description("Requests that failed at the transport level")
                .build(),
            round_trip: meter
                .f64_histogram("swarm.request.duration")
                .with_unit("s")
                .with_description("Request round-trip time in seconds")
                .build(),
            reconnects: meter
                .u64_counter("swarm.socket.reconnects")
                .with_description("Scheduled socket reconnect attempts")
                .build(),
            sessions: meter
                .u64_counter("swarm.sessions")
                .with_description("Sessions acquired")
                .build(),
            push_updates: meter
                .u64_counter("swarm.push.updates")
                .with_description("Subscription updates received")
                .build(),
        }
    }

    pub(crate) fn record_request(&self, transport: &'static str, elapsed: Duration, ok: bool) {
        let attrs = [KeyValue::new("transport", transport)];
        self.requests.add(1, &attrs);
        self.round_trip.record(elapsed.as_secs_f64(), &attrs);
        if !ok {
            self.request_errors.add(1, &attrs);
        }
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.add(1, &[]);
    }

    pub(crate) fn record_session(&self) {
        self.sessions.add(1, &[]);
    }

    pub(crate) fn record_push(&self, transport: &'static str, updates: usize) {
        self.push_updates
            .add(updates as u64, &[KeyValue::new("transport", transport)]);
    }
}

/// Debug statistics for one request.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestStatistics {
    pub rid: RequestId,
    pub command: String,
    /// Bytes sent, including a later `unsubscribe` for the same subscription.
    pub sent_bytes: usize,
    pub sent_at: Instant,
    pub received_bytes: usize,
    pub received_at: Option<Instant>,
    pub subid: Option<SubscriptionId>,
    /// Bytes of push updates delivered for `subid`.
    pub update_bytes: usize,
    pub unsubscribed: bool,
}

impl RequestStatistics {
    /// Time between sending the request and receiving its response.
    pub fn rtt(&self) -> Option<Duration> {
        self.received_at
            .map(|received| received.saturating_duration_since(self.sent_at))
    }

    /// Average update throughput since the response arrived, bytes/second.
    pub fn update_rate(&self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.received_at?).as_secs_f64();
        (elapsed > 0.0).then(|| self.update_bytes as f64 / elapsed)
    }
}

#[derive(Default)]
struct Recorded {
    requests: HashMap<RequestId, RequestStatistics>,
    by_subid: HashMap<SubscriptionId, RequestId>,
}

/// Per-request debug statistics.
#[derive(Default)]
pub struct StatisticsRecorder {
    inner: Mutex<Recorded>,
}

impl StatisticsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing request.
    ///
    /// An `unsubscribe` is charged to the request that created the
    /// subscription and marks it ended.
    pub fn record_sent(
        &self,
        rid: &RequestId,
        command: &str,
        unsubscribe_subid: Option<&SubscriptionId>,
        bytes: usize,
    ) {
        let mut inner = self.inner.lock();
        if let Some(subid) = unsubscribe_subid
            && let Some(origin) = inner.by_subid.get(subid).cloned()
            && let Some(stats) = inner.requests.get_mut(&origin)
        {
            stats.unsubscribed = true;
            stats.sent_bytes += bytes;
            return;
        }

        inner.requests.insert(
            rid.clone(),
            RequestStatistics {
                rid: rid.clone(),
                command: command.to_string(),
                sent_bytes: bytes,
                sent_at: Instant::now(),
                received_bytes: 0,
                received_at: None,
                subid: None,
                update_bytes: 0,
                unsubscribed: false,
            },
        );
    }

    /// Record the response to a request.
    pub fn record_response(&self, rid: &RequestId, subid: Option<SubscriptionId>, bytes: usize) {
        let mut inner = self.inner.lock();
        let Some(stats) = inner.requests.get_mut(rid) else {
            return;
        };
        stats.received_at = Some(Instant::now());
        stats.received_bytes = bytes;
        stats.subid = subid.clone();
        if let Some(subid) = subid {
            inner.by_subid.insert(subid, rid.clone());
        }
    }

    /// Record push update bytes for a subscription.
    pub fn record_update(&self, subid: &SubscriptionId, bytes: usize) {
        let mut inner = self.inner.lock();
        let Some(rid) = inner.by_subid.get(subid).cloned() else {
            return;
        };
        if let Some(stats) = inner.requests.get_mut(&rid) {
            stats.update_bytes += bytes;
        }
    }

    /// Snapshot of every recorded request, oldest first.
    pub fn snapshot(&self) -> Vec<RequestStatistics> {
        let mut all: Vec<_> = self.inner.lock().requests.values().cloned().collect();
        all.sort_by_key(|stats| stats.sent_at);
        all
    }

    /// Log one line per recorded request.
    pub fn dump(&self) {
        let now = Instant::now();
        for stats in self.snapshot() {
            info!(
                rid = %stats.rid,
                command = %stats.command,
                sent = stats.sent_bytes,
                received = stats.received_bytes,
                rtt_ms = stats.rtt().map(|rtt| rtt.as_millis() as u64),
                updates = stats.update_bytes,
                update_rate = stats.update_rate(now),
                ended = stats.unsubscribed,
                "request statistics"
            );
        }
    }
}
