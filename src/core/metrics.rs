//! Request/event metrics and the buffered metric sink.
//!
//! The sink decouples the request path from metric plugins: writers push
//! into a bounded in-memory buffer and return immediately; a background
//! worker drains in batches and fans out to the configured exporters. When
//! the buffer is full the oldest entries are dropped and counted, which is
//! preferred over blocking the request path.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

use crate::core::{
    bus::{BusError, EventBus, ListenerId},
    event::{Event, EventKind, ALL_KINDS},
    request::Protocol,
    upstream::{BackendId, UpstreamId},
};

/// Flush as soon as this many records are buffered, regardless of the timer.
pub const FLUSH_BATCH: usize = 256;

/// Serialize a `Duration` as integer microseconds.
mod duration_micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_micros() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

/// The first-digit class of a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Informational,
    Success,
    Redirect,
    ClientError,
    ServerError,
}

impl StatusClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            100..=199 => StatusClass::Informational,
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirect,
            400..=499 => StatusClass::ClientError,
            _ => StatusClass::ServerError,
        }
    }
}

/// The typed error recorded into a metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricError {
    pub kind: String,
    pub message: String,
}

/// Everything measured about one request. Assembled incrementally during
/// pipeline execution and emitted exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub prefix: Option<String>,
    pub protocol: Protocol,

    #[serde(default)]
    pub upstream_id: Option<UpstreamId>,
    #[serde(default)]
    pub backend_id: Option<BackendId>,

    #[serde(with = "duration_micros")]
    pub router_latency: Duration,
    #[serde(with = "duration_micros")]
    pub balancer_latency: Duration,
    #[serde(with = "duration_micros")]
    pub modifier_latency: Duration,
    #[serde(with = "duration_micros")]
    pub proxy_latency: Duration,
    #[serde(with = "duration_micros")]
    pub total_latency: Duration,
    /// `total - proxy`: time spent inside the gateway itself.
    #[serde(with = "duration_micros")]
    pub internal_latency: Duration,

    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub status_class: Option<StatusClass>,
    #[serde(default)]
    pub error: Option<MetricError>,
}

impl RequestMetric {
    pub fn new(method: &str, host: &str, path: &str, protocol: Protocol) -> Self {
        Self {
            timestamp: Utc::now(),
            method: method.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            prefix: None,
            protocol,
            upstream_id: None,
            backend_id: None,
            router_latency: Duration::ZERO,
            balancer_latency: Duration::ZERO,
            modifier_latency: Duration::ZERO,
            proxy_latency: Duration::ZERO,
            total_latency: Duration::ZERO,
            internal_latency: Duration::ZERO,
            status: None,
            status_class: None,
            error: None,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
        self.status_class = Some(StatusClass::from_status(status));
    }
}

/// A server or request lifecycle marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetric {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

/// Destination for metric batches. The production implementation fans out to
/// metric plugins.
#[async_trait]
pub trait MetricExporter: Send + Sync {
    async fn export_request_metrics(&self, batch: &[RequestMetric]) -> eyre::Result<()>;
    async fn export_event_metrics(&self, batch: &[EventMetric]) -> eyre::Result<()>;
}

#[derive(Debug)]
enum MetricRecord {
    Request(Box<RequestMetric>),
    Event(EventMetric),
}

struct SinkShared {
    buffer: Mutex<VecDeque<MetricRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl SinkShared {
    fn push(&self, record: MetricRecord) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let buffered = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(record);
            buffer.len()
        };
        if buffered >= FLUSH_BATCH {
            self.notify.notify_one();
        }
    }

    fn drain(&self, max: usize) -> Vec<MetricRecord> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let n = buffer.len().min(max);
        buffer.drain(..n).collect()
    }
}

/// Buffered fan-out of request and event metrics.
pub struct MetricSink {
    shared: Arc<SinkShared>,
    flush_interval: Duration,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MetricSink {
    pub fn new(buffer_size: usize, flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(SinkShared {
                buffer: Mutex::new(VecDeque::with_capacity(buffer_size.min(4096))),
                capacity: buffer_size.max(1),
                dropped: AtomicU64::new(0),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
            flush_interval,
            worker: Mutex::new(None),
        })
    }

    /// Record a request metric. Never blocks.
    pub fn write_request(&self, metric: RequestMetric) {
        self.shared.push(MetricRecord::Request(Box::new(metric)));
    }

    /// Record an event metric. Never blocks.
    pub fn write_event(&self, metric: EventMetric) {
        self.shared.push(MetricRecord::Event(metric));
    }

    /// How many records have been dropped because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Start the background flush worker.
    pub fn start(&self, exporter: Arc<dyn MetricExporter>) {
        let shared = self.shared.clone();
        let flush_interval = self.flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shared.notify.notified() => {}
                }

                loop {
                    let batch = shared.drain(FLUSH_BATCH);
                    if batch.is_empty() {
                        break;
                    }
                    let full = batch.len() == FLUSH_BATCH;
                    flush(&*exporter, batch).await;
                    if !full {
                        break;
                    }
                }

                if shared.closed.load(Ordering::Acquire) {
                    // Final drain already happened above; nothing new can be
                    // pushed once the flag is set.
                    break;
                }
            }
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Subscribe to the bus, converting every event into an [`EventMetric`].
    pub fn subscribe_events(self: &Arc<Self>, bus: &EventBus) -> Result<ListenerId, BusError> {
        let (tx, mut rx) = mpsc::channel::<Event>(64);
        let id = bus.add_listener(tx, &ALL_KINDS)?;
        let sink = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let timestamp = match &event {
                    Event::Lifecycle { timestamp, .. } => *timestamp,
                    _ => Utc::now(),
                };
                sink.write_event(EventMetric {
                    kind: event.kind(),
                    timestamp,
                });
            }
        });
        Ok(id)
    }

    /// Stop the worker after a final flush.
    pub async fn stop(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn flush(exporter: &dyn MetricExporter, batch: Vec<MetricRecord>) {
    let mut requests = Vec::new();
    let mut events = Vec::new();
    for record in batch {
        match record {
            MetricRecord::Request(m) => requests.push(*m),
            MetricRecord::Event(m) => events.push(m),
        }
    }

    if !requests.is_empty() {
        if let Err(err) = exporter.export_request_metrics(&requests).await {
            tracing::warn!(error = %err, count = requests.len(), "request metric export failed");
        }
    }
    if !events.is_empty() {
        if let Err(err) = exporter.export_event_metrics(&events).await {
            tracing::warn!(error = %err, count = events.len(), "event metric export failed");
        }
    }
}
