//! Typed proxy events and the fire-and-forget event bus.
//!
//! Publication never blocks the request path: events land in a bounded
//! queue that drops the oldest entry on overflow, and a background task
//! dispatches them to the registered sinks.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How a request was satisfied relative to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from a fresh mirror with no upstream call.
    Hit,
    /// Mirror was refreshed from upstream before serving.
    Refresh,
    /// Upstream failed; served from a warm but stale mirror.
    FallbackStale,
    /// Upstream failed and the mirror was cold.
    MissError,
}

impl CacheOutcome {
    /// Metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Refresh => "refresh",
            Self::FallbackStale => "fallback_stale",
            Self::MissError => "miss_error",
        }
    }
}

/// Event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A request finished (successfully or not).
    Request,
    /// A stale mirror was served because upstream was unreachable.
    FallbackStale,
    /// A cached response older than the freshness window was served.
    Staleness,
    /// An upstream conversation failed.
    UpstreamError,
    /// The request deadline elapsed or the client went away. Not an error.
    Cancelled,
}

/// A structured proxy event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event category.
    pub kind: EventKind,
    /// Canonical repository key.
    pub repo: String,
    /// v2 command being served, when known.
    pub command: Option<&'static str>,
    /// Request fingerprint, when classified.
    pub fingerprint: Option<String>,
    /// Response bytes written.
    pub bytes: u64,
    /// Request duration so far.
    pub duration: Duration,
    /// Upstream HTTP status, when one was observed.
    pub upstream_status: Option<u16>,
    /// Upstream error kind label, for `UpstreamError` events.
    pub upstream_error_kind: Option<&'static str>,
    /// Cache outcome, for `Request` events.
    pub cache_outcome: Option<CacheOutcome>,
    /// Mirror age at serve time, for staleness/fallback events.
    pub mirror_age: Option<Duration>,
}

impl Event {
    /// A minimal event of the given kind for `repo`.
    pub fn new(kind: EventKind, repo: impl Into<String>) -> Self {
        Self {
            kind,
            repo: repo.into(),
            command: None,
            fingerprint: None,
            bytes: 0,
            duration: Duration::ZERO,
            upstream_status: None,
            upstream_error_kind: None,
            cache_outcome: None,
            mirror_age: None,
        }
    }
}

/// Receives published events. Sinks must be fast; slow work belongs behind
/// the sink's own channel.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &Event);
}

/// Bounded drop-oldest event bus.
pub struct EventBus {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    sinks: Vec<Arc<dyn EventSink>>,
    dropped: AtomicU64,
}

impl EventBus {
    /// Creates a bus with the given queue capacity and sinks.
    pub fn new(capacity: usize, sinks: Vec<Arc<dyn EventSink>>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            sinks,
            dropped: AtomicU64::new(0),
        })
    }

    /// Publishes an event. Never blocks; drops the oldest queued event when
    /// the queue is full.
    pub fn publish(&self, event: Event) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Number of events dropped due to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Dispatches all queued events to the sinks. Returns how many were
    /// delivered.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            let event = self.queue.lock().pop_front();
            match event {
                Some(event) => {
                    for sink in &self.sinks {
                        sink.on_event(&event);
                    }
                    delivered += 1;
                }
                None => return delivered,
            }
        }
    }

    /// Background dispatch loop; runs until the bus is dropped elsewhere.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.drain();
            self.notify.notified().await;
        }
    }
}

/// Sink that emits events as structured logs.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: &Event) {
        match event.kind {
            EventKind::Request => {
                tracing::info!(
                    repo = %event.repo,
                    command = event.command.unwrap_or("-"),
                    outcome = event.cache_outcome.map(|o| o.as_str()).unwrap_or("-"),
                    bytes = event.bytes,
                    duration_ms = event.duration.as_millis() as u64,
                    "Request completed"
                );
            }
            EventKind::FallbackStale => {
                tracing::warn!(
                    repo = %event.repo,
                    age_secs = event.mirror_age.map(|a| a.as_secs()).unwrap_or(0),
                    "Upstream unreachable, served stale mirror"
                );
            }
            EventKind::Staleness => {
                tracing::warn!(
                    repo = %event.repo,
                    age_secs = event.mirror_age.map(|a| a.as_secs()).unwrap_or(0),
                    "Served response older than the freshness window"
                );
            }
            EventKind::UpstreamError => {
                tracing::warn!(
                    repo = %event.repo,
                    kind = event.upstream_error_kind.unwrap_or("unknown"),
                    status = event.upstream_status.unwrap_or(0),
                    "Upstream conversation failed"
                );
            }
            // Cancellation is ordinary client behavior, not an error.
            EventKind::Cancelled => {
                tracing::debug!(
                    repo = %event.repo,
                    command = event.command.unwrap_or("-"),
                    bytes = event.bytes,
                    "Request cancelled"
                );
            }
        }
    }
}
