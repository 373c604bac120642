//! Prometheus metrics for the proxy.

use crate::events::{Event, EventKind, EventSink};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Labels for request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// v2 command (`ls-refs`, `fetch`).
    pub command: String,
    /// Cache outcome (`hit`, `refresh`, `fallback_stale`, `miss_error`).
    pub outcome: String,
}

/// Labels for the request duration histogram.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    /// v2 command.
    pub command: String,
}

/// Labels for upstream error counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamErrorLabels {
    /// Error kind (`network`, `auth`, `status`, `protocol`).
    pub kind: String,
}

/// Global metrics state.
pub static METRICS: Lazy<MetricsState> = Lazy::new(MetricsState::new);

/// Metrics state container.
#[derive(Clone)]
pub struct MetricsState {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Requests by command and cache outcome.
    pub requests_total: Family<RequestLabels, Counter>,
    /// Response bytes written to clients.
    pub bytes_out_total: Counter,
    /// Upstream failures by kind.
    pub upstream_errors_total: Family<UpstreamErrorLabels, Counter>,
    /// Stale-mirror fallbacks.
    pub fallback_stale_total: Counter,
    /// Request duration by command.
    pub request_duration_seconds: Family<CommandLabels, Histogram>,
    /// In-flight deduplicated producers.
    pub inflight_dedup: Gauge,
    /// Open mirrors.
    pub repos_total: Gauge,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsState {
    /// Creates a metrics state with all families registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "goblet_requests",
            "Total requests by command and cache outcome",
            requests_total.clone(),
        );

        let bytes_out_total = Counter::default();
        registry.register(
            "goblet_bytes_out",
            "Total response bytes written to clients",
            bytes_out_total.clone(),
        );

        let upstream_errors_total = Family::<UpstreamErrorLabels, Counter>::default();
        registry.register(
            "goblet_upstream_errors",
            "Total upstream failures by kind",
            upstream_errors_total.clone(),
        );

        let fallback_stale_total = Counter::default();
        registry.register(
            "goblet_fallback_stale",
            "Total responses served stale due to upstream unavailability",
            fallback_stale_total.clone(),
        );

        let request_duration_seconds = Family::<CommandLabels, Histogram>::new_with_constructor(
            || Histogram::new(exponential_buckets(0.001, 2.0, 16)),
        );
        registry.register(
            "goblet_request_duration_seconds",
            "Request duration by command",
            request_duration_seconds.clone(),
        );

        let inflight_dedup = Gauge::default();
        registry.register(
            "goblet_inflight_dedup",
            "Requests currently coalesced into single-flight refreshes",
            inflight_dedup.clone(),
        );

        let repos_total = Gauge::default();
        registry.register("goblet_repos", "Open mirrors", repos_total.clone());

        Self {
            registry: Arc::new(RwLock::new(registry)),
            requests_total,
            bytes_out_total,
            upstream_errors_total,
            fallback_stale_total,
            request_duration_seconds,
            inflight_dedup,
            repos_total,
        }
    }

    /// Encodes the registry for Prometheus scraping.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .expect("metrics encoding is infallible");
        buffer
    }
}

/// Event sink feeding the Prometheus families.
#[derive(Debug, Default)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn on_event(&self, event: &Event) {
        match event.kind {
            EventKind::Request => {
                let command = event.command.unwrap_or("unknown").to_string();
                if let Some(outcome) = event.cache_outcome {
                    METRICS
                        .requests_total
                        .get_or_create(&RequestLabels {
                            command: command.clone(),
                            outcome: outcome.as_str().to_string(),
                        })
                        .inc();
                }
                METRICS.bytes_out_total.inc_by(event.bytes);
                METRICS
                    .request_duration_seconds
                    .get_or_create(&CommandLabels { command })
                    .observe(event.duration.as_secs_f64());
            }
            EventKind::FallbackStale => {
                METRICS.fallback_stale_total.inc();
            }
            EventKind::UpstreamError => {
                METRICS
                    .upstream_errors_total
                    .get_or_create(&UpstreamErrorLabels {
                        kind: event.upstream_error_kind.unwrap_or("unknown").to_string(),
                    })
                    .inc();
            }
            EventKind::Staleness | EventKind::Cancelled => {}
        }
    }
}
