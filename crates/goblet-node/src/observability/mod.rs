//! Observability: structured logging, Prometheus metrics, request tracking.

mod logging;
pub mod metrics;
mod middleware;

pub use logging::{init_logging, LogFormat};
pub use metrics::{MetricsSink, METRICS};
pub use middleware::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
