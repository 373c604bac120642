//! Process health state for the `/healthz` probe.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared health state.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<Inner>,
}

struct Inner {
    started_at: Instant,
    ready: AtomicBool,
}

/// `/healthz` response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "ok" while the process can answer.
    pub status: &'static str,
    /// Whether startup finished and the listener is bound.
    pub ready: bool,
    /// Seconds since process start.
    pub uptime_seconds: u64,
    /// Build version.
    pub version: &'static str,
}

impl HealthState {
    /// Creates a not-yet-ready health state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                started_at: Instant::now(),
                ready: AtomicBool::new(false),
            }),
        }
    }

    /// Marks startup as complete.
    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::Relaxed);
    }

    /// Current probe response.
    pub fn snapshot(&self) -> HealthResponse {
        HealthResponse {
            status: "ok",
            ready: self.inner.ready.load(Ordering::Relaxed),
            uptime_seconds: self.inner.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_flip() {
        let health = HealthState::new();
        assert!(!health.snapshot().ready);
        health.set_ready(true);
        assert!(health.snapshot().ready);
        assert_eq!(health.snapshot().status, "ok");
    }
}
