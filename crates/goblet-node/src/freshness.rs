//! Freshness policy: decides whether a mirror must be refreshed before a
//! request is served from it.

use std::time::Duration;

/// Why a refresh is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// The mirror has never been updated from upstream.
    ColdMirror,
    /// The mirror is older than the freshness window.
    Expired,
    /// The request wants an object or ref the mirror does not have.
    MissingWant,
}

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    /// Serve from the mirror as-is.
    ServeCached,
    /// Refresh from upstream first.
    Refresh(RefreshReason),
}

/// Freshness policy. Ages are compared on the monotonic clock; the wall
/// clock only ever feeds persisted metadata.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    window: Duration,
}

impl FreshnessPolicy {
    /// Creates a policy with the given freshness window.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// The configured window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decides whether to refresh before serving.
    ///
    /// `age` is the mirror's refresh age (`None` when never refreshed in
    /// this process and no persisted record exists), `warm` whether it has
    /// ever completed a refresh, and `missing_want` whether the request
    /// names an object or ref the mirror lacks.
    pub fn decide(&self, age: Option<Duration>, warm: bool, missing_want: bool) -> RefreshDecision {
        if !warm {
            return RefreshDecision::Refresh(RefreshReason::ColdMirror);
        }
        if missing_want {
            return RefreshDecision::Refresh(RefreshReason::MissingWant);
        }
        match age {
            Some(age) if age <= self.window => RefreshDecision::ServeCached,
            _ => RefreshDecision::Refresh(RefreshReason::Expired),
        }
    }

    /// Whether a response served at this age warrants a staleness event.
    pub fn is_stale(&self, age: Option<Duration>) -> bool {
        match age {
            Some(age) => age > self.window,
            None => true,
        }
    }
}
