//! The request pipeline: classify → freshness decision → refresh under
//! single-flight → materialize from the mirror.
//!
//! Lock order invariant: repo lock before fingerprint dedup, never the
//! reverse. An updater acquires the mirror's update lease, re-checks
//! freshness under it, and only then registers the dedup flight; the owned
//! lease moves into the detached producer. Joiners of an existing flight
//! hold no lock while they wait.

use crate::events::{CacheOutcome, Event, EventBus, EventKind};
use crate::freshness::{FreshnessPolicy, RefreshDecision};
use crate::observability::METRICS;
use crate::singleflight::{FlightKey, Inflight};
use goblet_mirror::{Mirror, MirrorError, MirrorStore, ObjectId, RefUpdate, RemoteUrl};
use goblet_protocol::{serve, Command, Fingerprint, ParsedRequest, ProtocolError};
use goblet_upstream::{FetchArgs, RemoteRef, RetryPolicy, UpstreamError, UpstreamTransport};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

/// Errors surfaced to the HTTP layer.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or unserveable request; maps to 400.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Upstream unreachable and the mirror cannot satisfy the request; 502.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream deadline elapsed before the first response byte; 504.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Request deadline elapsed or the client went away. 504 before the
    /// first byte, connection close after; logged at debug, never as an
    /// error.
    #[error("request cancelled")]
    Cancelled,

    /// A mirror invariant was violated; 500, never partial data.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    /// Disk or queue exhaustion; 503.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Everything else; 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<MirrorError> for ProxyError {
    fn from(err: MirrorError) -> Self {
        match err {
            MirrorError::Corrupt(msg) => ProxyError::CacheCorruption(msg),
            MirrorError::Io(e) if e.kind() == std::io::ErrorKind::StorageFull => {
                ProxyError::ResourceExhausted(e.to_string())
            }
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

impl From<ProtocolError> for ProxyError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Mirror(MirrorError::Corrupt(msg)) => ProxyError::CacheCorruption(msg),
            ProtocolError::Mirror(other) => ProxyError::from(other),
            other => ProxyError::Protocol(other),
        }
    }
}

/// Shareable refresh failure (single-flight waiters all see the same one).
#[derive(Debug, Clone)]
pub struct RefreshError {
    /// Failure kind label (`network`, `auth`, `status`, `protocol`, `cache`,
    /// `disabled`).
    pub kind: &'static str,
    /// Upstream HTTP status, when one was observed.
    pub status: Option<u16>,
    /// Human-readable description.
    pub message: String,
}

impl RefreshError {
    fn from_upstream(err: &UpstreamError) -> Self {
        Self {
            kind: err.kind(),
            status: err.status(),
            message: err.to_string(),
        }
    }
}

/// Result shared among all waiters of one refresh flight.
pub type RefreshResult = Result<(), RefreshError>;

/// The proxy core: every HTTP handler funnels through here.
pub struct ProxyCore {
    mirrors: Arc<MirrorStore>,
    upstream: Arc<dyn UpstreamTransport>,
    retry: RetryPolicy,
    freshness: FreshnessPolicy,
    events: Arc<EventBus>,
    inflight: Inflight<RefreshResult>,
    upstream_enabled: AtomicBool,
    request_timeout: Duration,
    agent: String,
}

impl ProxyCore {
    /// Assembles the core around its collaborators.
    pub fn new(
        mirrors: Arc<MirrorStore>,
        upstream: Arc<dyn UpstreamTransport>,
        freshness: FreshnessPolicy,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            mirrors,
            upstream,
            retry: RetryPolicy::default(),
            freshness,
            events,
            inflight: Inflight::new(),
            upstream_enabled: AtomicBool::new(true),
            request_timeout: Duration::from_secs(300),
            agent: format!("goblet/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Overrides the retry policy (tests use a fast one).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the total per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Total deadline for the pre-streaming phases of a request.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Flips upstream access at runtime. The flag is consulted once per
    /// request, at entry; in-flight operations keep the value they observed.
    pub fn set_upstream_enabled(&self, enabled: bool) {
        self.upstream_enabled.store(enabled, Ordering::Relaxed);
    }

    /// The event bus handle.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Capability advertisement body for `info/refs`.
    pub fn advertisement(&self) -> Vec<u8> {
        serve::advertisement(&self.agent)
    }

    /// Serves a classified `ls-refs` request.
    pub async fn serve_ls_refs(
        &self,
        url: &RemoteUrl,
        req: &ParsedRequest,
        auth: Option<String>,
    ) -> Result<Vec<u8>, ProxyError> {
        let started = Instant::now();
        let mirror = self.open_mirror(url)?;
        let fingerprint = Fingerprint::of(req);
        tracing::debug!(repo = %url, fingerprint = %fingerprint, "Classified ls-refs");

        let outcome = match self
            .ensure_fresh(&mirror, &fingerprint, &[], &[], auth)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit_request(
                    &mirror,
                    Command::LsRefs,
                    &fingerprint,
                    CacheOutcome::MissError,
                    0,
                    started.elapsed(),
                );
                return Err(e);
            }
        };

        let body = serve::ls_refs_response(&mirror, req)?;
        self.note_fingerprint(&mirror, &fingerprint);
        self.emit_request(
            &mirror,
            Command::LsRefs,
            &fingerprint,
            outcome,
            body.len() as u64,
            started.elapsed(),
        );
        Ok(body)
    }

    /// Runs the pre-streaming phases of a `fetch`: freshness, refresh, and
    /// want validation. Returns the mirror to materialize from.
    ///
    /// Validation happens here, before the first response byte, so failures
    /// still map to proper HTTP statuses.
    pub async fn prepare_fetch(
        &self,
        url: &RemoteUrl,
        req: &ParsedRequest,
        auth: Option<String>,
    ) -> Result<PreparedFetch, ProxyError> {
        let started = Instant::now();
        let mirror = self.open_mirror(url)?;
        let fingerprint = Fingerprint::of(req);
        tracing::debug!(repo = %url, fingerprint = %fingerprint, "Classified fetch");

        let outcome = match self
            .ensure_fresh(&mirror, &fingerprint, &req.wants, &req.want_refs, auth)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit_request(
                    &mirror,
                    Command::Fetch,
                    &fingerprint,
                    CacheOutcome::MissError,
                    0,
                    started.elapsed(),
                );
                return Err(e);
            }
        };

        // Post-refresh validation: anything still missing is not ours.
        for want in &req.wants {
            if !mirror.has_object(want) {
                return Err(ProxyError::Protocol(ProtocolError::NotOurRef(
                    want.to_hex(),
                )));
            }
        }
        if !req.want_refs.is_empty() {
            let names: HashSet<String> = mirror
                .refs_snapshot()?
                .into_iter()
                .map(|e| e.name)
                .collect();
            for name in &req.want_refs {
                if !names.contains(name) {
                    return Err(ProxyError::Protocol(ProtocolError::NotOurRef(name.clone())));
                }
            }
        }

        self.note_fingerprint(&mirror, &fingerprint);
        Ok(PreparedFetch {
            mirror,
            fingerprint,
            outcome,
            started,
        })
    }

    /// Publishes the terminal event for a request.
    pub fn emit_request(
        &self,
        mirror: &Mirror,
        command: Command,
        fingerprint: &Fingerprint,
        outcome: CacheOutcome,
        bytes: u64,
        duration: Duration,
    ) {
        let mut event = Event::new(EventKind::Request, mirror.url().cache_key());
        event.command = Some(command.as_str());
        event.fingerprint = Some(fingerprint.as_str().to_string());
        event.cache_outcome = Some(outcome);
        event.bytes = bytes;
        event.duration = duration;
        self.events.publish(event);
    }

    fn open_mirror(&self, url: &RemoteUrl) -> Result<Arc<Mirror>, ProxyError> {
        let mirror = self.mirrors.open_or_create(url)?;
        METRICS.repos_total.set(self.mirrors.len() as i64);
        Ok(mirror)
    }

    fn note_fingerprint(&self, mirror: &Mirror, fingerprint: &Fingerprint) {
        if let Err(e) = mirror.set_metadata(|meta| meta.record_fingerprint(fingerprint.as_str())) {
            tracing::warn!(repo = %mirror.url(), error = %e, "Failed to persist metadata");
        }
    }

    /// Decides freshness and, when needed, refreshes the mirror under
    /// single-flight. Returns how the eventual response relates to the cache.
    async fn ensure_fresh(
        &self,
        mirror: &Arc<Mirror>,
        fingerprint: &Fingerprint,
        wants: &[ObjectId],
        want_refs: &[String],
        auth: Option<String>,
    ) -> Result<CacheOutcome, ProxyError> {
        let warm = mirror.is_warm();
        let missing = self.missing_want(mirror, wants, want_refs, warm)?;
        let age = mirror.refresh_age();

        let reason = match self.freshness.decide(age, warm, missing) {
            RefreshDecision::ServeCached => return Ok(CacheOutcome::Hit),
            RefreshDecision::Refresh(reason) => reason,
        };

        // The enable flag is read once per request, here at the decision
        // point; flights already running keep the value they observed.
        if !self.upstream_enabled.load(Ordering::Relaxed) {
            let err = RefreshError {
                kind: "disabled",
                status: None,
                message: "upstream access disabled".to_string(),
            };
            return self.degrade(mirror, missing, age, err);
        }

        tracing::debug!(repo = %mirror.url(), reason = ?reason, "Refreshing mirror");
        let key = (mirror.url().cache_key(), fingerprint.as_str().to_string());
        METRICS.inflight_dedup.inc();
        let flight = self.refresh_flight(mirror, key, wants, want_refs, auth).await;
        METRICS.inflight_dedup.dec();

        let result = match flight? {
            Some(result) => result,
            // Another updater refreshed while we waited on the lease.
            None => return Ok(CacheOutcome::Refresh),
        };

        match result.as_ref() {
            Ok(()) => Ok(CacheOutcome::Refresh),
            Err(e) => {
                let mut event = Event::new(EventKind::UpstreamError, mirror.url().cache_key());
                event.upstream_error_kind = Some(e.kind);
                event.upstream_status = e.status;
                self.events.publish(event);

                // The failed flight may still have installed objects; the
                // wants may be satisfiable now.
                let missing = self.missing_want(mirror, wants, want_refs, mirror.is_warm())?;
                self.degrade(mirror, missing, age, e.clone())
            }
        }
    }

    /// Joins the running flight for `key`, or becomes its producer. The
    /// acquisition order is fixed: repository lease first, dedup
    /// registration second (joiners of an existing flight take neither).
    ///
    /// Returns `Ok(None)` when a refresh by another updater made ours
    /// unnecessary.
    async fn refresh_flight(
        &self,
        mirror: &Arc<Mirror>,
        key: FlightKey,
        wants: &[ObjectId],
        want_refs: &[String],
        auth: Option<String>,
    ) -> Result<Option<Arc<RefreshResult>>, ProxyError> {
        // Waiting on a flight holds no lock, so no cycle with its producer
        // is possible.
        if let Some(result) = self.inflight.join(&key).await {
            return Ok(Some(result));
        }

        let lease = mirror.acquire_update().await;
        // Re-check under the lease: another updater may have refreshed
        // while we waited for it.
        let missing = self.missing_want(mirror, wants, want_refs, mirror.is_warm())?;
        if let RefreshDecision::ServeCached =
            self.freshness
                .decide(mirror.refresh_age(), mirror.is_warm(), missing)
        {
            return Ok(None);
        }

        let producer = {
            let mirror = mirror.clone();
            let upstream = self.upstream.clone();
            let retry = self.retry.clone();
            let extra_wants = wants.to_vec();
            move || refresh_mirror(mirror, upstream, retry, extra_wants, auth, lease)
        };
        Ok(Some(self.inflight.start(key, producer).await))
    }

    /// Upstream could not be consulted: serve stale from a warm mirror that
    /// can satisfy the request, fail otherwise.
    fn degrade(
        &self,
        mirror: &Arc<Mirror>,
        missing: bool,
        age: Option<Duration>,
        err: RefreshError,
    ) -> Result<CacheOutcome, ProxyError> {
        if mirror.is_warm() && !missing {
            let mut event = Event::new(EventKind::FallbackStale, mirror.url().cache_key());
            event.mirror_age = age;
            event.upstream_status = err.status;
            self.events.publish(event);
            if self.freshness.is_stale(age) {
                let mut event = Event::new(EventKind::Staleness, mirror.url().cache_key());
                event.mirror_age = age;
                self.events.publish(event);
            }
            return Ok(CacheOutcome::FallbackStale);
        }
        if err.kind == "timeout" {
            return Err(ProxyError::UpstreamTimeout(err.message));
        }
        Err(ProxyError::UpstreamUnavailable(err.message))
    }

    fn missing_want(
        &self,
        mirror: &Mirror,
        wants: &[ObjectId],
        want_refs: &[String],
        warm: bool,
    ) -> Result<bool, ProxyError> {
        if wants.iter().any(|w| !mirror.has_object(w)) {
            return Ok(true);
        }
        if !want_refs.is_empty() {
            if !warm {
                return Ok(true);
            }
            let names: HashSet<String> = mirror
                .refs_snapshot()?
                .into_iter()
                .map(|e| e.name)
                .collect();
            if want_refs.iter().any(|name| !names.contains(name)) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// A fetch request ready to stream: freshness settled, wants validated.
pub struct PreparedFetch {
    /// Mirror to materialize from.
    pub mirror: Arc<Mirror>,
    /// Request fingerprint.
    pub fingerprint: Fingerprint,
    /// How the response relates to the cache.
    pub outcome: CacheOutcome,
    /// When the request entered the pipeline.
    pub started: Instant,
}

/// One refresh: upstream `ls-refs`, fetch of new tips, atomic pack install,
/// compare-and-set ref updates, metadata commit. The caller hands over the
/// mirror's exclusive update lease, which is held until the refresh ends
/// (waiter cancellation never drops it early — the producer task owns it).
async fn refresh_mirror(
    mirror: Arc<Mirror>,
    upstream: Arc<dyn UpstreamTransport>,
    retry: RetryPolicy,
    extra_wants: Vec<ObjectId>,
    auth: Option<String>,
    _lease: OwnedMutexGuard<()>,
) -> RefreshResult {
    let url = mirror.url().clone();

    let refs = match retry
        .execute(|| upstream.ls_refs(&url, &[], auth.as_deref()))
        .await
    {
        Ok(refs) => refs,
        Err(e) => {
            note_upstream_status(&mirror, &e);
            return Err(RefreshError::from_upstream(&e));
        }
    };

    let current: HashMap<String, ObjectId> = match mirror.refs_snapshot() {
        Ok(snapshot) => snapshot
            .into_iter()
            .filter(|e| e.name != "HEAD")
            .map(|e| (e.name, e.target))
            .collect(),
        Err(e) => {
            return Err(RefreshError {
                kind: "cache",
                status: None,
                message: e.to_string(),
            })
        }
    };

    let mut wants: Vec<ObjectId> = refs
        .iter()
        .filter(|r| r.name != "HEAD")
        .map(|r| r.target)
        .filter(|t| !mirror.has_object(t))
        .collect();
    wants.extend(
        extra_wants
            .into_iter()
            .filter(|w| !mirror.has_object(w)),
    );
    wants.sort();
    wants.dedup();

    if !wants.is_empty() {
        let haves: Vec<ObjectId> = current
            .values()
            .copied()
            .filter(|oid| mirror.has_object(oid))
            .collect();
        let pack = match retry
            .execute(|| {
                let args = FetchArgs {
                    wants: wants.clone(),
                    haves: haves.clone(),
                    ..FetchArgs::default()
                };
                let upstream = upstream.clone();
                let url = url.clone();
                let auth = auth.clone();
                async move { upstream.fetch_pack(&url, &args, auth.as_deref()).await }
            })
            .await
        {
            Ok(pack) => pack,
            Err(e) => {
                note_upstream_status(&mirror, &e);
                return Err(RefreshError::from_upstream(&e));
            }
        };

        let install_mirror = mirror.clone();
        let installed = tokio::task::spawn_blocking(move || {
            install_mirror.write_pack(Cursor::new(pack))
        })
        .await;
        match installed {
            Ok(Ok(ids)) => {
                tracing::info!(repo = %url, objects = ids.len(), "Installed pack");
            }
            Ok(Err(e)) => {
                return Err(RefreshError {
                    kind: "cache",
                    status: None,
                    message: e.to_string(),
                })
            }
            Err(e) => {
                return Err(RefreshError {
                    kind: "cache",
                    status: None,
                    message: format!("pack install task failed: {}", e),
                })
            }
        }
    }

    if let Err(e) = apply_ref_updates(&mirror, &refs, &current) {
        return Err(RefreshError {
            kind: "cache",
            status: None,
            message: e.to_string(),
        });
    }

    if let Err(e) = mirror.mark_refreshed(200) {
        tracing::warn!(repo = %url, error = %e, "Failed to persist refresh metadata");
    }
    tracing::debug!(repo = %url, refs = refs.len(), "Mirror refreshed");
    Ok(())
}

fn apply_ref_updates(
    mirror: &Mirror,
    advertised: &[RemoteRef],
    current: &HashMap<String, ObjectId>,
) -> goblet_mirror::Result<()> {
    let mut updates = Vec::new();
    let mut advertised_names: HashSet<&str> = HashSet::new();

    for remote_ref in advertised {
        if remote_ref.name == "HEAD" {
            continue;
        }
        advertised_names.insert(remote_ref.name.as_str());
        if !mirror.has_object(&remote_ref.target) {
            // The upstream advertised something it then failed to serve;
            // keep the old value rather than break connectivity.
            tracing::warn!(
                repo = %mirror.url(),
                name = %remote_ref.name,
                target = %remote_ref.target,
                "Advertised ref target missing after fetch, keeping previous value"
            );
            continue;
        }
        let expected = current.get(&remote_ref.name).copied();
        if expected == Some(remote_ref.target) {
            continue;
        }
        updates.push(RefUpdate {
            name: remote_ref.name.clone(),
            expected,
            target: Some(remote_ref.target),
        });
    }

    for (name, old) in current {
        if !advertised_names.contains(name.as_str()) {
            updates.push(RefUpdate {
                name: name.clone(),
                expected: Some(*old),
                target: None,
            });
        }
    }

    mirror.update_refs(&updates)?;

    if let Some(head) = advertised.iter().find(|r| r.name == "HEAD") {
        if let Some(target) = &head.symref_target {
            mirror.set_head(target)?;
        }
    }
    Ok(())
}

fn note_upstream_status(mirror: &Mirror, err: &UpstreamError) {
    if let Some(status) = err.status() {
        if let Err(e) = mirror.set_metadata(|meta| meta.last_upstream_status = Some(status)) {
            tracing::debug!(error = %e, "Failed to record upstream status");
        }
    }
}
