//! # HTTP surface
//!
//! Routes:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/healthz` | Liveness probe |
//! | GET | `/metrics` | Prometheus text exposition |
//! | GET | `/{host}/{path…}/info/refs?service=git-upload-pack` | v2 capability advertisement |
//! | POST | `/{host}/{path…}/git-upload-pack` | v2 `ls-refs` / `fetch` |
//!
//! Only GET and POST are served; anything else is 405. Fetch responses are
//! streamed through a bounded channel so a pack is never buffered whole.

use crate::auth::{AuthDecision, Authenticator};
use crate::canonical::UrlCanonicalizer;
use crate::events::{CacheOutcome, Event, EventKind};
use crate::health::HealthState;
use crate::observability::{request_id_middleware, METRICS};
use crate::proxy::{ProxyCore, ProxyError};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use goblet_mirror::RemoteUrl;
use goblet_protocol::{parse_request, serve, sideband, Command, PktLineWriter};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

const ADVERTISEMENT_TYPE: &str = "application/x-git-upload-pack-advertisement";
const RESULT_TYPE: &str = "application/x-git-upload-pack-result";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The proxy pipeline.
    pub core: Arc<ProxyCore>,
    /// Authentication collaborator.
    pub auth: Arc<dyn Authenticator>,
    /// URL canonicalization collaborator.
    pub canonicalizer: Arc<dyn UrlCanonicalizer>,
    /// Health probe state.
    pub health: HealthState,
}

/// API error type, mapped onto HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("access denied")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Proxy(ProxyError::Protocol(_)) => StatusCode::BAD_REQUEST,
            ApiError::Proxy(ProxyError::UpstreamUnavailable(_)) => StatusCode::BAD_GATEWAY,
            // Deadline expiry before the first byte is 504, whether the
            // clock ran out upstream or on the request itself.
            ApiError::Proxy(ProxyError::UpstreamTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Proxy(ProxyError::Cancelled) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Proxy(ProxyError::CacheCorruption(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Proxy(ProxyError::ResourceExhausted(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Proxy(ProxyError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut response = (status, self.to_string()).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, "30".parse().expect("static header"));
        }
        response
    }
}

/// Builds the router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/{*path}", get(git_get).post(git_post))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.snapshot())
}

async fn metrics() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        METRICS.encode(),
    )
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    match state.auth.authenticate(headers) {
        AuthDecision::Identity { authorization } => Ok(authorization),
        AuthDecision::Unauthenticated => Err(ApiError::Unauthenticated),
        AuthDecision::Denied => Err(ApiError::Forbidden),
    }
}

fn canonicalize(state: &AppState, repo_path: &str) -> Result<RemoteUrl, ApiError> {
    state
        .canonicalizer
        .canonicalize(repo_path)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// `GET /{repo-path}/info/refs?service=git-upload-pack`
async fn git_get(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let repo_path = match path.strip_suffix("/info/refs") {
        Some(prefix) => prefix,
        None => return Err(ApiError::NotFound),
    };
    match params.get("service").map(String::as_str) {
        Some("git-upload-pack") => {}
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unsupported service: {}",
                other
            )))
        }
        None => {
            return Err(ApiError::BadRequest(
                "dumb HTTP protocol is not supported".to_string(),
            ))
        }
    }
    authenticate(&state, &headers)?;
    canonicalize(&state, repo_path)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, ADVERTISEMENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(state.core.advertisement()))
        .expect("static response"))
}

/// `POST /{repo-path}/git-upload-pack`
async fn git_post(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let repo_path = match path.strip_suffix("/git-upload-pack") {
        Some(prefix) => prefix,
        None => return Err(ApiError::NotFound),
    };
    let auth = authenticate(&state, &headers)?;
    let url = canonicalize(&state, repo_path)?;

    let request = parse_request(&body).map_err(|e| ApiError::Proxy(ProxyError::from(e)))?;
    // Total request deadline for everything before the first response byte;
    // elapsing here is a cancellation, surfaced as 504.
    let deadline = state.core.request_timeout();
    match request.command() {
        Command::LsRefs => {
            let body = tokio::time::timeout(deadline, state.core.serve_ls_refs(&url, &request, auth))
                .await
                .map_err(|_| ApiError::Proxy(ProxyError::Cancelled))??;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, RESULT_TYPE)
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from(body))
                .expect("static response"))
        }
        Command::Fetch => {
            let prepared =
                tokio::time::timeout(deadline, state.core.prepare_fetch(&url, &request, auth))
                    .await
                    .map_err(|_| ApiError::Proxy(ProxyError::Cancelled))??;
            Ok(stream_fetch(state.core.clone(), prepared, request))
        }
    }
}

/// Streams a fetch response body. After the first byte the response is
/// committed: a later failure emits a band-3 fatal frame (when possible)
/// and closes the connection.
fn stream_fetch(
    core: Arc<ProxyCore>,
    prepared: crate::proxy::PreparedFetch,
    request: goblet_protocol::ParsedRequest,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);

    tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter::new(tx.clone());
        let result = serve::fetch_response(&prepared.mirror, &request, &mut writer);
        let bytes_written = writer.bytes_written;
        match result {
            Ok(stats) => {
                core.emit_request(
                    &prepared.mirror,
                    Command::Fetch,
                    &prepared.fingerprint,
                    prepared.outcome,
                    bytes_written,
                    prepared.started.elapsed(),
                );
                tracing::debug!(
                    repo = %prepared.mirror.url(),
                    objects = stats.objects,
                    pack_bytes = stats.pack_bytes,
                    "Fetch streamed"
                );
            }
            Err(e) => {
                if client_disconnected(&e) {
                    // Not an error: the client went away mid-stream.
                    let mut event =
                        Event::new(EventKind::Cancelled, prepared.mirror.url().cache_key());
                    event.command = Some(Command::Fetch.as_str());
                    event.fingerprint = Some(prepared.fingerprint.as_str().to_string());
                    event.bytes = bytes_written;
                    event.duration = prepared.started.elapsed();
                    core.events().publish(event);
                    return;
                }
                tracing::error!(repo = %prepared.mirror.url(), error = %e, "Fetch failed mid-stream");
                if bytes_written > 0 {
                    // Best effort: tell the client on the error sideband.
                    let mut pkt = PktLineWriter::new(&mut writer);
                    let _ = sideband::write_band(
                        &mut pkt,
                        sideband::Band::Fatal,
                        format!("fatal: {}\n", e).as_bytes(),
                    );
                }
                let _ = tx.blocking_send(Err(std::io::Error::other(e.to_string())));

                let mut event = Event::new(
                    EventKind::Request,
                    prepared.mirror.url().cache_key(),
                );
                event.command = Some(Command::Fetch.as_str());
                event.fingerprint = Some(prepared.fingerprint.as_str().to_string());
                event.cache_outcome = Some(CacheOutcome::MissError);
                event.bytes = bytes_written;
                event.duration = prepared.started.elapsed();
                core.events().publish(event);
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, RESULT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("static response")
}

fn client_disconnected(err: &goblet_protocol::ProtocolError) -> bool {
    use goblet_protocol::ProtocolError;
    match err {
        ProtocolError::Io(e) => e.kind() == std::io::ErrorKind::BrokenPipe,
        ProtocolError::Mirror(goblet_mirror::MirrorError::Io(e)) => {
            e.kind() == std::io::ErrorKind::BrokenPipe
        }
        _ => false,
    }
}

/// `Write` adapter pushing chunks into the response channel. Backpressure
/// comes from the bounded channel: when the socket stalls, `blocking_send`
/// stalls the materializer with it.
struct ChannelWriter {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    bytes_written: u64,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Result<Bytes, std::io::Error>>) -> Self {
        Self {
            tx,
            bytes_written: 0,
        }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PassthroughAuthenticator;
    use crate::canonical::HostPathCanonicalizer;
    use crate::events::{EventBus, LogSink};
    use crate::freshness::FreshnessPolicy;
    use async_trait::async_trait;
    use goblet_mirror::MirrorStore;
    use goblet_upstream::{FetchArgs, RemoteRef, UpstreamError, UpstreamTransport};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct DownUpstream;

    #[async_trait]
    impl UpstreamTransport for DownUpstream {
        async fn ls_refs(
            &self,
            _url: &RemoteUrl,
            _prefixes: &[String],
            _auth: Option<&str>,
        ) -> goblet_upstream::Result<Vec<RemoteRef>> {
            Err(UpstreamError::Network("connection refused".into()))
        }

        async fn fetch_pack(
            &self,
            _url: &RemoteUrl,
            _args: &FetchArgs,
            _auth: Option<&str>,
        ) -> goblet_upstream::Result<Bytes> {
            Err(UpstreamError::Network("connection refused".into()))
        }
    }

    fn test_state(root: &TempDir) -> AppState {
        let store = Arc::new(MirrorStore::open(root.path()).unwrap());
        let events = EventBus::new(64, vec![Arc::new(LogSink)]);
        let core = ProxyCore::new(
            store,
            Arc::new(DownUpstream),
            FreshnessPolicy::new(Duration::from_secs(300)),
            events,
        )
        .with_retry(goblet_upstream::RetryPolicy {
            max_attempts: 1,
            ..goblet_upstream::RetryPolicy::default()
        });
        AppState {
            core: Arc::new(core),
            auth: Arc::new(PassthroughAuthenticator),
            canonicalizer: Arc::new(HostPathCanonicalizer),
            health: HealthState::new(),
        }
    }

    fn request(method: &str, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let root = TempDir::new().unwrap();
        let app = create_router(test_state(&root));
        let response = app.oneshot(request("GET", "/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let root = TempDir::new().unwrap();
        let app = create_router(test_state(&root));
        let response = app.oneshot(request("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_info_refs_advertisement() {
        let root = TempDir::new().unwrap();
        let app = create_router(test_state(&root));
        let response = app
            .oneshot(request(
                "GET",
                "/github.com/octocat/hello/info/refs?service=git-upload-pack",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            ADVERTISEMENT_TYPE
        );
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("# service=git-upload-pack"));
        assert!(text.contains("version 2"));
    }

    #[tokio::test]
    async fn test_info_refs_requires_smart_service() {
        let root = TempDir::new().unwrap();
        let app = create_router(test_state(&root));
        let response = app
            .oneshot(request("GET", "/github.com/octocat/hello/info/refs"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let root = TempDir::new().unwrap();
        let app = create_router(test_state(&root));
        let response = app
            .oneshot(request("GET", "/github.com/octocat/hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_other_methods_405() {
        let root = TempDir::new().unwrap();
        let app = create_router(test_state(&root));
        let response = app
            .oneshot(request(
                "PUT",
                "/github.com/octocat/hello/git-upload-pack",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let root = TempDir::new().unwrap();
        let app = create_router(test_state(&root));
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/github.com/octocat/hello/git-upload-pack")
            .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
            .body(Body::from("this is not pkt-line"))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    struct TimedOutUpstream;

    #[async_trait]
    impl UpstreamTransport for TimedOutUpstream {
        async fn ls_refs(
            &self,
            _url: &RemoteUrl,
            _prefixes: &[String],
            _auth: Option<&str>,
        ) -> goblet_upstream::Result<Vec<RemoteRef>> {
            Err(UpstreamError::Timeout("deadline elapsed".into()))
        }

        async fn fetch_pack(
            &self,
            _url: &RemoteUrl,
            _args: &FetchArgs,
            _auth: Option<&str>,
        ) -> goblet_upstream::Result<Bytes> {
            Err(UpstreamError::Timeout("deadline elapsed".into()))
        }
    }

    fn ls_refs_body() -> Vec<u8> {
        let mut body = Vec::new();
        let mut writer = PktLineWriter::new(&mut body);
        writer.write_line("command=ls-refs").unwrap();
        writer.flush_pkt().unwrap();
        body
    }

    #[tokio::test]
    async fn test_upstream_timeout_on_cold_mirror_is_504() {
        let root = TempDir::new().unwrap();
        let store = Arc::new(MirrorStore::open(root.path()).unwrap());
        let events = EventBus::new(64, vec![Arc::new(LogSink)]);
        let core = ProxyCore::new(
            store,
            Arc::new(TimedOutUpstream),
            FreshnessPolicy::new(Duration::from_secs(300)),
            events,
        )
        .with_retry(goblet_upstream::RetryPolicy {
            max_attempts: 1,
            ..goblet_upstream::RetryPolicy::default()
        });
        let state = AppState {
            core: Arc::new(core),
            auth: Arc::new(PassthroughAuthenticator),
            canonicalizer: Arc::new(HostPathCanonicalizer),
            health: HealthState::new(),
        };
        let app = create_router(state);

        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/github.com/octocat/hello/git-upload-pack")
            .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
            .body(Body::from(ls_refs_body()))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_request_deadline_is_504() {
        let root = TempDir::new().unwrap();
        let mut state = test_state(&root);
        // An effectively instant deadline: the cold-mirror refresh (which
        // sleeps in the retry path) cannot finish in time.
        state.core = Arc::new(
            ProxyCore::new(
                Arc::new(MirrorStore::open(root.path()).unwrap()),
                Arc::new(DownUpstream),
                FreshnessPolicy::new(Duration::from_secs(300)),
                EventBus::new(64, vec![Arc::new(LogSink)]),
            )
            .with_request_timeout(Duration::from_millis(1))
            .with_retry(goblet_upstream::RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(100),
                ..goblet_upstream::RetryPolicy::default()
            }),
        );
        let app = create_router(state);

        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/github.com/octocat/hello/git-upload-pack")
            .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
            .body(Body::from(ls_refs_body()))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_cancelled_maps_to_504() {
        let response = ApiError::Proxy(ProxyError::Cancelled).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_cold_mirror_with_down_upstream_is_502() {
        let root = TempDir::new().unwrap();
        let app = create_router(test_state(&root));

        let mut body = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut body);
            writer.write_line("command=ls-refs").unwrap();
            writer.flush_pkt().unwrap();
        }
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/github.com/octocat/hello/git-upload-pack")
            .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
