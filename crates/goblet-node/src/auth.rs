//! Authentication collaborator.
//!
//! The core treats the `Authorization` header opaquely: an authenticator
//! decides whether the request may proceed and which credential (if any) to
//! attach to upstream calls. Identities never influence cache paths.

use axum::http::HeaderMap;

/// Outcome of authenticating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Request is allowed; carry this credential to upstream calls.
    Identity {
        /// Opaque `Authorization` header value to forward, if any.
        authorization: Option<String>,
    },
    /// No credentials presented where they are required.
    Unauthenticated,
    /// Credentials presented and rejected.
    Denied,
}

/// Authenticates incoming requests.
pub trait Authenticator: Send + Sync {
    /// Classifies a request by its headers.
    fn authenticate(&self, headers: &HeaderMap) -> AuthDecision;
}

/// Default authenticator: every request is allowed, and any `Authorization`
/// header is forwarded to upstream verbatim.
#[derive(Debug, Default, Clone)]
pub struct PassthroughAuthenticator;

impl Authenticator for PassthroughAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> AuthDecision {
        let authorization = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        AuthDecision::Identity { authorization }
    }
}
