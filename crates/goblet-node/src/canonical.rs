//! URL canonicalization collaborator.
//!
//! Request paths map `/{host}/{path…}` onto `https://{host}/{path…}.git`.
//! The canonical URL is the cache key for everything downstream.

use goblet_mirror::RemoteUrl;
use thiserror::Error;

/// Rejection reasons for a request path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanonicalizeError {
    /// The path does not name a host and repository.
    #[error("unroutable path: {0}")]
    Unroutable(String),

    /// The host segment is not a plausible hostname.
    #[error("invalid host: {0}")]
    InvalidHost(String),
}

/// Maps an incoming repository path to its canonical upstream URL.
pub trait UrlCanonicalizer: Send + Sync {
    /// Canonicalizes a request path (without the `/info/refs` or
    /// `/git-upload-pack` suffix) or rejects it.
    fn canonicalize(&self, path: &str) -> Result<RemoteUrl, CanonicalizeError>;
}

/// Default canonicalizer: first segment is the upstream host, the rest is
/// the repository path; `.git` is appended when missing.
#[derive(Debug, Default, Clone)]
pub struct HostPathCanonicalizer;

impl UrlCanonicalizer for HostPathCanonicalizer {
    fn canonicalize(&self, path: &str) -> Result<RemoteUrl, CanonicalizeError> {
        let trimmed = path.trim_matches('/');
        let (host, repo_path) = trimmed
            .split_once('/')
            .ok_or_else(|| CanonicalizeError::Unroutable(path.to_string()))?;
        if repo_path.is_empty() {
            return Err(CanonicalizeError::Unroutable(path.to_string()));
        }
        if !is_plausible_host(host) {
            return Err(CanonicalizeError::InvalidHost(host.to_string()));
        }
        if repo_path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(CanonicalizeError::Unroutable(path.to_string()));
        }
        Ok(RemoteUrl::new("https", host, repo_path))
    }
}

fn is_plausible_host(host: &str) -> bool {
    // Hostname with optional port.
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };
    if let Some(port) = port {
        if port.parse::<u16>().is_err() {
            return false;
        }
    }
    !name.is_empty()
        && name.contains('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_basic() {
        let c = HostPathCanonicalizer;
        let url = c.canonicalize("/github.com/octocat/hello").unwrap();
        assert_eq!(url.as_url(), "https://github.com/octocat/hello.git");
    }

    #[test]
    fn test_canonicalize_preserves_git_suffix() {
        let c = HostPathCanonicalizer;
        let url = c.canonicalize("/github.com/octocat/hello.git").unwrap();
        assert_eq!(url.path, "octocat/hello.git");
    }

    #[test]
    fn test_canonicalize_rejects_bare_host() {
        let c = HostPathCanonicalizer;
        assert!(matches!(
            c.canonicalize("/github.com"),
            Err(CanonicalizeError::Unroutable(_))
        ));
        assert!(c.canonicalize("/").is_err());
    }

    #[test]
    fn test_canonicalize_rejects_traversal() {
        let c = HostPathCanonicalizer;
        assert!(c.canonicalize("/github.com/../etc/passwd").is_err());
        assert!(c.canonicalize("/github.com/a//b").is_err());
    }

    #[test]
    fn test_canonicalize_rejects_bad_host() {
        let c = HostPathCanonicalizer;
        assert!(matches!(
            c.canonicalize("/nodots/repo"),
            Err(CanonicalizeError::InvalidHost(_))
        ));
        assert!(c.canonicalize("/bad host.com/repo").is_err());
    }

    #[test]
    fn test_canonicalize_host_with_port() {
        let c = HostPathCanonicalizer;
        let url = c.canonicalize("/git.internal.example:8443/team/repo").unwrap();
        assert_eq!(url.host, "git.internal.example:8443");
    }
}
