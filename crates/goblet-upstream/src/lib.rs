//! # Goblet Upstream
//!
//! Smart-HTTP v2 client used by the proxy to refresh mirrors from origin
//! servers, with transient-failure retry and a transport trait seam.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod error;
mod retry;

pub use client::{FetchArgs, HttpUpstream, RemoteRef, UpstreamTransport};
pub use error::{Result, UpstreamError};
pub use retry::RetryPolicy;
