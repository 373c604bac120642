//! # Goblet Node
//!
//! The Goblet proxy server: HTTP surface, freshness policy, single-flight
//! refresh coordination, event bus, configuration, and observability around
//! the mirror/protocol/upstream crates.

#![forbid(unsafe_code)]

pub mod api;
pub mod auth;
pub mod canonical;
pub mod config;
pub mod events;
pub mod freshness;
pub mod health;
pub mod observability;
pub mod proxy;
pub mod singleflight;
