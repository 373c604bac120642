//! Node configuration: TOML file, `GOBLET_*` environment, CLI overrides.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Cache configuration.
    pub cache: CacheConfig,
    /// Upstream client configuration.
    pub upstream: UpstreamConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub addr: SocketAddr,
    /// Total per-request deadline in seconds for everything before the
    /// first response byte.
    pub request_timeout_secs: u64,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for mirror storage.
    pub root: PathBuf,
    /// Freshness window in seconds: cached responses older than this
    /// trigger an upstream refresh.
    pub freshness_window_secs: u64,
}

/// Upstream client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Per-call upstream timeout in seconds.
    pub timeout_secs: u64,
    /// Whether upstream access is enabled at all. When disabled the proxy
    /// serves only from warm mirrors.
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log format (json, pretty).
    pub format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            upstream: UpstreamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".parse().expect("static addr"),
            request_timeout_secs: 300,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./cache"),
            freshness_window_secs: 300,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            enabled: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl NodeConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Merges `GOBLET_*` environment variables over the current values.
    pub fn merge_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("GOBLET_PORT") {
            let port: u16 = port.parse()?;
            self.server.addr.set_port(port);
        }
        if let Ok(addr) = std::env::var("GOBLET_ADDR") {
            self.server.addr = addr.parse()?;
        }
        if let Ok(root) = std::env::var("GOBLET_CACHE_ROOT") {
            self.cache.root = PathBuf::from(root);
        }
        if let Ok(secs) = std::env::var("GOBLET_FRESHNESS_WINDOW") {
            self.cache.freshness_window_secs = secs.parse()?;
        }
        if let Ok(secs) = std::env::var("GOBLET_UPSTREAM_TIMEOUT") {
            self.upstream.timeout_secs = secs.parse()?;
        }
        if let Ok(secs) = std::env::var("GOBLET_REQUEST_TIMEOUT") {
            self.server.request_timeout_secs = secs.parse()?;
        }
        if let Ok(level) = std::env::var("GOBLET_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("GOBLET_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate_config(&self) -> Result<()> {
        if self.cache.freshness_window_secs == 0 {
            bail!("cache.freshness_window_secs must be positive");
        }
        if self.upstream.timeout_secs == 0 {
            bail!("upstream.timeout_secs must be positive");
        }
        if self.server.request_timeout_secs == 0 {
            bail!("server.request_timeout_secs must be positive");
        }
        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => bail!("logging.format must be json or pretty, got {:?}", other),
        }
        Ok(())
    }

    /// Freshness window as a [`Duration`].
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.cache.freshness_window_secs)
    }

    /// Upstream timeout as a [`Duration`].
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    /// Total per-request deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let config = NodeConfig::default();
        config.to_file(&path).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.server.addr, loaded.server.addr);
        assert_eq!(
            config.cache.freshness_window_secs,
            loaded.cache.freshness_window_secs
        );
    }

    #[test]
    fn partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[cache]\nfreshness_window_secs = 60\n").unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.cache.freshness_window_secs, 60);
        assert_eq!(loaded.upstream.timeout_secs, 60);
    }

    #[test]
    fn validation_rejects_zero_window() {
        let mut config = NodeConfig::default();
        config.cache.freshness_window_secs = 0;
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn validation_rejects_zero_request_timeout() {
        let mut config = NodeConfig::default();
        config.server.request_timeout_secs = 0;
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn validation_rejects_bad_format() {
        let mut config = NodeConfig::default();
        config.logging.format = "xml".into();
        assert!(config.validate_config().is_err());
    }
}
