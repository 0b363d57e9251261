//! Proxy configuration, loaded once at startup and shared read-only.
//!
//! The on-disk format is JSON. Legacy field names
//! (`ttl`, `urls_to_cache`, `params_to_skip_in_key`) are accepted as aliases.
//!
//! ```json
//! {
//!   "port": 8080,
//!   "remote_url": "https://origin.example.com",
//!   "ttl_seconds": 300,
//!   "cacheable_paths": ["/assets/*", "/robots.txt"],
//!   "skip_params": ["utm_source", "session"]
//! }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::cache::CacheRuleSet;

/// Errors raised while loading or validating configuration. All are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("remote_url {url} is unusable: {reason}")]
    InvalidRemoteUrl { url: String, reason: &'static str },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Which [`KvEngine`](crate::cache::KvEngine) backs the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreEngine {
    /// Durable embedded database at `store_path`.
    #[default]
    Sled,
    /// Process-local map; the cache starts empty on every restart.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Origin base URL every request is forwarded to.
    pub remote_url: Url,

    #[serde(default = "default_ttl_seconds", alias = "ttl")]
    pub ttl_seconds: u64,

    #[serde(default, alias = "urls_to_cache")]
    pub cacheable_paths: CacheRuleSet,

    /// Query parameters ignored when computing cache keys.
    #[serde(default, alias = "params_to_skip_in_key")]
    pub skip_params: HashSet<String>,

    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    #[serde(default)]
    pub store_engine: StoreEngine,

    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    #[serde(default = "default_origin_timeout_seconds")]
    pub origin_timeout_seconds: u64,

    /// Adds `X-Cache: HIT|MISS|BYPASS` to every response.
    #[serde(default)]
    pub cache_status_header: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_ttl_seconds() -> u64 {
    300
}

fn default_store_path() -> PathBuf {
    PathBuf::from("cacheGate")
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_origin_timeout_seconds() -> u64 {
    30
}

impl ProxyConfig {
    /// A configuration with every optional field at its default.
    pub fn new(remote_url: Url) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            remote_url,
            ttl_seconds: default_ttl_seconds(),
            cacheable_paths: CacheRuleSet::default(),
            skip_params: HashSet::new(),
            store_path: default_store_path(),
            store_engine: StoreEngine::default(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            origin_timeout_seconds: default_origin_timeout_seconds(),
            cache_status_header: false,
        }
    }

    /// Reads and parses a JSON config file. Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Checks the cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.remote_url;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidRemoteUrl {
                url: url.to_string(),
                reason: "scheme must be http or https",
            });
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidRemoteUrl {
                url: url.to_string(),
                reason: "missing host",
            });
        }

        for (field, value) in [
            ("port", u64::from(self.port)),
            ("ttl_seconds", self.ttl_seconds),
            ("sweep_interval_seconds", self.sweep_interval_seconds),
            ("origin_timeout_seconds", self.origin_timeout_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }

    /// `host:port` in a form `TcpListener::bind` accepts.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout_seconds)
    }
}
