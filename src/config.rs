//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{EndpointClass, LimiterOptions, SystemClock, DEFAULT_KEY_PREFIX};

/// Main configuration for the rate limiting core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Which counter store backs the limiters
    #[serde(default)]
    pub backend: BackendConfig,

    /// In-process cleanup sweep interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Bound on each call to a shared store in milliseconds
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_ms: u64,

    /// Prefix for keys written to a shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-class policy overrides; classes not listed keep their defaults
    #[serde(default)]
    pub policies: HashMap<EndpointClass, PolicyOverride>,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            cleanup_interval_secs: default_cleanup_interval(),
            backend_timeout_ms: default_backend_timeout(),
            key_prefix: default_key_prefix(),
            policies: HashMap::new(),
        }
    }
}

/// Counter store selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Fixed-window counters in this process
    #[default]
    InProcess,
    /// Sliding-window logs in Redis
    Redis {
        /// Redis connection URL
        url: String,
    },
}

/// Replacement policy for one endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Window length in seconds
    pub window_secs: u64,
    /// Maximum requests per window
    pub max_requests: u64,
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_backend_timeout() -> u64 {
    250
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rate limit config: {}", e)))?;

        if config.cleanup_interval_secs == 0 {
            return Err(FloodgateError::Config(
                "cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        if config.backend_timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "backend_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }

    /// Limiter tuning derived from this configuration, on the system clock.
    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            key_prefix: self.key_prefix.clone(),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            backend_timeout: Duration::from_millis(self.backend_timeout_ms),
            clock: Arc::new(SystemClock::new()),
        }
    }
}
