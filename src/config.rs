//! Configuration management for Tollgate.
//!
//! Configuration is layered with the `config` crate: an optional file
//! (YAML, TOML or JSON, picked by extension) followed by environment
//! variables prefixed with `TOLLGATE_`, using `__` to separate nested keys:
//!
//! ```bash
//! export TOLLGATE_LIMITER__IP_MAX_REQUESTS=20
//! export TOLLGATE_STORE__REDIS_URL=redis://cache:6379
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counting store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Personalized per-token limits registered at startup
    #[serde(default)]
    pub tokens: Vec<TokenLimitConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Request header carrying the caller's API token
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            token_header: default_token_header(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

/// Which counting store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance; the only backend that supports multiple limiter processes
    #[default]
    Redis,
    /// Process-local store, for single-instance deployments and development
    Memory,
}

/// Counting store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// What to do when a token-identified request has no personalized limit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTokenPolicy {
    /// Fail the check with `TokenNotFound`
    #[default]
    Reject,
    /// Apply `token_max_requests`
    DefaultLimit,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per lock window for IP-identified callers
    #[serde(default = "default_ip_max_requests")]
    pub ip_max_requests: u64,

    /// Requests allowed per lock window for tokens without their own limit
    /// (only consulted under the `default_limit` missing-token policy)
    #[serde(default = "default_token_max_requests")]
    pub token_max_requests: u64,

    /// Seconds an admitted request counts against the budget
    #[serde(default = "default_lock_duration")]
    pub lock_duration_secs: u64,

    /// Seconds an identity stays blocked after breaching its limit
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,

    /// Upper bound for a single admission check, in milliseconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,

    #[serde(default)]
    pub missing_token_policy: MissingTokenPolicy,

    /// Run block-check, prune, count and record as one atomic store operation
    #[serde(default)]
    pub atomic_window: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            ip_max_requests: default_ip_max_requests(),
            token_max_requests: default_token_max_requests(),
            lock_duration_secs: default_lock_duration(),
            block_duration_secs: default_block_duration(),
            check_timeout_ms: default_check_timeout(),
            missing_token_policy: MissingTokenPolicy::default(),
            atomic_window: false,
        }
    }
}

fn default_ip_max_requests() -> u64 {
    10
}

fn default_token_max_requests() -> u64 {
    100
}

fn default_lock_duration() -> u64 {
    1
}

fn default_block_duration() -> u64 {
    60
}

fn default_check_timeout() -> u64 {
    10_000
}

impl LimiterConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ip_max_requests == 0 {
            return Err(TollgateError::Config(
                "limiter.ip_max_requests must be greater than zero".to_string(),
            ));
        }
        if self.token_max_requests == 0 {
            return Err(TollgateError::Config(
                "limiter.token_max_requests must be greater than zero".to_string(),
            ));
        }
        if self.lock_duration_secs == 0 {
            return Err(TollgateError::Config(
                "limiter.lock_duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.block_duration_secs == 0 {
            return Err(TollgateError::Config(
                "limiter.block_duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.check_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "limiter.check_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A personalized limit for one API token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimitConfig {
    pub token: String,

    /// Requests allowed per lock window for this token
    pub max_requests: u64,

    /// Overrides `limiter.lock_duration_secs` for this token
    #[serde(default)]
    pub lock_duration_secs: Option<u64>,

    /// Overrides `limiter.block_duration_secs` for this token
    #[serde(default)]
    pub block_duration_secs: Option<u64>,
}

impl TokenLimitConfig {
    pub fn new(token: impl Into<String>, max_requests: u64) -> Self {
        Self {
            token: token.into(),
            max_requests,
            lock_duration_secs: None,
            block_duration_secs: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(TollgateError::Config(
                "token entries must have a non-empty token".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(TollgateError::Config(format!(
                "token {}: max_requests must be greater than zero",
                self.token
            )));
        }
        if self.lock_duration_secs == Some(0) || self.block_duration_secs == Some(0) {
            return Err(TollgateError::Config(format!(
                "token {}: durations must be greater than zero",
                self.token
            )));
        }
        Ok(())
    }
}

impl TollgateConfig {
    /// Load configuration from an optional file plus `TOLLGATE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: TollgateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check every section, failing on the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.server.token_header.is_empty() {
            return Err(TollgateError::Config(
                "server.token_header must not be empty".to_string(),
            ));
        }

        self.limiter.validate()?;

        let mut seen = HashSet::new();
        for token in &self.tokens {
            token.validate()?;
            if !seen.insert(token.token.as_str()) {
                return Err(TollgateError::Config(format!(
                    "token {} is configured more than once",
                    token.token
                )));
            }
        }
        Ok(())
    }
}
