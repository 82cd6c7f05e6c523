//! Configuration management for Ratekeeper.
//!
//! Values are layered: built-in defaults, then an optional YAML (or any
//! format the `config` crate recognises by extension) file, then
//! environment variables such as `RATEKEEPER_REDIS__URL` or
//! `RATEKEEPER_LIMITER__DEFAULT_RATE`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::Limits;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RatekeeperConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Shared state store connection
    pub redis: RedisConfig,

    /// Rate limiting defaults and policy
    pub limiter: LimiterConfig,

    /// Log output
    pub log: LogConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// gRPC server address
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
        }
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,

    /// Password, overriding any in the URL
    pub password: Option<String>,

    /// Logical database index
    pub db: i64,

    /// Time allowed to establish a connection
    pub connect_timeout_ms: u64,

    /// Time allowed for a single command round trip
    pub command_timeout_ms: u64,

    /// Reconnect attempts before a command fails
    pub max_retries: usize,

    /// Upper bound of the exponential reconnect backoff
    pub max_retry_backoff_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            connect_timeout_ms: 5_000,
            command_timeout_ms: 3_000,
            max_retries: 3,
            max_retry_backoff_ms: 512,
        }
    }
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// What the front end answers when the store cannot be consulted.
///
/// The rate limiting core always reports store failures as errors; this
/// policy is applied on top of it by the gRPC service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Return the error to the caller
    #[default]
    Propagate,
    /// Admit the request
    Open,
    /// Reject the request
    Closed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Tokens per second for keys without a rule
    pub default_rate: i64,

    /// Bucket capacity for keys without a rule
    pub default_burst: i64,

    /// Policy when the store is unavailable
    pub failure_mode: FailureMode,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_rate: 10,
            default_burst: 50,
            failure_mode: FailureMode::default(),
        }
    }
}

impl LimiterConfig {
    pub fn default_limits(&self) -> Limits {
        Limits {
            rate: self.default_rate,
            burst: self.default_burst,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `ratekeeper=debug`. `RUST_LOG` wins if set.
    pub level: String,

    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl RatekeeperConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        Self::build(builder)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: RatekeeperConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would otherwise fail at first use.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.default_rate <= 0 {
            return Err(RatekeeperError::Config(
                "limiter.default_rate must be greater than 0".to_string(),
            ));
        }
        if self.limiter.default_burst <= 0 {
            return Err(RatekeeperError::Config(
                "limiter.default_burst must be greater than 0".to_string(),
            ));
        }
        if self.redis.command_timeout_ms == 0 || self.redis.connect_timeout_ms == 0 {
            return Err(RatekeeperError::Config(
                "redis timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
