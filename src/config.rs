//! Configuration loading and validation.
//!
//! The service reads its YAML configuration exactly once at startup, from
//! the path named by the `CONFIG_PATH` environment variable (default
//! `../config/config.yaml`). Every validation failure is fatal: the
//! process must not start listening with a partially valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Default location of the configuration file, relative to the working
/// directory, used when `CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "../config/config.yaml";

/// Top-level configuration as deserialized from the YAML file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    /// Interface the listener binds to.
    pub host: String,
    /// Port the listener binds to.
    pub port: String,
    /// Absolute URLs of the backend origins, in rotation order.
    pub backends: Vec<String>,
    pub rate_limiting: RateLimitingConfig,
    pub storage: StorageConfig,
    pub healthcheck: HealthCheckConfig,
    pub balancer: BalancerConfig,
}

/// Process-wide default token-bucket parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RateLimitingConfig {
    /// Bucket capacity (burst size).
    pub capacity: i64,
    /// Refill rate in tokens per second.
    pub rate_per_second: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub redis: RedisConfig,
}

/// Connection parameters for the rate-limit datastore.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    /// May be empty for unauthenticated instances.
    #[serde(default)]
    pub password: String,
}

/// Health-probe cadence and per-probe deadline.
///
/// Durations are written in human form in the YAML file, e.g. `"5s"`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BalancerConfig {
    /// Named selection algorithm: `"roundrobin"` or `"random"`.
    pub algorithm: String,
}

impl Config {
    /// Loads configuration from the path in `CONFIG_PATH`, falling back to
    /// [`DEFAULT_CONFIG_PATH`].
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from_file(&path)
    }

    /// Loads and validates configuration from a YAML file at the given path.
    pub fn load_from_file(path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::Config(format!("failed to open {}: {e}", path.as_ref().display()))
        })?;

        let config: Config = serde_yaml::from_reader(file)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Parses and validates configuration from an in-memory YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must be set".into()));
        }
        if self.port.is_empty() {
            return Err(Error::Config("port must be set".into()));
        }
        if self.backends.is_empty() {
            return Err(Error::Config("backends must be set".into()));
        }
        if self.backends.iter().any(String::is_empty) {
            return Err(Error::Config("backend must be set".into()));
        }
        if self.rate_limiting.rate_per_second <= 0 {
            return Err(Error::Config("rate_per_second must be greater than 0".into()));
        }
        if self.rate_limiting.capacity <= 0 {
            return Err(Error::Config("capacity must be greater than 0".into()));
        }
        if self.storage.redis.host.is_empty() {
            return Err(Error::Config("redis host must be set".into()));
        }
        if self.storage.redis.port == 0 {
            return Err(Error::Config("redis port must be set".into()));
        }
        if self.healthcheck.interval.is_zero() {
            return Err(Error::Config("healthcheck interval must be set".into()));
        }
        if self.healthcheck.timeout.is_zero() {
            return Err(Error::Config("healthcheck timeout must be set".into()));
        }
        Ok(())
    }

    /// The `host:port` pair the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl RedisConfig {
    /// Connection URL for the datastore client. Omits the auth section
    /// when no password is configured.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/", self.host, self.port)
        } else {
            format!("redis://:{}@{}:{}/", self.password, self.host, self.port)
        }
    }
}
