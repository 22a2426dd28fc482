//! Environment-driven process configuration.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use streamhook_observability::LogFormat;

use crate::delivery::{DEFAULT_LEASE_MARGIN, DEFAULT_MAX_ATTEMPT_TIMEOUT, EngineConfig};
use crate::sweeper::{DEFAULT_SWEEP_BATCH_SIZE, DEFAULT_SWEEP_INTERVAL, SweeperConfig};

pub const DEFAULT_DB_MAX_CONNS: u32 = 25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: &'static str },

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_max_conns: u32,
    pub sweep_interval: Duration,
    pub sweep_batch_size: u32,
    pub max_attempt_timeout: Duration,
    pub lease_margin: Duration,
    pub log_format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_conns: DEFAULT_DB_MAX_CONNS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            max_attempt_timeout: DEFAULT_MAX_ATTEMPT_TIMEOUT,
            lease_margin: DEFAULT_LEASE_MARGIN,
            log_format: LogFormat::Json,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Ok(Self {
            database_url: get("DATABASE_URL"),
            db_max_conns: parse_positive(&get, "DB_MAX_CONNS")?.unwrap_or(defaults.db_max_conns),
            sweep_interval: parse_positive(&get, "SWEEP_INTERVAL_SECS")?
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .unwrap_or(defaults.sweep_interval),
            sweep_batch_size: parse_positive(&get, "SWEEP_BATCH_SIZE")?
                .unwrap_or(defaults.sweep_batch_size),
            max_attempt_timeout: parse_positive(&get, "MAX_ATTEMPT_TIMEOUT_SECS")?
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .unwrap_or(defaults.max_attempt_timeout),
            lease_margin: parse_positive(&get, "CLAIM_LEASE_MARGIN_SECS")?
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .unwrap_or(defaults.lease_margin),
            log_format: parse(&get, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing {
            key: "DATABASE_URL",
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_attempt_timeout: self.max_attempt_timeout,
            lease_margin: self.lease_margin,
            ..EngineConfig::default()
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            batch_size: self.sweep_batch_size,
        }
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}

fn parse_positive(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u32>, ConfigError> {
    match parse::<u32>(get, key)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        }),
        other => Ok(other),
    }
}
