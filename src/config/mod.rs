//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use crate::model::LeaseTimeout;
use secrecy::SecretString;

/// Default lease duration for `pop`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Priority given to a pushed item that names none.
pub const DEFAULT_PRIORITY: i32 = 3;

/// Per-queue settings. Each `Queue` owns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub timeout: LeaseTimeout,
    pub default_priority: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            timeout: LeaseTimeout::seconds(DEFAULT_TIMEOUT_SECS),
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub max_connections: u32,
    pub queue: QueueConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_connections: parsed_var("DEQUEUE_MAX_CONNECTIONS")?.unwrap_or(10),
            queue: QueueConfig::from_env()?,
        })
    }
}

impl QueueConfig {
    /// `DEQUEUE_TIMEOUT` (seconds or `disabled`) and
    /// `DEQUEUE_DEFAULT_PRIORITY`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let timeout = match std::env::var("DEQUEUE_TIMEOUT") {
            Ok(raw) => LeaseTimeout::parse(&raw)
                .map_err(|_| Error::Config(format!("DEQUEUE_TIMEOUT is invalid: {raw:?}")))?,
            Err(_) => defaults.timeout,
        };
        Ok(Self {
            timeout,
            default_priority: parsed_var("DEQUEUE_DEFAULT_PRIORITY")?
                .unwrap_or(defaults.default_priority),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} is invalid: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_match_documented_values() {
        let config = QueueConfig::default();
        assert_eq!(config.timeout, LeaseTimeout::Expires(Duration::from_secs(300)));
        assert_eq!(config.default_priority, 3);
    }

    #[test]
    fn lease_timeout_parses_seconds_and_disabled() {
        assert_eq!(LeaseTimeout::parse("90").unwrap(), LeaseTimeout::seconds(90));
        assert_eq!(LeaseTimeout::parse("disabled").unwrap(), LeaseTimeout::Disabled);
        assert_eq!(LeaseTimeout::parse(" OFF ").unwrap(), LeaseTimeout::Disabled);
        assert_eq!(LeaseTimeout::parse("0").unwrap(), LeaseTimeout::Disabled);
        assert!(LeaseTimeout::parse("soon").is_err());
    }
}
