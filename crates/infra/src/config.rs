//! Box office configuration.
//!
//! Built once at process start from environment variables (with defaults) and
//! passed explicitly to whatever needs it.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("missing required setting {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

/// Event store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Required when `backend` is postgres
    pub database_url: Option<String>,
    pub max_connections: u32,
}

/// Stale payment recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Pending attempts older than this are failed by recovery.
    pub payment_timeout_secs: u64,
    /// Also cancel the still-pending order of a timed-out attempt.
    pub release_on_timeout: bool,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            payment_timeout_secs: 900,
            release_on_timeout: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `turnstile_infra=debug`
    pub filter: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxOfficeConfig {
    pub store: StoreConfig,
    /// Attempts per operation when a commit loses an optimistic race.
    pub max_commit_retries: u32,
    pub settlement: SettlementConfig,
    pub log: LogConfig,
}

impl Default for BoxOfficeConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Memory,
                database_url: None,
                max_connections: 10,
            },
            max_commit_retries: 3,
            settlement: SettlementConfig::default(),
            log: LogConfig {
                filter: "info".to_string(),
                json: true,
            },
        }
    }
}

impl BoxOfficeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (unset keys take defaults).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            store: StoreConfig {
                backend: parse(&lookup, "TURNSTILE_STORE", defaults.store.backend)?,
                database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
                max_connections: parse(
                    &lookup,
                    "TURNSTILE_DB_MAX_CONNECTIONS",
                    defaults.store.max_connections,
                )?,
            },
            max_commit_retries: parse(
                &lookup,
                "TURNSTILE_MAX_COMMIT_RETRIES",
                defaults.max_commit_retries,
            )?,
            settlement: SettlementConfig {
                payment_timeout_secs: parse(
                    &lookup,
                    "TURNSTILE_PAYMENT_TIMEOUT_SECS",
                    defaults.settlement.payment_timeout_secs,
                )?,
                release_on_timeout: parse(
                    &lookup,
                    "TURNSTILE_RELEASE_ON_TIMEOUT",
                    defaults.settlement.release_on_timeout,
                )?,
            },
            log: LogConfig {
                filter: lookup("RUST_LOG").unwrap_or(defaults.log.filter),
                json: parse(&lookup, "TURNSTILE_LOG_JSON", defaults.log.json)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.store.max_connections == 0 {
            return Err(invalid("TURNSTILE_DB_MAX_CONNECTIONS", "0", "must be at least 1"));
        }
        if self.max_commit_retries == 0 {
            return Err(invalid("TURNSTILE_MAX_COMMIT_RETRIES", "0", "must be at least 1"));
        }
        if self.settlement.payment_timeout_secs == 0 {
            return Err(invalid("TURNSTILE_PAYMENT_TIMEOUT_SECS", "0", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}
