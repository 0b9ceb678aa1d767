//! Configuration management for the `user-sync` binary.
//!
//! Loads configuration from environment variables (and a `.env` file when present)
//! with defaults for a local RabbitMQ.

use std::collections::HashSet;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use user_sync_core::config::{BrokerConfig, DatabaseConfig};
use user_sync_core::routing::{DEFAULT_EXCHANGE, DEFAULT_SUBSYSTEMS};
use user_sync_runtime::RetryPolicy;
use user_sync_runtime::retry::{DEFAULT_DELAY, DEFAULT_MAX_ATTEMPTS};

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("{name} must be set")]
    Missing {
        /// Variable name.
        name: &'static str,
    },

    /// A variable is set but unusable.
    #[error("{name}='{value}' is invalid: {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Runtime configuration of the `user-sync` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Broker endpoint and credentials.
    pub broker: BrokerConfig,
    /// User database; only `consume` needs it.
    pub database: Option<DatabaseConfig>,
    /// Topic exchange shared by every subsystem queue.
    pub exchange: String,
    /// Subsystems that receive every lifecycle event.
    pub subsystems: Vec<String>,
    /// Broker connection attempts before giving up.
    pub connect_attempts: u32,
    /// Wait between broker connection attempts.
    pub connect_delay: Duration,
    /// Prometheus listener, if metrics are exported.
    pub metrics_addr: Option<SocketAddr>,
}

impl SyncConfig {
    /// Load configuration from the process environment, after reading `.env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal outside development.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BrokerConfig::default();
        let broker = BrokerConfig {
            host: lookup("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "RABBITMQ_PORT", defaults.port)?,
            vhost: lookup("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            username: lookup("RABBITMQ_USER").unwrap_or(defaults.username),
            password: lookup("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
        };

        let database = match lookup("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig::new(url).with_max_connections(parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                DatabaseConfig::DEFAULT_MAX_CONNECTIONS,
            )?)),
            None => None,
        };

        let subsystems = lookup("USER_SYNC_SUBSYSTEMS").map_or_else(
            || DEFAULT_SUBSYSTEMS.iter().map(ToString::to_string).collect(),
            |raw| split_list(&raw),
        );

        let metrics_addr = match lookup("METRICS_ADDR") {
            Some(raw) => Some(parse_value("METRICS_ADDR", &raw)?),
            None => None,
        };

        Ok(Self {
            broker,
            database,
            exchange: lookup("USER_SYNC_EXCHANGE").unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            subsystems,
            connect_attempts: parse_or(&lookup, "BROKER_CONNECT_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            connect_delay: Duration::from_secs(parse_or(
                &lookup,
                "BROKER_CONNECT_DELAY_SECS",
                DEFAULT_DELAY.as_secs(),
            )?),
            metrics_addr,
        })
    }

    /// Check values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(invalid("RABBITMQ_HOST", &self.broker.host, "must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(invalid("RABBITMQ_PORT", "0", "must be a valid port"));
        }
        if self.exchange.trim().is_empty() {
            return Err(invalid("USER_SYNC_EXCHANGE", &self.exchange, "must not be empty"));
        }
        if self.connect_attempts == 0 {
            return Err(invalid("BROKER_CONNECT_ATTEMPTS", "0", "must be at least 1"));
        }
        if let Some(database) = &self.database {
            if database.max_connections == 0 {
                return Err(invalid("DATABASE_MAX_CONNECTIONS", "0", "must be at least 1"));
            }
        }
        validate_subsystems(&self.subsystems)
    }

    /// The database section, required by `consume`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DATABASE_URL` was not set.
    pub fn require_database(&self) -> Result<&DatabaseConfig, ConfigError> {
        self.database
            .as_ref()
            .ok_or(ConfigError::Missing { name: "DATABASE_URL" })
    }

    /// Retry policy for the broker connection.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.connect_attempts, self.connect_delay)
    }
}

/// Check subsystem names: non-empty, unique, and usable as a routing key segment.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for the first offending name.
pub fn validate_subsystems<S: AsRef<str>>(subsystems: &[S]) -> Result<(), ConfigError> {
    const NAME: &str = "USER_SYNC_SUBSYSTEMS";

    if subsystems.is_empty() {
        return Err(invalid(NAME, "", "at least one subsystem is required"));
    }

    let mut seen = HashSet::new();
    for subsystem in subsystems {
        let subsystem = subsystem.as_ref();
        let well_formed = !subsystem.is_empty()
            && subsystem
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !well_formed {
            return Err(invalid(NAME, subsystem, "use letters, digits, '_' or '-'"));
        }
        if !seen.insert(subsystem) {
            return Err(invalid(NAME, subsystem, "listed more than once"));
        }
    }
    Ok(())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(name, raw, &e.to_string()))
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
