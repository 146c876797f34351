//! Environment configuration of the `rating-consumer` binary.
//!
//! | Variable                 | Default    |
//! |--------------------------|------------|
//! | `KAFKA_BROKERS`          | required   |
//! | `KAFKA_TOPIC`            | required   |
//! | `KAFKA_GROUP_ID`         | required   |
//! | `MENTOR_SERVICE_ADDRESS` | required   |
//! | `RPC_TIMEOUT_MS`         | `5000`     |
//! | `POISON_MAX_ATTEMPTS`    | `0`: block the partition; `n > 0`: dead-letter after `n` rejections |
//! | `DATABASE_URL`           | unset: dead letters are only logged |
//! | `LOG_LEVEL`              | `info`     |
//! | `METRICS_ADDR`           | unset: no exporter |

use crate::worker::PoisonPolicy;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required variable missing
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),
    /// Value could not be parsed
    #[error("Failed to parse {name}: {reason}")]
    ParseError {
        /// Variable name
        name: String,
        /// Parser message
        reason: String,
    },
    /// Parsed but invalid
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Accepted `LOG_LEVEL` values.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Comma-separated broker list
    pub kafka_brokers: String,
    /// Review event topic
    pub kafka_topic: String,
    /// Consumer group id
    pub kafka_group_id: String,
    /// `host:port` or URL of the mentor service
    pub mentor_service_address: String,
    /// Deadline of one apply call
    pub rpc_timeout: Duration,
    /// Rejected applies before a message is dead-lettered; `0` blocks forever
    pub poison_max_attempts: u32,
    /// Postgres connection string for the dead-letter table
    pub database_url: Option<String>,
    /// Default tracing level (`RUST_LOG` overrides)
    pub log_level: String,
    /// Prometheus scrape address
    pub metrics_addr: Option<SocketAddr>,
}

impl ConsumerConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Missing required variables, unparsable values, or failed validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through `lookup`.
    ///
    /// # Errors
    ///
    /// Missing required variables, unparsable values, or failed validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &str| lookup(name).ok_or_else(|| ConfigError::EnvVarNotSet(name.to_string()));

        let config = Self {
            kafka_brokers: required("KAFKA_BROKERS")?,
            kafka_topic: required("KAFKA_TOPIC")?,
            kafka_group_id: required("KAFKA_GROUP_ID")?,
            mentor_service_address: required("MENTOR_SERVICE_ADDRESS")?,
            rpc_timeout: Duration::from_millis(parse_or(&lookup, "RPC_TIMEOUT_MS", 5000)?),
            poison_max_attempts: parse_or(&lookup, "POISON_MAX_ATTEMPTS", 0)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            metrics_addr: parse_optional(&lookup, "METRICS_ADDR")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("KAFKA_BROKERS", &self.kafka_brokers),
            ("KAFKA_TOPIC", &self.kafka_topic),
            ("KAFKA_GROUP_ID", &self.kafka_group_id),
            ("MENTOR_SERVICE_ADDRESS", &self.mentor_service_address),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{name} cannot be empty")));
            }
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::ValidationError("RPC_TIMEOUT_MS must be > 0".to_string()));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "invalid LOG_LEVEL: {}. Must be one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    /// Poison policy selected by `POISON_MAX_ATTEMPTS`.
    #[must_use]
    pub const fn poison_policy(&self) -> PoisonPolicy {
        match self.poison_max_attempts {
            0 => PoisonPolicy::Block,
            max_attempts => PoisonPolicy::DeadLetter { max_attempts },
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(lookup, name)?.unwrap_or(default))
}

fn parse_optional<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
                name: name.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
