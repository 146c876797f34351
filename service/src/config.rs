//! Environment configuration of the `mentor-service` binary.
//!
//! | Variable             | Default          |
//! |----------------------|------------------|
//! | `DATABASE_URL`       | required         |
//! | `LISTEN_ADDR`        | `0.0.0.0:50051`  |
//! | `DB_MAX_CONNECTIONS` | `10`             |
//! | `LOG_LEVEL`          | `info`           |
//! | `METRICS_ADDR`       | unset: no exporter |

use std::net::SocketAddr;
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

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Postgres connection string
    pub database_url: String,
    /// Address the HTTP server binds
    pub listen_addr: SocketAddr,
    /// Pool size
    pub db_max_connections: u32,
    /// Default tracing level (`RUST_LOG` overrides)
    pub log_level: String,
    /// Prometheus scrape address
    pub metrics_addr: Option<SocketAddr>,
}

impl ServiceConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Missing `DATABASE_URL`, unparsable values, or failed validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through `lookup`.
    ///
    /// # Errors
    ///
    /// Missing `DATABASE_URL`, unparsable values, or failed validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::EnvVarNotSet("DATABASE_URL".to_string()))?;

        let listen_addr = parse_or(&lookup, "LISTEN_ADDR", "0.0.0.0:50051".parse().ok())?;
        let db_max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", Some(10))?;

        let config = Self {
            database_url,
            listen_addr,
            db_max_connections,
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
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationError("DATABASE_URL cannot be empty".to_string()));
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::ValidationError("DB_MAX_CONNECTIONS must be > 0".to_string()));
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
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Option<T>,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        None => default.ok_or_else(|| ConfigError::EnvVarNotSet(name.to_string())),
    }
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = ServiceConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://db/mentors")])).unwrap();

        assert_eq!(config.listen_addr.port(), 50051);
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn metrics_addr_is_parsed_when_set() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/mentors"),
            ("METRICS_ADDR", "127.0.0.1:9090"),
        ]))
        .unwrap();
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9090".parse().unwrap()));

        let err = ServiceConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/mentors"),
            ("METRICS_ADDR", "nowhere"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { ref name, .. } if name == "METRICS_ADDR"));
    }

    #[test]
    fn database_url_is_required() {
        let err = ServiceConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::EnvVarNotSet("DATABASE_URL".to_string()));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = ServiceConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/mentors"),
            ("DB_MAX_CONNECTIONS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { ref name, .. } if name == "DB_MAX_CONNECTIONS"));

        let err = ServiceConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/mentors"),
            ("LOG_LEVEL", "loud"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
