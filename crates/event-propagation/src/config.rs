//! Propagation configuration.
//!
//! Provides the configuration record handed to the runtime: transport
//! endpoints, topic and consumer group names, retry parameters and
//! timeouts. Configuration is loaded from environment variables with
//! defaults suitable for local development.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required environment variable.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Backoff shape between redelivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Always wait `backoff_base`.
    Fixed,
    /// Double from `backoff_base` up to `backoff_cap`.
    Exponential,
}

/// Configuration for one propagation runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Broker endpoints (e.g., `redis://localhost:6379`). Empty for the in-memory transport.
    pub bootstrap_endpoints: Vec<String>,

    /// Topic this service publishes to or consumes from.
    pub topic: String,

    /// Consumer group of this service.
    pub consumer_group: String,

    /// Handler attempts before an envelope is dead-lettered.
    pub max_attempts: u32,

    /// Backoff shape.
    pub backoff: BackoffKind,

    /// First (or fixed) redelivery delay in milliseconds.
    pub backoff_base_ms: u64,

    /// Upper bound for exponential backoff in milliseconds.
    pub backoff_cap_ms: u64,

    /// Time an unacknowledged delivery stays invisible to other consumers.
    pub visibility_timeout_ms: u64,

    /// Time the publisher waits for the transport to accept an envelope.
    pub publish_timeout_ms: u64,

    /// Envelope retention on the transport, in seconds.
    pub retention_secs: u64,

    /// Key prefix for broker-side keys.
    pub key_prefix: String,
}

impl Default for PropagationConfig {
    /// Returns default configuration suitable for local development.
    fn default() -> Self {
        Self {
            bootstrap_endpoints: Vec::new(),
            topic: "order-events".to_string(),
            consumer_group: "default".to_string(),
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            backoff_base_ms: 100,
            backoff_cap_ms: 30_000,
            visibility_timeout_ms: 30_000,
            publish_timeout_ms: 5_000,
            retention_secs: 7 * 24 * 60 * 60,
            key_prefix: "propagation".to_string(),
        }
    }
}

impl PropagationConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PROPAGATION_BOOTSTRAP_ENDPOINTS`: comma-separated broker endpoints (default: none)
    /// - `PROPAGATION_TOPIC`: topic name (default: order-events)
    /// - `PROPAGATION_CONSUMER_GROUP`: consumer group (default: default)
    /// - `PROPAGATION_MAX_ATTEMPTS`: handler attempts (default: 3)
    /// - `PROPAGATION_BACKOFF`: `fixed` or `exponential` (default: exponential)
    /// - `PROPAGATION_BACKOFF_BASE_MS`: base delay (default: 100)
    /// - `PROPAGATION_BACKOFF_CAP_MS`: delay cap (default: 30000)
    /// - `PROPAGATION_VISIBILITY_TIMEOUT_MS`: redelivery timeout (default: 30000)
    /// - `PROPAGATION_PUBLISH_TIMEOUT_MS`: publish timeout (default: 5000)
    /// - `PROPAGATION_RETENTION_SECS`: envelope retention (default: 7 days)
    /// - `PROPAGATION_KEY_PREFIX`: broker key prefix (default: propagation)
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        let backoff = match std::env::var("PROPAGATION_BACKOFF") {
            Ok(value) => parse_backoff(&value)?,
            Err(_) => default.backoff,
        };

        Ok(Self {
            bootstrap_endpoints: std::env::var("PROPAGATION_BOOTSTRAP_ENDPOINTS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(default.bootstrap_endpoints),
            topic: std::env::var("PROPAGATION_TOPIC").unwrap_or(default.topic),
            consumer_group: std::env::var("PROPAGATION_CONSUMER_GROUP")
                .unwrap_or(default.consumer_group),
            max_attempts: env_number("PROPAGATION_MAX_ATTEMPTS", default.max_attempts)?,
            backoff,
            backoff_base_ms: env_number("PROPAGATION_BACKOFF_BASE_MS", default.backoff_base_ms)?,
            backoff_cap_ms: env_number("PROPAGATION_BACKOFF_CAP_MS", default.backoff_cap_ms)?,
            visibility_timeout_ms: env_number(
                "PROPAGATION_VISIBILITY_TIMEOUT_MS",
                default.visibility_timeout_ms,
            )?,
            publish_timeout_ms: env_number(
                "PROPAGATION_PUBLISH_TIMEOUT_MS",
                default.publish_timeout_ms,
            )?,
            retention_secs: env_number("PROPAGATION_RETENTION_SECS", default.retention_secs)?,
            key_prefix: std::env::var("PROPAGATION_KEY_PREFIX").unwrap_or(default.key_prefix),
        })
    }

    /// Validate the configuration.
    ///
    /// Called once at startup; any error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::invalid("topic", "must not be empty"));
        }
        validate_consumer_group(&self.consumer_group)?;
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.backoff == BackoffKind::Exponential && self.backoff_base_ms > self.backoff_cap_ms {
            return Err(ConfigError::invalid(
                "backoff_cap_ms",
                format!(
                    "cap ({}ms) is below base ({}ms)",
                    self.backoff_cap_ms, self.backoff_base_ms
                ),
            ));
        }
        if self.visibility_timeout_ms == 0 {
            return Err(ConfigError::invalid("visibility_timeout_ms", "must be positive"));
        }
        if self.publish_timeout_ms == 0 {
            return Err(ConfigError::invalid("publish_timeout_ms", "must be positive"));
        }
        if self.retention_secs == 0 {
            return Err(ConfigError::invalid("retention_secs", "must be positive"));
        }
        Ok(())
    }

    /// Validate that broker endpoints are configured.
    pub fn require_endpoints(&self) -> Result<&str, ConfigError> {
        self.bootstrap_endpoints
            .first()
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingEnvVar("PROPAGATION_BOOTSTRAP_ENDPOINTS".to_string()))
    }

    /// First (or fixed) backoff delay.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff cap.
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Visibility timeout for unacknowledged deliveries.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// Publish timeout.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Envelope retention window.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Check a consumer group name.
///
/// Group names key both the transport cursor and the idempotency namespace,
/// so they must be non-empty and free of whitespace and `:`.
pub fn validate_consumer_group(group: &str) -> Result<(), ConfigError> {
    if group.is_empty() {
        return Err(ConfigError::invalid("consumer_group", "must not be empty"));
    }
    if group.chars().any(|c| c.is_whitespace() || c == ':') {
        return Err(ConfigError::invalid(
            "consumer_group",
            format!("'{}' contains whitespace or ':'", group),
        ));
    }
    Ok(())
}

fn parse_backoff(value: &str) -> Result<BackoffKind, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffKind::Fixed),
        "exponential" => Ok(BackoffKind::Exponential),
        other => Err(ConfigError::invalid(
            "PROPAGATION_BACKOFF",
            format!("expected 'fixed' or 'exponential', got '{}'", other),
        )),
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(key, format!("'{}' is not a number", raw))),
        Err(_) => Ok(default),
    }
}
