//! Transport configuration snapshot.
//!
//! A [`TransportConfig`] is an immutable value handed to
//! [`RefreshablePipeline::refresh`](crate::RefreshablePipeline::refresh).
//! It derives serde so whatever loads agent configuration can produce it
//! directly from JSON or YAML.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Flush timeout used when none (or a negative one) is configured.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Error types for configuration validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A size bound was configured as zero
    #[error("{field} must be greater than zero")]
    ZeroBound { field: &'static str },
    /// Flush timeout was configured as zero
    #[error("flush timeout must be greater than zero")]
    ZeroTimeout,
}

/// Where batches are shipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    /// Newline-delimited JSON batches over TCP (`host:port`)
    Tcp { address: String },
    /// One JSON array per line, appended to a local file
    File { path: PathBuf },
    /// Human-readable summary on stdout
    Stdout {
        #[serde(default)]
        verbose: bool,
    },
    /// Discard everything
    #[default]
    Noop,
}

/// Configuration snapshot for the transport and the buffer feeding it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// When false, spans are still accepted but discarded at flush time
    pub enabled: bool,
    /// Destination of the batches
    pub endpoint: Endpoint,
    /// Maximum number of spans per batch
    pub max_batch_spans: usize,
    /// Maximum encoded size of a batch in bytes
    pub max_batch_bytes: usize,
    /// Maximum time a span waits in the buffer before a flush
    #[serde(rename = "message_timeout_ms", with = "timeout_millis")]
    pub flush_timeout: Duration,
    /// Maximum number of spans waiting in the buffer
    pub queued_max_spans: usize,
    /// Maximum encoded size of all spans waiting in the buffer
    pub queued_max_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: Endpoint::Noop,
            max_batch_spans: 1000,
            max_batch_bytes: 1024 * 1024,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            queued_max_spans: 10_000,
            queued_max_bytes: 16 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    /// Creates an enabled configuration shipping to `endpoint` with default limits.
    pub fn enabled(endpoint: Endpoint) -> Self {
        Self {
            enabled: true,
            endpoint,
            ..Default::default()
        }
    }

    /// Creates a disabled configuration with default limits.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Sets the per-batch span and byte limits.
    pub fn with_batch_limits(mut self, max_spans: usize, max_bytes: usize) -> Self {
        self.max_batch_spans = max_spans;
        self.max_batch_bytes = max_bytes;
        self
    }

    /// Sets the buffer span and byte limits.
    pub fn with_queue_limits(mut self, max_spans: usize, max_bytes: usize) -> Self {
        self.queued_max_spans = max_spans;
        self.queued_max_bytes = max_bytes;
        self
    }

    /// Sets the flush timeout.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Checks that every bound can admit at least one span.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [
            ("max_batch_spans", self.max_batch_spans),
            ("max_batch_bytes", self.max_batch_bytes),
            ("queued_max_spans", self.queued_max_spans),
            ("queued_max_bytes", self.queued_max_bytes),
        ];
        if let Some((field, _)) = bounds.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroBound { field: *field });
        }
        if self.flush_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Flush timeout as integer milliseconds; negative values mean "use the default".
mod timeout_millis {
    use super::DEFAULT_FLUSH_TIMEOUT;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(timeout: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(timeout.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Ok(u64::try_from(millis).map_or(DEFAULT_FLUSH_TIMEOUT, Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid_and_disabled() {
        let config = TransportConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.endpoint, Endpoint::Noop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_snapshot() {
        let json = r#"{
            "enabled": true,
            "endpoint": { "type": "tcp", "address": "collector:9411" },
            "max_batch_spans": 2,
            "message_timeout_ms": 250
        }"#;
        let config: TransportConfig = serde_json::from_str(json).unwrap();

        assert!(config.enabled);
        assert_eq!(
            config.endpoint,
            Endpoint::Tcp {
                address: "collector:9411".to_string()
            }
        );
        assert_eq!(config.max_batch_spans, 2);
        assert_eq!(config.flush_timeout, Duration::from_millis(250));
        assert_eq!(config.queued_max_spans, TransportConfig::default().queued_max_spans);
    }

    #[test]
    fn test_negative_timeout_falls_back_to_default() {
        let config: TransportConfig = serde_json::from_str(r#"{ "message_timeout_ms": -5 }"#).unwrap();
        assert_eq!(config.flush_timeout, DEFAULT_FLUSH_TIMEOUT);
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let config = TransportConfig::enabled(Endpoint::Noop).with_batch_limits(0, 100);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroBound {
                field: "max_batch_spans"
            })
        );

        let config = TransportConfig::default().with_flush_timeout(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[test]
    fn test_serialize_timeout_as_millis() {
        let config = TransportConfig::default().with_flush_timeout(Duration::from_secs(2));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["message_timeout_ms"], 2000);
        assert_eq!(value["endpoint"]["type"], "noop");
    }
}
