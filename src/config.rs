//! Server configuration.
//!
//! [`ServerConfig`] holds the transport limits and the response-compression switch. It
//! can be built in code through its chained setters or loaded from TOML:
//!
//! ```toml
//! max_url_length = 4096
//! max_body_size = 1048576
//! body_timeout_ms = 5000
//! compression = true
//! ```
//!
//! Absent keys keep their defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::context::BodyLimits;
use crate::http::Limits;

/// Errors produced while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Transport and response settings for [`crate::server::Server`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Longest request target accepted; longer requests get `414`.
    pub max_url_length: usize,
    /// Largest request head accepted; larger heads get `431`.
    pub max_header_size: usize,
    /// Maximum number of header fields per request.
    pub max_headers: usize,
    /// Largest request body buffered; larger bodies get `413`. `None` disables the check.
    pub max_body_size: Option<usize>,
    /// Longest wait for the next body chunk, in milliseconds; exceeded waits get `408`.
    pub body_timeout_ms: Option<u64>,
    /// Negotiate gzip/deflate response encoding against `Accept-Encoding`.
    pub compression: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_url_length: limits.max_url_length,
            max_header_size: limits.max_header_size,
            max_headers: limits.max_headers,
            max_body_size: Some(8 * 1024 * 1024),
            body_timeout_ms: None,
            compression: false,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys, [`ConfigError::Invalid`]
    /// when a value fails [`validate`](Self::validate).
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Rejects limits that would make every request fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_url_length == 0 {
            return Err(ConfigError::Invalid {
                field: "max_url_length",
                reason: "must be greater than zero",
            });
        }
        if self.max_header_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_header_size",
                reason: "must be greater than zero",
            });
        }
        if self.max_headers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_headers",
                reason: "must be greater than zero",
            });
        }
        if self.body_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "body_timeout_ms",
                reason: "must be greater than zero when set",
            });
        }
        Ok(())
    }

    pub fn max_url_length(mut self, bytes: usize) -> Self {
        self.max_url_length = bytes;
        self
    }

    pub fn max_header_size(mut self, bytes: usize) -> Self {
        self.max_header_size = bytes;
        self
    }

    pub fn max_headers(mut self, count: usize) -> Self {
        self.max_headers = count;
        self
    }

    pub fn max_body_size(mut self, bytes: Option<usize>) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn body_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.body_timeout_ms = timeout.map(|t| t.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Limits for the request-head parser.
    pub fn head_limits(&self) -> Limits {
        Limits {
            max_url_length: self.max_url_length,
            max_header_size: self.max_header_size,
            max_headers: self.max_headers,
        }
    }

    /// Limits for draining request bodies.
    pub fn body_limits(&self) -> BodyLimits {
        BodyLimits {
            max_size: self.max_body_size,
            chunk_timeout: self.body_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_url_length, 2048);
        assert_eq!(config.max_header_size, 16 * 1024);
        assert_eq!(config.max_body_size, Some(8 * 1024 * 1024));
        assert!(!config.compression);
        assert!(config.body_limits().chunk_timeout.is_none());
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let config = ServerConfig::from_toml_str(
            "max_url_length = 4096\nbody_timeout_ms = 250\ncompression = true\n",
        )
        .unwrap();
        assert_eq!(config.max_url_length, 4096);
        assert_eq!(config.max_headers, 64);
        assert!(config.compression);
        assert_eq!(
            config.body_limits().chunk_timeout,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(ServerConfig::from_toml_str("").unwrap(), ServerConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ServerConfig::from_toml_str("max_url = 10").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_limits_are_invalid() {
        let err = ServerConfig::from_toml_str("max_headers = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_headers",
                ..
            }
        ));
    }

    #[test]
    fn builder_feeds_limits() {
        let config = ServerConfig::new()
            .max_url_length(10)
            .max_body_size(None)
            .body_timeout(Some(Duration::from_secs(2)));
        assert_eq!(config.head_limits().max_url_length, 10);
        assert_eq!(config.body_limits().max_size, None);
        assert_eq!(config.body_timeout_ms, Some(2000));
    }
}
