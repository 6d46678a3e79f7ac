//! Layered configuration for portbus nodes.
//!
//! [`Config`] is assembled by `ortho_config` from built-in defaults, a
//! `portbus.toml` file (located through `--config-path` or
//! `PORTBUS_CONFIG_PATH`), `PORTBUS_*` environment variables and command-line
//! flags, with later layers taking precedence.

mod defaults;
mod logging;

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::defaults::{
    DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_LOG_FILTER, default_command_timeout_ms,
    default_log_filter_string, default_log_format,
};
pub use self::logging::{LogFormat, LogFormatParseError};

/// Command-line flags understood by the configuration loader.
pub const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--command-timeout-ms",
    "--response-timeout-ms",
    "--log-filter",
    "--log-format",
];

/// Resolved configuration shared by the worker and client commands.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "PORTBUS")]
pub struct Config {
    /// Milliseconds a remote request may wait for its acknowledgement.
    #[ortho_config(default = defaults::default_command_timeout_ms())]
    pub command_timeout_ms: u64,
    /// Milliseconds an acknowledged unary request may wait for its result.
    pub response_timeout_ms: Option<u64>,
    /// `tracing-subscriber` filter expression.
    #[ortho_config(default = defaults::default_log_filter_string())]
    pub log_filter: String,
    /// Output format for log records.
    #[ortho_config(default = defaults::default_log_format())]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            response_timeout_ms: None,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Acknowledgement deadline for remote requests.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Post-acknowledgement deadline for unary requests, when configured.
    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    /// Log filter expression.
    #[must_use]
    pub const fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Rejects values no node can operate with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroTimeout`] when either deadline is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout {
                field: "command_timeout_ms",
            });
        }
        if self.response_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroTimeout {
                field: "response_timeout_ms",
            });
        }
        Ok(())
    }
}

/// Errors raised while validating a loaded [`Config`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A deadline was configured as zero milliseconds.
    #[error("{field} must be greater than zero")]
    ZeroTimeout {
        /// Offending configuration key.
        field: &'static str,
    },
}
