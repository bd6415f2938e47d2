//! Logging configuration.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Logging subsystem configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global log level: trace, debug, info, warn, error (case-insensitive).
    /// `RUST_LOG` overrides it when set.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Console output on stderr.
    pub console: bool,

    /// Console output format.
    pub format: LogFormat,

    /// ANSI coloring for the compact and pretty formats.
    pub ansi_colors: bool,

    /// systemd journald output (Linux only; ignored elsewhere).
    pub journald: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            format: LogFormat::Compact,
            ansi_colors: true,
            journald: false,
        }
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some("Log level must be one of: trace, debug, info, warn, error".into());
            Err(err)
        }
    }
}
