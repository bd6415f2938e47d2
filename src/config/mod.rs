//! Application configuration loading, validation, and management.
//!
//! The top-level [`Config`] aggregates the logging, server, plugin, statsd
//! and reverse-connection sections. It is loaded from a TOML file early in
//! the process lifecycle and immutable thereafter. A `ConfigError` refuses
//! startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use validator::Validate;

pub mod agent;
pub mod logger;

use agent::{PluginsConfig, ServerConfig, StatsdConfig};
use logger::LoggerConfig;

/// Timestamped messages for the window before the tracing subscriber is
/// installed (configuration loading happens first).
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors during configuration loading, parsing, or validation. All of
/// them refuse startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(String),

    #[error("io error while reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error while reading configuration: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    /// Forces debug log level regardless of `logger.level`.
    pub debug: bool,

    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub plugins: PluginsConfig,

    #[validate(nested)]
    pub statsd: StatsdConfig,

    #[validate(nested)]
    pub reverse: waggle_reverse::Config,
}

impl Config {
    /// Locates and loads the configuration.
    ///
    /// Priority: the `WAGGLE_CONFIG` environment variable (must exist when
    /// set), then `/etc/waggle/config.toml`, then built-in defaults when
    /// neither is present.
    pub fn new() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("WAGGLE_CONFIG") {
            print_info!("Using config from WAGGLE_CONFIG: {path}");
            return Self::load(Path::new(&path));
        }

        let fallback = PathBuf::from("/etc/waggle/config.toml");
        if fallback.exists() {
            return Self::load(&fallback);
        }

        print_info!("No configuration file found, using defaults");
        let config = Config::default();
        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(config)
    }

    /// Loads and validates configuration from an explicit path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        print_info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
