//! Logging initialization.
//!
//! `LoggerManager` validates the logging configuration and installs the
//! global `tracing` subscriber: a console layer on stderr in the
//! configured format, plus an optional journald layer on Linux. Must be
//! initialized once at startup, after configuration loading.

use std::io;

use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};
use validator::{Validate, ValidationErrors};

use crate::config::logger::{LogFormat, LoggerConfig};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("logger configuration validation error: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("no logging layers were configured")]
    NoLayers,
}

/// Validates logging configuration and installs the global subscriber.
#[derive(Debug)]
pub struct LoggerManager {
    config: LoggerConfig,
    debug: bool,
}

impl LoggerManager {
    /// `debug` forces the debug level regardless of the configured one.
    pub fn new(config: LoggerConfig, debug: bool) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(Self { config, debug })
    }

    /// The level the filter falls back to when `RUST_LOG` is unset.
    pub fn effective_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.config.level
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.effective_level()))
    }

    /// Installs the global subscriber. Call once, before any tracing
    /// macros fire.
    pub fn init(&self) -> Result<(), LoggerError> {
        let mut layers: Vec<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>> =
            Vec::new();

        if self.config.console {
            let layer = match self.config.format {
                LogFormat::Compact => fmt::layer()
                    .compact()
                    .with_ansi(self.config.ansi_colors)
                    .with_writer(io::stderr)
                    .with_filter(self.env_filter())
                    .boxed(),
                LogFormat::Pretty => fmt::layer()
                    .pretty()
                    .with_ansi(self.config.ansi_colors)
                    .with_writer(io::stderr)
                    .with_filter(self.env_filter())
                    .boxed(),
                LogFormat::Json => fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_filter(self.env_filter())
                    .boxed(),
            };
            layers.push(layer);
        }

        #[cfg(target_os = "linux")]
        if self.config.journald {
            match tracing_journald::layer() {
                Ok(layer) => layers.push(layer.with_filter(self.env_filter()).boxed()),
                Err(err) => {
                    crate::print_warn!("Failed to initialize journald logging: {err}");
                    if !self.config.console {
                        return Err(LoggerError::Io(err));
                    }
                }
            }
        }

        if layers.is_empty() {
            return Err(LoggerError::NoLayers);
        }
        tracing_subscriber::registry().with(layers).init();
        Ok(())
    }
}
