//! Tunnel configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Reverse-connection settings, one section of the agent's TOML config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_config"))]
pub struct Config {
    /// Master switch; when off the tunnel never starts.
    pub enabled: bool,

    /// Broker endpoint to dial out to.
    pub broker_host: String,
    pub broker_port: u16,

    /// Check bundle ID announced to the broker. Opaque to the agent.
    pub check_bundle_id: String,

    /// Host identity announced to the broker.
    pub target_host: String,

    /// PEM file with the broker CA. System roots are used when unset.
    pub broker_ca_file: Option<PathBuf>,

    /// TCP + TLS + hello deadline, seconds.
    #[validate(range(min = 1, message = "Connect timeout must be at least 1 second"))]
    pub connect_timeout_secs: u64,

    /// First reconnect delay, seconds. Doubles per failed attempt.
    #[validate(range(min = 1, message = "Initial backoff must be at least 1 second"))]
    pub backoff_initial_secs: u64,

    /// Reconnect delay cap, seconds.
    pub backoff_max_secs: u64,

    /// Idle threshold before a heartbeat ping is sent, seconds.
    #[validate(range(min = 1, message = "Heartbeat idle threshold must be at least 1 second"))]
    pub heartbeat_idle_secs: u64,

    /// How long shutdown waits for in-flight responses, seconds.
    pub drain_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: String::new(),
            broker_port: 43191,
            check_bundle_id: String::new(),
            target_host: String::new(),
            broker_ca_file: None,
            connect_timeout_secs: 10,
            backoff_initial_secs: 1,
            backoff_max_secs: 60,
            heartbeat_idle_secs: 30,
            drain_grace_secs: 5,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn heartbeat_idle(&self) -> Duration {
        Duration::from_secs(self.heartbeat_idle_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

/// Cross-field rules that only matter when the tunnel is enabled.
fn validate_config(config: &Config) -> Result<(), ValidationError> {
    if !config.enabled {
        return Ok(());
    }
    if config.broker_host.is_empty() {
        let mut err = ValidationError::new("broker_host");
        err.message = Some("Reverse mode requires a broker host".into());
        return Err(err);
    }
    if config.backoff_max_secs < config.backoff_initial_secs {
        let mut err = ValidationError::new("backoff");
        err.message = Some("Backoff cap must be at least the initial interval".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_validates_without_broker() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_config_requires_broker_host() {
        let config = Config {
            enabled: true,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            enabled: true,
            broker_host: "broker.example.net".into(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_cap_must_cover_initial() {
        let config = Config {
            enabled: true,
            broker_host: "broker.example.net".into(),
            backoff_initial_secs: 30,
            backoff_max_secs: 5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
