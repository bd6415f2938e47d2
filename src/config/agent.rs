//! Configuration sections for the agent's own components.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::statsd::accumulator::{GaugeOp, WindowOp};

/// Inbound HTTP(S) listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_server"))]
pub struct ServerConfig {
    /// Plain HTTP listen address.
    #[validate(length(min = 1, message = "Listen address must not be empty"))]
    pub listen: String,

    /// HTTPS listen address. Requires cert and key files; the plaintext
    /// listener keeps running alongside it.
    pub tls_listen: Option<String>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,

    /// Overall deadline for one agent run, seconds. Collectors missing it
    /// are dropped from that response and finish in the background.
    #[validate(range(min = 1, message = "Run deadline must be at least 1 second"))]
    pub run_deadline_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2609".to_string(),
            tls_listen: None,
            tls_cert_file: None,
            tls_key_file: None,
            run_deadline_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }
}

fn validate_server(config: &ServerConfig) -> Result<(), ValidationError> {
    if config.tls_listen.is_some()
        && (config.tls_cert_file.is_none() || config.tls_key_file.is_none())
    {
        let mut err = ValidationError::new("tls");
        err.message = Some("TLS listener requires both cert and key files".into());
        return Err(err);
    }
    Ok(())
}

/// Plugin runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned (non-recursively) for executable plugins.
    pub dir: PathBuf,

    /// Per-execution timeout, seconds. Expiry sends SIGTERM, then SIGKILL
    /// after the grace interval.
    #[validate(range(min = 1, message = "Plugin timeout must be at least 1 second"))]
    pub run_timeout_secs: u64,

    /// Grace between SIGTERM and SIGKILL, seconds.
    #[validate(range(min = 1, message = "Termination grace must be at least 1 second"))]
    pub term_grace_secs: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/opt/waggle/plugins"),
            run_timeout_secs: 30,
            term_grace_secs: 3,
        }
    }
}

impl PluginsConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_secs(self.term_grace_secs)
    }
}

/// StatsD listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StatsdConfig {
    /// Disables the listener entirely.
    pub disabled: bool,

    /// UDP port, bound on localhost.
    pub port: u16,

    /// First name segment selecting the host set.
    #[validate(length(min = 1, message = "Host prefix must not be empty"))]
    pub host_prefix: String,

    /// Prefix applied to host metrics in the agent's output.
    #[validate(length(min = 1, message = "Host category must not be empty"))]
    pub host_category: String,

    /// Prefix applied to group metrics on submission.
    #[validate(length(min = 1, message = "Group prefix must not be empty"))]
    pub group_prefix: String,

    /// Group check id handed to the submission client. Opaque.
    pub group_check_id: String,

    pub group_counter_operator: WindowOp,
    pub group_gauge_operator: GaugeOp,
    pub group_set_operator: WindowOp,

    /// Group submission interval, seconds.
    #[validate(range(min = 1, message = "Flush interval must be at least 1 second"))]
    pub flush_interval_secs: u64,
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            port: 8125,
            host_prefix: "host".to_string(),
            host_category: "statsd".to_string(),
            group_prefix: "group".to_string(),
            group_check_id: String::new(),
            group_counter_operator: WindowOp::Sum,
            group_gauge_operator: GaugeOp::Average,
            group_set_operator: WindowOp::Sum,
            flush_interval_secs: 60,
        }
    }
}
