//! Tunnel connection state.
//!
//! The lifecycle flows `Disconnected -> Connecting -> Established` and, on
//! shutdown, `Established -> Draining -> Disconnected`. Transitions are
//! driven by the connection kernel and published on a watch channel so the
//! agent can observe the tunnel without touching its internals.

use std::fmt;

/// Current state of the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// No connection. Carries the reason for the most recent loss
    /// ("startup" before the first attempt).
    Disconnected(String),

    /// TCP/TLS connect and hello exchange in progress.
    Connecting,

    /// Hello received; request/response frames are flowing.
    Established,

    /// Shutdown requested: no new requests accepted, in-flight responses
    /// are being finished before the connection closes.
    Draining,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Disconnected(_) => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Established => "established",
            TunnelState::Draining => "draining",
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, TunnelState::Established)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Disconnected(reason) if !reason.is_empty() => {
                write!(f, "disconnected ({reason})")
            }
            other => write!(f, "{}", other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(TunnelState::Connecting.as_str(), "connecting");
        assert_eq!(TunnelState::Established.as_str(), "established");
        assert_eq!(TunnelState::Draining.as_str(), "draining");
        assert_eq!(
            TunnelState::Disconnected("timeout".into()).as_str(),
            "disconnected"
        );
    }

    #[test]
    fn display_includes_reason() {
        assert_eq!(
            TunnelState::Disconnected("broker closed".into()).to_string(),
            "disconnected (broker closed)"
        );
        assert_eq!(TunnelState::Disconnected(String::new()).to_string(), "disconnected");
        assert_eq!(TunnelState::Established.to_string(), "established");
    }

    #[test]
    fn only_established_is_established() {
        assert!(TunnelState::Established.is_established());
        assert!(!TunnelState::Connecting.is_established());
        assert!(!TunnelState::Draining.is_established());
    }
}
