//! Error type for the tunnel crate.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid broker address '{0}'")]
    InvalidAddress(String),

    #[error("broker CA file {path}: {reason}")]
    CaFile { path: String, reason: String },

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("frame decode error: {0}")]
    FrameDecode(String),

    #[error("frame body of {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    #[error("broker closed the connection")]
    BrokerClosed,

    #[error("request dispatcher is gone")]
    DispatcherGone,
}

impl TunnelError {
    /// Errors where reconnecting cannot help: local misconfiguration and
    /// unusable trust material. Everything else is transient and feeds
    /// the backoff loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::InvalidAddress(_) | TunnelError::CaFile { .. }
        )
    }
}
