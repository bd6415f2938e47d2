//! The uniform contract over all metric sources.

use async_trait::async_trait;
use thiserror::Error;

use crate::metrics::MetricSet;

/// Result alias used by every collector operation.
pub type CollectResult<T> = Result<T, CollectError>;

/// Errors raised while sampling a metric source.
///
/// Collection errors never propagate past the owning manager: they are
/// logged, the collector's previous snapshot stays valid, and the other
/// collectors are unaffected.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Failed to read a file from disk.
    #[error("failed to read {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A value could not be extracted from otherwise readable data.
    #[error("failed to parse {metric} from {location}: {reason}")]
    Parse {
        metric: String,
        location: String,
        reason: String,
    },

    /// Data was found but did not conform to the expected format.
    #[error("invalid format in {location}: {reason}")]
    InvalidFormat { location: String, reason: String },

    /// An external program failed to launch or complete.
    #[error("command '{command}' failed: {source}")]
    CommandExecution {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// An external program ran past its deadline and was terminated.
    #[error("command '{command}' timed out after {timeout_secs}s")]
    CommandTimeout { command: String, timeout_secs: u64 },

    /// An external program exited non-zero without producing any metrics.
    #[error("command '{command}' exited with code {code} and produced no metrics")]
    CommandFailed { command: String, code: i32 },

    /// The requested collector id is not registered.
    #[error("collector not found: {0}")]
    NotFound(String),

    /// The collector exists but cannot run on this platform.
    #[error("unsupported collector: {0}")]
    Unsupported(String),
}

/// A unit of metric collection: plugin, builtin, or anything else that can
/// sample and report.
///
/// `collect` and `flush` are independent: `flush` may be called without a
/// preceding `collect` and returns an empty set in that case. `collect`
/// must be safe to call concurrently across different collectors and must
/// be reentrancy-safe for the same collector: an overlapping call is a
/// no-op leaving the previously captured snapshot in place.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable identifier, used in logs and to scope a run to one source.
    fn id(&self) -> &str;

    /// Samples the source and replaces the internal snapshot.
    async fn collect(&self) -> CollectResult<()>;

    /// Returns the most recently collected metrics. Pure reader; never
    /// blocks on I/O.
    fn flush(&self) -> MetricSet;
}
