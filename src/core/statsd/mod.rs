//! StatsD UDP listener.
//!
//! Accepts the standard statsd line protocol, routes each metric to the
//! host or group store by its first name segment, and submits the group
//! store on a timer through the configured [`Submitter`]. Host metrics are
//! never auto-submitted; the agent embeds them in its own output via
//! [`StatsdServer::flush_host`].

pub mod accumulator;
pub mod parser;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::agent::StatsdConfig;
use crate::metrics::MetricSet;
use crate::stats::AppStats;

use accumulator::MetricStore;
use parser::parse_line;

/// Receive buffer size. Larger datagrams are truncated by the kernel, so
/// this bounds the accepted packet size.
const MAX_PACKET: usize = 8192;

#[derive(Debug, Error)]
pub enum StatsdError {
    #[error("failed to bind statsd listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure delivering group metrics; logged and retried on the next
/// interval.
#[derive(Debug, Error)]
#[error("group metric submission failed: {0}")]
pub struct SubmissionError(pub String);

/// Delivery client for group metrics. The remote API client implements
/// this; [`LogSubmitter`] stands in when none is wired up.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, group_id: &str, metrics: MetricSet) -> Result<(), SubmissionError>;
}

/// Default submitter: records what would have been sent.
pub struct LogSubmitter;

#[async_trait]
impl Submitter for LogSubmitter {
    async fn submit(&self, group_id: &str, metrics: MetricSet) -> Result<(), SubmissionError> {
        info!(group_id, count = metrics.len(), "no submission client configured, dropping group metrics");
        Ok(())
    }
}

/// The UDP listener plus its two accumulation stores.
pub struct StatsdServer {
    config: StatsdConfig,
    host: MetricStore,
    group: MetricStore,
    submitter: Arc<dyn Submitter>,
    stats: Arc<AppStats>,
}

impl StatsdServer {
    pub fn new(config: StatsdConfig, submitter: Arc<dyn Submitter>, stats: Arc<AppStats>) -> Self {
        let group = MetricStore::new(
            config.group_counter_operator,
            Some(config.group_gauge_operator),
            config.group_set_operator,
        );
        Self {
            config,
            host: MetricStore::host(),
            group,
            submitter,
            stats,
        }
    }

    /// Binds the listener socket. Bind failures are fatal to startup.
    pub async fn bind(&self) -> Result<UdpSocket, StatsdError> {
        let addr = format!("127.0.0.1:{}", self.config.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| StatsdError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!(addr, "statsd listener bound");
        Ok(socket)
    }

    /// Receive loop. Runs until the cancellation token fires; the group
    /// submission timer ticks inside the same loop.
    pub async fn run(&self, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_PACKET];
        let mut submit_timer =
            tokio::time::interval(Duration::from_secs(self.config.flush_interval_secs));
        submit_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("statsd listener stopping");
                    break;
                }

                _ = submit_timer.tick() => {
                    self.submit_group().await;
                }

                recv = socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, _peer)) => {
                            self.stats.increment("statsd", "packets");
                            self.process_packet(&String::from_utf8_lossy(&buf[..len]));
                        }
                        Err(err) => {
                            warn!(error = %err, "statsd recv error");
                        }
                    }
                }
            }
        }

        // deliver whatever the group store accumulated before shutdown
        self.submit_group().await;
    }

    /// Parses a (possibly multi-line) packet and folds each valid line
    /// into its destination store. Malformed lines are logged and skipped.
    pub fn process_packet(&self, data: &str) {
        for raw in data.lines() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match parse_line(raw) {
                Ok(line) => self.route(line),
                Err(err) => {
                    self.stats.increment("statsd", "malformed_lines");
                    warn!(line = raw, error = %err, "skipping malformed statsd line");
                }
            }
        }
    }

    /// Destination is decided by the first name segment: the configured
    /// host prefix selects the host store (re-prefixed with the host
    /// category), everything else goes to the group store.
    fn route(&self, line: parser::Line) {
        match line.name.split_once('.') {
            Some((segment, rest)) if segment == self.config.host_prefix && !rest.is_empty() => {
                let name = format!("{}`{}", self.config.host_category, rest);
                self.host.record(&name, line.sample);
            }
            _ => {
                let name = format!("{}`{}", self.config.group_prefix, line.name);
                self.group.record(&name, line.sample);
            }
        }
    }

    /// Flushes the group store through the submitter. Submission errors
    /// are logged; the next interval tries again with fresh data.
    async fn submit_group(&self) {
        if self.group.is_empty() {
            return;
        }
        let metrics = self.group.flush();
        if metrics.is_empty() {
            return;
        }
        self.stats.set_now("statsd", "last_group_submit");
        if let Err(err) = self
            .submitter
            .submit(&self.config.group_check_id, metrics)
            .await
        {
            error!(error = %err, "group submission failed, retrying next interval");
        }
    }

    /// Host-set snapshot for embedding in the agent's output. Counters and
    /// sets reset on flush; gauges retain their last value.
    pub fn flush_host(&self) -> MetricSet {
        self.host.flush()
    }
}
