//! Agent orchestrator.
//!
//! Owns the lifecycles of the plugin runner, the builtins, the statsd
//! listener, the HTTP(S) listeners and the reverse tunnel. `start` brings
//! them up in dependency order (collectors, then listeners, then tunnel);
//! `stop` cancels everything and waits out a bounded shutdown deadline.
//! `run` fans a collection pass out across plugins and builtins and
//! returns the merged flush.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use waggle_reverse::TunnelKernel;

use crate::config::Config;
use crate::core::builtins::Builtins;
use crate::core::collector::CollectError;
use crate::core::plugins::PluginRunner;
use crate::core::statsd::{LogSubmitter, StatsdError, StatsdServer};
use crate::metrics::MetricSet;
use crate::server;
use crate::stats::AppStats;

/// How long `stop` waits for component tasks before aborting them.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown collector id: {0}")]
    UnknownCollector(String),
}

/// Startup failures. All of them terminate the process.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Statsd(#[from] StatsdError),

    #[error(transparent)]
    Server(#[from] server::ServerError),

    #[error("plugin scan failed: {0}")]
    Scan(#[from] CollectError),
}

/// Payload of `GET /inventory`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Inventory {
    pub plugins: Vec<String>,
    pub builtins: Vec<String>,
}

/// The agent: all components plus the run/flush surface the listeners
/// call into.
pub struct Agent {
    config: Config,
    stats: Arc<AppStats>,
    plugins: Arc<PluginRunner>,
    builtins: Arc<Builtins>,
    statsd: Option<Arc<StatsdServer>>,
    /// Externally pushed metrics, per source id (`PUT /write/{id}`).
    receiver: Mutex<HashMap<String, MetricSet>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        let stats = Arc::new(AppStats::new());
        stats.set("agent", "version", env!("CARGO_PKG_VERSION"));

        let plugins = Arc::new(PluginRunner::new(
            config.plugins.dir.clone(),
            config.plugins.run_timeout(),
            config.plugins.term_grace(),
            stats.clone(),
        ));
        let builtins = Arc::new(Builtins::new(stats.clone()));
        let statsd = (!config.statsd.disabled).then(|| {
            Arc::new(StatsdServer::new(
                config.statsd.clone(),
                Arc::new(LogSubmitter),
                stats.clone(),
            ))
        });

        Self {
            config,
            stats,
            plugins,
            builtins,
            statsd,
            receiver: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &AppStats {
        &self.stats
    }

    /// The statsd listener, when enabled.
    pub fn statsd(&self) -> Option<&StatsdServer> {
        self.statsd.as_deref()
    }

    /// Child token components derive their shutdown from.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Rescans the plugin directory on demand. Also part of `start`.
    pub fn scan_plugins(&self) -> Result<usize, CollectError> {
        self.plugins.scan()
    }

    /// Brings the components up: plugin scan first, then the statsd and
    /// HTTP(S) listeners, the reverse tunnel last.
    pub async fn start(self: &Arc<Self>) -> Result<(), StartError> {
        info!(
            pid = std::process::id(),
            version = env!("CARGO_PKG_VERSION"),
            "starting agent"
        );

        self.scan_plugins()?;

        if let Some(statsd) = &self.statsd {
            let socket = statsd.bind().await?;
            let statsd = statsd.clone();
            let cancel = self.cancel.clone();
            self.track(
                "statsd",
                tokio::spawn(async move { statsd.run(socket, cancel).await }),
            );
        }

        for (name, handle) in server::spawn_listeners(self).await? {
            self.track(name, handle);
        }

        if self.config.reverse.enabled {
            let (mut kernel, requests_rx, responses_tx) =
                TunnelKernel::new(self.config.reverse.clone(), self.cancel.clone());
            self.track(
                "reverse-dispatch",
                server::spawn_tunnel_dispatcher(self.clone(), requests_rx, responses_tx),
            );
            self.track(
                "reverse",
                tokio::spawn(async move {
                    if let Err(err) = kernel.run().await {
                        error!(error = %err, "reverse tunnel terminated");
                    }
                }),
            );
        }

        self.stats.set_now("agent", "started_at");
        Ok(())
    }

    fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().expect("agent lock poisoned").push((name, handle));
    }

    /// Cancels every component and waits out the shutdown deadline.
    /// Components that ignore it are aborted.
    pub async fn stop(&self) {
        info!("stopping agent");
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("agent lock poisoned");
            tasks.drain(..).collect()
        };
        for (name, mut handle) in tasks {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(task = name, "did not stop within shutdown deadline, aborting");
                handle.abort();
            }
        }
        info!(
            pid = std::process::id(),
            version = env!("CARGO_PKG_VERSION"),
            "agent stopped"
        );
    }

    /// One collection pass. Empty `id` fans out over plugins and builtins
    /// concurrently; a non-empty `id` scopes the pass to the matching
    /// source. The pass runs under the configured deadline; sources that
    /// miss it are dropped from this response and finish in the
    /// background, landing in the next flush.
    pub async fn run(&self, id: &str) -> Result<MetricSet, AgentError> {
        let scoped = !id.is_empty();
        let is_plugin = scoped && self.plugins.is_plugin(id);
        let is_builtin = scoped && self.builtins.is_builtin(id);
        if scoped && !is_plugin && !is_builtin {
            // pushed-metric sources have nothing to run, only a cache
            let known = self
                .receiver
                .lock()
                .expect("agent lock poisoned")
                .contains_key(id);
            if known {
                return Ok(self.flush(id));
            }
            return Err(AgentError::UnknownCollector(id.to_string()));
        }

        let plugins = self.plugins.clone();
        let builtins = self.builtins.clone();
        let target = id.to_string();
        let pass = tokio::spawn(async move {
            if target.is_empty() {
                let (p, b) = tokio::join!(plugins.run(""), builtins.run(""));
                for err in [p.err(), b.err()].into_iter().flatten() {
                    error!(error = %err, "collection pass failed");
                }
            } else if is_plugin {
                if let Err(err) = plugins.run(&target).await {
                    error!(error = %err, "plugin pass failed");
                }
            } else if let Err(err) = builtins.run(&target).await {
                error!(error = %err, "builtin pass failed");
            }
        });

        let deadline = self.config.server.run_deadline();
        if tokio::time::timeout(deadline, pass).await.is_err() {
            warn!(
                deadline_secs = deadline.as_secs(),
                "run deadline exceeded, slow collectors continue in the background"
            );
        }

        self.stats.increment("agent", "runs");
        Ok(self.flush(id))
    }

    /// Merged snapshot. Unscoped: plugins, builtins, pushed metrics and
    /// the statsd host set, first write winning on name collisions.
    /// Scoped: the matching source only.
    pub fn flush(&self, id: &str) -> MetricSet {
        if id.is_empty() {
            let mut out = self.plugins.flush(None);
            for (name, metric) in self.builtins.flush(None) {
                out.entry(name).or_insert(metric);
            }
            {
                let receiver = self.receiver.lock().expect("agent lock poisoned");
                for (source, set) in receiver.iter() {
                    for (name, metric) in set {
                        out.entry(format!("{source}`{name}")).or_insert(metric.clone());
                    }
                }
            }
            if let Some(statsd) = &self.statsd {
                for (name, metric) in statsd.flush_host() {
                    out.entry(name).or_insert(metric);
                }
            }
            return out;
        }

        if self.plugins.is_plugin(id) {
            return self.plugins.flush(Some(id));
        }
        if self.builtins.is_builtin(id) {
            return self.builtins.flush(Some(id));
        }
        let receiver = self.receiver.lock().expect("agent lock poisoned");
        receiver
            .get(id)
            .map(|set| {
                set.iter()
                    .map(|(name, metric)| (format!("{id}`{name}"), metric.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stores externally pushed metrics under `id`. Per-name, the newest
    /// push wins; the set appears in subsequent flushes.
    pub fn write(&self, id: &str, metrics: MetricSet) {
        let mut receiver = self.receiver.lock().expect("agent lock poisoned");
        receiver.entry(id.to_string()).or_default().extend(metrics);
    }

    /// Known plugin and builtin ids.
    pub fn inventory(&self) -> Inventory {
        Inventory {
            plugins: self.plugins.inventory(),
            builtins: self.builtins.inventory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::agent::{PluginsConfig, StatsdConfig};
    use crate::metrics::{Metric, MetricValue};

    #[cfg(unix)]
    fn plugin_script(dir: &std::path::Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn agent_with_dir(dir: &std::path::Path) -> Agent {
        let config = Config {
            plugins: PluginsConfig {
                dir: dir.to_path_buf(),
                run_timeout_secs: 5,
                term_grace_secs: 1,
            },
            statsd: StatsdConfig {
                host_prefix: "foo".into(),
                ..StatsdConfig::default()
            },
            ..Config::default()
        };
        Agent::new(config)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unscoped_run_unions_all_sources() {
        let dir = tempfile::tempdir().unwrap();
        plugin_script(dir.path(), "mem.sh", "printf 'used\\tI\\t42\\n'");
        let agent = agent_with_dir(dir.path());
        agent.plugins.scan().unwrap();

        // a statsd host metric and a pushed metric join the union
        agent.statsd().unwrap().process_packet("foo.bar:7|c");
        let mut pushed = MetricSet::new();
        pushed.insert("latency".into(), Metric::float(3.5));
        agent.write("app", pushed);

        let out = agent.run("").await.unwrap();
        assert_eq!(out["mem`used"].value, MetricValue::Uint(42));
        assert_eq!(out["statsd`bar"].value, MetricValue::Uint(7));
        assert_eq!(out["app`latency"].value, MetricValue::Float(3.5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scoped_run_returns_only_that_source() {
        let dir = tempfile::tempdir().unwrap();
        plugin_script(dir.path(), "mem.sh", "printf 'used\\tI\\t42\\n'");
        let agent = agent_with_dir(dir.path());
        agent.plugins.scan().unwrap();
        agent.statsd().unwrap().process_packet("foo.bar:7|c");

        let out = agent.run("mem").await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("mem`used"));
    }

    #[tokio::test]
    async fn unknown_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with_dir(dir.path());
        agent.plugins.scan().unwrap();

        let err = agent.run("ghost").await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownCollector(_)));
    }

    #[tokio::test]
    async fn pushed_metrics_flush_without_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with_dir(dir.path());

        let mut pushed = MetricSet::new();
        pushed.insert("up".into(), Metric::uint64(1));
        agent.write("probe", pushed);

        let out = agent.run("probe").await.unwrap();
        assert_eq!(out["probe`up"].value, MetricValue::Uint(1));

        // newest push wins per name
        let mut newer = MetricSet::new();
        newer.insert("up".into(), Metric::uint64(0));
        agent.write("probe", newer);
        assert_eq!(agent.flush("probe")["probe`up"].value, MetricValue::Uint(0));
    }

    #[tokio::test]
    async fn inventory_lists_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with_dir(dir.path());
        agent.plugins.scan().unwrap();

        let inventory = agent.inventory();
        assert!(inventory.builtins.contains(&"loadavg".to_string()));
        assert!(inventory.builtins.contains(&"meminfo".to_string()));
        assert!(inventory.plugins.is_empty());
    }
}
