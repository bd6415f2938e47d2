//! A single executable plugin and its execution discipline.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::output;
use crate::core::collector::{CollectError, CollectResult, Collector};
use crate::metrics::MetricSet;

/// Mutable plugin record: execution configuration plus the result of the
/// most recent run. Guarded by the plugin's own mutex so unrelated plugins
/// never serialize on each other.
#[derive(Debug, Default, Clone)]
pub struct PluginState {
    /// Arguments passed to the executable, from the sidecar config.
    pub args: Vec<String>,
    /// Opaque payload written to the plugin's stdin, from the sidecar config.
    pub stdin_config: Option<String>,
    /// Last successfully parsed metrics. Survives failed runs.
    pub metrics: MetricSet,
    pub last_exit_code: Option<i32>,
    pub last_start: Option<OffsetDateTime>,
    pub last_end: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

/// One executable file in the plugin directory.
///
/// The `running` flag enforces at-most-one in-flight execution; the state
/// mutex guards the cached result. Neither is held across process I/O.
#[derive(Debug)]
pub struct Plugin {
    id: String,
    instance: String,
    path: PathBuf,
    run_timeout: Duration,
    term_grace: Duration,
    running: AtomicBool,
    state: Mutex<PluginState>,
}

impl Plugin {
    pub fn new(
        id: &str,
        instance: &str,
        path: PathBuf,
        state: PluginState,
        run_timeout: Duration,
        term_grace: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            instance: instance.to_string(),
            path,
            run_timeout,
            term_grace,
            running: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    /// Instance suffix after the first `_`, empty when absent.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Full name used for inventory and scoped runs: `id` or `id_instance`.
    pub fn name(&self) -> String {
        if self.instance.is_empty() {
            self.id.clone()
        } else {
            format!("{}_{}", self.id, self.instance)
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Replaces the execution configuration, preserving the cached result.
    /// Called on rescan when the sidecar config changed.
    pub fn reconfigure(&self, args: Vec<String>, stdin_config: Option<String>) {
        let mut state = self.state.lock().expect("plugin lock poisoned");
        state.args = args;
        state.stdin_config = stdin_config;
    }

    /// Snapshot of the full record, for inventory and diagnostics.
    pub fn state(&self) -> PluginState {
        self.state.lock().expect("plugin lock poisoned").clone()
    }

    /// Runs the executable once, honoring the single-flight guard.
    ///
    /// An invocation arriving while a run is in flight is skipped silently.
    /// On timeout the child receives SIGTERM, then SIGKILL once the grace
    /// interval expires. A failed run (non-zero exit with nothing parsed,
    /// launch error, timeout) preserves the previous cache and records the
    /// failure.
    pub async fn execute(&self) -> CollectResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!(plugin = %self.name(), "run already in flight, skipping");
            return Ok(());
        }

        let result = self.run_once().await;

        {
            let mut state = self.state.lock().expect("plugin lock poisoned");
            state.last_end = Some(OffsetDateTime::now_utc());
            if let Err(err) = &result {
                state.last_error = Some(err.to_string());
            }
        }
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_once(&self) -> CollectResult<()> {
        let (args, stdin_config) = {
            let mut state = self.state.lock().expect("plugin lock poisoned");
            state.last_start = Some(OffsetDateTime::now_utc());
            state.last_exit_code = None;
            (state.args.clone(), state.stdin_config.clone())
        };

        let command = self.path.display().to_string();
        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(if stdin_config.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CollectError::CommandExecution {
                command: command.clone(),
                source,
            })?;

        if let (Some(cfg), Some(mut stdin)) = (stdin_config, child.stdin.take()) {
            if let Err(err) = stdin.write_all(cfg.as_bytes()).await {
                warn!(plugin = %self.name(), error = %err, "failed writing instance config to plugin stdin");
            }
            // dropping stdin closes the pipe so the plugin sees EOF
        }

        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                buf
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| CollectError::CommandExecution {
                command: command.clone(),
                source,
            })?,
            _ = tokio::time::sleep(self.run_timeout) => {
                self.terminate(&mut child).await;
                return Err(CollectError::CommandTimeout {
                    command,
                    timeout_secs: self.run_timeout.as_secs(),
                });
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if let Some(task) = stderr_task {
            let stderr = task.await.unwrap_or_default();
            if !stderr.is_empty() {
                debug!(plugin = %self.name(), stderr = %String::from_utf8_lossy(&stderr), "plugin stderr");
            }
        }

        let exit_code = status.code().unwrap_or(-1);
        let mut parsed = output::parse_output(&self.name(), &String::from_utf8_lossy(&stdout));
        if !self.instance.is_empty() {
            let tag = format!("instance:{}", self.instance);
            for metric in parsed.values_mut() {
                metric.tags.push(tag.clone());
            }
        }

        let mut state = self.state.lock().expect("plugin lock poisoned");
        state.last_exit_code = Some(exit_code);

        if parsed.is_empty() && !status.success() {
            // keep the last-known-good cache intact
            return Err(CollectError::CommandFailed {
                command: self.name(),
                code: exit_code,
            });
        }

        state.metrics = parsed;
        state.last_error = None;
        Ok(())
    }

    /// Sends SIGTERM, waits out the grace period, then hard-kills.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(plugin = %self.name(), error = %err, "SIGTERM failed");
            }
        }
        if tokio::time::timeout(self.term_grace, child.wait()).await.is_err() {
            warn!(plugin = %self.name(), "plugin ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl Collector for Plugin {
    fn id(&self) -> &str {
        &self.id
    }

    async fn collect(&self) -> CollectResult<()> {
        self.execute().await
    }

    fn flush(&self) -> MetricSet {
        self.state.lock().expect("plugin lock poisoned").metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::metrics::MetricValue;

    #[cfg(unix)]
    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn plugin(id: &str, instance: &str, path: PathBuf, state: PluginState) -> Plugin {
        Plugin::new(
            id,
            instance,
            path,
            state,
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_parses_and_caches_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "mem.sh", "printf 'used\\tI\\t42\\n'");
        let p = plugin("mem", "", path, PluginState::default());

        p.execute().await.unwrap();

        let set = p.flush();
        assert_eq!(set["used"].value, MetricValue::Uint(42));
        let state = p.state();
        assert_eq!(state.last_exit_code, Some(0));
        assert!(state.last_error.is_none());
        assert!(state.last_start.is_some());
        assert!(state.last_end.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_run_preserves_previous_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "flaky.sh", "printf 'ok\\tL\\t1\\n'");
        let p = plugin("flaky", "", path.clone(), PluginState::default());

        p.execute().await.unwrap();
        let before = p.flush();
        assert!(!before.is_empty());

        // same path, now exits non-zero without output
        script(&dir, "flaky.sh", "exit 3");
        let err = p.execute().await.unwrap_err();
        assert!(matches!(err, CollectError::CommandFailed { code: 3, .. }));

        assert_eq!(p.flush(), before);
        assert!(p.state().last_error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn overlapping_execute_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let path = script(
            &dir,
            "slow.sh",
            &format!("echo run >> {}\nsleep 1", counter.display()),
        );
        let p = std::sync::Arc::new(plugin("slow", "", path, PluginState::default()));

        let first = {
            let p = p.clone();
            tokio::spawn(async move { p.execute().await })
        };
        // give the first run time to claim the flag
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        p.execute().await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "second call should be a no-op"
        );

        first.await.unwrap().unwrap();
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "hang.sh", "sleep 30");
        let p = Plugin::new(
            "hang",
            "",
            path,
            PluginState::default(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );

        let started = Instant::now();
        let err = p.execute().await.unwrap_err();
        assert!(matches!(err, CollectError::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!p.is_running());
        assert!(p.flush().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn instance_tag_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "db_primary.sh", "printf 'conns\\tI\\t9\\n'");
        let p = plugin("db", "primary", path, PluginState::default());

        p.collect().await.unwrap();
        let set = p.flush();
        assert_eq!(set["conns"].tags, vec!["instance:primary".to_string()]);
        assert_eq!(p.name(), "db_primary");
        assert_eq!(p.id(), "db");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_config_reaches_the_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "echoer.sh", "read cfg\nprintf 'cfg\\ts\\t%s\\n' \"$cfg\"");
        let state = PluginState {
            stdin_config: Some("tuned\n".into()),
            ..PluginState::default()
        };
        let p = plugin("echoer", "", path, state);

        p.execute().await.unwrap();
        assert_eq!(p.flush()["cfg"].value, MetricValue::Text("tuned".into()));
    }
}
