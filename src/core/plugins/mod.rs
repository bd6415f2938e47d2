//! Plugin discovery and run coordination.
//!
//! The runner turns a directory of executable programs into a set of metric
//! sources: it scans the directory on startup and on demand, fans a run out
//! across the discovered plugins, and merges their cached results on flush.

pub mod output;
pub mod plugin;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::core::collector::{CollectError, CollectResult, Collector};
use crate::metrics::MetricSet;
use crate::stats::AppStats;

use plugin::{Plugin, PluginState};

/// Sidecar key used by plugins that carry no instance suffix.
const DEFAULT_INSTANCE: &str = "default";

/// Optional per-plugin configuration, loaded from a sibling `<id>.json`.
///
/// Both maps are keyed by instance name; plugins without an instance use
/// the `default` entry.
#[derive(Debug, Default, Deserialize)]
struct SidecarConfig {
    /// Arguments passed to the executable, per instance.
    #[serde(default)]
    instance_args: HashMap<String, Vec<String>>,

    /// Opaque string handed to the plugin on stdin, per instance.
    #[serde(default)]
    instance_config: HashMap<String, String>,
}

/// Discovers and executes the plugins of one directory.
///
/// The runner's own mutex guards only structural changes to the plugin map;
/// each plugin carries its own lock and single-flight guard, so unrelated
/// plugins never serialize on each other.
pub struct PluginRunner {
    dir: PathBuf,
    run_timeout: Duration,
    term_grace: Duration,
    stats: Arc<AppStats>,
    plugins: Mutex<BTreeMap<String, Arc<Plugin>>>,
}

impl PluginRunner {
    pub fn new(
        dir: PathBuf,
        run_timeout: Duration,
        term_grace: Duration,
        stats: Arc<AppStats>,
    ) -> Self {
        Self {
            dir,
            run_timeout,
            term_grace,
            stats,
            plugins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Enumerates the plugin directory (non-recursive) and rebuilds the
    /// plugin map. An entry is admitted iff it is a regular file with an
    /// executable bit set. Plugins that survive a rescan keep their cached
    /// results and their in-flight guard; scanned-out plugins are dropped.
    ///
    /// Returns the number of plugins now known.
    pub fn scan(&self) -> CollectResult<usize> {
        if !self.dir.is_dir() {
            warn!(dir = %self.dir.display(), "plugin directory missing, no plugins loaded");
            self.plugins.lock().expect("runner lock poisoned").clear();
            return Ok(0);
        }

        let entries = std::fs::read_dir(&self.dir).map_err(|source| CollectError::FileRead {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut found: BTreeMap<String, Arc<Plugin>> = BTreeMap::new();
        let mut previous = self.plugins.lock().expect("runner lock poisoned");

        for entry in entries.flatten() {
            let path = entry.path();
            if !is_admissible(&path) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let (id, instance) = match stem.split_once('_') {
                Some((id, instance)) => (id, instance),
                None => (stem, ""),
            };
            if id.is_empty() {
                continue;
            }
            let id = id.to_string();
            let instance = instance.to_string();

            let (args, stdin_config) = self.sidecar_settings(&id, &instance);
            let name = if instance.is_empty() {
                id.to_string()
            } else {
                format!("{id}_{instance}")
            };

            let plugin = match previous.remove(&name) {
                Some(existing) if existing.path() == &path => {
                    existing.reconfigure(args, stdin_config);
                    existing
                }
                _ => {
                    debug!(plugin = %name, path = %path.display(), "discovered plugin");
                    Arc::new(Plugin::new(
                        &id,
                        &instance,
                        path,
                        PluginState {
                            args,
                            stdin_config,
                            ..PluginState::default()
                        },
                        self.run_timeout,
                        self.term_grace,
                    ))
                }
            };
            found.insert(name, plugin);
        }

        let count = found.len();
        *previous = found;
        drop(previous);

        self.stats.set("plugins", "count", count);
        self.stats.set_now("plugins", "last_scan");
        self.stats.increment("plugins", "scans");
        info!(count, dir = %self.dir.display(), "plugin scan complete");
        Ok(count)
    }

    /// Reads the `<id>.json` sidecar, resolving argv and stdin payload for
    /// the given instance. A missing sidecar is not an error; a malformed
    /// one is logged and ignored.
    fn sidecar_settings(&self, id: &str, instance: &str) -> (Vec<String>, Option<String>) {
        let sidecar = self.dir.join(format!("{id}.json"));
        if !sidecar.is_file() {
            return (Vec::new(), None);
        }

        let config: SidecarConfig = match std::fs::read_to_string(&sidecar)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
        {
            Ok(config) => config,
            Err(err) => {
                warn!(sidecar = %sidecar.display(), error = %err, "ignoring malformed plugin config");
                return (Vec::new(), None);
            }
        };

        let key = if instance.is_empty() {
            DEFAULT_INSTANCE
        } else {
            instance
        };
        (
            config.instance_args.get(key).cloned().unwrap_or_default(),
            config.instance_config.get(key).cloned(),
        )
    }

    /// Runs every plugin concurrently, or just the ones matching `id`
    /// (either a bare plugin id or a full `id_instance` name). Plugins
    /// already in flight are skipped by their own guard; per-plugin
    /// failures are logged and do not affect the other plugins.
    pub async fn run(&self, id: &str) -> CollectResult<()> {
        let selected: Vec<Arc<Plugin>> = {
            let plugins = self.plugins.lock().expect("runner lock poisoned");
            plugins
                .values()
                .filter(|p| id.is_empty() || p.id() == id || p.name() == id)
                .cloned()
                .collect()
        };
        if !id.is_empty() && selected.is_empty() {
            return Err(CollectError::NotFound(id.to_string()));
        }
        if selected.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        self.stats.set_now("plugins", "last_run_start");

        let mut handles = Vec::with_capacity(selected.len());
        for plugin in selected {
            handles.push(tokio::spawn(async move {
                if let Err(err) = plugin.collect().await {
                    error!(plugin = %plugin.name(), error = %err, "plugin run failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.stats.set_now("plugins", "last_run_end");
        self.stats
            .set_duration("plugins", "last_run_duration", started.elapsed());
        debug!("all plugins done");
        Ok(())
    }

    /// Union of the plugins' cached metric sets, names prefixed with the
    /// owning plugin id. Plugins are visited in (id, instance) order and
    /// the first write wins, which makes cross-instance collisions resolve
    /// deterministically to the lexicographically first plugin.
    pub fn flush(&self, id: Option<&str>) -> MetricSet {
        let plugins = self.plugins.lock().expect("runner lock poisoned");
        let mut out = MetricSet::new();
        for plugin in plugins.values() {
            if let Some(want) = id {
                if plugin.id() != want && plugin.name() != want {
                    continue;
                }
            }
            for (name, metric) in plugin.flush() {
                out.entry(format!("{}`{}", plugin.id(), name)).or_insert(metric);
            }
        }
        out
    }

    /// True if `id` names a known plugin (bare id or full name).
    pub fn is_plugin(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        let plugins = self.plugins.lock().expect("runner lock poisoned");
        plugins
            .values()
            .any(|p| p.id() == id || p.name() == id)
    }

    /// Sorted list of known plugin names.
    pub fn inventory(&self) -> Vec<String> {
        let plugins = self.plugins.lock().expect("runner lock poisoned");
        plugins.keys().cloned().collect()
    }
}

/// Admission check: regular file with any executable bit set. Sidecar
/// configs are never admitted, executable or not.
fn is_admissible(path: &std::path::Path) -> bool {
    if path.extension().is_some_and(|ext| ext == "json") {
        return false;
    }
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::metrics::MetricValue;

    fn script(dir: &std::path::Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn runner(dir: &std::path::Path) -> PluginRunner {
        PluginRunner::new(
            dir.to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            Arc::new(AppStats::new()),
        )
    }

    #[tokio::test]
    async fn scan_admits_only_executables() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "mem.sh", "printf 'used\\tI\\t1\\n'");
        std::fs::write(dir.path().join("notes.txt"), "not a plugin").unwrap();
        std::fs::write(dir.path().join("mem.json"), "{}").unwrap();

        let r = runner(dir.path());
        assert_eq!(r.scan().unwrap(), 1);
        assert_eq!(r.inventory(), vec!["mem".to_string()]);
        assert!(r.is_plugin("mem"));
        assert!(!r.is_plugin("notes"));
    }

    #[tokio::test]
    async fn missing_directory_is_empty_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let r = runner(&gone);
        assert_eq!(r.scan().unwrap(), 0);
        assert!(r.inventory().is_empty());
    }

    #[tokio::test]
    async fn sidecar_args_reach_the_plugin() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "greet.sh", "printf 'word\\ts\\t%s\\n' \"$1\"");
        std::fs::write(
            dir.path().join("greet.json"),
            r#"{"instance_args": {"default": ["hello"]}}"#,
        )
        .unwrap();

        let r = runner(dir.path());
        r.scan().unwrap();
        r.run("").await.unwrap();

        let set = r.flush(None);
        assert_eq!(set["greet`word"].value, MetricValue::Text("hello".into()));
    }

    #[tokio::test]
    async fn duplicate_names_resolve_to_first_plugin() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "a_1.sh", "printf 'x\\tL\\t1\\n'");
        script(dir.path(), "a_2.sh", "printf 'x\\tL\\t2\\n'");

        let r = runner(dir.path());
        r.scan().unwrap();
        r.run("").await.unwrap();

        let set = r.flush(None);
        assert_eq!(set.len(), 1);
        assert_eq!(set["a`x"].value, MetricValue::Uint(1));
        assert_eq!(set["a`x"].tags, vec!["instance:1".to_string()]);
    }

    #[tokio::test]
    async fn scoped_run_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "one.sh", "printf 'v\\tL\\t1\\n'");
        script(dir.path(), "two.sh", "printf 'v\\tL\\t2\\n'");

        let r = runner(dir.path());
        r.scan().unwrap();
        r.run("one").await.unwrap();

        assert_eq!(r.flush(Some("one")).len(), 1);
        // "two" never ran: nothing cached
        assert!(r.flush(Some("two")).is_empty());
    }

    #[tokio::test]
    async fn unknown_scoped_run_errors() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());
        r.scan().unwrap();
        let err = r.run("ghost").await.unwrap_err();
        assert!(matches!(err, CollectError::NotFound(_)));
    }

    #[tokio::test]
    async fn rescan_drops_removed_plugins_and_keeps_caches() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "keep.sh", "printf 'v\\tL\\t7\\n'");
        script(dir.path(), "gone.sh", "printf 'v\\tL\\t8\\n'");

        let r = runner(dir.path());
        r.scan().unwrap();
        r.run("").await.unwrap();
        assert_eq!(r.flush(None).len(), 2);

        std::fs::remove_file(dir.path().join("gone.sh")).unwrap();
        r.scan().unwrap();

        let set = r.flush(None);
        assert_eq!(set.len(), 1);
        // survivor kept its cache without a new run
        assert_eq!(set["keep`v"].value, MetricValue::Uint(7));
    }
}
