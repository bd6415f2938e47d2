//! In-process (non-plugin) metric collectors.
//!
//! Builtins self-register at compile time through the `inventory` crate;
//! the manager instantiates the registry into a map and fans `collect`
//! out across it on each run.

pub mod loadavg;
pub mod meminfo;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::core::collector::{CollectError, CollectResult, Collector};
use crate::metrics::MetricSet;
use crate::stats::AppStats;

/// Registration record submitted by each builtin collector.
pub struct BuiltinMeta {
    pub id: &'static str,
    pub factory: fn() -> Arc<dyn Collector>,
}

inventory::collect!(BuiltinMeta);

/// Registers a builtin collector type under the given id.
#[macro_export]
macro_rules! register_builtin {
    ($collector:ty, $id:expr) => {
        inventory::submit! {
            $crate::core::builtins::BuiltinMeta {
                id: $id,
                factory: || std::sync::Arc::new(<$collector>::default()),
            }
        }
    };
}

/// Holds the in-process collectors and coordinates their runs.
///
/// The map is fixed at construction; the atomic flag makes overlapping
/// runs on the same manager return immediately without starting a new
/// pass.
pub struct Builtins {
    collectors: BTreeMap<String, Arc<dyn Collector>>,
    running: AtomicBool,
    stats: Arc<AppStats>,
}

impl Builtins {
    /// Builds the manager from every registered builtin.
    pub fn new(stats: Arc<AppStats>) -> Self {
        let mut collectors: BTreeMap<String, Arc<dyn Collector>> = BTreeMap::new();
        for meta in inventory::iter::<BuiltinMeta> {
            collectors.insert(meta.id.to_string(), (meta.factory)());
        }
        info!(count = collectors.len(), "configuring builtins");
        Self {
            collectors,
            running: AtomicBool::new(false),
            stats,
        }
    }

    /// Manager over an explicit collector map. Used by tests and by hosts
    /// embedding their own collectors.
    pub fn with_collectors(
        collectors: BTreeMap<String, Arc<dyn Collector>>,
        stats: Arc<AppStats>,
    ) -> Self {
        Self {
            collectors,
            running: AtomicBool::new(false),
            stats,
        }
    }

    /// Triggers the builtins to gather metrics, concurrently across
    /// collectors, waiting for all of them. Empty `id` runs everything;
    /// otherwise only the matching collector. An overlapping run returns
    /// immediately.
    pub async fn run(&self, id: &str) -> CollectResult<()> {
        if self.collectors.is_empty() {
            return Ok(());
        }
        if !id.is_empty() && !self.collectors.contains_key(id) {
            return Err(CollectError::NotFound(id.to_string()));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("builtins run already in progress");
            return Ok(());
        }

        let started = Instant::now();
        self.stats.set_now("builtins", "last_start");

        let selected: Vec<Arc<dyn Collector>> = self
            .collectors
            .iter()
            .filter(|(key, _)| id.is_empty() || key.as_str() == id)
            .map(|(_, c)| c.clone())
            .collect();

        let mut handles = Vec::with_capacity(selected.len());
        for collector in selected {
            debug!(builtin = collector.id(), "collecting");
            handles.push(tokio::spawn(async move {
                if let Err(err) = collector.collect().await {
                    error!(builtin = collector.id(), error = %err, "builtin collection failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        debug!("all builtins done");

        self.stats.set_now("builtins", "last_end");
        self.stats
            .set_duration("builtins", "last_duration", started.elapsed());
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Union of the builtins' current metrics, scoped to one collector
    /// when `id` is given. Collectors are visited in id order; on a name
    /// collision the first write wins.
    pub fn flush(&self, id: Option<&str>) -> MetricSet {
        self.stats.set_now("builtins", "last_flush");

        let mut out = MetricSet::new();
        for (key, collector) in &self.collectors {
            if let Some(want) = id {
                if key != want {
                    continue;
                }
            }
            for (name, metric) in collector.flush() {
                out.entry(name).or_insert(metric);
            }
        }
        out
    }

    /// True if `id` names a registered builtin.
    pub fn is_builtin(&self, id: &str) -> bool {
        !id.is_empty() && self.collectors.contains_key(id)
    }

    /// Sorted list of builtin ids.
    pub fn inventory(&self) -> Vec<String> {
        self.collectors.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::metrics::Metric;

    struct FakeCollector {
        id: &'static str,
        collected: AtomicUsize,
        delay: Duration,
    }

    impl FakeCollector {
        fn new(id: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id,
                collected: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl Collector for FakeCollector {
        fn id(&self) -> &str {
            self.id
        }

        async fn collect(&self) -> CollectResult<()> {
            tokio::time::sleep(self.delay).await;
            self.collected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn flush(&self) -> MetricSet {
            let mut set = MetricSet::new();
            set.insert(
                format!("{}`count", self.id),
                Metric::uint64(self.collected.load(Ordering::SeqCst) as u64),
            );
            set
        }
    }

    fn manager(collectors: Vec<Arc<FakeCollector>>) -> (Builtins, Vec<Arc<FakeCollector>>) {
        let map: BTreeMap<String, Arc<dyn Collector>> = collectors
            .iter()
            .map(|c| (c.id.to_string(), c.clone() as Arc<dyn Collector>))
            .collect();
        (
            Builtins::with_collectors(map, Arc::new(AppStats::new())),
            collectors,
        )
    }

    #[tokio::test]
    async fn run_fans_out_over_all_collectors() {
        let (builtins, fakes) = manager(vec![
            FakeCollector::new("cpu", Duration::ZERO),
            FakeCollector::new("mem", Duration::ZERO),
        ]);

        builtins.run("").await.unwrap();
        for fake in &fakes {
            assert_eq!(fake.collected.load(Ordering::SeqCst), 1);
        }

        let set = builtins.flush(None);
        assert_eq!(set.len(), 2);
        assert!(set.contains_key("cpu`count"));
    }

    #[tokio::test]
    async fn scoped_run_touches_one_collector() {
        let (builtins, fakes) = manager(vec![
            FakeCollector::new("cpu", Duration::ZERO),
            FakeCollector::new("mem", Duration::ZERO),
        ]);

        builtins.run("mem").await.unwrap();
        assert_eq!(fakes[0].collected.load(Ordering::SeqCst), 0);
        assert_eq!(fakes[1].collected.load(Ordering::SeqCst), 1);

        assert_eq!(builtins.flush(Some("mem")).len(), 1);
    }

    #[tokio::test]
    async fn unknown_scoped_run_errors() {
        let (builtins, _) = manager(vec![FakeCollector::new("cpu", Duration::ZERO)]);
        let err = builtins.run("ghost").await.unwrap_err();
        assert!(matches!(err, CollectError::NotFound(_)));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn overlapping_run_is_a_no_op() {
        let (builtins, fakes) = manager(vec![FakeCollector::new(
            "slow",
            Duration::from_millis(300),
        )]);
        let builtins = Arc::new(builtins);

        let first = {
            let b = builtins.clone();
            tokio::spawn(async move { b.run("").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        builtins.run("").await.unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(fakes[0].collected.load(Ordering::SeqCst), 1);
        assert!(logs_contain("builtins run already in progress"));
    }

    #[tokio::test]
    async fn flush_without_collect_is_empty_for_registry() {
        let (builtins, _) = manager(vec![]);
        assert!(builtins.flush(None).is_empty());
        assert!(!builtins.is_builtin(""));
        assert!(!builtins.is_builtin("anything"));
    }
}
