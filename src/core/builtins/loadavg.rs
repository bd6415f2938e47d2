//! Builtin collector for /proc/loadavg.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::collector::{CollectError, CollectResult, Collector};
use crate::metrics::{Metric, MetricSet};
use crate::register_builtin;

const PROC_LOADAVG: &str = "/proc/loadavg";

/// Samples the 1/5/15-minute load averages and the runnable/total entity
/// counts from `/proc/loadavg`.
#[derive(Debug, Default)]
pub struct LoadavgCollector {
    metrics: Mutex<MetricSet>,
    running: AtomicBool,
}

#[async_trait]
impl Collector for LoadavgCollector {
    fn id(&self) -> &str {
        "loadavg"
    }

    async fn collect(&self) -> CollectResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.sample().await;
        self.running.store(false, Ordering::Release);
        result
    }

    fn flush(&self) -> MetricSet {
        self.metrics.lock().expect("loadavg lock poisoned").clone()
    }
}

impl LoadavgCollector {
    #[cfg(target_os = "linux")]
    async fn sample(&self) -> CollectResult<()> {
        let content = tokio::fs::read_to_string(PROC_LOADAVG)
            .await
            .map_err(|source| CollectError::FileRead {
                path: PROC_LOADAVG.to_string(),
                source,
            })?;
        let set = parse_loadavg(&content)?;
        *self.metrics.lock().expect("loadavg lock poisoned") = set;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn sample(&self) -> CollectResult<()> {
        Err(CollectError::Unsupported(
            "loadavg requires /proc".to_string(),
        ))
    }
}

/// Parses `/proc/loadavg` content.
///
/// Format: `0.52 0.58 0.59 1/467 12345`. Three load averages, then
/// `runnable/total` scheduling entities, then the most recent pid (which
/// is not a metric and is ignored).
fn parse_loadavg(content: &str) -> CollectResult<MetricSet> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(CollectError::InvalidFormat {
            location: PROC_LOADAVG.to_string(),
            reason: format!("expected at least 4 fields, got {}", fields.len()),
        });
    }

    let mut set = MetricSet::new();
    for (name, raw) in [
        ("load_1min", fields[0]),
        ("load_5min", fields[1]),
        ("load_15min", fields[2]),
    ] {
        let value: f64 = raw.parse().map_err(|_| CollectError::Parse {
            metric: name.to_string(),
            location: PROC_LOADAVG.to_string(),
            reason: format!("invalid value: {raw}"),
        })?;
        set.insert(name.to_string(), Metric::float(value));
    }

    if let Some((runnable, total)) = fields[3].split_once('/') {
        if let (Ok(runnable), Ok(total)) = (runnable.parse::<u64>(), total.parse::<u64>()) {
            set.insert("procs_runnable".to_string(), Metric::uint64(runnable));
            set.insert("procs_total".to_string(), Metric::uint64(total));
        }
    }

    Ok(set)
}

register_builtin!(LoadavgCollector, "loadavg");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;

    #[test]
    fn parses_typical_content() {
        let set = parse_loadavg("0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert_eq!(set["load_1min"].value, MetricValue::Float(0.52));
        assert_eq!(set["load_15min"].value, MetricValue::Float(0.59));
        assert_eq!(set["procs_runnable"].value, MetricValue::Uint(1));
        assert_eq!(set["procs_total"].value, MetricValue::Uint(467));
    }

    #[test]
    fn rejects_truncated_content() {
        let err = parse_loadavg("0.52 0.58\n").unwrap_err();
        assert!(matches!(err, CollectError::InvalidFormat { .. }));
    }

    #[test]
    fn rejects_garbage_load_value() {
        let err = parse_loadavg("abc 0.58 0.59 1/467 12345").unwrap_err();
        assert!(matches!(err, CollectError::Parse { .. }));
    }

    #[test]
    fn flush_before_collect_is_empty() {
        let collector = LoadavgCollector::default();
        assert!(collector.flush().is_empty());
    }
}
