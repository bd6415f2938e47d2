//! Builtin collector for /proc/meminfo.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::collector::{CollectError, CollectResult, Collector};
use crate::metrics::{Metric, MetricSet};
use crate::register_builtin;

const PROC_MEMINFO: &str = "/proc/meminfo";

/// The meminfo rows surfaced as metrics, paired with their metric names.
/// Values are reported in kB as the kernel publishes them.
const FIELDS: &[(&str, &str)] = &[
    ("MemTotal", "total_kb"),
    ("MemFree", "free_kb"),
    ("MemAvailable", "available_kb"),
    ("Buffers", "buffers_kb"),
    ("Cached", "cached_kb"),
    ("SwapTotal", "swap_total_kb"),
    ("SwapFree", "swap_free_kb"),
];

/// Samples system memory usage from `/proc/meminfo`.
#[derive(Debug, Default)]
pub struct MeminfoCollector {
    metrics: Mutex<MetricSet>,
    running: AtomicBool,
}

#[async_trait]
impl Collector for MeminfoCollector {
    fn id(&self) -> &str {
        "meminfo"
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
        self.metrics.lock().expect("meminfo lock poisoned").clone()
    }
}

impl MeminfoCollector {
    #[cfg(target_os = "linux")]
    async fn sample(&self) -> CollectResult<()> {
        let content = tokio::fs::read_to_string(PROC_MEMINFO)
            .await
            .map_err(|source| CollectError::FileRead {
                path: PROC_MEMINFO.to_string(),
                source,
            })?;
        let set = parse_meminfo(&content)?;
        *self.metrics.lock().expect("meminfo lock poisoned") = set;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn sample(&self) -> CollectResult<()> {
        Err(CollectError::Unsupported(
            "meminfo requires /proc".to_string(),
        ))
    }
}

/// Parses `/proc/meminfo` content, keeping only the rows in [`FIELDS`].
///
/// Row format: `MemTotal:       16344536 kB`. Rows that are absent on a
/// given kernel are simply omitted from the result.
fn parse_meminfo(content: &str) -> CollectResult<MetricSet> {
    let mut set = MetricSet::new();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some((_, name)) = FIELDS.iter().find(|(k, _)| *k == key) else {
            continue;
        };
        let raw = rest.trim().trim_end_matches(" kB").trim();
        let value: u64 = raw.parse().map_err(|_| CollectError::Parse {
            metric: name.to_string(),
            location: PROC_MEMINFO.to_string(),
            reason: format!("invalid value: {raw}"),
        })?;
        set.insert(name.to_string(), Metric::uint64(value));
    }

    if set.is_empty() {
        return Err(CollectError::InvalidFormat {
            location: PROC_MEMINFO.to_string(),
            reason: "no recognized rows".to_string(),
        });
    }
    Ok(set)
}

register_builtin!(MeminfoCollector, "meminfo");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;

    const SAMPLE: &str = "MemTotal:       16344536 kB\n\
                          MemFree:         1234567 kB\n\
                          MemAvailable:    8765432 kB\n\
                          Buffers:          345678 kB\n\
                          Cached:          4567890 kB\n\
                          SwapCached:            0 kB\n\
                          SwapTotal:       2097148 kB\n\
                          SwapFree:        2097148 kB\n";

    #[test]
    fn parses_recognized_rows() {
        let set = parse_meminfo(SAMPLE).unwrap();
        assert_eq!(set["total_kb"].value, MetricValue::Uint(16_344_536));
        assert_eq!(set["available_kb"].value, MetricValue::Uint(8_765_432));
        assert_eq!(set["swap_free_kb"].value, MetricValue::Uint(2_097_148));
        // SwapCached is not a surfaced field
        assert_eq!(set.len(), 7);
    }

    #[test]
    fn tolerates_missing_rows() {
        let set = parse_meminfo("MemTotal: 100 kB\n").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn rejects_content_without_recognized_rows() {
        let err = parse_meminfo("Bogus: 1 kB\n").unwrap_err();
        assert!(matches!(err, CollectError::InvalidFormat { .. }));
    }

    #[test]
    fn rejects_non_numeric_value() {
        let err = parse_meminfo("MemTotal: lots kB\n").unwrap_err();
        assert!(matches!(err, CollectError::Parse { .. }));
    }
}
