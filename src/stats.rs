//! Process-wide operational stats.
//!
//! Components record last-run timestamps, durations and counters here; the
//! whole map is served by `GET /stats`. One component, one mutex; nothing
//! global, the handle is passed around as an `Arc`.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Grouped key/value stats store.
///
/// The lock is held only for map mutation; values are plain JSON so the
/// `/stats` handler can serialize a snapshot without knowing the shapes
/// components record.
#[derive(Debug, Default)]
pub struct AppStats {
    inner: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl AppStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `group.key` to an arbitrary JSON value.
    pub fn set(&self, group: &str, key: &str, value: impl Into<Value>) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Sets `group.key` to the current UTC timestamp (RFC 3339).
    pub fn set_now(&self, group: &str, key: &str) {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("unknown"));
        self.set(group, key, ts);
    }

    /// Sets `group.key` to a duration in fractional milliseconds.
    pub fn set_duration(&self, group: &str, key: &str, d: Duration) {
        self.set(group, key, d.as_secs_f64() * 1000.0);
    }

    /// Increments the counter at `group.key`, creating it at 1.
    pub fn increment(&self, group: &str, key: &str) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        let slot = inner
            .entry(group.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| Value::from(0u64));
        let next = slot.as_u64().unwrap_or(0) + 1;
        *slot = Value::from(next);
    }

    /// Clones the current contents for serialization.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        self.inner.lock().expect("stats lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_snapshot() {
        let stats = AppStats::new();
        stats.set("builtins", "last_duration", 12.5);
        stats.set("agent", "version", "0.3.1");

        let snap = stats.snapshot();
        assert_eq!(snap["builtins"]["last_duration"], 12.5);
        assert_eq!(snap["agent"]["version"], "0.3.1");
    }

    #[test]
    fn increment_counts_from_zero() {
        let stats = AppStats::new();
        stats.increment("plugins", "scans");
        stats.increment("plugins", "scans");
        assert_eq!(stats.snapshot()["plugins"]["scans"], 2);
    }

    #[test]
    fn set_now_writes_a_timestamp() {
        let stats = AppStats::new();
        stats.set_now("builtins", "last_start");
        let snap = stats.snapshot();
        let ts = snap["builtins"]["last_start"].as_str().unwrap();
        assert!(ts.contains('T'), "expected RFC 3339 timestamp, got {ts}");
    }
}
