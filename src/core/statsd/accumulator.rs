//! Metric accumulation stores for the statsd listener.
//!
//! Two independent instances exist at runtime: the host store (embedded in
//! the agent's own output) and the group store (submitted separately on a
//! timer). Accumulation is totally ordered per metric name; the store's
//! mutex is released before any serialization happens.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::statsd::parser::Sample;
use crate::metrics::{Metric, MetricSet};

/// Operator applied to gauge observations within a submission window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GaugeOp {
    Average,
    Sum,
    Min,
    Max,
}

/// Operator applied to counter totals and set cardinalities across a
/// submission window: the raw total, or the mean over received updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowOp {
    Sum,
    Average,
}

/// Accumulation state for one metric name.
#[derive(Debug)]
enum Accum {
    Counter {
        total: f64,
        updates: u64,
    },
    Gauge {
        /// Observations of the current window.
        samples: Vec<f64>,
        /// Value computed at the previous flush; reported when the
        /// current window is empty.
        last: Option<f64>,
    },
    Set {
        members: HashSet<String>,
        updates: u64,
    },
    Histogram(Vec<f64>),
    Text(String),
}

/// One accumulation store.
///
/// `gauge_op = None` selects host semantics: gauges keep the last observed
/// value instead of applying a window operator.
#[derive(Debug)]
pub struct MetricStore {
    counter_op: WindowOp,
    gauge_op: Option<GaugeOp>,
    set_op: WindowOp,
    inner: Mutex<HashMap<String, Accum>>,
}

impl MetricStore {
    /// Host store: counters sum, gauges keep last, sets sum.
    pub fn host() -> Self {
        Self::new(WindowOp::Sum, None, WindowOp::Sum)
    }

    pub fn new(counter_op: WindowOp, gauge_op: Option<GaugeOp>, set_op: WindowOp) -> Self {
        Self {
            counter_op,
            gauge_op,
            set_op,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Folds one sample into the store. A sample whose type conflicts with
    /// the name's existing accumulator resets the accumulator to the new
    /// type (last writer decides the type, as the wire format allows).
    pub fn record(&self, name: &str, sample: Sample) {
        let mut inner = self.inner.lock().expect("statsd store lock poisoned");
        match sample {
            Sample::Counter(v) => {
                match inner.get_mut(name) {
                    Some(Accum::Counter { total, updates }) => {
                        *total += v;
                        *updates += 1;
                    }
                    _ => {
                        inner.insert(
                            name.to_string(),
                            Accum::Counter {
                                total: v,
                                updates: 1,
                            },
                        );
                    }
                };
            }
            Sample::Gauge(v) => match inner.get_mut(name) {
                Some(Accum::Gauge { samples, .. }) => {
                    if self.gauge_op.is_none() {
                        samples.clear();
                    }
                    samples.push(v);
                }
                _ => {
                    inner.insert(
                        name.to_string(),
                        Accum::Gauge {
                            samples: vec![v],
                            last: None,
                        },
                    );
                }
            },
            Sample::Histogram(v) => match inner.get_mut(name) {
                Some(Accum::Histogram(samples)) => samples.push(v),
                _ => {
                    inner.insert(name.to_string(), Accum::Histogram(vec![v]));
                }
            },
            Sample::Set(member) => match inner.get_mut(name) {
                Some(Accum::Set { members, updates }) => {
                    members.insert(member);
                    *updates += 1;
                }
                _ => {
                    let mut members = HashSet::new();
                    members.insert(member);
                    inner.insert(name.to_string(), Accum::Set { members, updates: 1 });
                }
            },
            Sample::Text(v) => {
                inner.insert(name.to_string(), Accum::Text(v));
            }
        }
    }

    /// Snapshots the store into a metric set and resets per the
    /// accumulation contract: counters and sets reset to zero (and stay
    /// visible at zero), gauges retain their last computed value,
    /// histograms and text reset away entirely.
    pub fn flush(&self) -> MetricSet {
        let mut inner = self.inner.lock().expect("statsd store lock poisoned");
        let mut out = MetricSet::new();

        inner.retain(|name, accum| match accum {
            Accum::Counter { total, updates } => {
                let value = apply_window(self.counter_op, *total, *updates);
                out.insert(name.clone(), counter_metric(value));
                *total = 0.0;
                *updates = 0;
                true
            }
            Accum::Gauge { samples, last } => {
                let value = if samples.is_empty() {
                    last.unwrap_or(0.0)
                } else {
                    match self.gauge_op {
                        None => samples.last().copied().unwrap_or(0.0),
                        Some(op) => apply_gauge(op, samples),
                    }
                };
                out.insert(name.clone(), Metric::float(value));
                samples.clear();
                *last = Some(value);
                true
            }
            Accum::Set { members, updates } => {
                let value = apply_window(self.set_op, members.len() as f64, *updates);
                out.insert(name.clone(), counter_metric(value));
                members.clear();
                *updates = 0;
                true
            }
            Accum::Histogram(samples) => {
                out.insert(name.clone(), Metric::histogram(samples.clone()));
                false
            }
            Accum::Text(v) => {
                out.insert(name.clone(), Metric::text(v.clone()));
                false
            }
        });

        out
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("statsd store lock poisoned").is_empty()
    }
}

fn apply_window(op: WindowOp, total: f64, updates: u64) -> f64 {
    match op {
        WindowOp::Sum => total,
        WindowOp::Average if updates > 0 => total / updates as f64,
        WindowOp::Average => 0.0,
    }
}

fn apply_gauge(op: GaugeOp, samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    match op {
        GaugeOp::Average => samples.iter().sum::<f64>() / samples.len() as f64,
        GaugeOp::Sum => samples.iter().sum(),
        GaugeOp::Min => samples.iter().copied().fold(f64::INFINITY, f64::min),
        GaugeOp::Max => samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

/// Counter/set flush value: unsigned when non-negative and integral, the
/// signed or float fallback otherwise.
fn counter_metric(value: f64) -> Metric {
    if value.fract() == 0.0 {
        if value >= 0.0 {
            Metric::uint64(value as u64)
        } else {
            Metric::int64(value as i64)
        }
    } else {
        Metric::float(value)
    }
}
