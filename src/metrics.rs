//! Metric model and wire envelope.
//!
//! Every metric source in the agent produces a [`MetricSet`]: a mapping from
//! metric name to a typed [`Metric`]. On the wire a metric is the envelope
//! `{"_type": "<code>", "_value": <scalar|list>, "_tags": [..]}` where the
//! type codes mirror the plugin stdout protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Mapping from metric name to metric, as produced by one source's flush.
///
/// `BTreeMap` keeps iteration deterministic, which the merge tie-break and
/// the serialized output both rely on.
pub type MetricSet = BTreeMap<String, Metric>;

/// Closed set of metric types, serialized as one-character codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    /// 32-bit signed integer (`i`).
    #[serde(rename = "i")]
    Int32,
    /// 32-bit unsigned integer (`I`).
    #[serde(rename = "I")]
    Uint32,
    /// 64-bit signed integer (`l`).
    #[serde(rename = "l")]
    Int64,
    /// 64-bit unsigned integer (`L`).
    #[serde(rename = "L")]
    Uint64,
    /// Floating point (`n`).
    #[serde(rename = "n")]
    Float,
    /// Text (`s`).
    #[serde(rename = "s")]
    Text,
    /// Histogram of samples (`h`).
    #[serde(rename = "h")]
    Histogram,
    /// Cumulative histogram (`H`).
    #[serde(rename = "H")]
    CumulativeHistogram,
}

impl MetricType {
    /// Resolves a plugin type code to a metric type.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Self::Int32),
            "I" => Some(Self::Uint32),
            "l" => Some(Self::Int64),
            "L" => Some(Self::Uint64),
            "n" => Some(Self::Float),
            "s" => Some(Self::Text),
            "h" => Some(Self::Histogram),
            "H" => Some(Self::CumulativeHistogram),
            _ => None,
        }
    }

    /// Returns the one-character wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Int32 => "i",
            Self::Uint32 => "I",
            Self::Int64 => "l",
            Self::Uint64 => "L",
            Self::Float => "n",
            Self::Text => "s",
            Self::Histogram => "h",
            Self::CumulativeHistogram => "H",
        }
    }
}

/// A metric value: scalar or sample list.
///
/// Untagged so the wire shape stays `"_value": 42` / `"_value": [1.0, 2.0]`.
/// Variant order matters for deserialization: unsigned is tried before
/// signed, signed before float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Uint(u64),
    Int(i64),
    Float(f64),
    Text(String),
    Samples(Vec<f64>),
}

/// A named, typed value as carried in the agent's output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "_type")]
    pub mtype: MetricType,

    #[serde(rename = "_value")]
    pub value: MetricValue,

    /// Stream tags. Omitted from the wire when empty.
    #[serde(rename = "_tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Metric {
    pub fn new(mtype: MetricType, value: MetricValue) -> Self {
        Self {
            mtype,
            value,
            tags: Vec::new(),
        }
    }

    pub fn uint64(v: u64) -> Self {
        Self::new(MetricType::Uint64, MetricValue::Uint(v))
    }

    pub fn int64(v: i64) -> Self {
        Self::new(MetricType::Int64, MetricValue::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Self::new(MetricType::Float, MetricValue::Float(v))
    }

    pub fn text(v: impl Into<String>) -> Self {
        Self::new(MetricType::Text, MetricValue::Text(v.into()))
    }

    pub fn histogram(samples: Vec<f64>) -> Self {
        Self::new(MetricType::Histogram, MetricValue::Samples(samples))
    }

    /// Appends a stream tag, returning the metric for chaining.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}
