//! Plugin stdout parsing.
//!
//! A plugin emits either one metric per line, `NAME<TAB>TYPE<TAB>VALUE`
//! with the type codes from [`MetricType`], or a single JSON document of
//! the envelope shape `{name: {_type, _value}, ...}`. Lines that do not
//! parse are logged and skipped; they never fail the plugin.

use tracing::warn;

use crate::metrics::{Metric, MetricSet, MetricType, MetricValue};

/// Parses raw plugin output into a metric set.
///
/// A document starting with `{` is tried as a JSON envelope first and used
/// directly when it parses. Otherwise the output is processed line by line.
pub fn parse_output(plugin: &str, raw: &str) -> MetricSet {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') {
        match serde_json::from_str::<MetricSet>(trimmed) {
            Ok(set) => return set,
            Err(err) => {
                warn!(plugin, error = %err, "plugin emitted invalid JSON document, falling back to line parsing");
            }
        }
    }

    let mut set = MetricSet::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some((name, metric)) => {
                set.insert(name, metric);
            }
            None => {
                warn!(plugin, line, "skipping unparsable plugin output line");
            }
        }
    }
    set
}

/// Parses one `NAME<TAB>TYPE<TAB>VALUE` line.
fn parse_line(line: &str) -> Option<(String, Metric)> {
    let mut fields = line.splitn(3, '\t');
    let name = fields.next()?.trim();
    let code = fields.next()?.trim();
    let value = fields.next()?.trim();
    if name.is_empty() {
        return None;
    }

    let mtype = MetricType::from_code(code)?;
    let parsed = match mtype {
        MetricType::Int32 => MetricValue::Int(i64::from(value.parse::<i32>().ok()?)),
        MetricType::Uint32 => MetricValue::Uint(u64::from(value.parse::<u32>().ok()?)),
        MetricType::Int64 => MetricValue::Int(value.parse::<i64>().ok()?),
        MetricType::Uint64 => MetricValue::Uint(value.parse::<u64>().ok()?),
        MetricType::Float => MetricValue::Float(value.parse::<f64>().ok()?),
        MetricType::Text => MetricValue::Text(value.to_string()),
        MetricType::Histogram | MetricType::CumulativeHistogram => {
            MetricValue::Samples(parse_histogram(value)?)
        }
    };

    Some((name.to_string(), Metric::new(mtype, parsed)))
}

/// Parses a histogram value.
///
/// Two encodings are accepted: bracketed bucket lists `H[1.0]=3,H[2.0]=1`
/// (each bucket value repeated by its count) and bare numeric sample
/// streams `1.0,2.0,1.5`.
fn parse_histogram(value: &str) -> Option<Vec<f64>> {
    let mut samples = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(rest) = part.strip_prefix("H[") {
            let (bucket, count) = rest.split_once("]=")?;
            let bucket: f64 = bucket.parse().ok()?;
            let count: usize = count.parse().ok()?;
            samples.extend(std::iter::repeat(bucket).take(count));
        } else {
            samples.push(part.parse().ok()?);
        }
    }
    if samples.is_empty() {
        return None;
    }
    Some(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tab_lines() {
        let raw = "mem\tI\t42\nload\tn\t0.75\nstate\ts\tidle\n";
        let set = parse_output("test", raw);
        assert_eq!(set.len(), 3);
        assert_eq!(set["mem"].value, MetricValue::Uint(42));
        assert_eq!(set["load"].value, MetricValue::Float(0.75));
        assert_eq!(set["state"].value, MetricValue::Text("idle".into()));
    }

    #[test]
    fn skips_bad_lines_without_failing() {
        let raw = "good\tL\t1\nmissing fields\nbad\tq\t2\nneg\tI\t-1\n";
        let set = parse_output("test", raw);
        assert_eq!(set.len(), 1);
        assert!(set.contains_key("good"));
    }

    #[test]
    fn parses_signed_types() {
        let raw = "delta\ti\t-7\nbig\tl\t-90000000000\n";
        let set = parse_output("test", raw);
        assert_eq!(set["delta"].value, MetricValue::Int(-7));
        assert_eq!(set["big"].value, MetricValue::Int(-90_000_000_000));
    }

    #[test]
    fn parses_bucketed_histogram() {
        let raw = "lat\th\tH[1.0]=3,H[2.0]=1\n";
        let set = parse_output("test", raw);
        assert_eq!(
            set["lat"].value,
            MetricValue::Samples(vec![1.0, 1.0, 1.0, 2.0])
        );
    }

    #[test]
    fn parses_bare_sample_stream() {
        let raw = "lat\tH\t0.5,0.7,0.9\n";
        let set = parse_output("test", raw);
        assert_eq!(set["lat"].mtype, MetricType::CumulativeHistogram);
        assert_eq!(set["lat"].value, MetricValue::Samples(vec![0.5, 0.7, 0.9]));
    }

    #[test]
    fn uses_json_document_directly() {
        let raw = r#"{"mem": {"_type": "I", "_value": 42}, "state": {"_type": "s", "_value": "up"}}"#;
        let set = parse_output("test", raw);
        assert_eq!(set.len(), 2);
        assert_eq!(set["mem"].value, MetricValue::Uint(42));
    }

    #[test]
    fn invalid_json_falls_back_to_lines() {
        let raw = "{not json at all";
        let set = parse_output("test", raw);
        assert!(set.is_empty());
    }

    #[test]
    fn empty_output_is_empty_set() {
        assert!(parse_output("test", "").is_empty());
        assert!(parse_output("test", "\n\n").is_empty());
    }
}
