//! statsd wire-format parsing.
//!
//! One metric per line: `name:value|type[|@sample_rate]` with type one of
//! `c` (counter), `g` (gauge), `h` (histogram), `ms` (timer, treated as a
//! histogram), `s` (set), `t` (text). Packets may carry multiple lines.

use thiserror::Error;

/// Per-line parse failure. Malformed lines are logged and skipped; they
/// never affect the listener or the other lines of the packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty metric name")]
    EmptyName,

    #[error("missing ':' value separator")]
    MissingValue,

    #[error("missing '|' type separator")]
    MissingType,

    #[error("invalid value '{0}'")]
    InvalidValue(String),

    #[error("unknown metric type '{0}'")]
    UnknownType(String),

    #[error("invalid sample rate '{0}'")]
    InvalidRate(String),
}

/// A parsed statsd sample, before routing and accumulation.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// Counter increment. A `+`/`-` prefix means a signed delta; the value
    /// is already scaled by the sample rate.
    Counter(f64),
    /// Gauge observation.
    Gauge(f64),
    /// Histogram (or timer) observation.
    Histogram(f64),
    /// Set member.
    Set(String),
    /// Text value; last write wins.
    Text(String),
}

/// A routed line: metric name plus its sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub name: String,
    pub sample: Sample,
}

/// Parses a single wire line.
pub fn parse_line(line: &str) -> Result<Line, ParseError> {
    let (name, rest) = line.split_once(':').ok_or(ParseError::MissingValue)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ParseError::EmptyName);
    }

    let mut fields = rest.split('|');
    let raw_value = fields.next().unwrap_or_default().trim();
    let type_code = fields.next().ok_or(ParseError::MissingType)?.trim();

    let mut sample_rate = 1.0_f64;
    if let Some(rate_field) = fields.next() {
        let rate = rate_field
            .strip_prefix('@')
            .ok_or_else(|| ParseError::InvalidRate(rate_field.to_string()))?;
        sample_rate = rate
            .parse::<f64>()
            .ok()
            .filter(|r| *r > 0.0 && *r <= 1.0)
            .ok_or_else(|| ParseError::InvalidRate(rate_field.to_string()))?;
    }

    let numeric = || {
        raw_value
            .parse::<f64>()
            .map_err(|_| ParseError::InvalidValue(raw_value.to_string()))
    };

    let sample = match type_code {
        "c" => Sample::Counter(numeric()? / sample_rate),
        "g" => Sample::Gauge(numeric()?),
        "h" | "ms" => Sample::Histogram(numeric()?),
        "s" => Sample::Set(raw_value.to_string()),
        "t" => Sample::Text(raw_value.to_string()),
        other => return Err(ParseError::UnknownType(other.to_string())),
    };

    Ok(Line {
        name: name.to_string(),
        sample,
    })
}
