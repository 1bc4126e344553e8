//! Boundary formats: exposition text in and out, Prometheus API JSON in.
//!
//! Decoders only produce flat `(labels, value, timestamp)` triples plus help
//! text; all store semantics live in [`crate::mutate`].

pub mod api_json;
pub mod text;

use crate::storage::Labels;

/// One decoded observation. `timestamp` is `None` when the input had none.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub labels: Labels,
    pub value: f64,
    pub timestamp: Option<i64>,
}

/// Everything a decoder recovered from one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub samples: Vec<DecodedSample>,
    /// `(metric name, help text)` in document order.
    pub help: Vec<(String, String)>,
}

/// Render a sample value the way the exposition format spells it.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

/// Parse a sample value, accepting `NaN`, `+Inf`, `-Inf` and `Inf`.
pub fn parse_value(input: &str) -> Option<f64> {
    match input {
        "NaN" => Some(f64::NAN),
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        _ => input.parse().ok(),
    }
}
