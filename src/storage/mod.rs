//! Sample storage and the read-only query boundary.
//!
//! Samples are stored flat, bucketed by metric name. A series (unique label
//! set) only exists once a query groups the samples of a bucket together.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use memory::MemoryStorage;

use crate::matchers::LabelMatcher;

/// Reserved label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Metric name given to imported samples that carry none.
pub const DEFAULT_METRIC_NAME: &str = "query_result";

/// Lazily consumed sequence of series produced by [`Querier::select`].
pub type SeriesSet = std::vec::IntoIter<Series>;

/// Read-only view of the store handed to the query engine.
///
/// There is no write path through this trait.
pub trait Querier {
    /// Resolve series whose labels satisfy every matcher, with samples clipped
    /// to `[min_t, max_t]` (inclusive, milliseconds).
    ///
    /// Series come back in a deterministic order and each series' points are
    /// sorted ascending by timestamp. Points sharing a timestamp keep
    /// insertion order.
    fn select(&self, matchers: &[Arc<dyn LabelMatcher>], min_t: i64, max_t: i64) -> SeriesSet;

    /// All label names present in the store, sorted.
    fn label_names(&self) -> Vec<String>;

    /// All values of label `name`, sorted. Empty if the label is unknown.
    fn label_values(&self, name: &str) -> Vec<String>;
}

/// A sorted set of label name/value pairs.
///
/// Equality and ordering are structural. Use [`Labels::signature`] only for
/// display and regex-based filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Value of `__name__`, if set.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Copy of these labels minus `__name__`.
    pub fn without_name(&self) -> Self {
        let mut labels = self.clone();
        labels.remove(METRIC_NAME_LABEL);
        labels
    }

    /// Keep only the labels for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|k, _| keep(k));
    }

    /// Render the non-name labels as `{a="x",b="y"}`, or an empty string when
    /// there are none.
    pub fn braces(&self) -> String {
        let body = self
            .iter()
            .filter(|(name, _)| *name != METRIC_NAME_LABEL)
            .map(|(name, value)| format!("{name}=\"{}\"", escape_label_value(value)))
            .collect::<Vec<_>>()
            .join(",");
        if body.is_empty() {
            body
        } else {
            format!("{{{body}}}")
        }
    }

    /// Canonical series signature: metric name followed by the sorted,
    /// escaped non-name labels, e.g. `up{instance="a",job="node"}`.
    pub fn signature(&self) -> String {
        format!("{}{}", self.metric_name().unwrap_or_default(), self.braces())
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.metric_name().is_none() && self.braces().is_empty() {
            return f.write_str("{}");
        }
        f.write_str(&self.signature())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Escape a label value for the exposition format and series signatures.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

/// One stored observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Labels,
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Sample {
    pub fn new(labels: Labels, value: f64, timestamp: i64) -> Self {
        Self { labels, value, timestamp }
    }
}

/// A (timestamp, value) pair inside a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: i64,
    pub value: f64,
}

impl Point {
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A label set with its time-ordered points.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub points: Vec<Point>,
}

impl Series {
    pub const fn new(labels: Labels) -> Self {
        Self { labels, points: Vec::new() }
    }

    /// Points in `[start, end]` (inclusive).
    pub fn points_in_range(&self, start: i64, end: i64) -> impl Iterator<Item = &Point> {
        self.points.iter().filter(move |p| p.timestamp >= start && p.timestamp <= end)
    }
}
