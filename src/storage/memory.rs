//! In-memory sample store.
//!
//! Samples live in per-metric buckets with no secondary index. Every query
//! scans the buckets it needs and groups samples into series on the fly,
//! which is fine for the interactive, human-sized datasets this tool holds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fnv::FnvHashMap;

use crate::matchers::LabelMatcher;
use crate::storage::{
    Labels, Point, Querier, Sample, Series, SeriesSet, DEFAULT_METRIC_NAME, METRIC_NAME_LABEL,
};

/// Outcome of [`MemoryStorage::retain_samples`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetainStats {
    pub removed: usize,
    pub remaining: usize,
    /// Metrics whose bucket became empty and was deleted.
    pub deleted_metrics: Vec<String>,
}

/// Flat sample storage keyed by metric name, plus per-metric help text.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    buckets: FnvHashMap<String, Vec<Sample>>,
    help: FnvHashMap<String, String>,
}

impl MemoryStorage {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample to the bucket named by its `__name__` label.
    ///
    /// Samples without a name are filed under `query_result`. Identical
    /// `(labels, timestamp)` pairs are kept side by side.
    ///
    /// # Parameters
    ///
    /// - `labels` - Full label set, `__name__` included
    /// - `value` - Sample value
    /// - `timestamp` - Milliseconds since the epoch
    pub fn add_sample(&mut self, mut labels: Labels, value: f64, timestamp: i64) {
        let name = match labels.metric_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                labels.insert(METRIC_NAME_LABEL, DEFAULT_METRIC_NAME);
                DEFAULT_METRIC_NAME.to_string()
            }
        };
        self.buckets.entry(name).or_default().push(Sample::new(labels, value, timestamp));
    }

    /// Metric names, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_metric(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    /// Raw samples of one metric in insertion order.
    ///
    /// # Returns
    ///
    /// `None` when no sample carries the name.
    pub fn bucket(&self, name: &str) -> Option<&[Sample]> {
        self.buckets.get(name).map(Vec::as_slice)
    }

    pub fn bucket_len(&self, name: &str) -> usize {
        self.buckets.get(name).map_or(0, Vec::len)
    }

    pub fn help(&self, name: &str) -> Option<&str> {
        self.help.get(name).map(String::as_str)
    }

    pub fn set_help(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.help.insert(name.into(), text.into());
    }

    /// Total number of stored samples.
    pub fn sample_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Distinct label sets stored under `name`, sorted.
    pub fn series_labels(&self, name: &str) -> Vec<Labels> {
        self.bucket(name)
            .unwrap_or_default()
            .iter()
            .map(|s| &s.labels)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn series_count(&self, name: &str) -> usize {
        self.series_labels(name).len()
    }

    /// Drop everything, help text included.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.help.clear();
    }

    /// Remove a whole bucket and its help text.
    pub(crate) fn take_bucket(&mut self, name: &str) -> Option<(Vec<Sample>, Option<String>)> {
        let samples = self.buckets.remove(name)?;
        Some((samples, self.help.remove(name)))
    }

    /// Install a bucket under `name`, replacing any previous one.
    pub(crate) fn put_bucket(&mut self, name: String, samples: Vec<Sample>, help: Option<String>) {
        if let Some(help) = help {
            self.help.insert(name.clone(), help);
        }
        self.buckets.insert(name, samples);
    }

    /// Keep only samples for which `keep` returns true. Buckets left empty are
    /// deleted together with their help text.
    ///
    /// # Returns
    ///
    /// Removed and remaining sample counts and the deleted metric names,
    /// sorted.
    pub fn retain_samples(&mut self, mut keep: impl FnMut(&Sample) -> bool) -> RetainStats {
        let mut stats = RetainStats::default();
        for (name, samples) in &mut self.buckets {
            let before = samples.len();
            samples.retain(&mut keep);
            stats.removed += before - samples.len();
            stats.remaining += samples.len();
            if samples.is_empty() {
                stats.deleted_metrics.push(name.clone());
            }
        }
        for name in &stats.deleted_metrics {
            self.buckets.remove(name);
            self.help.remove(name);
        }
        stats.deleted_metrics.sort();
        stats
    }
}

impl Querier for MemoryStorage {
    fn select(&self, matchers: &[Arc<dyn LabelMatcher>], min_t: i64, max_t: i64) -> SeriesSet {
        let (name_matchers, label_matchers): (Vec<_>, Vec<_>) =
            matchers.iter().partition(|m| m.is_name_matcher());

        let mut groups: BTreeMap<Labels, Vec<Point>> = BTreeMap::new();
        for (name, samples) in &self.buckets {
            if !name_matchers.iter().all(|m| m.matches_value(Some(name.as_str()))) {
                continue;
            }
            for sample in samples {
                if sample.timestamp < min_t || sample.timestamp > max_t {
                    continue;
                }
                if !label_matchers.iter().all(|m| m.matches(&sample.labels)) {
                    continue;
                }
                let point = Point::new(sample.timestamp, sample.value);
                if let Some(points) = groups.get_mut(&sample.labels) {
                    points.push(point);
                } else {
                    groups.insert(sample.labels.clone(), vec![point]);
                }
            }
        }

        groups
            .into_iter()
            .map(|(labels, mut points)| {
                // Stable: duplicate timestamps keep insertion order.
                points.sort_by_key(|p| p.timestamp);
                Series { labels, points }
            })
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn label_names(&self) -> Vec<String> {
        self.buckets
            .values()
            .flatten()
            .flat_map(|s| s.labels.names())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn label_values(&self, name: &str) -> Vec<String> {
        self.buckets
            .values()
            .flatten()
            .filter_map(|s| s.labels.get(name))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::matchers::{anchored_regex, AbsentMatcher, EqualMatcher, NotEqualMatcher, RegexMatcher};

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().copied().collect()
    }

    fn populated() -> MemoryStorage {
        let mut storage = MemoryStorage::new();
        let get = labels(&[("__name__", "http_requests_total"), ("method", "get")]);
        let post = labels(&[("__name__", "http_requests_total"), ("method", "post")]);
        storage.add_sample(get.clone(), 3.0, 2000);
        storage.add_sample(post, 1.0, 1000);
        storage.add_sample(get, 1.0, 1000);
        storage.add_sample(labels(&[("__name__", "up"), ("job", "api")]), 1.0, 1000);
        storage
    }

    #[test]
    fn test_add_sample_defaults_name() {
        let mut storage = MemoryStorage::new();
        storage.add_sample(labels(&[("job", "api")]), 1.0, 0);

        let bucket = storage.bucket(DEFAULT_METRIC_NAME).expect("bucket exists");
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].labels.metric_name(), Some(DEFAULT_METRIC_NAME));
    }

    #[test]
    fn test_select_groups_and_sorts() {
        let storage = populated();
        let name: Arc<dyn LabelMatcher> =
            Arc::new(EqualMatcher::new("__name__", "http_requests_total"));

        let series: Vec<Series> = storage.select(&[name], i64::MIN, i64::MAX).collect();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].labels.get("method"), Some("get"));
        assert_eq!(series[0].points, vec![Point::new(1000, 1.0), Point::new(2000, 3.0)]);
        assert_eq!(series[1].labels.get("method"), Some("post"));
        assert_eq!(series[1].points.len(), 1);
    }

    #[test]
    fn test_select_keeps_duplicates_in_insertion_order() {
        let mut storage = MemoryStorage::new();
        let up = labels(&[("__name__", "up")]);
        storage.add_sample(up.clone(), 1.0, 1000);
        storage.add_sample(up.clone(), 2.0, 1000);
        storage.add_sample(up, 0.5, 500);

        let series: Vec<Series> = storage.select(&[], i64::MIN, i64::MAX).collect();
        assert_eq!(series.len(), 1);
        let values: Vec<f64> = series[0].points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![0.5, 1.0, 2.0]);
    }

    #[test]
    fn test_select_clips_window_and_omits_empty_series() {
        let storage = populated();
        let series: Vec<Series> = storage.select(&[], 1500, 2500).collect();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].points, vec![Point::new(2000, 3.0)]);
    }

    #[test]
    fn test_select_with_label_matchers() {
        let storage = populated();

        let matcher: Arc<dyn LabelMatcher> = Arc::new(NotEqualMatcher::new("method", "get"));
        let series: Vec<Series> = storage.select(&[matcher], i64::MIN, i64::MAX).collect();
        // post series plus `up`, which has no method label at all
        assert_eq!(series.len(), 2);

        let matcher: Arc<dyn LabelMatcher> = Arc::new(AbsentMatcher::new("method"));
        let series: Vec<Series> = storage.select(&[matcher], i64::MIN, i64::MAX).collect();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels.metric_name(), Some("up"));

        let regex = anchored_regex("http_.*").expect("valid regex");
        let matcher: Arc<dyn LabelMatcher> = Arc::new(RegexMatcher::new("__name__", regex));
        assert_eq!(storage.select(&[matcher], i64::MIN, i64::MAX).count(), 2);
    }

    #[test]
    fn test_lookup_miss_is_empty() {
        let storage = populated();
        let matcher: Arc<dyn LabelMatcher> = Arc::new(EqualMatcher::new("__name__", "missing"));
        assert_eq!(storage.select(&[matcher], i64::MIN, i64::MAX).count(), 0);
        assert!(storage.label_values("missing").is_empty());
        assert!(storage.bucket("missing").is_none());
    }

    #[test]
    fn test_label_names_and_values() {
        let storage = populated();
        assert_eq!(storage.label_names(), vec!["__name__", "job", "method"]);
        assert_eq!(storage.label_values("method"), vec!["get", "post"]);
        assert_eq!(storage.label_values("__name__"), vec!["http_requests_total", "up"]);
    }

    #[test]
    fn test_retain_deletes_empty_buckets() {
        let mut storage = populated();
        storage.set_help("up", "target is up");

        let stats = storage.retain_samples(|s| s.labels.metric_name() != Some("up"));
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.remaining, 3);
        assert_eq!(stats.deleted_metrics, vec!["up"]);
        assert!(!storage.contains_metric("up"));
        assert_eq!(storage.help("up"), None);
    }
}
