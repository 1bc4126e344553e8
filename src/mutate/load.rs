//! Merge decoded samples into the store.

use std::collections::BTreeSet;

use crate::codec::Decoded;
use crate::error::Result;
use crate::mutate::{SeriesFilter, TimestampMode};
use crate::storage::{MemoryStorage, DEFAULT_METRIC_NAME, METRIC_NAME_LABEL};

/// Counts reported by [`load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Samples inserted.
    pub loaded: usize,
    /// Samples rejected by the series filter.
    pub filtered_out: usize,
    /// Distinct metrics that received samples.
    pub metrics: usize,
}

/// Append `decoded` to the store.
///
/// Samples whose signature does not match `filter` are discarded. The
/// timestamp mode only rewrites samples inserted by this call; samples already
/// in the store are never touched. Samples decoded without a timestamp get
/// `now_ms`. Help text is recorded for metrics that have no help yet.
///
/// # Errors
///
/// Returns [`Error::Usage`] when the timestamp mode would shift a sample out
/// of the `i64` range. Nothing is inserted in that case.
///
/// [`Error::Usage`]: crate::Error::Usage
pub fn load(
    store: &mut MemoryStorage,
    decoded: Decoded,
    filter: Option<&SeriesFilter>,
    mode: TimestampMode,
    now_ms: i64,
) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    let mut accepted = Vec::with_capacity(decoded.samples.len());
    let mut timestamps = Vec::with_capacity(decoded.samples.len());

    for sample in decoded.samples {
        let mut labels = sample.labels;
        if !labels.metric_name().is_some_and(|name| !name.is_empty()) {
            labels.insert(METRIC_NAME_LABEL, DEFAULT_METRIC_NAME);
        }

        if filter.is_some_and(|f| !f.matches(&labels)) {
            report.filtered_out += 1;
            continue;
        }
        accepted.push((labels, sample.value));
        timestamps.push(sample.timestamp.unwrap_or(now_ms));
    }

    mode.apply(&mut timestamps, now_ms)?;

    let mut metrics = BTreeSet::new();
    for ((labels, value), timestamp) in accepted.into_iter().zip(timestamps) {
        if let Some(name) = labels.metric_name() {
            if !metrics.contains(name) {
                metrics.insert(name.to_string());
            }
        }
        store.add_sample(labels, value, timestamp);
        report.loaded += 1;
    }
    report.metrics = metrics.len();

    for (name, text) in decoded.help {
        if store.contains_metric(&name) && store.help(&name).is_none() {
            store.set_help(name, text);
        }
    }

    tracing::info!(
        loaded = report.loaded,
        filtered_out = report.filtered_out,
        metrics = report.metrics,
        %mode,
        "loaded samples"
    );
    Ok(report)
}
