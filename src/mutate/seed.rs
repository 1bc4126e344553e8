//! Backfill synthetic history so range functions have data to work on.

use rand::Rng;

use crate::error::{Error, Result};
use crate::storage::MemoryStorage;

/// Suffixes of metrics treated as monotonic counters.
const COUNTER_SUFFIXES: &[&str] = &["_total", "_count", "_sum", "_bucket"];

/// Relative jitter applied to gauge values.
const GAUGE_JITTER: f64 = 0.1;

/// Counts reported by [`seed_history`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub series: usize,
    pub samples: usize,
}

fn is_counter(name: &str) -> bool {
    COUNTER_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Add `steps` samples to every series of `metric`, spaced `step_ms` apart
/// and stepping backwards from each series' earliest sample.
///
/// Counters get a non-negative progression that increases towards the
/// existing samples; gauges wander within ±10% of the earliest value. All
/// generated timestamps are earlier than the series' existing ones.
pub fn seed_history(
    store: &mut MemoryStorage,
    metric: &str,
    steps: usize,
    step_ms: i64,
    now_ms: i64,
    rng: &mut impl Rng,
) -> Result<SeedReport> {
    if steps == 0 {
        return Err(Error::usage("steps must be at least 1"));
    }
    if step_ms <= 0 {
        return Err(Error::usage("step must be a positive duration"));
    }
    let Some(bucket) = store.bucket(metric) else {
        return Err(Error::usage(format!("metric {metric:?} not found")));
    };

    let counter = is_counter(metric);
    let mut generated = Vec::new();
    let series = store.series_labels(metric);
    for labels in &series {
        let (start_ts, start_value) = bucket
            .iter()
            .filter(|s| &s.labels == labels)
            .min_by_key(|s| s.timestamp)
            .map_or((now_ms, 0.0), |s| (s.timestamp, s.value));

        let mut value = start_value;
        let decrement = if start_value.is_finite() && start_value > 0.0 {
            start_value / (steps as f64 + 1.0)
        } else {
            0.0
        };
        for k in 1..=steps {
            let offset = i64::try_from(k)
                .ok()
                .and_then(|k| k.checked_mul(step_ms))
                .ok_or_else(|| Error::usage("seeded history overflows the timestamp range"))?;
            let timestamp = start_ts
                .checked_sub(offset)
                .ok_or_else(|| Error::usage("seeded history overflows the timestamp range"))?;

            value = if counter {
                (value - decrement * rng.gen_range(0.5..1.5)).max(0.0)
            } else {
                start_value * (1.0 + rng.gen_range(-GAUGE_JITTER..=GAUGE_JITTER))
            };
            generated.push((labels.clone(), value, timestamp));
        }
    }

    let report = SeedReport { series: series.len(), samples: generated.len() };
    // Oldest first so the bucket reads chronologically.
    generated.sort_by_key(|(_, _, ts)| *ts);
    for (labels, value, timestamp) in generated {
        store.add_sample(labels, value, timestamp);
    }

    tracing::info!(metric, series = report.series, samples = report.samples, "seeded history");
    Ok(report)
}
