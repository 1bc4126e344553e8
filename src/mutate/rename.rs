//! Rename a metric.

use crate::codec::text::is_valid_metric_name;
use crate::error::{Error, Result};
use crate::storage::{MemoryStorage, METRIC_NAME_LABEL};

/// Move metric `old` to `new`, help text included, and return the number of
/// samples moved.
///
/// Fails without touching the store when `old` does not exist or `new`
/// already does.
pub fn rename(store: &mut MemoryStorage, old: &str, new: &str) -> Result<usize> {
    if !is_valid_metric_name(new) {
        return Err(Error::usage(format!("invalid metric name {new:?}")));
    }
    if store.contains_metric(new) {
        return Err(Error::usage(format!("metric {new:?} already exists")));
    }
    let Some((mut samples, help)) = store.take_bucket(old) else {
        return Err(Error::usage(format!("metric {old:?} not found")));
    };

    for sample in &mut samples {
        sample.labels.insert(METRIC_NAME_LABEL, new);
    }
    let moved = samples.len();
    store.put_bucket(new.to_string(), samples, help);
    tracing::info!(old, new, samples = moved, "renamed metric");
    Ok(moved)
}
