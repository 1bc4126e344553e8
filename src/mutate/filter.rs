//! `drop` and `keep`: remove series by signature regex.

use crate::mutate::SeriesFilter;
use crate::storage::memory::RetainStats;
use crate::storage::MemoryStorage;

/// Remove every sample whose series signature matches `filter`.
pub fn drop_series(store: &mut MemoryStorage, filter: &SeriesFilter) -> RetainStats {
    let stats = store.retain_samples(|s| !filter.matches(&s.labels));
    tracing::info!(pattern = filter.as_str(), removed = stats.removed, "dropped series");
    stats
}

/// Remove every sample whose series signature does not match `filter`.
pub fn keep_series(store: &mut MemoryStorage, filter: &SeriesFilter) -> RetainStats {
    let stats = store.retain_samples(|s| filter.matches(&s.labels));
    tracing::info!(pattern = filter.as_str(), removed = stats.removed, "kept series");
    stats
}
