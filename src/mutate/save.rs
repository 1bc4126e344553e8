//! Export the store as exposition text.

use crate::codec::text::encode_metric;
use crate::error::Result;
use crate::mutate::{SeriesFilter, TimestampMode};
use crate::storage::{MemoryStorage, Sample};

/// Encoded store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOutput {
    pub text: String,
    pub samples: usize,
    pub metrics: usize,
}

/// Encode the store, optionally restricted to series matching `filter`.
///
/// Metrics are written in name order, samples grouped by series and sorted by
/// timestamp. The store itself is not modified.
///
/// # Errors
///
/// Fails with [`Error::Usage`] when `mode` would shift a timestamp out of the
/// `i64` range.
///
/// [`Error::Usage`]: crate::Error::Usage
pub fn save(
    store: &MemoryStorage,
    filter: Option<&SeriesFilter>,
    mode: TimestampMode,
    now_ms: i64,
) -> Result<SaveOutput> {
    let mut families: Vec<(String, Vec<&Sample>)> = Vec::new();
    for name in store.metric_names() {
        let mut samples: Vec<&Sample> = store
            .bucket(&name)
            .unwrap_or_default()
            .iter()
            .filter(|s| filter.map_or(true, |f| f.matches(&s.labels)))
            .collect();
        if samples.is_empty() {
            continue;
        }
        samples.sort_by(|a, b| a.labels.cmp(&b.labels).then(a.timestamp.cmp(&b.timestamp)));
        families.push((name, samples));
    }

    let mut timestamps: Vec<i64> =
        families.iter().flat_map(|(_, s)| s.iter().map(|s| s.timestamp)).collect();
    mode.apply(&mut timestamps, now_ms)?;

    let mut output = SaveOutput { metrics: families.len(), ..SaveOutput::default() };
    let mut timestamps = timestamps.into_iter();
    for (name, samples) in &families {
        output.samples += samples.len();
        encode_metric(
            &mut output.text,
            name,
            store.help(name),
            samples.iter().zip(timestamps.by_ref()).map(|(s, ts)| (&s.labels, s.value, ts)),
        );
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::text;
    use crate::mutate::load;

    fn store() -> MemoryStorage {
        let doc = "# HELP up Target up.\nup{job=\"b\"} 0 2000\nup{job=\"a\"} 1 1000\nup{job=\"a\"} 1 3000\nerrors 4 1500\n";
        let mut store = MemoryStorage::new();
        load(&mut store, text::decode(doc).expect("valid"), None, TimestampMode::Keep, 0).expect("loaded");
        store
    }

    #[test]
    fn test_save_orders_and_formats() {
        let out = save(&store(), None, TimestampMode::Keep, 0).expect("saved");
        assert_eq!(out.samples, 4);
        assert_eq!(out.metrics, 2);
        assert_eq!(
            out.text,
            "errors 4 1500\n# HELP up Target up.\nup{job=\"a\"} 1 1000\nup{job=\"a\"} 1 3000\nup{job=\"b\"} 0 2000\n"
        );
    }

    #[test]
    fn test_save_filter_and_set() {
        let filter = SeriesFilter::new("job=\"a\"").expect("valid");
        let out = save(&store(), Some(&filter), TimestampMode::Set(10_000), 0).expect("saved");
        assert_eq!(out.text, "# HELP up Target up.\nup{job=\"a\"} 1 8000\nup{job=\"a\"} 1 10000\n");
    }

    #[test]
    fn test_save_remove_uses_now() {
        let filter = SeriesFilter::new("^errors").expect("valid");
        let out = save(&store(), Some(&filter), TimestampMode::Remove, 42).expect("saved");
        assert_eq!(out.text, "errors 4 42\n");
    }

    #[test]
    fn test_save_out_of_range_shift_fails() {
        let mut store = store();
        store.add_sample([("__name__", "up")].into_iter().collect(), 1.0, i64::MIN);
        let err = save(&store, None, TimestampMode::Set(0), 0).expect_err("shift overflows");
        assert!(matches!(err, crate::Error::Usage(_)));
        assert!(save(&store, None, TimestampMode::Keep, 0).is_ok());
    }
}
