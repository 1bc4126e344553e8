//! Operators that change the contents of a [`MemoryStorage`].
//!
//! [`MemoryStorage`]: crate::storage::MemoryStorage

mod filter;
mod load;
mod rename;
mod save;
mod seed;

use std::fmt;

use regex::Regex;

pub use filter::{drop_series, keep_series};
pub use load::{load, LoadReport};
pub use rename::rename;
pub use save::{save, SaveOutput};
pub use seed::{seed_history, SeedReport};

use crate::clock::parse_instant;
use crate::error::{Error, Result};
use crate::storage::Labels;

/// How timestamps are treated when samples enter or leave the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampMode {
    /// Leave timestamps as they are.
    #[default]
    Keep,
    /// Rewrite every timestamp to "now".
    Remove,
    /// Shift timestamps so the newest one lands on the given instant,
    /// preserving the spacing between samples.
    Set(i64),
}

impl TimestampMode {
    /// Parse `keep`, `remove`, or an instant accepted by [`parse_instant`].
    pub fn parse(input: &str, now_ms: i64) -> Result<Self> {
        match input.trim() {
            "keep" => Ok(Self::Keep),
            "remove" => Ok(Self::Remove),
            other => parse_instant(other, now_ms).map(Self::Set),
        }
    }

    /// Rewrite `timestamps` in place. `Set` anchors the shift on the largest
    /// timestamp in the slice.
    ///
    /// Fails without touching `timestamps` when a shifted value does not fit
    /// in an `i64`.
    pub(crate) fn apply(self, timestamps: &mut [i64], now_ms: i64) -> Result<()> {
        match self {
            Self::Keep => {}
            Self::Remove => timestamps.fill(now_ms),
            Self::Set(target) => {
                let Some(newest) = timestamps.iter().copied().max() else {
                    return Ok(());
                };
                let overflow = || {
                    Error::usage(format!(
                        "cannot shift timestamps to {target}: offset from {newest} is out of range"
                    ))
                };
                let delta = target.checked_sub(newest).ok_or_else(overflow)?;
                let shifted: Vec<i64> = timestamps
                    .iter()
                    .map(|ts| ts.checked_add(delta))
                    .collect::<Option<_>>()
                    .ok_or_else(overflow)?;
                timestamps.copy_from_slice(&shifted);
            }
        }
        Ok(())
    }
}

impl fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keep => f.write_str("keep"),
            Self::Remove => f.write_str("remove"),
            Self::Set(at) => write!(f, "set({})", crate::clock::format_ms(*at)),
        }
    }
}

/// Regex over series signatures, used by the human-facing filter commands.
///
/// The pattern is searched, not anchored: `http_` matches every series whose
/// signature contains it.
#[derive(Debug, Clone)]
pub struct SeriesFilter(Regex);

impl SeriesFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|e| Error::usage(format!("invalid series regex {pattern:?}: {e}")))
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.is_match(&labels.signature())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_mode() {
        assert_eq!(TimestampMode::parse("keep", 0).expect("valid"), TimestampMode::Keep);
        assert_eq!(TimestampMode::parse("remove", 0).expect("valid"), TimestampMode::Remove);
        assert_eq!(TimestampMode::parse("now-1m", 120_000).expect("valid"), TimestampMode::Set(60_000));
        assert!(TimestampMode::parse("later", 0).is_err());
    }

    #[test]
    fn test_set_preserves_spacing() {
        let mut ts = vec![1_000, 4_000, 2_500];
        TimestampMode::Set(10_000).apply(&mut ts, 0).expect("in range");
        assert_eq!(ts, vec![7_000, 10_000, 8_500]);
    }

    #[test]
    fn test_set_out_of_range_leaves_timestamps() {
        let mut ts = vec![i64::MIN];
        let err = TimestampMode::Set(1_000).apply(&mut ts, 0).expect_err("overflows");
        assert!(matches!(err, Error::Usage(_)));
        assert_eq!(ts, vec![i64::MIN]);

        let mut ts = vec![i64::MIN, 0];
        assert!(TimestampMode::Set(-1).apply(&mut ts, 0).is_err());
        assert_eq!(ts, vec![i64::MIN, 0]);

        let mut ts = vec![i64::MIN];
        TimestampMode::Remove.apply(&mut ts, 5).expect("remove never overflows");
        assert_eq!(ts, vec![5]);
    }

    #[test]
    fn test_series_filter_searches_signature() {
        let labels: Labels = [("__name__", "http_requests_total"), ("code", "500")].into_iter().collect();
        assert!(SeriesFilter::new("code=\"5..\"").expect("valid").matches(&labels));
        assert!(SeriesFilter::new("^http_").expect("valid").matches(&labels));
        assert!(!SeriesFilter::new("^up").expect("valid").matches(&labels));
        assert!(matches!(SeriesFilter::new("("), Err(Error::Usage(_))));
    }
}
