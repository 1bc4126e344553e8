//! Evaluation clock and instant parsing.
//!
//! Every query and rule pass asks the [`Clock`] for "now". Pinning the clock
//! makes a whole session reproducible until it is unpinned.

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{Error, Result};

const NANOS_PER_MILLI: i128 = 1_000_000;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn wall_clock_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / NANOS_PER_MILLI) as i64
}

/// Session clock with an optional pinned instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Clock {
    pinned: Option<i64>,
}

impl Clock {
    /// An unpinned clock following wall-clock time.
    pub const fn new() -> Self {
        Self { pinned: None }
    }

    /// A clock pinned at `at_ms`.
    pub const fn pinned_at(at_ms: i64) -> Self {
        Self { pinned: Some(at_ms) }
    }

    pub fn pin(&mut self, at_ms: i64) {
        self.pinned = Some(at_ms);
    }

    pub fn unpin(&mut self) {
        self.pinned = None;
    }

    pub const fn pinned(&self) -> Option<i64> {
        self.pinned
    }

    /// The pinned instant, or wall-clock time when unpinned.
    pub fn now_ms(&self) -> i64 {
        self.pinned.unwrap_or_else(wall_clock_ms)
    }
}

/// Parse an instant into milliseconds.
///
/// Supports:
/// - "now", "now-15m", "now+1h30m" relative to `now_ms`
/// - RFC3339, e.g. "2025-08-03T00:00:00Z"
/// - UNIX seconds, optionally fractional ("1700000000", "1700000000.250")
pub fn parse_instant(input: &str, now_ms: i64) -> Result<i64> {
    let s = input.trim();

    if s == "now" {
        return Ok(now_ms);
    }
    if let Some(rest) = s.strip_prefix("now-") {
        return Ok(now_ms - parse_duration_ms(rest)?);
    }
    if let Some(rest) = s.strip_prefix("now+") {
        return Ok(now_ms + parse_duration_ms(rest)?);
    }

    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok((dt.unix_timestamp_nanos() / NANOS_PER_MILLI) as i64);
    }

    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') {
        if let Ok(secs) = s.parse::<f64>() {
            return Ok((secs * 1000.0).round() as i64);
        }
    }

    Err(Error::usage(format!("invalid time {s:?}: expected RFC3339, unix seconds or now[-+]<dur>")))
}

/// Parse a human duration ("30s", "5m", "1h30m") into milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<i64> {
    let duration = humantime::parse_duration(input.trim())
        .map_err(|e| Error::usage(format!("invalid duration {input:?}: {e}")))?;
    i64::try_from(duration.as_millis())
        .map_err(|_| Error::usage(format!("duration {input:?} out of range")))
}

/// Render a millisecond timestamp as RFC3339, falling back to the raw number.
pub fn format_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * NANOS_PER_MILLI)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_641_038_400_000; // 2022-01-01T12:00:00Z

    #[test]
    fn test_pinned_clock_overrides_now() {
        let mut clock = Clock::new();
        assert_eq!(clock.pinned(), None);

        clock.pin(NOW);
        assert_eq!(clock.now_ms(), NOW);

        clock.unpin();
        assert!(clock.now_ms() > NOW);
    }

    #[test]
    fn test_parse_relative() {
        assert_eq!(parse_instant("now", NOW).expect("valid"), NOW);
        assert_eq!(parse_instant("now-1h", NOW).expect("valid"), NOW - 3_600_000);
        assert_eq!(parse_instant("now+30s", NOW).expect("valid"), NOW + 30_000);
        assert_eq!(parse_instant("now-1h30m", NOW).expect("valid"), NOW - 5_400_000);
    }

    #[test]
    fn test_parse_absolute() {
        assert_eq!(parse_instant("2022-01-01T12:00:00Z", 0).expect("valid"), NOW);
        assert_eq!(parse_instant("1641038400", 0).expect("valid"), NOW);
        assert_eq!(parse_instant("1641038400.5", 0).expect("valid"), NOW + 500);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_instant("yesterday", NOW).is_err());
        assert!(parse_instant("now-abc", NOW).is_err());
        assert!(parse_instant("", NOW).is_err());
    }

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(NOW), "2022-01-01T12:00:00Z");
    }
}
