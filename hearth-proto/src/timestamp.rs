//! Timestamp helpers: ISO-8601 strings on the wire, integer sort keys in memory.
//!
//! Messages carry their creation time as an ISO-8601 string. Ordering a
//! timeline by re-parsing those strings inside a comparator is quadratic in
//! practice, so every message gets a [`SortTime`] computed once when it
//! enters the client.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Naive (zone-less) layouts accepted after RFC 3339 fails. Interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Milliseconds since the UNIX epoch, used as the ordering key of a timeline entry.
///
/// Unparseable timestamps map to [`SortTime::EPOCH`], so malformed
/// messages float to the top of a timeline instead of being dropped.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SortTime(i64);

impl SortTime {
    /// The UNIX epoch; the sort time of any unparseable timestamp.
    pub const EPOCH: Self = Self(0);

    /// Creates a sort time from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the sort time as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Parses an ISO-8601 timestamp into a sort time.
    ///
    /// Accepts RFC 3339 (with offset or `Z`), zone-less date-times
    /// (treated as UTC) and bare dates (midnight UTC). Anything else,
    /// including the empty string, yields [`SortTime::EPOCH`].
    #[must_use]
    pub fn parse(timestamp: &str) -> Self {
        let raw = timestamp.trim();
        if raw.is_empty() {
            return Self::EPOCH;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Self(dt.timestamp_millis());
        }
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Self(naive.and_utc().timestamp_millis());
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map_or(Self::EPOCH, |naive| Self(naive.and_utc().timestamp_millis()))
    }
}

/// Returns the current time as an RFC 3339 string with millisecond precision.
#[must_use]
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
