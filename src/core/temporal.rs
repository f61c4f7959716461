//! Logical timestamps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp representing a point in time with millisecond precision.
///
/// Clocks are monotonic within a single writer but may skew between
/// writers; ordering across writers is settled by `(ts, seq)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp {
    millis: i64,
}

impl Timestamp {
    /// The zero timestamp (epoch).
    pub const ZERO: Timestamp = Timestamp { millis: 0 };

    /// Create a timestamp from milliseconds since the epoch
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Create a timestamp from seconds since the epoch
    pub fn from_secs(secs: i64) -> Self {
        Self {
            millis: secs * 1_000,
        }
    }

    /// Get current timestamp
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            millis: now.timestamp_millis(),
        }
    }

    /// Get milliseconds since the epoch
    pub fn as_millis(&self) -> i64 {
        self.millis
    }

    /// Get seconds since the epoch
    pub fn as_secs(&self) -> i64 {
        self.millis / 1_000
    }

    /// Convert to chrono DateTime
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis).unwrap_or_else(Utc::now)
    }

    /// Add a duration in milliseconds
    pub fn add_millis(&self, millis: i64) -> Self {
        Self {
            millis: self.millis + millis,
        }
    }

    /// Subtract a duration in milliseconds
    pub fn sub_millis(&self, millis: i64) -> Self {
        Self {
            millis: self.millis - millis,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.millis)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            millis: dt.timestamp_millis(),
        }
    }
}
