//! Timestamp helpers shared by persisted records and metrics.

use chrono::{DateTime, Utc};

/// Timestamp type stored on every persisted record.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_unix_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Milliseconds between `start` and `end`, clamped at zero.
#[must_use]
pub fn elapsed_ms(start: Timestamp, end: Timestamp) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
