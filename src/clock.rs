//! Timestamp helpers shared by the cache index and the registry.
//!
//! Timestamps are `DateTime<Utc>` in memory and epoch milliseconds on disk.

use chrono::{DateTime, TimeZone, Utc};

/// Current time, truncated to millisecond precision so that values survive
/// a round trip through the database unchanged.
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// Epoch milliseconds for storage.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Inverse of [`to_millis`]. Out-of-range values clamp to the epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}
