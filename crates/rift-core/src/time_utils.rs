use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Time left before a message created at `created_unix_ms` falls out of the
/// retention window. Saturates at zero for messages that are already overdue.
pub fn retention_remaining(created_unix_ms: u64, retention_seconds: u64, now_unix_ms: u64) -> Duration {
    let elapsed_ms = now_unix_ms.saturating_sub(created_unix_ms);
    let window_ms = retention_seconds.saturating_mul(1_000);
    Duration::from_millis(window_ms.saturating_sub(elapsed_ms))
}

/// ISO-8601 rendering used in audit lines.
pub fn format_iso8601(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, false)
}
