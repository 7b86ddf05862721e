//! All operator-facing times are US Eastern (America/New_York): the
//! hourly P&L buckets, the daily reset, and log-friendly formatting.

use chrono::{DateTime, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

pub fn eastern(at: DateTime<Utc>) -> DateTime<Tz> {
    at.with_timezone(&New_York)
}

/// Hour bucket key in Eastern time, e.g. "14:00".
pub fn hour_key(at: DateTime<Utc>) -> String {
    eastern(at).format("%H:00").to_string()
}

/// Date key in Eastern time, e.g. "2026-08-02".
pub fn date_key(at: DateTime<Utc>) -> String {
    eastern(at).format("%Y-%m-%d").to_string()
}

/// Format an instant as HH:MM:SS Eastern for display.
pub fn format_eastern(at: DateTime<Utc>) -> String {
    eastern(at).format("%H:%M:%S").to_string()
}

pub fn epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}
