//! Shared timestamp and token helpers.

use chrono::{DateTime, SecondsFormat, Utc};
use ulid::Ulid;

/// Current UTC time as an RFC 3339 string (e.g. `2026-01-01T00:00:00.000000Z`).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Returns true if `value` parses as an RFC 3339 datetime.
pub fn is_datetime(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
}

/// Opaque unique token, used to identify lock holders.
pub fn new_token() -> String {
    Ulid::new().to_string()
}
