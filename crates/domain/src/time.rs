//! Time and timestamp helpers.
//!
//! Timestamps cross process and storage boundaries as RFC 3339 text.

use chrono::{DateTime, SecondsFormat, Utc};

/// UTC timestamp used for element/bus `created`/`modified`, event capture times, etc.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Render `at` as RFC 3339 with full sub-second precision.
#[must_use]
pub fn to_rfc3339(at: Timestamp) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse RFC 3339 text in any offset into a UTC timestamp.
///
/// # Errors
///
/// Returns a [`chrono::ParseError`] when `text` is not RFC 3339.
pub fn parse_rfc3339(text: &str) -> Result<Timestamp, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|at| at.to_utc())
}
