use std::time::{SystemTime, UNIX_EPOCH};
use ::time::OffsetDateTime;
use ::time::format_description::BorrowedFormatItem;
use ::time::format_description::well_known::Rfc3339;
use ::time::macros::format_description;

/// RFC 3339 in UTC with exactly three fractional digits.
const UTC_MILLIS: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Current UTC time as RFC 3339 with millisecond precision.
pub fn now_iso8601() -> String {
    format_utc_millis(now_millis())
}

/// Format epoch milliseconds as an RFC 3339 UTC timestamp.
pub fn format_utc_millis(millis: u64) -> String {
    let nanos = i128::from(millis) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|dt| dt.format(UTC_MILLIS).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string())
}

/// Parse an RFC 3339 timestamp into epoch milliseconds.
/// Returns `None` for malformed input or instants before the epoch.
pub fn parse_utc(raw: &str) -> Option<u64> {
    let dt = OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()?;
    let millis = dt.unix_timestamp_nanos() / 1_000_000;
    u64::try_from(millis).ok()
}
