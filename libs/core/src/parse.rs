//! Lenient field parsing used when mapping bus commands onto the domain model.
//!
//! Malformed values never reject a message: identifiers degrade to the nil UUID
//! and timestamps to the current time.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub fn lenient_uuid(raw: &str) -> Uuid {
    Uuid::parse_str(raw.trim()).unwrap_or(Uuid::nil())
}

/// Parses an RFC 3339 timestamp into Unix epoch milliseconds.
pub fn lenient_rfc3339_millis(raw: &str) -> i64 {
    let at = OffsetDateTime::parse(raw.trim(), &Rfc3339).unwrap_or_else(|_| OffsetDateTime::now_utc());
    unix_millis(at)
}

pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn now_millis() -> i64 {
    unix_millis(OffsetDateTime::now_utc())
}
