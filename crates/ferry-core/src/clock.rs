use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::error::{FerryError, FerryResult};

const SECONDS_PER_DAY: i64 = 60 * 60 * 24;

/// Render a UTC instant as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
///
/// Fixed width and fixed offset, so lexical order of the output equals
/// chronological order. Every timestamp used as a sort key goes through here.
pub fn format_sortable(dt: OffsetDateTime) -> String {
    let dt = dt.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.millisecond()
    )
}

/// Current time in sortable form.
pub fn now_sortable() -> String {
    format_sortable(OffsetDateTime::now_utc())
}

/// Parse any RFC 3339 timestamp (any offset, any precision) and normalize it.
pub fn normalize_timestamp(raw: &str) -> FerryResult<String> {
    let dt = OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .map_err(|e| FerryError::invalid(format!("bad timestamp {raw:?}: {e}")))?;
    Ok(format_sortable(dt))
}

/// Unix seconds now.
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Unix milliseconds now (used for promotion tag names).
pub fn unix_millis() -> i128 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}

/// Unix milliseconds of an RFC 3339 timestamp.
pub fn unix_millis_of(raw: &str) -> FerryResult<i128> {
    let dt = OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .map_err(|e| FerryError::invalid(format!("bad timestamp {raw:?}: {e}")))?;
    Ok(dt.unix_timestamp_nanos() / 1_000_000)
}

/// Expiry attribute `days` from now, in unix seconds.
pub fn expires_in_days(days: u32) -> i64 {
    unix_now() + i64::from(days) * SECONDS_PER_DAY
}
