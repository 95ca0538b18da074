use jiff::{Timestamp, civil::DateTime, tz::Offset};

const WINDOWS_TO_UNIX_SECS: i64 = 11_644_473_600;

/// Rendered in place of timestamps that cannot be represented.
pub const INVALID_TIMESTAMP_SENTINEL: &str = "0001-01-01T00:00:00.000000Z";

/// Converts a FILETIME (100ns ticks since 1601-01-01T00:00:00Z).
///
/// Returns `None` when the value is past the representable range.
#[inline]
pub(crate) fn filetime_to_timestamp(filetime: u64) -> Option<Timestamp> {
    let secs = i64::try_from(filetime / 10_000_000).ok()? - WINDOWS_TO_UNIX_SECS;
    let nanos = ((filetime % 10_000_000) * 100) as i32;
    Timestamp::new(secs, nanos).ok()
}

/// Converts the 16-byte SYSTEMTIME fields
/// (year, month, day of week, day, hour, minute, second, milliseconds).
pub(crate) fn systime_to_timestamp(fields: &[u16; 8]) -> Option<Timestamp> {
    let [year, month, _day_of_week, day, hour, minute, second, milliseconds] = *fields;

    // The entire value is unset. By convention, use the FILETIME epoch.
    if fields.iter().all(|f| *f == 0) {
        return filetime_to_timestamp(0);
    }
    if milliseconds > 999 {
        return None;
    }

    let dt = DateTime::new(
        i16::try_from(year).ok()?,
        i8::try_from(month).ok()?,
        i8::try_from(day).ok()?,
        i8::try_from(hour).ok()?,
        i8::try_from(minute).ok()?,
        i8::try_from(second).ok()?,
        i32::from(milliseconds) * 1_000_000,
    )
    .ok()?;

    Offset::UTC.to_timestamp(dt).ok()
}

/// ISO-8601 in UTC with microsecond precision, e.g. `2012-03-14T04:17:43.354563Z`.
pub(crate) fn format_timestamp(ts: &Timestamp) -> String {
    let dt = Offset::UTC.to_datetime(*ts);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.subsec_nanosecond() / 1_000
    )
}
