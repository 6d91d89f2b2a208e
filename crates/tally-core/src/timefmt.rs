use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Stand-in for records whose timestamp could not be parsed.
pub const SENTINEL: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

pub fn is_sentinel(ts: OffsetDateTime) -> bool {
    ts == SENTINEL
}

pub fn parse_rfc3339(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()
}

pub fn format_rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// Whole milliseconds from `start` to `end`, negative when `end` precedes `start`.
pub fn millis_between(start: OffsetDateTime, end: OffsetDateTime) -> i64 {
    let ms = (end - start).whole_milliseconds();
    ms.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
