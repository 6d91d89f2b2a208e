use time::{OffsetDateTime, UtcOffset};

/// `42s`, `17m`, `2.5h`.
pub fn format_duration_ms(ms: f64) -> String {
    let secs = ms.max(0.0) / 1000.0;
    if secs < 60.0 {
        format!("{secs:.0}s")
    } else if secs < 3600.0 {
        format!("{:.0}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Cuts `s` to `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let mut out: String = s.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

/// `2025-01-15 10:04` in UTC.
pub(crate) fn minute_stamp(ts: OffsetDateTime) -> String {
    let ts = ts.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}",
        ts.year(),
        u8::from(ts.month()),
        ts.day(),
        ts.hour(),
        ts.minute()
    )
}

/// `2025-01-15 10:04:05` in UTC.
pub(crate) fn second_stamp(ts: OffsetDateTime) -> String {
    let ts = ts.to_offset(UtcOffset::UTC);
    format!("{} {:02}:{:02}:{:02}", date_stamp(ts), ts.hour(), ts.minute(), ts.second())
}

/// `01-15 10:04` in UTC.
pub(crate) fn short_stamp(ts: OffsetDateTime) -> String {
    let ts = ts.to_offset(UtcOffset::UTC);
    format!(
        "{:02}-{:02} {:02}:{:02}",
        u8::from(ts.month()),
        ts.day(),
        ts.hour(),
        ts.minute()
    )
}

pub(crate) fn date_stamp(ts: OffsetDateTime) -> String {
    let ts = ts.to_offset(UtcOffset::UTC);
    format!("{:04}-{:02}-{:02}", ts.year(), u8::from(ts.month()), ts.day())
}

pub(crate) fn percent(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

pub(crate) fn share(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
