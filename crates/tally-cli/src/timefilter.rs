use anyhow::Context;
use tally_core::timefmt::parse_rfc3339;
use time::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time};

const ACCEPTED: &str =
    "today, yesterday, 1h, 24h, 7d, 30d, YYYY-MM-DD, \"YYYY-MM-DD HH:MM:SS\" or RFC 3339";

/// Resolves a `--since`/`--until` value against `now`. Calendar forms are UTC.
pub fn parse_time_spec(raw: &str, now: OffsetDateTime) -> anyhow::Result<OffsetDateTime> {
    let spec = raw.trim().to_ascii_lowercase();
    match spec.as_str() {
        "today" => return Ok(now.replace_time(Time::MIDNIGHT)),
        "yesterday" => return Ok((now - Duration::days(1)).replace_time(Time::MIDNIGHT)),
        _ => {}
    }

    if let Some(ago) = relative(&spec) {
        return now
            .checked_sub(ago)
            .with_context(|| format!("{raw:?} reaches too far back"));
    }

    let trimmed = raw.trim();
    if let Some(date) = calendar_date(trimmed) {
        return Ok(date.midnight().assume_utc());
    }
    if let Some(dt) = calendar_datetime(trimmed) {
        return Ok(dt.assume_utc());
    }
    if let Some(ts) = parse_rfc3339(trimmed) {
        return Ok(ts);
    }
    anyhow::bail!("unrecognized time {raw:?} (use {ACCEPTED})")
}

/// `<n>h` or `<n>d`.
fn relative(spec: &str) -> Option<Duration> {
    let (digits, per_unit) = if let Some(d) = spec.strip_suffix('h') {
        (d, Duration::HOUR)
    } else if let Some(d) = spec.strip_suffix('d') {
        (d, Duration::DAY)
    } else {
        return None;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: i32 = digits.parse().ok()?;
    per_unit.checked_mul(n)
}

fn calendar_date(raw: &str) -> Option<Date> {
    let format = format_description::parse("[year]-[month]-[day]").ok()?;
    Date::parse(raw, &format).ok()
}

fn calendar_datetime(raw: &str) -> Option<PrimitiveDateTime> {
    let format =
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").ok()?;
    PrimitiveDateTime::parse(raw, &format).ok()
}
