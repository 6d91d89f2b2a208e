use serde_json::json;
use tally_aggregate::GlobalSnapshot;

use crate::csv::CsvWriter;
use crate::format::percent;
use crate::sparkline::{sparkline, COMMAND_SPARK_WIDTH};
use crate::table::{boxed, section, Table};
use crate::{to_json, OutputFormat};

pub(crate) fn render_timeline(
    global: &GlobalSnapshot,
    format: OutputFormat,
) -> anyhow::Result<String> {
    match format {
        OutputFormat::Table => Ok(timeline_table(global)),
        OutputFormat::Json => to_json(&json!({
            "daily_activity": global.daily_activity,
            "hourly_activity": global.hourly_activity,
            "most_active_hours": global.most_active_hours,
        })),
        OutputFormat::Csv => {
            let mut w = CsvWriter::new();
            w.line("Daily Activity");
            w.record([
                "Date",
                "Sessions",
                "Tool Calls",
                "Unique Tools",
                "Success Rate",
                "Total Duration (ms)",
                "Errors",
            ]);
            for d in &global.daily_activity {
                w.record([
                    d.date.clone(),
                    d.sessions.to_string(),
                    d.tool_calls.to_string(),
                    d.unique_tools.to_string(),
                    format!("{:.2}", d.success_rate),
                    d.total_duration_ms.to_string(),
                    d.errors.to_string(),
                ]);
            }
            w.line("");
            w.line("Hourly Activity");
            w.record(["Hour", "Tool Calls"]);
            for h in &global.hourly_activity {
                w.record([format!("{:02}:00", h.hour), h.tool_calls.to_string()]);
            }
            Ok(w.finish())
        }
    }
}

fn timeline_table(global: &GlobalSnapshot) -> String {
    let mut out = String::new();
    boxed(&mut out, "TEMPORAL ACTIVITY");
    if global.daily_activity.is_empty() {
        out.push_str("No tool activity recorded.\n");
        return out;
    }

    section(&mut out, "DAILY ACTIVITY");
    let mut daily = Table::new(&[
        "Date",
        "Sessions",
        "Tool Calls",
        "Unique Tools",
        "Success Rate",
        "Errors",
    ]);
    for d in &global.daily_activity {
        daily.row(vec![
            d.date.clone(),
            d.sessions.to_string(),
            d.tool_calls.to_string(),
            d.unique_tools.to_string(),
            percent(d.success_rate),
            d.errors.to_string(),
        ]);
    }
    out.push_str(&daily.render());
    out.push('\n');

    // Hours are UTC and only timed calls count.
    section(&mut out, "HOURLY ACTIVITY (UTC)");
    let busiest = global
        .hourly_activity
        .iter()
        .map(|h| h.tool_calls)
        .max()
        .unwrap_or(0);
    let mut hourly = Table::new(&["Hour", "Calls", "Activity"]);
    for h in global.hourly_activity.iter().filter(|h| h.tool_calls > 0) {
        hourly.row(vec![
            format!("{:02}:00", h.hour),
            h.tool_calls.to_string(),
            sparkline(h.tool_calls, busiest, COMMAND_SPARK_WIDTH),
        ]);
    }
    out.push_str(&hourly.render());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::sample_report;

    #[test]
    fn daily_rows_per_utc_date() {
        let report = sample_report();
        let out = render_timeline(&report.global, OutputFormat::Table).unwrap();
        assert!(out.contains("TEMPORAL ACTIVITY"));
        let day = out.lines().find(|l| l.starts_with("2025-01-15")).unwrap();
        assert!(day.contains("75.0%"));
        assert!(out.lines().any(|l| l.starts_with("2025-01-16")));
        let ten = out.lines().find(|l| l.starts_with("10:00")).unwrap();
        assert!(ten.ends_with(&"█".repeat(15)));
    }

    #[test]
    fn csv_lists_every_hour() {
        let report = sample_report();
        let out = render_timeline(&report.global, OutputFormat::Csv).unwrap();
        assert!(out.contains("2025-01-15,1,4,3,0.75,8600,1\n"));
        assert!(out.contains("\nHourly Activity\nHour,Tool Calls\n00:00,0\n"));
        assert!(out.contains("10:00,4\n"));
    }

    #[test]
    fn json_has_daily_and_hourly() {
        let report = sample_report();
        let out = render_timeline(&report.global, OutputFormat::Json).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["daily_activity"].as_array().unwrap().len(), 2);
        assert_eq!(v["hourly_activity"].as_array().unwrap().len(), 24);
        assert_eq!(v["most_active_hours"][0], 10);
    }
}
