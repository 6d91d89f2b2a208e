use serde_json::json;
use tally_aggregate::{GlobalSnapshot, SessionSnapshot, ToolSessionStats};
use tally_core::timefmt::format_rfc3339;

use crate::csv::CsvWriter;
use crate::format::{format_duration_ms, minute_stamp, percent, second_stamp};
use crate::table::{boxed, key_values, section, Table};
use crate::{to_json, truncate, OutputFormat};

const SESSION_ID_WIDTH: usize = 36;

pub(crate) fn render_summary(
    global: &GlobalSnapshot,
    format: OutputFormat,
) -> anyhow::Result<String> {
    match format {
        OutputFormat::Table => Ok(summary_table(global)),
        OutputFormat::Json => to_json(global),
        OutputFormat::Csv => Ok(summary_csv(global)),
    }
}

fn summary_table(global: &GlobalSnapshot) -> String {
    let mut out = String::new();
    let title = match &global.period {
        Some(p) => format!(
            "AGGREGATED STATISTICS - {} to {}",
            minute_stamp(p.start),
            minute_stamp(p.end)
        ),
        None => "AGGREGATED STATISTICS".to_string(),
    };
    boxed(&mut out, &title);

    section(&mut out, "SESSION OVERVIEW");
    key_values(
        &mut out,
        &[
            ("Total Sessions", global.total_sessions.to_string()),
            ("Avg Duration", format_duration_ms(global.avg_session_duration_ms)),
        ],
    );

    section(&mut out, "TOOL USAGE SUMMARY");
    let mut usage = vec![
        ("Total Tool Calls", global.total_tool_calls.to_string()),
        ("Unique Tools", global.tools.len().to_string()),
        ("Success Rate", percent(global.success_rate)),
    ];
    if global.pending_invocations > 0 {
        usage.push(("Awaiting Results", global.pending_invocations.to_string()));
    }
    if !global.most_active_hours.is_empty() {
        let hours: Vec<String> = global
            .most_active_hours
            .iter()
            .map(|h| format!("{h:02}:00"))
            .collect();
        usage.push(("Most Active Hours", hours.join(", ")));
    }
    key_values(&mut out, &usage);

    if !global.total_tokens.is_empty() {
        section(&mut out, "TOKEN USAGE");
        key_values(
            &mut out,
            &[
                ("Input Tokens", global.total_tokens.input.to_string()),
                ("Output Tokens", global.total_tokens.output.to_string()),
                ("Total Tokens", global.total_tokens.total.to_string()),
            ],
        );
    }

    if global.total_tool_calls > 0 {
        let perf = &global.performance;
        section(&mut out, "PERFORMANCE METRICS");
        key_values(
            &mut out,
            &[
                ("Avg Response Time", format!("{:.0}ms", perf.avg_response_time_ms)),
                ("P50 Response Time", format!("{:.0}ms", perf.p50_response_time_ms)),
                ("P95 Response Time", format!("{:.0}ms", perf.p95_response_time_ms)),
                ("P99 Response Time", format!("{:.0}ms", perf.p99_response_time_ms)),
                ("Throughput", format!("{:.1} calls/min", perf.tool_calls_per_minute)),
                ("Max Consecutive Failures", perf.max_consecutive_failures.to_string()),
                ("Peak Concurrency", perf.peak_concurrency.to_string()),
            ],
        );
    }
    out
}

fn summary_csv(global: &GlobalSnapshot) -> String {
    let perf = &global.performance;
    let mut w = CsvWriter::new();
    w.record(["Metric", "Value"]);
    if let Some(p) = &global.period {
        w.record(["Period Start".to_string(), format_rfc3339(p.start)]);
        w.record(["Period End".to_string(), format_rfc3339(p.end)]);
    }
    let rows = [
        ("Total Sessions", global.total_sessions.to_string()),
        ("Avg Session Duration (ms)", format!("{:.0}", global.avg_session_duration_ms)),
        ("Total Tool Calls", global.total_tool_calls.to_string()),
        ("Overall Success Rate", format!("{:.2}", global.success_rate)),
        ("Input Tokens", global.total_tokens.input.to_string()),
        ("Output Tokens", global.total_tokens.output.to_string()),
        ("Total Tokens", global.total_tokens.total.to_string()),
        ("Avg Response Time (ms)", format!("{:.0}", perf.avg_response_time_ms)),
        ("P50 Response Time (ms)", format!("{:.0}", perf.p50_response_time_ms)),
        ("P95 Response Time (ms)", format!("{:.0}", perf.p95_response_time_ms)),
        ("P99 Response Time (ms)", format!("{:.0}", perf.p99_response_time_ms)),
        ("Tool Calls Per Minute", format!("{:.2}", perf.tool_calls_per_minute)),
    ];
    for (metric, value) in rows {
        w.record([metric.to_string(), value]);
    }
    w.finish()
}

pub(crate) fn render_sessions(
    sessions: &[SessionSnapshot],
    format: OutputFormat,
) -> anyhow::Result<String> {
    match format {
        OutputFormat::Table => Ok(match sessions {
            [] => "No sessions found.\n".to_string(),
            [only] => session_detail(only),
            _ => session_list(sessions),
        }),
        OutputFormat::Json => to_json(&json!({
            "sessions": sessions,
            "total_sessions": sessions.len(),
        })),
        OutputFormat::Csv => Ok(sessions_csv(sessions)),
    }
}

fn session_detail(s: &SessionSnapshot) -> String {
    let mut out = String::new();
    boxed(&mut out, &format!("SESSION: {}", s.session_id));

    section(&mut out, "TIME INFORMATION");
    let mut times = Vec::new();
    if let Some(start) = s.start_time {
        times.push(("Start Time", second_stamp(start)));
    }
    if let Some(end) = s.end_time {
        times.push(("End Time", second_stamp(end)));
    }
    times.push(("Duration", format_duration_ms(s.duration_ms as f64)));
    key_values(&mut out, &times);

    section(&mut out, "MESSAGE COUNTS");
    key_values(
        &mut out,
        &[
            ("User Messages", s.user_messages.to_string()),
            ("Assistant Messages", s.assistant_messages.to_string()),
            ("System Messages", s.system_messages.to_string()),
            ("Commands", s.commands_used.to_string()),
        ],
    );

    section(&mut out, "TOOL USAGE");
    key_values(
        &mut out,
        &[
            ("Total Calls", s.total_tool_calls.to_string()),
            ("Successful", s.successful_calls.to_string()),
            ("Failed", s.failed_calls.to_string()),
            ("Error Rate", percent(s.error_rate)),
        ],
    );

    section(&mut out, "TOKEN USAGE");
    key_values(
        &mut out,
        &[
            ("Input Tokens", s.tokens.input.to_string()),
            ("Output Tokens", s.tokens.output.to_string()),
            ("Total Tokens", s.tokens.total.to_string()),
        ],
    );

    if !s.tool_stats.is_empty() {
        section(&mut out, "TOOL BREAKDOWN");
        let mut stats: Vec<&ToolSessionStats> = s.tool_stats.values().collect();
        stats.sort_by(|a, b| {
            b.call_count
                .cmp(&a.call_count)
                .then(a.tool_name.cmp(&b.tool_name))
        });
        let mut table = Table::new(&["Tool", "Calls", "Success", "Fail", "Avg Duration"]);
        for t in stats {
            table.row(vec![
                t.tool_name.clone(),
                t.call_count.to_string(),
                t.success_count.to_string(),
                t.failure_count.to_string(),
                format!("{:.0}ms", t.avg_duration_ms),
            ]);
        }
        out.push_str(&table.render());
    }
    out
}

fn session_list(sessions: &[SessionSnapshot]) -> String {
    let mut out = String::new();
    boxed(&mut out, "SESSIONS");
    let mut table = Table::new(&[
        "Session",
        "Start",
        "Duration",
        "Messages",
        "Tool Calls",
        "Failed",
        "Error Rate",
        "Tokens",
    ]);
    for s in sessions {
        table.row(vec![
            truncate(&s.session_id, SESSION_ID_WIDTH),
            s.start_time.map(minute_stamp).unwrap_or_default(),
            format_duration_ms(s.duration_ms as f64),
            (s.user_messages + s.assistant_messages + s.system_messages).to_string(),
            s.total_tool_calls.to_string(),
            s.failed_calls.to_string(),
            percent(s.error_rate),
            s.tokens.total.to_string(),
        ]);
    }
    out.push_str(&table.render());
    out
}

fn sessions_csv(sessions: &[SessionSnapshot]) -> String {
    let mut w = CsvWriter::new();
    w.record([
        "Session ID",
        "Start Time",
        "End Time",
        "Duration (ms)",
        "User Messages",
        "Assistant Messages",
        "System Messages",
        "Total Tool Calls",
        "Successful Calls",
        "Failed Calls",
        "Error Rate",
        "Input Tokens",
        "Output Tokens",
        "Total Tokens",
    ]);
    for s in sessions {
        w.record([
            s.session_id.clone(),
            s.start_time.map(format_rfc3339).unwrap_or_default(),
            s.end_time.map(format_rfc3339).unwrap_or_default(),
            s.duration_ms.to_string(),
            s.user_messages.to_string(),
            s.assistant_messages.to_string(),
            s.system_messages.to_string(),
            s.total_tool_calls.to_string(),
            s.successful_calls.to_string(),
            s.failed_calls.to_string(),
            format!("{:.2}", s.error_rate),
            s.tokens.input.to_string(),
            s.tokens.output.to_string(),
            s.tokens.total.to_string(),
        ]);
    }
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::sample_report;

    #[test]
    fn summary_table_has_sections() {
        let report = sample_report();
        let out = render_summary(&report.global, OutputFormat::Table).unwrap();
        assert!(out.contains("AGGREGATED STATISTICS - 2025-01-15 10:00 to 2025-01-16 09:00"));
        assert!(out.contains("SESSION OVERVIEW"));
        assert!(out.contains("Total Tool Calls:"));
        assert!(out.contains("PERFORMANCE METRICS"));
        assert!(out.contains("Success Rate:"));
    }

    #[test]
    fn summary_csv_is_metric_value_pairs() {
        let report = sample_report();
        let out = render_summary(&report.global, OutputFormat::Csv).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("Metric,Value"));
        assert!(out.contains("Total Sessions,2\n"));
        assert!(out.contains("Total Tool Calls,6\n"));
        assert!(out.contains("Overall Success Rate,0.83\n"));
        assert!(out.lines().all(|l| l.split(',').count() == 2));
    }

    #[test]
    fn summary_json_is_the_snapshot() {
        let report = sample_report();
        let out = render_summary(&report.global, OutputFormat::Json).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["total_sessions"], 2);
        assert_eq!(v["tools"]["Bash"]["total_calls"], 3);
    }

    #[test]
    fn single_session_gets_the_detail_view() {
        let report = sample_report();
        let alpha: Vec<SessionSnapshot> = report
            .sessions
            .iter()
            .filter(|s| s.session_id == "alpha")
            .cloned()
            .collect();
        let out = render_sessions(&alpha, OutputFormat::Table).unwrap();
        assert!(out.contains("SESSION: alpha"));
        assert!(out.contains("TOOL BREAKDOWN"));
        assert!(out.contains("Error Rate:"));

        let list = render_sessions(&report.sessions, OutputFormat::Table).unwrap();
        assert!(list.contains("SESSIONS"));
        assert!(list.contains("alpha"));
        assert!(list.contains("beta"));

        assert_eq!(
            render_sessions(&[], OutputFormat::Table).unwrap(),
            "No sessions found.\n"
        );
    }

    #[test]
    fn sessions_csv_has_one_row_each() {
        let report = sample_report();
        let out = render_sessions(&report.sessions, OutputFormat::Csv).unwrap();
        assert_eq!(out.lines().count(), 3);
        assert!(out.lines().nth(1).unwrap().starts_with("alpha,2025-01-15T10:00:00Z,"));
    }
}
