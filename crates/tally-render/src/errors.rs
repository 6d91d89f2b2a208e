use serde_json::json;
use tally_aggregate::{ErrorFrequency, ErrorPattern, GlobalSnapshot};
use tally_core::timefmt::format_rfc3339;

use crate::csv::CsvWriter;
use crate::format::short_stamp;
use crate::table::{boxed, section, Table};
use crate::{take_limit, to_json, truncate, OutputFormat};

const PATTERN_WIDTH: usize = 30;
const MESSAGE_WIDTH: usize = 40;

pub(crate) fn render_errors(
    global: &GlobalSnapshot,
    limit: usize,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let patterns = take_limit(&global.error_patterns, limit);
    let top = take_limit(&global.top_errors, limit);
    match format {
        OutputFormat::Table => Ok(errors_table(patterns, top)),
        // `percentage` stays on the 0..=100 scale here.
        OutputFormat::Json => to_json(&json!({
            "error_patterns": patterns,
            "top_errors": top,
            "total_errors": global.error_patterns.iter().map(|p| p.count).sum::<u64>(),
            "total_patterns": global.error_patterns.len(),
            "showing": patterns.len(),
        })),
        OutputFormat::Csv => Ok(errors_csv(patterns, top)),
    }
}

fn errors_table(patterns: &[ErrorPattern], top: &[ErrorFrequency]) -> String {
    let mut out = String::new();
    boxed(&mut out, "ERROR ANALYSIS");
    if patterns.is_empty() {
        out.push_str("No errors recorded.\n");
        return out;
    }

    section(&mut out, "ERROR PATTERNS");
    let mut table = Table::new(&["Pattern", "Count", "Tools", "First Seen", "Last Seen"]);
    for p in patterns {
        table.row(vec![
            truncate(&label(&p.code, &p.message), PATTERN_WIDTH),
            p.count.to_string(),
            p.tools.join(", "),
            short_stamp(p.first_seen),
            short_stamp(p.last_seen),
        ]);
    }
    out.push_str(&table.render());
    out.push('\n');

    if !top.is_empty() {
        section(&mut out, "TOP ERRORS BY FREQUENCY");
        let mut table = Table::new(&["Tool", "Error", "Count", "Percentage"]);
        for f in top {
            let tool = if f.tool_name.is_empty() {
                "-".to_string()
            } else {
                f.tool_name.clone()
            };
            table.row(vec![
                tool,
                truncate(&label(&f.error_code, &f.error_message), MESSAGE_WIDTH),
                f.count.to_string(),
                format!("{:.1}%", f.percentage),
            ]);
        }
        out.push_str(&table.render());
    }
    out
}

fn errors_csv(patterns: &[ErrorPattern], top: &[ErrorFrequency]) -> String {
    let mut w = CsvWriter::new();
    if !patterns.is_empty() {
        w.line("Error Patterns");
        w.record([
            "Error Code",
            "Error Message",
            "Count",
            "Tools",
            "First Seen",
            "Last Seen",
        ]);
        for p in patterns {
            w.record([
                p.code.clone(),
                p.message.clone(),
                p.count.to_string(),
                p.tools.join("; "),
                format_rfc3339(p.first_seen),
                format_rfc3339(p.last_seen),
            ]);
        }
    }
    if !top.is_empty() {
        if !w.is_empty() {
            w.line("");
        }
        w.line("Error Frequencies");
        w.record(["Tool", "Error Code", "Error Message", "Count", "Percentage"]);
        for f in top {
            w.record([
                f.tool_name.clone(),
                f.error_code.clone(),
                f.error_message.clone(),
                f.count.to_string(),
                format!("{:.2}", f.percentage / 100.0),
            ]);
        }
    }
    w.finish()
}

fn label(code: &str, message: &str) -> String {
    match (code.is_empty(), message.is_empty()) {
        (false, false) => format!("{code}: {message}"),
        (true, _) => message.to_string(),
        (false, true) => code.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::sample_report;

    #[test]
    fn table_lists_patterns_and_frequencies() {
        let report = sample_report();
        let out = render_errors(&report.global, 10, OutputFormat::Table).unwrap();
        assert!(out.contains("ERROR ANALYSIS"));
        assert!(out.contains("ERROR PATTERNS"));
        let pattern = out
            .lines()
            .find(|l| l.starts_with("TOOL_ERROR: exit status 1"))
            .unwrap();
        assert!(pattern.contains("Bash"));
        assert!(pattern.contains("01-15 10:01"));
        assert!(out.contains("TOP ERRORS BY FREQUENCY"));
        assert!(out.contains("100.0%"));
    }

    #[test]
    fn csv_percentages_are_fractions() {
        let report = sample_report();
        let out = render_errors(&report.global, 10, OutputFormat::Csv).unwrap();
        assert!(out.starts_with("Error Patterns\nError Code,Error Message,Count,Tools"));
        assert!(out.contains("\n\nError Frequencies\n"));
        assert!(out.contains("Bash,TOOL_ERROR,exit status 1,1,1.00\n"));
    }

    #[test]
    fn json_percentages_are_whole() {
        let report = sample_report();
        let out = render_errors(&report.global, 10, OutputFormat::Json).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["total_errors"], 1);
        assert_eq!(v["top_errors"][0]["percentage"], 100.0);
        assert_eq!(v["error_patterns"][0]["tools"][0], "Bash");
    }

    #[test]
    fn labels_skip_empty_parts() {
        assert_eq!(label("E1", "boom"), "E1: boom");
        assert_eq!(label("", "boom"), "boom");
        assert_eq!(label("E1", ""), "E1");
    }

    #[test]
    fn no_errors_is_a_message() {
        let agg = tally_aggregate::Aggregator::default();
        let global = agg.snapshot_global();
        let out = render_errors(&global, 10, OutputFormat::Table).unwrap();
        assert!(out.ends_with("No errors recorded.\n"));
        assert_eq!(render_errors(&global, 10, OutputFormat::Csv).unwrap(), "");
    }
}
