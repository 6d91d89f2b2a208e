//! Human, JSON and CSV views over the aggregate snapshots.

mod csv;
mod delegation;
mod errors;
#[cfg(test)]
mod fixture;
mod format;
mod leaderboard;
mod sparkline;
mod summary;
mod table;
mod timeline;

use std::fmt;
use std::str::FromStr;

use tally_aggregate::{
    AgentSnapshot, Aggregator, CoOccurrence, DelegationChain, DelegationStats, GlobalSnapshot,
    SessionSnapshot, TransitionPattern,
};

pub use crate::csv::CsvWriter;
pub use crate::format::{format_duration_ms, truncate};
pub use crate::sparkline::{sparkline, COMMAND_SPARK_WIDTH, TOOL_SPARK_WIDTH};
pub use crate::table::Table;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum View {
    #[default]
    Summary,
    Tools,
    Agents,
    Commands,
    Sessions,
    Errors,
    Delegation,
    Timeline,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} {value:?} (expected one of: {expected})")]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
    expected: &'static str,
}

impl FromStr for OutputFormat {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => Err(ParseNameError {
                kind: "format",
                value: s.to_string(),
                expected: "table, json, csv",
            }),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Table => "table",
            Self::Json => "json",
            Self::Csv => "csv",
        })
    }
}

impl FromStr for View {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summary" => Ok(Self::Summary),
            "tools" => Ok(Self::Tools),
            "agents" => Ok(Self::Agents),
            "commands" => Ok(Self::Commands),
            "sessions" => Ok(Self::Sessions),
            "errors" => Ok(Self::Errors),
            "delegation" => Ok(Self::Delegation),
            "timeline" => Ok(Self::Timeline),
            _ => Err(ParseNameError {
                kind: "view",
                value: s.to_string(),
                expected: "summary, tools, agents, commands, sessions, errors, delegation, timeline",
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DelegationReport {
    pub stats: DelegationStats,
    pub transitions: Vec<TransitionPattern>,
    pub cooccurrences: Vec<CoOccurrence>,
    pub chains: Vec<DelegationChain>,
}

/// Everything a view may need, captured once after ingestion.
#[derive(Debug, Clone)]
pub struct Report {
    pub global: GlobalSnapshot,
    pub sessions: Vec<SessionSnapshot>,
    pub agents: Vec<AgentSnapshot>,
    pub delegation: DelegationReport,
    pub files_scanned: usize,
    pub events: usize,
    pub lines_skipped: usize,
}

impl Report {
    pub fn collect(agg: &Aggregator) -> Self {
        let graph = agg.delegation();
        Self {
            global: agg.snapshot_global(),
            sessions: agg.snapshot_sessions(),
            agents: agg.agents().all_agent_stats(),
            delegation: DelegationReport {
                stats: graph.stats(),
                transitions: graph.top_transitions(0),
                cooccurrences: graph.top_cooccurrences(0),
                chains: graph.chains(),
            },
            files_scanned: 0,
            events: 0,
            lines_skipped: 0,
        }
    }
}

/// Renders `view`. `limit` caps leaderboard rows; 0 shows all.
pub fn render(
    report: &Report,
    view: View,
    format: OutputFormat,
    limit: usize,
) -> anyhow::Result<String> {
    let mut out = match view {
        View::Summary => summary::render_summary(&report.global, format)?,
        View::Tools => leaderboard::render_tools(&report.global, limit, format)?,
        View::Agents => leaderboard::render_agents(&report.agents, limit, format)?,
        View::Commands => leaderboard::render_commands(&report.global, limit, format)?,
        View::Sessions => summary::render_sessions(&report.sessions, format)?,
        View::Errors => errors::render_errors(&report.global, limit, format)?,
        View::Delegation => delegation::render_delegation(&report.delegation, limit, format)?,
        View::Timeline => timeline::render_timeline(&report.global, format)?,
    };
    if format == OutputFormat::Table {
        out.push_str(&footer(report));
    }
    Ok(out)
}

fn footer(report: &Report) -> String {
    format!(
        "\n{} files, {} events, {} lines skipped\n",
        report.files_scanned, report.events, report.lines_skipped
    )
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> anyhow::Result<String> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    Ok(json)
}

/// First `limit` items, or all of them when `limit` is 0.
pub(crate) fn take_limit<T>(items: &[T], limit: usize) -> &[T] {
    if limit == 0 || limit >= items.len() {
        items
    } else {
        &items[..limit]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(" csv".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("Delegation".parse::<View>().unwrap(), View::Delegation);
        let err = "yaml".parse::<OutputFormat>().unwrap_err();
        assert!(err.to_string().contains("table, json, csv"));
        assert!("leaderboards".parse::<View>().is_err());
    }

    #[test]
    fn limit_zero_keeps_everything() {
        let items = [1, 2, 3];
        assert_eq!(take_limit(&items, 0), &[1, 2, 3]);
        assert_eq!(take_limit(&items, 2), &[1, 2]);
        assert_eq!(take_limit(&items, 9), &[1, 2, 3]);
    }

    #[test]
    fn table_output_ends_with_footer() {
        let agg = Aggregator::default();
        let mut report = Report::collect(&agg);
        report.files_scanned = 2;
        report.events = 40;
        report.lines_skipped = 3;
        let out = render(&report, View::Summary, OutputFormat::Table, 10).unwrap();
        assert!(out.ends_with("2 files, 40 events, 3 lines skipped\n"));

        let json = render(&report, View::Summary, OutputFormat::Json, 10).unwrap();
        assert!(!json.contains("lines skipped"));
    }
}
