use serde_json::json;
use tally_aggregate::{AgentSnapshot, GlobalSnapshot, ToolSnapshot};

use crate::csv::CsvWriter;
use crate::format::{format_duration_ms, percent, share};
use crate::sparkline::{sparkline, COMMAND_SPARK_WIDTH, TOOL_SPARK_WIDTH};
use crate::table::{boxed, Table};
use crate::{take_limit, to_json, OutputFormat};

pub(crate) fn render_tools(
    global: &GlobalSnapshot,
    limit: usize,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let ranked = global.tools_by_calls();
    let shown = take_limit(&ranked, limit);
    match format {
        OutputFormat::Table => Ok(tools_table(shown)),
        OutputFormat::Json => {
            let leaderboard: Vec<_> = shown
                .iter()
                .enumerate()
                .map(|(i, t)| json!({ "rank": i + 1, "name": t.name, "stats": t }))
                .collect();
            to_json(&json!({
                "leaderboard": leaderboard,
                "total_tools": ranked.len(),
                "showing": shown.len(),
            }))
        }
        OutputFormat::Csv => Ok(tools_csv(shown)),
    }
}

fn tools_table(tools: &[&ToolSnapshot]) -> String {
    if tools.is_empty() {
        return "No tool usage recorded.\n".to_string();
    }
    let mut out = String::new();
    boxed(&mut out, "TOOL USAGE LEADERBOARD");

    // Share and bar are relative to the rows shown.
    let total: u64 = tools.iter().map(|t| t.total_calls).sum();
    let top = tools[0].total_calls;
    let mut table = Table::new(&[
        "Rank",
        "Tool",
        "Calls",
        "%",
        "Success Rate",
        "Avg Duration",
        "Sparkline",
    ]);
    for (i, t) in tools.iter().enumerate() {
        table.row(vec![
            (i + 1).to_string(),
            t.name.clone(),
            t.total_calls.to_string(),
            percent(share(t.total_calls, total)),
            percent(t.success_rate),
            format!("{:.0}ms", t.avg_duration_ms),
            sparkline(t.total_calls, top, TOOL_SPARK_WIDTH),
        ]);
    }
    out.push_str(&table.render());
    out
}

fn tools_csv(tools: &[&ToolSnapshot]) -> String {
    let mut w = CsvWriter::new();
    w.record([
        "Rank",
        "Tool",
        "Total Calls",
        "Success Rate",
        "Avg Duration (ms)",
        "Min Duration (ms)",
        "Max Duration (ms)",
        "P95 Duration (ms)",
        "P99 Duration (ms)",
    ]);
    for (i, t) in tools.iter().enumerate() {
        w.record([
            (i + 1).to_string(),
            t.name.clone(),
            t.total_calls.to_string(),
            format!("{:.2}", t.success_rate),
            format!("{:.0}", t.avg_duration_ms),
            opt_ms(t.min_duration_ms),
            opt_ms(t.max_duration_ms),
            format!("{:.0}", t.p95_duration_ms),
            format!("{:.0}", t.p99_duration_ms),
        ]);
    }
    w.finish()
}

pub(crate) fn render_agents(
    agents: &[AgentSnapshot],
    limit: usize,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let shown = take_limit(agents, limit);
    match format {
        OutputFormat::Table => Ok(agents_table(shown)),
        OutputFormat::Json => {
            let leaderboard: Vec<_> = shown
                .iter()
                .enumerate()
                .map(|(i, a)| json!({ "rank": i + 1, "name": a.agent, "stats": a }))
                .collect();
            to_json(&json!({
                "leaderboard": leaderboard,
                "total_agents": agents.len(),
                "showing": shown.len(),
            }))
        }
        OutputFormat::Csv => Ok(agents_csv(shown)),
    }
}

fn agents_table(agents: &[AgentSnapshot]) -> String {
    if agents.is_empty() {
        return "No agent delegations recorded.\n".to_string();
    }
    let mut out = String::new();
    boxed(&mut out, "AGENT LEADERBOARD");

    let total: u64 = agents.iter().map(|a| a.invocations).sum();
    let top = agents.iter().map(|a| a.invocations).max().unwrap_or(0);
    let mut table = Table::new(&[
        "Rank",
        "Agent",
        "Runs",
        "%",
        "Success Rate",
        "Avg Duration",
        "P95",
        "Sparkline",
    ]);
    for (i, a) in agents.iter().enumerate() {
        table.row(vec![
            (i + 1).to_string(),
            a.agent.clone(),
            a.invocations.to_string(),
            percent(share(a.invocations, total)),
            percent(a.success_rate),
            format_duration_ms(a.avg_duration_ms),
            format_duration_ms(a.p95_duration_ms),
            sparkline(a.invocations, top, TOOL_SPARK_WIDTH),
        ]);
    }
    out.push_str(&table.render());
    out
}

fn agents_csv(agents: &[AgentSnapshot]) -> String {
    let mut w = CsvWriter::new();
    w.record([
        "Rank",
        "Agent",
        "Invocations",
        "Success Rate",
        "Avg Duration (ms)",
        "Std Dev (ms)",
        "Min Duration (ms)",
        "Max Duration (ms)",
        "P50 Duration (ms)",
        "P95 Duration (ms)",
        "P99 Duration (ms)",
    ]);
    for (i, a) in agents.iter().enumerate() {
        w.record([
            (i + 1).to_string(),
            a.agent.clone(),
            a.invocations.to_string(),
            format!("{:.2}", a.success_rate),
            format!("{:.0}", a.avg_duration_ms),
            format!("{:.0}", a.std_dev_ms),
            opt_ms(a.min_duration_ms),
            opt_ms(a.max_duration_ms),
            format!("{:.0}", a.p50_duration_ms),
            format!("{:.0}", a.p95_duration_ms),
            format!("{:.0}", a.p99_duration_ms),
        ]);
    }
    w.finish()
}

pub(crate) fn render_commands(
    global: &GlobalSnapshot,
    limit: usize,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let ranked = global.commands_by_usage();
    let shown = take_limit(&ranked, limit);
    match format {
        OutputFormat::Table => {
            let total: u64 = ranked.iter().map(|(_, n)| n).sum();
            Ok(commands_table(shown, total))
        }
        OutputFormat::Json => {
            let leaderboard: Vec<_> = shown
                .iter()
                .enumerate()
                .map(|(i, (name, count))| json!({ "rank": i + 1, "name": name, "count": count }))
                .collect();
            to_json(&json!({
                "leaderboard": leaderboard,
                "total_commands": ranked.len(),
                "showing": shown.len(),
            }))
        }
        OutputFormat::Csv => {
            let mut w = CsvWriter::new();
            w.record(["Rank", "Command/Agent", "Usage Count"]);
            for (i, (name, count)) in shown.iter().enumerate() {
                w.record([(i + 1).to_string(), name.to_string(), count.to_string()]);
            }
            Ok(w.finish())
        }
    }
}

/// Percentages are of all command usage, not only the rows shown.
fn commands_table(commands: &[(&str, u64)], total: u64) -> String {
    if commands.is_empty() {
        return "No commands recorded.\n".to_string();
    }
    let mut out = String::new();
    boxed(&mut out, "COMMAND/AGENT LEADERBOARD");
    let top = commands[0].1;
    let mut table = Table::new(&["Rank", "Command/Agent", "Usage", "Percentage", "Sparkline"]);
    for (i, (name, count)) in commands.iter().enumerate() {
        table.row(vec![
            (i + 1).to_string(),
            name.to_string(),
            count.to_string(),
            percent(share(*count, total)),
            sparkline(*count, top, COMMAND_SPARK_WIDTH),
        ]);
    }
    out.push_str(&table.render());
    out
}

fn opt_ms(ms: Option<f64>) -> String {
    ms.map(|v| format!("{v:.0}")).unwrap_or_default()
}
