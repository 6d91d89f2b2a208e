use serde_json::json;
use tally_core::timefmt::{format_rfc3339, millis_between};

use crate::csv::CsvWriter;
use crate::format::{format_duration_ms, short_stamp};
use crate::table::{boxed, key_values, section, Table};
use crate::{take_limit, to_json, truncate, DelegationReport, OutputFormat};

const SESSION_ID_WIDTH: usize = 36;

pub(crate) fn render_delegation(
    report: &DelegationReport,
    limit: usize,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let transitions = take_limit(&report.transitions, limit);
    let cooccurrences = take_limit(&report.cooccurrences, limit);
    let chains = take_limit(&report.chains, limit);
    match format {
        OutputFormat::Table => Ok(delegation_table(report, limit)),
        OutputFormat::Json => to_json(&json!({
            "stats": report.stats,
            "transitions": transitions,
            "cooccurrences": cooccurrences,
            "chains": chains,
            "showing": transitions.len(),
        })),
        OutputFormat::Csv => {
            let mut w = CsvWriter::new();
            w.line("Transitions");
            w.record(["From", "To", "Count", "Last Seen", "Last Session"]);
            for t in transitions {
                w.record([
                    t.from.clone(),
                    t.to.clone(),
                    t.count.to_string(),
                    format_rfc3339(t.last_seen),
                    t.last_session.clone(),
                ]);
            }
            w.line("");
            w.line("Co-occurrences");
            w.record(["Agent A", "Agent B", "Count", "Sessions", "Last Seen"]);
            for c in cooccurrences {
                w.record([
                    c.agent_a.clone(),
                    c.agent_b.clone(),
                    c.count.to_string(),
                    c.sessions.join("; "),
                    format_rfc3339(c.last_seen),
                ]);
            }
            w.line("");
            w.line("Chains");
            w.record(["Session", "Agents", "Start", "End"]);
            for c in chains {
                w.record([
                    c.session.clone(),
                    c.agents.join(" > "),
                    format_rfc3339(c.start),
                    format_rfc3339(c.end),
                ]);
            }
            Ok(w.finish())
        }
    }
}

fn delegation_table(report: &DelegationReport, limit: usize) -> String {
    let mut out = String::new();
    boxed(&mut out, "DELEGATION GRAPH");
    let stats = &report.stats;
    if stats.total_transitions == 0 && stats.total_cooccurrences == 0 {
        out.push_str("No delegations recorded.\n");
        return out;
    }

    section(&mut out, "OVERVIEW");
    key_values(
        &mut out,
        &[
            ("Transition Patterns", stats.total_transitions.to_string()),
            ("Transition Events", stats.transition_events.to_string()),
            ("Co-occurring Pairs", stats.total_cooccurrences.to_string()),
            ("Sessions With Chains", stats.sessions_with_chains.to_string()),
            ("Avg Chain Length", format!("{:.1}", stats.avg_chain_length)),
        ],
    );

    let transitions = take_limit(&report.transitions, limit);
    if !transitions.is_empty() {
        section(&mut out, "TOP TRANSITIONS");
        let mut table = Table::new(&["From", "To", "Count", "Last Seen"]);
        for t in transitions {
            table.row(vec![
                t.from.clone(),
                t.to.clone(),
                t.count.to_string(),
                short_stamp(t.last_seen),
            ]);
        }
        out.push_str(&table.render());
        out.push('\n');
    }

    let cooccurrences = take_limit(&report.cooccurrences, limit);
    if !cooccurrences.is_empty() {
        section(&mut out, "AGENT CO-OCCURRENCE");
        let mut table = Table::new(&["Agent A", "Agent B", "Sessions", "Last Seen"]);
        for c in cooccurrences {
            table.row(vec![
                c.agent_a.clone(),
                c.agent_b.clone(),
                c.count.to_string(),
                short_stamp(c.last_seen),
            ]);
        }
        out.push_str(&table.render());
        out.push('\n');
    }

    let chains = take_limit(&report.chains, limit);
    if !chains.is_empty() {
        section(&mut out, "DELEGATION CHAINS");
        let mut table = Table::new(&["Session", "Chain", "Span"]);
        for c in chains {
            table.row(vec![
                truncate(&c.session, SESSION_ID_WIDTH),
                c.agents.join(" → "),
                format_duration_ms(millis_between(c.start, c.end) as f64),
            ]);
        }
        out.push_str(&table.render());
    }
    out
}
