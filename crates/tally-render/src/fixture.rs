use tally_aggregate::Aggregator;
use tally_core::timefmt::parse_rfc3339;
use tally_core::{Event, Parameters, TaskParams};
use time::OffsetDateTime;

use crate::Report;

fn t(raw: &str) -> OffsetDateTime {
    parse_rfc3339(raw).unwrap()
}

fn call(
    agg: &Aggregator,
    session: &str,
    id: &str,
    tool: &str,
    at: &str,
    done: &str,
    error: Option<&str>,
) {
    call_with(agg, session, id, tool, Parameters::default(), at, done, error);
}

#[allow(clippy::too_many_arguments)]
fn call_with(
    agg: &Aggregator,
    session: &str,
    id: &str,
    tool: &str,
    parameters: Parameters,
    at: &str,
    done: &str,
    error: Option<&str>,
) {
    agg.process_event(&Event::ToolInvocation {
        session: session.into(),
        ts: t(at),
        invocation_id: id.into(),
        tool_name: tool.into(),
        parameters,
    });
    agg.process_event(&Event::ToolResult {
        session: session.into(),
        ts: t(done),
        invocation_id: id.into(),
        tool_name: None,
        output: None,
        error: error.map(str::to_string),
        result_payload: None,
    });
}

/// Two sessions, six calls (one failed), one delegation to `planner`,
/// commands `/review` ×2 and `/deploy` ×1.
pub(crate) fn sample_report() -> Report {
    let agg = Aggregator::default();
    agg.process_event(&Event::UserInput {
        session: "alpha".into(),
        ts: t("2025-01-15T10:00:00Z"),
        text: "please review".into(),
    });
    call(&agg, "alpha", "a1", "Bash", "2025-01-15T10:00:01Z", "2025-01-15T10:00:03Z", None);
    call(
        &agg,
        "alpha",
        "a2",
        "Bash",
        "2025-01-15T10:01:00Z",
        "2025-01-15T10:01:00.500Z",
        Some("exit status 1"),
    );
    call(&agg, "alpha", "a3", "Read", "2025-01-15T10:02:00Z", "2025-01-15T10:02:00.100Z", None);
    call_with(
        &agg,
        "alpha",
        "a4",
        "Task",
        Parameters::Task(TaskParams {
            subagent_type: Some("planner".into()),
            description: None,
            prompt: None,
        }),
        "2025-01-15T10:03:00Z",
        "2025-01-15T10:03:06Z",
        None,
    );
    agg.process_event(&Event::AssistantText {
        session: "alpha".into(),
        ts: t("2025-01-15T10:04:00Z"),
        text: "<command-name>/review</command-name>".into(),
        input_tokens: 100,
        output_tokens: 50,
        model: None,
    });

    call(&agg, "beta", "b1", "Bash", "2025-01-16T08:59:00Z", "2025-01-16T08:59:01Z", None);
    call(&agg, "beta", "b2", "Grep", "2025-01-16T08:59:30Z", "2025-01-16T08:59:31Z", None);
    agg.process_event(&Event::AssistantText {
        session: "beta".into(),
        ts: t("2025-01-16T09:00:00Z"),
        text: "<command-name>/review</command-name> then <command-name>/deploy</command-name>"
            .into(),
        input_tokens: 10,
        output_tokens: 5,
        model: None,
    });
    agg.quiesce();

    let mut report = Report::collect(&agg);
    report.files_scanned = 2;
    report.events = 17;
    report
}
