use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tally_core::timefmt::{is_sentinel, millis_between};
use tally_core::{
    subagent_in_payload, AgentInvocation, CompletedInvocation, DelegationEdge, ErrorEntry, Event,
    Parameters, ROOT_AGENT, TOOL_ERROR_CODE,
};
use time::{Duration, OffsetDateTime};

pub const DEFAULT_ORPHAN_TIMEOUT: Duration = Duration::minutes(5);
pub const DEFAULT_DELEGATION_TOOL: &str = "Task";

/// Everything a single step of the correlator derived.
#[derive(Debug, Default, Clone)]
pub struct Correlated {
    pub completed: Vec<CompletedInvocation>,
    pub edges: Vec<DelegationEdge>,
    pub agent_runs: Vec<AgentInvocation>,
}

impl Correlated {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.edges.is_empty() && self.agent_runs.is_empty()
    }

    fn extend(&mut self, other: Correlated) {
        self.completed.extend(other.completed);
        self.edges.extend(other.edges);
        self.agent_runs.extend(other.agent_runs);
    }
}

#[derive(Debug, Clone)]
struct Pending {
    seq: u64,
    session: String,
    tool_name: String,
    invoked_at: OffsetDateTime,
    timeout_at: OffsetDateTime,
    parameters: Parameters,
    /// Sub-agent named by a delegation invocation.
    agent: Option<String>,
}

/// Pairs tool invocations with their results and expires orphans on event time.
#[derive(Debug)]
pub struct Correlator {
    orphan_timeout: Duration,
    delegation_tool: String,
    pending: HashMap<String, Pending>,
    /// Insertion sequence to invocation id, for ordered expiry.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    last_agent: HashMap<String, String>,
    watermark: Option<OffsetDateTime>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_ORPHAN_TIMEOUT, DEFAULT_DELEGATION_TOOL)
    }
}

impl Correlator {
    pub fn new(orphan_timeout: Duration, delegation_tool: impl Into<String>) -> Self {
        Self {
            orphan_timeout,
            delegation_tool: delegation_tool.into(),
            pending: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            last_agent: HashMap::new(),
            watermark: None,
        }
    }

    pub fn orphan_timeout(&self) -> Duration {
        self.orphan_timeout
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Advances the state machine by one event.
    pub fn process(&mut self, event: &Event) -> Correlated {
        let mut out = Correlated::default();
        match event {
            Event::ToolInvocation {
                session,
                ts,
                invocation_id,
                tool_name,
                parameters,
            } => self.begin(session, *ts, invocation_id, tool_name, parameters, &mut out),
            Event::ToolResult {
                ts,
                invocation_id,
                error,
                result_payload,
                ..
            } => match self.take(invocation_id) {
                Some(pending) => self.resolve(
                    invocation_id,
                    pending,
                    *ts,
                    error.as_deref(),
                    result_payload.as_ref(),
                    &mut out,
                ),
                None => tracing::debug!(invocation_id, "result without pending invocation"),
            },
            _ => {}
        }

        let ts = event.ts();
        if !is_sentinel(ts) {
            self.watermark = Some(self.watermark.map_or(ts, |w| w.max(ts)));
            self.expire(ts, &mut out);
        }
        out
    }

    /// Expires the pending invocations whose deadline the watermark has passed.
    /// Fresher ones stay pending.
    pub fn flush(&mut self) -> Correlated {
        let mut out = Correlated::default();
        if let Some(watermark) = self.watermark {
            self.expire(watermark, &mut out);
        }
        out
    }

    /// Takes over the pending invocations of `other`, after this correlator's
    /// own in expiry order. The watermark becomes the later of the two.
    pub fn absorb(&mut self, other: Correlator) {
        let Correlator {
            mut pending,
            order,
            watermark,
            ..
        } = other;
        for id in order.into_values() {
            let Some(mut entry) = pending.remove(&id) else {
                continue;
            };
            if let Some(previous) = self.pending.remove(&id) {
                self.order.remove(&previous.seq);
                tracing::debug!(
                    invocation_id = %id,
                    "duplicate invocation id replaces pending entry"
                );
            }
            entry.seq = self.next_seq;
            self.next_seq += 1;
            self.order.insert(entry.seq, id.clone());
            self.pending.insert(id, entry);
        }
        self.watermark = match (self.watermark, watermark) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.order.clear();
        self.last_agent.clear();
        self.next_seq = 0;
        self.watermark = None;
    }

    fn begin(
        &mut self,
        session: &str,
        ts: OffsetDateTime,
        invocation_id: &str,
        tool_name: &str,
        parameters: &Parameters,
        out: &mut Correlated,
    ) {
        if is_sentinel(ts) {
            tracing::debug!(
                invocation_id,
                tool = tool_name,
                "invocation without timestamp left unpaired"
            );
            return;
        }
        let agent = if tool_name == self.delegation_tool {
            parameters.subagent().map(str::to_string)
        } else {
            None
        };
        if let Some(agent) = &agent {
            out.edges.push(self.delegate(session, agent, ts));
        }

        if let Some(previous) = self.pending.remove(invocation_id) {
            self.order.remove(&previous.seq);
            tracing::debug!(invocation_id, "duplicate invocation id replaces pending entry");
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, invocation_id.to_string());
        self.pending.insert(
            invocation_id.to_string(),
            Pending {
                seq,
                session: session.to_string(),
                tool_name: tool_name.to_string(),
                invoked_at: ts,
                timeout_at: ts.saturating_add(self.orphan_timeout),
                parameters: parameters.clone(),
                agent,
            },
        );
    }

    fn take(&mut self, invocation_id: &str) -> Option<Pending> {
        let pending = self.pending.remove(invocation_id)?;
        self.order.remove(&pending.seq);
        Some(pending)
    }

    fn resolve(
        &mut self,
        invocation_id: &str,
        pending: Pending,
        ts: OffsetDateTime,
        error: Option<&str>,
        result_payload: Option<&Value>,
        out: &mut Correlated,
    ) {
        let completed_at = ts.max(pending.invoked_at);
        let duration_ms = millis_between(pending.invoked_at, completed_at);
        let success = error.is_none();

        let mut agent = pending.agent.clone();
        if pending.tool_name == self.delegation_tool {
            if let Some(echoed) = result_payload.and_then(subagent_in_payload) {
                if agent.as_deref() != Some(echoed) {
                    out.edges.push(self.delegate(&pending.session, echoed, ts));
                    agent.get_or_insert_with(|| echoed.to_string());
                }
            }
        }
        if let Some(agent) = agent {
            out.agent_runs.push(AgentInvocation {
                agent,
                session: pending.session.clone(),
                ts: pending.invoked_at,
                duration_ms,
                success,
                confidence: 1.0,
            });
        }

        out.completed.push(CompletedInvocation {
            invocation_id: invocation_id.to_string(),
            tool_name: pending.tool_name,
            session: pending.session,
            invoked_at: pending.invoked_at,
            completed_at,
            duration_ms: Some(duration_ms),
            success,
            error: error.map(|message| ErrorEntry::new(TOOL_ERROR_CODE, message)),
            parameters: pending.parameters,
            result_payload: result_payload.cloned(),
        });
    }

    fn expire(&mut self, now: OffsetDateTime, out: &mut Correlated) {
        let expired: Vec<u64> = self
            .order
            .iter()
            .filter(|(_, id)| self.pending.get(*id).is_some_and(|p| now > p.timeout_at))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(id) = self.order.remove(&seq) {
                if let Some(pending) = self.pending.remove(&id) {
                    self.time_out(id, pending, now, out);
                }
            }
        }
    }

    fn time_out(&mut self, id: String, pending: Pending, at: OffsetDateTime, out: &mut Correlated) {
        tracing::debug!(invocation_id = %id, tool = %pending.tool_name, "orphaned invocation timed out");
        if let Some(agent) = pending.agent.clone() {
            out.agent_runs.push(AgentInvocation {
                agent,
                session: pending.session.clone(),
                ts: pending.invoked_at,
                duration_ms: self.orphan_timeout.whole_milliseconds() as i64,
                success: false,
                confidence: 1.0,
            });
        }
        out.completed.push(CompletedInvocation {
            invocation_id: id,
            tool_name: pending.tool_name,
            session: pending.session,
            invoked_at: pending.invoked_at,
            completed_at: at,
            duration_ms: None,
            success: false,
            error: Some(ErrorEntry::timeout()),
            parameters: pending.parameters,
            result_payload: None,
        });
    }

    fn delegate(&mut self, session: &str, to: &str, ts: OffsetDateTime) -> DelegationEdge {
        let from = self
            .last_agent
            .insert(session.to_string(), to.to_string())
            .unwrap_or_else(|| ROOT_AGENT.to_string());
        DelegationEdge {
            session: session.to_string(),
            from_agent: from,
            to_agent: to.to_string(),
            ts,
        }
    }
}

/// Runs a whole event sequence through `correlator`, then expires whatever the
/// final watermark has passed.
pub fn correlate_all<'a>(
    correlator: &mut Correlator,
    events: impl IntoIterator<Item = &'a Event>,
) -> Correlated {
    let mut out = Correlated::default();
    for event in events {
        out.extend(correlator.process(event));
    }
    out.extend(correlator.flush());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::timefmt::SENTINEL;
    use tally_core::TaskParams;

    fn invoke(session: &str, ts: OffsetDateTime, id: &str, tool: &str) -> Event {
        Event::ToolInvocation {
            session: session.into(),
            ts,
            invocation_id: id.into(),
            tool_name: tool.into(),
            parameters: Parameters::default(),
        }
    }

    fn result(session: &str, ts: OffsetDateTime, id: &str, error: Option<&str>) -> Event {
        Event::ToolResult {
            session: session.into(),
            ts,
            invocation_id: id.into(),
            tool_name: None,
            output: None,
            error: error.map(String::from),
            result_payload: None,
        }
    }

    fn task(session: &str, ts: OffsetDateTime, id: &str, agent: &str) -> Event {
        Event::ToolInvocation {
            session: session.into(),
            ts,
            invocation_id: id.into(),
            tool_name: "Task".into(),
            parameters: Parameters::Task(TaskParams {
                subagent_type: Some(agent.into()),
                description: None,
                prompt: None,
            }),
        }
    }

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_735_689_610).unwrap()
    }

    #[test]
    fn pairs_invocation_with_result() {
        let mut c = Correlator::default();
        assert!(c.process(&invoke("s1", t0(), "i1", "Bash")).is_empty());
        assert_eq!(c.pending_len(), 1);
        let out = c.process(&result("s1", t0() + Duration::milliseconds(150), "i1", None));
        assert_eq!(out.completed.len(), 1);
        let done = &out.completed[0];
        assert_eq!(done.tool_name, "Bash");
        assert_eq!(done.duration_ms, Some(150));
        assert!(done.success);
        assert!(done.completed_at >= done.invoked_at);
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn failed_result_carries_error() {
        let mut c = Correlator::default();
        c.process(&invoke("s1", t0(), "i1", "Bash"));
        let out = c.process(&result("s1", t0(), "i1", Some("boom")));
        let err = out.completed[0].error.as_ref().unwrap();
        assert_eq!(err.code, TOOL_ERROR_CODE);
        assert_eq!(err.message, "boom");
        assert!(!out.completed[0].success);
    }

    #[test]
    fn unmatched_result_dropped() {
        let mut c = Correlator::default();
        assert!(c.process(&result("s1", t0(), "ghost", None)).is_empty());
    }

    #[test]
    fn result_before_invocation_clamps_to_zero() {
        let mut c = Correlator::default();
        c.process(&invoke("s1", t0(), "i1", "Read"));
        let out = c.process(&result("s1", t0() - Duration::seconds(1), "i1", None));
        assert_eq!(out.completed[0].duration_ms, Some(0));
        assert_eq!(out.completed[0].completed_at, t0());
    }

    #[test]
    fn orphan_expires_on_later_event_from_any_session() {
        let mut c = Correlator::new(Duration::seconds(10), "Task");
        c.process(&invoke("s1", t0(), "i1", "Read"));
        // Exactly at timeout_at: not yet.
        let at = c.process(&Event::UserInput {
            session: "s2".into(),
            ts: t0() + Duration::seconds(10),
            text: String::new(),
        });
        assert!(at.completed.is_empty());
        let trigger = t0() + Duration::seconds(10) + Duration::milliseconds(1);
        let out = c.process(&Event::UserInput {
            session: "s2".into(),
            ts: trigger,
            text: String::new(),
        });
        assert_eq!(out.completed.len(), 1);
        let done = &out.completed[0];
        assert!(done.timed_out());
        assert_eq!(done.duration_ms, None);
        assert_eq!(done.completed_at, trigger);
    }

    #[test]
    fn simultaneous_expiry_in_insertion_order() {
        let mut c = Correlator::new(Duration::seconds(1), "Task");
        c.process(&invoke("s1", t0() + Duration::milliseconds(500), "late", "Read"));
        c.process(&invoke("s2", t0(), "early", "Read"));
        c.process(&invoke("s1", t0() + Duration::milliseconds(100), "mid", "Read"));
        let out = c.process(&Event::UserInput {
            session: "s3".into(),
            ts: t0() + Duration::seconds(5),
            text: String::new(),
        });
        let ids: Vec<&str> = out
            .completed
            .iter()
            .map(|c| c.invocation_id.as_str())
            .collect();
        assert_eq!(ids, ["late", "early", "mid"]);
    }

    #[test]
    fn flush_keeps_invocations_inside_their_window() {
        let mut c = Correlator::default();
        c.process(&invoke("s1", t0(), "i1", "Read"));
        c.process(&Event::UserInput {
            session: "s1".into(),
            ts: t0() + Duration::seconds(3),
            text: String::new(),
        });
        assert!(c.flush().is_empty());
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn absorbed_pending_expires_against_merged_watermark() {
        let mut store = Correlator::new(Duration::seconds(10), "Task");
        let mut reader = Correlator::new(Duration::seconds(10), "Task");
        reader.process(&invoke("s1", t0(), "i1", "Read"));
        store.process(&Event::UserInput {
            session: "s2".into(),
            ts: t0() + Duration::seconds(60),
            text: String::new(),
        });

        store.absorb(reader);
        assert_eq!(store.pending_len(), 1);
        let out = store.flush();
        assert_eq!(out.completed.len(), 1);
        assert!(out.completed[0].timed_out());
        assert_eq!(out.completed[0].completed_at, t0() + Duration::seconds(60));
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn absorbed_pending_still_pairs_with_its_result() {
        let mut store = Correlator::default();
        let mut reader = Correlator::default();
        reader.process(&invoke("s1", t0(), "i1", "Bash"));
        store.absorb(reader);
        let out = store.process(&result("s1", t0() + Duration::milliseconds(40), "i1", None));
        assert_eq!(out.completed[0].duration_ms, Some(40));
    }

    #[test]
    fn invocation_without_timestamp_is_not_tracked() {
        let mut c = Correlator::default();
        let out = c.process(&invoke("s1", SENTINEL, "i1", "Bash"));
        assert!(out.is_empty());
        assert_eq!(c.pending_len(), 0);
        let late = c.process(&result("s1", t0(), "i1", None));
        assert!(late.completed.is_empty());
    }

    #[test]
    fn delegation_edges_chain_from_root() {
        let mut c = Correlator::default();
        let a = c.process(&task("s1", t0(), "t1", "planner"));
        assert_eq!(a.edges.len(), 1);
        assert_eq!(a.edges[0].from_agent, ROOT_AGENT);
        assert_eq!(a.edges[0].to_agent, "planner");
        let b = c.process(&task("s1", t0() + Duration::seconds(1), "t2", "coder"));
        assert_eq!(b.edges[0].from_agent, "planner");
        assert_eq!(b.edges[0].to_agent, "coder");
        // Other sessions start from root again.
        let other = c.process(&task("s2", t0() + Duration::seconds(1), "t3", "coder"));
        assert_eq!(other.edges[0].from_agent, ROOT_AGENT);
    }

    #[test]
    fn non_delegation_tool_yields_no_edge() {
        let mut c = Correlator::default();
        let out = c.process(&Event::ToolInvocation {
            session: "s1".into(),
            ts: t0(),
            invocation_id: "x".into(),
            tool_name: "Bash".into(),
            parameters: Parameters::Opaque(json!({"subagent_type": "planner"})),
        });
        assert!(out.edges.is_empty());
    }

    #[test]
    fn completed_delegation_records_agent_run() {
        let mut c = Correlator::default();
        c.process(&task("s1", t0(), "t1", "planner"));
        let out = c.process(&result("s1", t0() + Duration::seconds(2), "t1", None));
        assert_eq!(out.agent_runs.len(), 1);
        let run = &out.agent_runs[0];
        assert_eq!(run.agent, "planner");
        assert_eq!(run.duration_ms, 2000);
        assert!(run.success);
        assert_eq!(run.confidence, 1.0);
    }

    #[test]
    fn result_echoing_other_agent_adds_edge() {
        let mut c = Correlator::default();
        c.process(&task("s1", t0(), "t1", "planner"));
        let echo = Event::ToolResult {
            session: "s1".into(),
            ts: t0() + Duration::seconds(1),
            invocation_id: "t1".into(),
            tool_name: Some("Task".into()),
            output: None,
            error: None,
            result_payload: Some(json!({"subagent_type": "reviewer"})),
        };
        let out = c.process(&echo);
        assert_eq!(out.edges.len(), 1);
        assert_eq!(out.edges[0].from_agent, "planner");
        assert_eq!(out.edges[0].to_agent, "reviewer");

        // Echoing the same agent adds nothing.
        c.process(&task("s1", t0() + Duration::seconds(2), "t2", "coder"));
        let same = Event::ToolResult {
            session: "s1".into(),
            ts: t0() + Duration::seconds(3),
            invocation_id: "t2".into(),
            tool_name: None,
            output: None,
            error: None,
            result_payload: Some(json!({"subagent_type": "coder"})),
        };
        assert!(c.process(&same).edges.is_empty());
    }

    #[test]
    fn correlate_all_leaves_fresh_calls_pending() {
        let events = vec![
            invoke("s1", t0(), "i1", "Bash"),
            result("s1", t0() + Duration::milliseconds(5), "i1", None),
            invoke("s1", t0() + Duration::milliseconds(10), "i2", "Read"),
        ];
        let mut c = Correlator::default();
        let out = correlate_all(&mut c, &events);
        assert_eq!(out.completed.len(), 1);
        assert!(out.completed[0].success);
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn reset_drops_pending() {
        let mut c = Correlator::default();
        c.process(&invoke("s1", t0(), "i1", "Bash"));
        c.reset();
        assert_eq!(c.pending_len(), 0);
        assert!(c.flush().is_empty());
    }
}
