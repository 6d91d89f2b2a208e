use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tally_core::{DelegationEdge, Result, StatsError};
use time::OffsetDateTime;

use crate::merge::Aggregate;
use crate::snapshot::{
    CoOccurrence, DelegationChain, DelegationStats, SessionBoundary, TransitionPattern,
};

#[derive(Debug, Clone, Default)]
struct GraphState {
    transitions: HashMap<(String, String), TransitionPattern>,
    chains: HashMap<String, DelegationChain>,
    session_agents: HashMap<String, BTreeSet<String>>,
    cooccurrences: HashMap<(String, String), CoOccurrence>,
    boundaries: HashMap<String, Vec<SessionBoundary>>,
}

impl GraphState {
    fn pair(&mut self, session: &str, a: &str, b: &str, ts: OffsetDateTime) {
        if a == b {
            return;
        }
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        let entry = self
            .cooccurrences
            .entry((a.to_string(), b.to_string()))
            .or_insert_with(|| CoOccurrence {
                agent_a: a.to_string(),
                agent_b: b.to_string(),
                count: 0,
                sessions: Vec::new(),
                last_seen: ts,
            });
        if !entry.sessions.iter().any(|s| s == session) {
            entry.sessions.push(session.to_string());
            entry.count = entry.sessions.len() as u64;
        }
        entry.last_seen = entry.last_seen.max(ts);
    }
}

/// Agent transitions, per-session chains and co-occurrence.
#[derive(Debug, Default)]
pub struct DelegationGraph {
    state: RwLock<GraphState>,
}

impl DelegationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_edge(&self, edge: &DelegationEdge) -> Result<()> {
        self.record_transition(&edge.session, &edge.from_agent, &edge.to_agent, edge.ts)
    }

    pub fn record_transition(
        &self,
        session: &str,
        from: &str,
        to: &str,
        ts: OffsetDateTime,
    ) -> Result<()> {
        if session.is_empty() || from.is_empty() || to.is_empty() {
            return Err(StatsError::invalid_invocation(format!(
                "transition needs session, source and target (got {session:?}, {from:?} -> {to:?})"
            )));
        }
        let mut state = self.write();

        let pattern = state
            .transitions
            .entry((from.to_string(), to.to_string()))
            .or_insert_with(|| TransitionPattern {
                from: from.to_string(),
                to: to.to_string(),
                count: 0,
                last_seen: ts,
                last_session: session.to_string(),
            });
        pattern.count += 1;
        if ts >= pattern.last_seen {
            pattern.last_seen = ts;
            pattern.last_session = session.to_string();
        }

        let chain = state
            .chains
            .entry(session.to_string())
            .or_insert_with(|| DelegationChain {
                session: session.to_string(),
                agents: vec![from.to_string()],
                start: ts,
                end: ts,
            });
        chain.agents.push(to.to_string());
        chain.start = chain.start.min(ts);
        chain.end = chain.end.max(ts);

        let agents = state.session_agents.entry(session.to_string()).or_default();
        agents.insert(from.to_string());
        agents.insert(to.to_string());

        state.pair(session, from, to, ts);
        Ok(())
    }

    /// Registers a set of agents seen together in `session`. Chains are untouched.
    pub fn record_session_agents(
        &self,
        session: &str,
        agents: &[String],
        ts: OffsetDateTime,
    ) -> Result<()> {
        if session.is_empty() {
            return Err(StatsError::invalid_invocation("session agents need a session"));
        }
        let agents: Vec<&str> = agents
            .iter()
            .map(String::as_str)
            .filter(|a| !a.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut state = self.write();
        let known = state.session_agents.entry(session.to_string()).or_default();
        known.extend(agents.iter().map(|a| a.to_string()));
        for (i, a) in agents.iter().enumerate() {
            for b in &agents[i + 1..] {
                state.pair(session, a, b, ts);
            }
        }
        Ok(())
    }

    pub fn record_boundary(&self, session: &str, kind: &str, ts: OffsetDateTime) -> Result<()> {
        if session.is_empty() || kind.is_empty() {
            return Err(StatsError::invalid_invocation("boundary needs session and kind"));
        }
        self.write()
            .boundaries
            .entry(session.to_string())
            .or_default()
            .push(SessionBoundary {
                kind: kind.to_string(),
                ts,
            });
        Ok(())
    }

    pub fn chain(&self, session: &str) -> Result<DelegationChain> {
        self.read()
            .chains
            .get(session)
            .cloned()
            .ok_or_else(|| StatsError::not_found("delegation chain", session))
    }

    pub fn chains(&self) -> Vec<DelegationChain> {
        let mut chains: Vec<DelegationChain> = self.read().chains.values().cloned().collect();
        chains.sort_by(|a, b| a.start.cmp(&b.start).then(a.session.cmp(&b.session)));
        chains
    }

    /// True when any agent appears more than once in the session's chain.
    pub fn has_cycle(&self, session: &str) -> bool {
        let state = self.read();
        let Some(chain) = state.chains.get(session) else {
            return false;
        };
        let mut seen = HashSet::new();
        chain.agents.iter().any(|a| !seen.insert(a.as_str()))
    }

    /// Most frequent transitions first; `limit == 0` returns all.
    pub fn top_transitions(&self, limit: usize) -> Vec<TransitionPattern> {
        let mut all: Vec<TransitionPattern> = self.read().transitions.values().cloned().collect();
        all.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.from.cmp(&b.from))
                .then_with(|| a.to.cmp(&b.to))
        });
        truncate(all, limit)
    }

    pub fn top_cooccurrences(&self, limit: usize) -> Vec<CoOccurrence> {
        let mut all: Vec<CoOccurrence> = self.read().cooccurrences.values().cloned().collect();
        for co in &mut all {
            co.sessions.sort();
        }
        all.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.agent_a.cmp(&b.agent_a))
                .then_with(|| a.agent_b.cmp(&b.agent_b))
        });
        truncate(all, limit)
    }

    /// Transitions last seen in `[start, end)`.
    pub fn transitions_in_window(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Vec<TransitionPattern> {
        self.top_transitions(0)
            .into_iter()
            .filter(|t| t.last_seen >= start && t.last_seen < end)
            .collect()
    }

    pub fn session_agents(&self, session: &str) -> Vec<String> {
        self.read()
            .session_agents
            .get(session)
            .map(|agents| agents.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn boundaries(&self, session: &str) -> Vec<SessionBoundary> {
        self.read()
            .boundaries
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> DelegationStats {
        let state = self.read();
        let sessions_with_chains = state.chains.len();
        let total_len: usize = state.chains.values().map(|c| c.agents.len()).sum();
        DelegationStats {
            total_transitions: state.transitions.len(),
            transition_events: state.transitions.values().map(|t| t.count).sum(),
            total_cooccurrences: state.cooccurrences.len(),
            sessions_with_chains,
            avg_chain_length: if sessions_with_chains == 0 {
                0.0
            } else {
                total_len as f64 / sessions_with_chains as f64
            },
        }
    }

    fn absorb(&self, other: GraphState) {
        let mut state = self.write();
        for (key, theirs) in other.transitions {
            match state.transitions.get_mut(&key) {
                Some(ours) => {
                    ours.count += theirs.count;
                    if theirs.last_seen > ours.last_seen {
                        ours.last_seen = theirs.last_seen;
                        ours.last_session = theirs.last_session;
                    }
                }
                None => {
                    state.transitions.insert(key, theirs);
                }
            }
        }
        for (session, theirs) in other.chains {
            match state.chains.get_mut(&session) {
                Some(ours) => {
                    ours.agents.extend(theirs.agents);
                    ours.start = ours.start.min(theirs.start);
                    ours.end = ours.end.max(theirs.end);
                }
                None => {
                    state.chains.insert(session, theirs);
                }
            }
        }
        for (session, agents) in other.session_agents {
            state.session_agents.entry(session).or_default().extend(agents);
        }
        for (key, theirs) in other.cooccurrences {
            match state.cooccurrences.get_mut(&key) {
                Some(ours) => {
                    for s in theirs.sessions {
                        if !ours.sessions.contains(&s) {
                            ours.sessions.push(s);
                        }
                    }
                    ours.count = ours.sessions.len() as u64;
                    ours.last_seen = ours.last_seen.max(theirs.last_seen);
                }
                None => {
                    state.cooccurrences.insert(key, theirs);
                }
            }
        }
        for (session, theirs) in other.boundaries {
            let ours = state.boundaries.entry(session).or_default();
            ours.extend(theirs);
            ours.sort_by(|a, b| a.ts.cmp(&b.ts));
        }
    }
}

impl Aggregate for DelegationGraph {
    fn kind(&self) -> &'static str {
        "delegation-graph"
    }

    fn reset(&self) {
        *self.write() = GraphState::default();
    }

    fn merge_from(&self, other: &dyn Aggregate) -> Result<()> {
        let other = crate::merge::downcast::<Self>(self, other)?;
        let snapshot = other.read().clone();
        self.absorb(snapshot);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn truncate<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    if limit > 0 {
        items.truncate(limit);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    #[test]
    fn chain_starts_with_source() {
        let g = DelegationGraph::new();
        g.record_transition("s1", "A", "B", ts(0)).unwrap();
        g.record_transition("s1", "B", "C", ts(1)).unwrap();
        let chain = g.chain("s1").unwrap();
        assert_eq!(chain.agents, ["A", "B", "C"]);
        assert_eq!(chain.start, ts(0));
        assert_eq!(chain.end, ts(1));
        assert!(!g.has_cycle("s1"));
    }

    #[test]
    fn self_delegation_is_a_cycle() {
        let g = DelegationGraph::new();
        g.record_transition("s1", "A", "A", ts(0)).unwrap();
        assert_eq!(g.chain("s1").unwrap().agents, ["A", "A"]);
        assert!(g.has_cycle("s1"));
        // No co-occurrence of an agent with itself.
        assert!(g.top_cooccurrences(0).is_empty());
    }

    #[test]
    fn rejects_empty_fields() {
        let g = DelegationGraph::new();
        assert!(g.record_transition("", "A", "B", ts(0)).is_err());
        assert!(g.record_transition("s1", "", "B", ts(0)).is_err());
        assert!(g.record_transition("s1", "A", "", ts(0)).is_err());
        assert!(g.record_boundary("s1", "", ts(0)).is_err());
        assert_eq!(g.stats(), DelegationStats::default());
    }

    #[test]
    fn unknown_chain_not_found() {
        let g = DelegationGraph::new();
        assert!(matches!(
            g.chain("nope"),
            Err(StatsError::NotFound { .. })
        ));
        assert!(!g.has_cycle("nope"));
    }

    #[test]
    fn top_transitions_ordering() {
        let g = DelegationGraph::new();
        g.record_transition("s1", "b", "c", ts(0)).unwrap();
        g.record_transition("s1", "a", "z", ts(1)).unwrap();
        g.record_transition("s2", "x", "y", ts(2)).unwrap();
        g.record_transition("s3", "x", "y", ts(3)).unwrap();
        let top = g.top_transitions(0);
        let keys: Vec<(&str, &str, u64)> = top
            .iter()
            .map(|t| (t.from.as_str(), t.to.as_str(), t.count))
            .collect();
        assert_eq!(keys, [("x", "y", 2), ("a", "z", 1), ("b", "c", 1)]);
        assert_eq!(top[0].last_session, "s3");
        assert_eq!(g.top_transitions(1).len(), 1);
    }

    #[test]
    fn window_filters_on_last_seen() {
        let g = DelegationGraph::new();
        g.record_transition("s1", "a", "b", ts(0)).unwrap();
        g.record_transition("s1", "b", "c", ts(10)).unwrap();
        let hits = g.transitions_in_window(ts(5), ts(10) + Duration::seconds(1));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].from, "b");
        assert!(g.transitions_in_window(ts(11), ts(20)).is_empty());
    }

    #[test]
    fn returned_values_are_copies() {
        let g = DelegationGraph::new();
        g.record_transition("s1", "a", "b", ts(0)).unwrap();
        let before = g.chain("s1").unwrap();
        g.record_transition("s1", "b", "c", ts(1)).unwrap();
        assert_eq!(before.agents, ["a", "b"]);
    }

    #[test]
    fn bulk_agents_pair_every_combination() {
        let g = DelegationGraph::new();
        let agents = vec!["c".to_string(), "a".to_string(), "b".to_string(), "a".to_string()];
        g.record_session_agents("s1", &agents, ts(0)).unwrap();
        let pairs: Vec<(String, String)> = g
            .top_cooccurrences(0)
            .into_iter()
            .map(|c| (c.agent_a, c.agent_b))
            .collect();
        assert_eq!(pairs.len(), 3);
        assert!(pairs.contains(&("a".into(), "b".into())));
        assert!(pairs.contains(&("a".into(), "c".into())));
        assert!(pairs.contains(&("b".into(), "c".into())));
        assert_eq!(g.session_agents("s1"), ["a", "b", "c"]);
        assert!(g.chain("s1").is_err());
    }

    #[test]
    fn boundaries_append() {
        let g = DelegationGraph::new();
        g.record_boundary("s1", "start", ts(0)).unwrap();
        g.record_boundary("s1", "summary", ts(9)).unwrap();
        let b = g.boundaries("s1");
        assert_eq!(b.len(), 2);
        assert_eq!(b[1].kind, "summary");
    }

    #[test]
    fn stats_and_reset() {
        let g = DelegationGraph::new();
        g.record_transition("s1", "a", "b", ts(0)).unwrap();
        g.record_transition("s1", "b", "a", ts(1)).unwrap();
        g.record_transition("s2", "a", "b", ts(2)).unwrap();
        let stats = g.stats();
        assert_eq!(stats.total_transitions, 2);
        assert_eq!(stats.transition_events, 3);
        assert_eq!(stats.total_cooccurrences, 1);
        assert_eq!(stats.sessions_with_chains, 2);
        assert_eq!(stats.avg_chain_length, 2.5);
        g.reset();
        assert_eq!(g.stats(), DelegationStats::default());
    }

    #[test]
    fn merge_unions_sessions() {
        let a = DelegationGraph::new();
        let b = DelegationGraph::new();
        a.record_transition("s1", "x", "y", ts(0)).unwrap();
        b.record_transition("s1", "x", "y", ts(5)).unwrap();
        b.record_transition("s2", "y", "x", ts(6)).unwrap();
        a.merge_from(&b).unwrap();
        let co = a.top_cooccurrences(0);
        assert_eq!(co.len(), 1);
        assert_eq!(co[0].count, 2);
        assert_eq!(co[0].sessions, ["s1", "s2"]);
        assert_eq!(co[0].last_seen, ts(6));
        let xy = &a.top_transitions(0)[0];
        assert_eq!((xy.from.as_str(), xy.count), ("x", 2));
        assert!(a.merge_from(&a).is_err());
    }
}
