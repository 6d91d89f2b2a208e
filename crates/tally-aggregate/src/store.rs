use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tally_core::timefmt::{is_sentinel, millis_between};
use tally_core::{
    AgentInvocation, CompletedInvocation, ErrorEntry, Event, Result, StatsError, TokenUsage,
};
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::agents::{AgentAggregator, DEFAULT_MAX_AGENTS};
use crate::command::extract_commands;
use crate::correlate::{Correlated, Correlator, DEFAULT_DELEGATION_TOOL, DEFAULT_ORPHAN_TIMEOUT};
use crate::delegation::DelegationGraph;
use crate::merge::Aggregate;
use crate::snapshot::{
    max_opt, min_opt, ratio, DailyActivity, ErrorFrequency, ErrorOccurrence, ErrorPattern,
    GlobalSnapshot, HourActivity, PerformanceMetrics, Period, SessionSnapshot, ToolSessionStats,
    ToolSnapshot,
};
use crate::tdigest::{TDigest, DEFAULT_MAX_CENTROIDS};
use crate::welford::Welford;

/// Distinct error messages kept per tool.
pub const ERROR_RING_CAPACITY: usize = 10;
const TOP_ERRORS: usize = 10;
const MOST_ACTIVE_HOURS: usize = 3;

pub const BOUNDARY_START: &str = "start";
pub const BOUNDARY_SUMMARY: &str = "summary";

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub orphan_timeout: Duration,
    pub delegation_tool: String,
    pub max_centroids: usize,
    pub max_agents: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            orphan_timeout: DEFAULT_ORPHAN_TIMEOUT,
            delegation_tool: DEFAULT_DELEGATION_TOOL.to_string(),
            max_centroids: DEFAULT_MAX_CENTROIDS,
            max_agents: DEFAULT_MAX_AGENTS,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SessionData {
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
    user_messages: u64,
    assistant_messages: u64,
    system_messages: u64,
    commands_used: u64,
    tokens: TokenUsage,
    tool_stats: BTreeMap<String, ToolSessionStats>,
    errors: Vec<ErrorOccurrence>,
    invocations: Vec<CompletedInvocation>,
}

impl SessionData {
    fn touch(&mut self, ts: OffsetDateTime) {
        if is_sentinel(ts) {
            return;
        }
        self.start = min_opt(self.start, Some(ts));
        self.end = max_opt(self.end, Some(ts));
    }

    fn record(&mut self, inv: &CompletedInvocation) {
        self.tool_stats
            .entry(inv.tool_name.clone())
            .or_insert_with(|| ToolSessionStats::new(&inv.tool_name))
            .record(inv);
        if let (false, Some(error)) = (inv.success, &inv.error) {
            self.errors.push(ErrorOccurrence {
                ts: inv.completed_at,
                tool_name: inv.tool_name.clone(),
                invocation_id: Some(inv.invocation_id.clone()),
                error: error.clone(),
            });
        }
        self.invocations.push(inv.clone());
    }

    fn absorb(&mut self, other: SessionData) {
        self.start = min_opt(self.start, other.start);
        self.end = max_opt(self.end, other.end);
        self.user_messages += other.user_messages;
        self.assistant_messages += other.assistant_messages;
        self.system_messages += other.system_messages;
        self.commands_used += other.commands_used;
        self.tokens.add(&other.tokens);
        for (tool, theirs) in other.tool_stats {
            match self.tool_stats.get_mut(&tool) {
                Some(ours) => ours.absorb(&theirs),
                None => {
                    self.tool_stats.insert(tool, theirs);
                }
            }
        }
        self.errors.extend(other.errors);
        self.invocations.extend(other.invocations);
    }

    fn snapshot(&self, id: &str) -> SessionSnapshot {
        let total: u64 = self.tool_stats.values().map(|s| s.call_count).sum();
        let success: u64 = self.tool_stats.values().map(|s| s.success_count).sum();
        let failure: u64 = self.tool_stats.values().map(|s| s.failure_count).sum();
        SessionSnapshot {
            session_id: id.to_string(),
            start_time: self.start,
            end_time: self.end,
            duration_ms: self.duration_ms().unwrap_or(0),
            user_messages: self.user_messages,
            assistant_messages: self.assistant_messages,
            system_messages: self.system_messages,
            total_tool_calls: total,
            successful_calls: success,
            failed_calls: failure,
            error_rate: ratio(failure, total),
            commands_used: self.commands_used,
            tokens: self.tokens,
            tool_stats: self.tool_stats.clone(),
            errors: self.errors.clone(),
            invocations: self.invocations.clone(),
        }
    }

    fn duration_ms(&self) -> Option<i64> {
        Some(millis_between(self.start?, self.end?))
    }
}

#[derive(Debug, Clone)]
struct ToolData {
    total_calls: u64,
    success: u64,
    failure: u64,
    total_duration_ms: i64,
    sessions: BTreeSet<String>,
    first_used: Option<OffsetDateTime>,
    last_used: Option<OffsetDateTime>,
    welford: Welford,
    digest: TDigest,
    error_types: BTreeMap<String, u64>,
    common_errors: VecDeque<String>,
    hourly: [u64; 24],
}

impl ToolData {
    fn new(max_centroids: usize) -> Self {
        Self {
            total_calls: 0,
            success: 0,
            failure: 0,
            total_duration_ms: 0,
            sessions: BTreeSet::new(),
            first_used: None,
            last_used: None,
            welford: Welford::new(),
            digest: TDigest::new(max_centroids),
            error_types: BTreeMap::new(),
            common_errors: VecDeque::with_capacity(ERROR_RING_CAPACITY),
            hourly: [0; 24],
        }
    }

    fn record(&mut self, inv: &CompletedInvocation) {
        self.total_calls += 1;
        if inv.success {
            self.success += 1;
        } else {
            self.failure += 1;
        }
        if !self.sessions.contains(&inv.session) {
            self.sessions.insert(inv.session.clone());
        }
        self.first_used = min_opt(self.first_used, Some(inv.invoked_at));
        self.last_used = max_opt(self.last_used, Some(inv.invoked_at));

        if let Some(d) = inv.duration_ms {
            self.total_duration_ms += d;
            self.welford.update(d as f64);
            self.digest.add(d as f64);
            self.hourly[utc_hour(inv.invoked_at)] += 1;
        }

        if let (false, Some(error)) = (inv.success, &inv.error) {
            *self.error_types.entry(error.code.clone()).or_insert(0) += 1;
            self.remember_error(&error.message);
        }
    }

    fn remember_error(&mut self, message: &str) {
        if message.is_empty() || self.common_errors.iter().any(|m| m == message) {
            return;
        }
        if self.common_errors.len() == ERROR_RING_CAPACITY {
            self.common_errors.pop_front();
        }
        self.common_errors.push_back(message.to_string());
    }

    fn absorb(&mut self, other: ToolData) {
        self.total_calls += other.total_calls;
        self.success += other.success;
        self.failure += other.failure;
        self.total_duration_ms += other.total_duration_ms;
        self.sessions.extend(other.sessions);
        self.first_used = min_opt(self.first_used, other.first_used);
        self.last_used = max_opt(self.last_used, other.last_used);
        for (code, n) in other.error_types {
            *self.error_types.entry(code).or_insert(0) += n;
        }
        for message in &other.common_errors {
            self.remember_error(message);
        }
        for (ours, theirs) in self.hourly.iter_mut().zip(other.hourly) {
            *ours += theirs;
        }
    }

    fn snapshot(&self, name: &str) -> ToolSnapshot {
        ToolSnapshot {
            name: name.to_string(),
            total_calls: self.total_calls,
            unique_sessions: self.sessions.len(),
            success_count: self.success,
            failure_count: self.failure,
            success_rate: ratio(self.success, self.total_calls),
            total_duration_ms: self.total_duration_ms,
            avg_duration_ms: self.welford.mean(),
            std_dev_ms: self.welford.std_dev(),
            min_duration_ms: self.welford.min(),
            max_duration_ms: self.welford.max(),
            median_duration_ms: self.digest.quantile(0.5),
            p95_duration_ms: self.digest.quantile(0.95),
            p99_duration_ms: self.digest.quantile(0.99),
            error_types: self.error_types.clone(),
            common_errors: self.common_errors.iter().cloned().collect(),
            hourly_usage: self.hourly.to_vec(),
            peak_hour: peak_hour(&self.hourly),
            first_used: self.first_used,
            last_used: self.last_used,
        }
    }
}

/// Everything the store accumulates, minus the in-flight correlation.
#[derive(Debug, Clone, Default)]
struct Tables {
    max_centroids: usize,
    sessions: BTreeMap<String, SessionData>,
    tools: BTreeMap<String, ToolData>,
    commands: BTreeMap<String, u64>,
    tokens: TokenUsage,
    earliest: Option<OffsetDateTime>,
    latest: Option<OffsetDateTime>,
}

/// A session boundary to hand to the delegation graph once the store lock drops.
struct Boundary {
    session: String,
    kind: &'static str,
    ts: OffsetDateTime,
}

impl Tables {
    fn new(max_centroids: usize) -> Self {
        Self {
            max_centroids,
            ..Self::default()
        }
    }

    fn session(
        &mut self,
        id: &str,
        ts: OffsetDateTime,
        boundaries: &mut Vec<Boundary>,
    ) -> &mut SessionData {
        if !is_sentinel(ts) {
            self.earliest = min_opt(self.earliest, Some(ts));
            self.latest = max_opt(self.latest, Some(ts));
        }
        if !self.sessions.contains_key(id) {
            boundaries.push(Boundary {
                session: id.to_string(),
                kind: BOUNDARY_START,
                ts,
            });
        }
        let session = self.sessions.entry(id.to_string()).or_default();
        session.touch(ts);
        session
    }

    fn observe(&mut self, event: &Event, boundaries: &mut Vec<Boundary>) {
        let session = self.session(event.session(), event.ts(), boundaries);
        match event {
            Event::UserInput { .. } => session.user_messages += 1,
            Event::SystemEvent { .. } => session.system_messages += 1,
            Event::AssistantText {
                text,
                input_tokens,
                output_tokens,
                ..
            } => {
                session.assistant_messages += 1;
                let usage = TokenUsage::from_counts(*input_tokens, *output_tokens);
                session.tokens.add(&usage);
                let commands = extract_commands(text);
                session.commands_used += commands.len() as u64;
                self.tokens.add(&usage);
                for name in commands {
                    *self.commands.entry(name).or_insert(0) += 1;
                }
            }
            Event::SessionSummary {
                session: id,
                ts,
                tokens,
                errors,
            } => {
                session.tokens.add(tokens);
                session.errors.extend(errors.iter().map(|error| ErrorOccurrence {
                    ts: *ts,
                    tool_name: String::new(),
                    invocation_id: None,
                    error: error.clone(),
                }));
                self.tokens.add(tokens);
                boundaries.push(Boundary {
                    session: id.clone(),
                    kind: BOUNDARY_SUMMARY,
                    ts: *ts,
                });
            }
            Event::ToolInvocation { .. } | Event::ToolResult { .. } => {}
        }
    }

    fn record(&mut self, inv: &CompletedInvocation, boundaries: &mut Vec<Boundary>) {
        if is_sentinel(inv.invoked_at) {
            tracing::debug!(
                invocation_id = %inv.invocation_id,
                "completion without timestamp ignored"
            );
            return;
        }
        self.session(&inv.session, inv.invoked_at, boundaries)
            .record(inv);
        let max_centroids = self.max_centroids;
        self.tools
            .entry(inv.tool_name.clone())
            .or_insert_with(|| ToolData::new(max_centroids))
            .record(inv);
    }

    fn absorb(&mut self, other: Tables) {
        for (id, theirs) in other.sessions {
            match self.sessions.get_mut(&id) {
                Some(ours) => ours.absorb(theirs),
                None => {
                    self.sessions.insert(id, theirs);
                }
            }
        }
        for (name, theirs) in other.tools {
            match self.tools.get_mut(&name) {
                Some(ours) => ours.absorb(theirs),
                None => {
                    self.tools.insert(name, theirs);
                }
            }
        }
        for (name, n) in other.commands {
            *self.commands.entry(name).or_insert(0) += n;
        }
        self.tokens.add(&other.tokens);
        self.earliest = min_opt(self.earliest, other.earliest);
        self.latest = max_opt(self.latest, other.latest);
    }

    fn global(&self, pending: usize) -> GlobalSnapshot {
        let tools: BTreeMap<String, ToolSnapshot> = self
            .tools
            .iter()
            .map(|(name, data)| (name.clone(), data.snapshot(name)))
            .collect();
        let total_calls: u64 = self.tools.values().map(|t| t.total_calls).sum();
        let total_success: u64 = self.tools.values().map(|t| t.success).sum();
        let total_failure: u64 = self.tools.values().map(|t| t.failure).sum();

        let period = match (self.earliest, self.latest) {
            (Some(start), Some(end)) => Some(Period {
                start,
                end,
                duration_ms: millis_between(start, end),
            }),
            _ => None,
        };

        let durations: Vec<i64> = self
            .sessions
            .values()
            .filter_map(SessionData::duration_ms)
            .collect();
        let avg_session_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<i64>() as f64 / durations.len() as f64
        };

        let mut hourly = [0u64; 24];
        for tool in self.tools.values() {
            for (h, n) in tool.hourly.iter().enumerate() {
                hourly[h] += n;
            }
        }

        let (error_patterns, top_errors) = self.errors();

        GlobalSnapshot {
            period,
            total_sessions: self.sessions.len(),
            avg_session_duration_ms,
            total_tool_calls: total_calls,
            total_success,
            total_failure,
            success_rate: ratio(total_success, total_calls),
            total_tokens: self.tokens,
            tools,
            commands: self.commands.clone(),
            error_patterns,
            top_errors,
            most_active_hours: most_active_hours(&hourly),
            hourly_activity: (0u8..24)
                .map(|hour| HourActivity {
                    hour,
                    tool_calls: hourly[hour as usize],
                })
                .collect(),
            daily_activity: self.daily(),
            performance: self.performance(total_calls, period),
            pending_invocations: pending,
        }
    }

    fn errors(&self) -> (Vec<ErrorPattern>, Vec<ErrorFrequency>) {
        let mut patterns: BTreeMap<(&str, &str), ErrorPattern> = BTreeMap::new();
        let mut pattern_tools: HashMap<(&str, &str), BTreeSet<&str>> = HashMap::new();
        let mut frequencies: BTreeMap<(&str, &str, &str), u64> = BTreeMap::new();
        let mut total = 0u64;

        for occurrence in self.sessions.values().flat_map(|s| s.errors.iter()) {
            let ErrorEntry { code, message, .. } = &occurrence.error;
            let key = (code.as_str(), message.as_str());
            total += 1;
            let pattern = patterns.entry(key).or_insert_with(|| ErrorPattern {
                code: code.clone(),
                message: message.clone(),
                count: 0,
                tools: Vec::new(),
                first_seen: occurrence.ts,
                last_seen: occurrence.ts,
            });
            pattern.count += 1;
            pattern.first_seen = pattern.first_seen.min(occurrence.ts);
            pattern.last_seen = pattern.last_seen.max(occurrence.ts);
            if !occurrence.tool_name.is_empty() {
                pattern_tools
                    .entry(key)
                    .or_default()
                    .insert(occurrence.tool_name.as_str());
            }
            *frequencies
                .entry((code.as_str(), message.as_str(), occurrence.tool_name.as_str()))
                .or_insert(0) += 1;
        }

        let mut patterns: Vec<ErrorPattern> = patterns
            .into_iter()
            .map(|(key, mut pattern)| {
                if let Some(tools) = pattern_tools.remove(&key) {
                    pattern.tools = tools.into_iter().map(str::to_string).collect();
                }
                pattern
            })
            .collect();
        // Stable sort keeps the (code, message) order among equal counts.
        patterns.sort_by(|a, b| b.count.cmp(&a.count));

        let mut top: Vec<ErrorFrequency> = frequencies
            .into_iter()
            .map(|((code, message, tool), count)| ErrorFrequency {
                error_code: code.to_string(),
                error_message: message.to_string(),
                tool_name: tool.to_string(),
                count,
                percentage: ratio(count, total) * 100.0,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count));
        top.truncate(TOP_ERRORS);
        (patterns, top)
    }

    fn daily(&self) -> Vec<DailyActivity> {
        #[derive(Default)]
        struct Day<'a> {
            sessions: BTreeSet<&'a str>,
            tools: BTreeSet<&'a str>,
            calls: u64,
            success: u64,
            duration_ms: i64,
            errors: u64,
        }

        let mut days: BTreeMap<time::Date, Day<'_>> = BTreeMap::new();
        for (id, session) in &self.sessions {
            for inv in &session.invocations {
                let day = days.entry(inv.invoked_at.to_offset(UtcOffset::UTC).date()).or_default();
                day.sessions.insert(id.as_str());
                day.tools.insert(inv.tool_name.as_str());
                day.calls += 1;
                if inv.success {
                    day.success += 1;
                } else {
                    day.errors += 1;
                }
                day.duration_ms += inv.duration_ms.unwrap_or(0);
            }
        }
        days.into_iter()
            .map(|(date, day)| DailyActivity {
                date: format!(
                    "{:04}-{:02}-{:02}",
                    date.year(),
                    u8::from(date.month()),
                    date.day()
                ),
                sessions: day.sessions.len(),
                tool_calls: day.calls,
                unique_tools: day.tools.len(),
                success_rate: ratio(day.success, day.calls),
                total_duration_ms: day.duration_ms,
                errors: day.errors,
            })
            .collect()
    }

    fn performance(&self, total_calls: u64, period: Option<Period>) -> PerformanceMetrics {
        let timed: u64 = self.tools.values().map(|t| t.welford.count()).sum();
        let weighted: f64 = self
            .tools
            .values()
            .map(|t| t.welford.mean() * t.welford.count() as f64)
            .sum();
        let mut digest = TDigest::new(self.max_centroids.max(2));
        for tool in self.tools.values() {
            digest.merge(&tool.digest);
        }

        let minutes = period.map_or(0.0, |p| p.duration_ms as f64 / 60_000.0);
        let per_minute = if minutes > 0.0 {
            total_calls as f64 / minutes
        } else {
            0.0
        };

        let mut max_streak = 0u64;
        let mut spans: Vec<(OffsetDateTime, i32)> = Vec::new();
        for session in self.sessions.values() {
            let mut streak = 0u64;
            for inv in &session.invocations {
                if inv.success {
                    streak = 0;
                } else {
                    streak += 1;
                    max_streak = max_streak.max(streak);
                }
                if inv.duration_ms.is_some() {
                    spans.push((inv.invoked_at, 1));
                    spans.push((inv.completed_at, -1));
                }
            }
        }
        // Ends sort before starts at the same instant.
        spans.sort();
        let mut current = 0i64;
        let mut peak = 0i64;
        for (_, delta) in spans {
            current += i64::from(delta);
            peak = peak.max(current);
        }

        PerformanceMetrics {
            avg_response_time_ms: if timed == 0 {
                0.0
            } else {
                weighted / timed as f64
            },
            p50_response_time_ms: digest.quantile(0.5),
            p95_response_time_ms: digest.quantile(0.95),
            p99_response_time_ms: digest.quantile(0.99),
            tool_calls_per_minute: per_minute,
            tool_calls_per_hour: per_minute * 60.0,
            max_consecutive_failures: max_streak,
            peak_concurrency: peak as u64,
        }
    }
}

struct StoreState {
    tables: Tables,
    correlator: Correlator,
}

/// Shared, thread-safe aggregation store.
///
/// Session and tool tables sit behind one readers-writer lock; the per-agent
/// statistics and the delegation graph carry their own. Snapshots are owned
/// copies.
pub struct Aggregator {
    config: AggregatorConfig,
    state: RwLock<StoreState>,
    agents: AgentAggregator,
    delegation: DelegationGraph,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let state = StoreState {
            tables: Tables::new(config.max_centroids),
            correlator: Correlator::new(config.orphan_timeout, config.delegation_tool.clone()),
        };
        Self {
            agents: AgentAggregator::new(config.max_agents, config.max_centroids),
            delegation: DelegationGraph::new(),
            state: RwLock::new(state),
            config,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn agents(&self) -> &AgentAggregator {
        &self.agents
    }

    pub fn delegation(&self) -> &DelegationGraph {
        &self.delegation
    }

    /// A correlator configured like the store's own, for per-reader use.
    pub fn new_correlator(&self) -> Correlator {
        Correlator::new(self.config.orphan_timeout, self.config.delegation_tool.clone())
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates session counters and runs tool events through the store's correlator.
    pub fn process_event(&self, event: &Event) {
        let mut boundaries = Vec::new();
        let mut derived = {
            let mut state = self.write();
            state.tables.observe(event, &mut boundaries);
            let derived = state.correlator.process(event);
            for inv in &derived.completed {
                state.tables.record(inv, &mut boundaries);
            }
            derived
        };
        derived.completed.clear();
        self.route(boundaries, derived);
    }

    /// Session-level bookkeeping only; correlation is left to the caller.
    pub fn observe(&self, event: &Event) {
        let mut boundaries = Vec::new();
        self.write().tables.observe(event, &mut boundaries);
        self.route(boundaries, Correlated::default());
    }

    /// Applies the output of an external correlator.
    pub fn apply(&self, derived: Correlated) {
        if derived.is_empty() {
            return;
        }
        let mut boundaries = Vec::new();
        {
            let mut state = self.write();
            for inv in &derived.completed {
                state.tables.record(inv, &mut boundaries);
            }
        }
        self.route(
            boundaries,
            Correlated {
                completed: Vec::new(),
                ..derived
            },
        );
    }

    pub fn process_invocation(&self, inv: &CompletedInvocation) -> Result<()> {
        if inv.tool_name.trim().is_empty() {
            return Err(StatsError::invalid_invocation("empty tool name"));
        }
        if inv.session.is_empty() {
            return Err(StatsError::invalid_invocation("empty session"));
        }
        if is_sentinel(inv.invoked_at) {
            return Err(StatsError::invalid_invocation(format!(
                "invocation {} has no timestamp",
                inv.invocation_id
            )));
        }
        let mut boundaries = Vec::new();
        self.write().tables.record(inv, &mut boundaries);
        self.route(boundaries, Correlated::default());
        Ok(())
    }

    pub fn process_agent_invocation(&self, inv: &AgentInvocation) -> Result<()> {
        self.agents.process_agent_invocation(inv)
    }

    /// Moves a reader's unanswered invocations, and its event-time watermark,
    /// into the store's correlator.
    pub fn adopt_pending(&self, correlator: Correlator) {
        self.write().correlator.absorb(correlator);
    }

    /// Times out pending invocations whose deadline the latest event seen has
    /// passed. The rest stay pending and are reported as awaiting results.
    pub fn quiesce(&self) {
        let mut boundaries = Vec::new();
        let mut derived = {
            let mut state = self.write();
            let derived = state.correlator.flush();
            for inv in &derived.completed {
                state.tables.record(inv, &mut boundaries);
            }
            derived
        };
        derived.completed.clear();
        self.route(boundaries, derived);
    }

    pub fn pending_invocations(&self) -> usize {
        self.read().correlator.pending_len()
    }

    pub fn snapshot_session(&self, session: &str) -> Result<SessionSnapshot> {
        self.read()
            .tables
            .sessions
            .get(session)
            .map(|data| data.snapshot(session))
            .ok_or_else(|| StatsError::not_found("session", session))
    }

    /// Every session, earliest first.
    pub fn snapshot_sessions(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .read()
            .tables
            .sessions
            .iter()
            .map(|(id, data)| data.snapshot(id))
            .collect();
        all.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        all
    }

    pub fn snapshot_tool(&self, tool: &str) -> Result<ToolSnapshot> {
        self.read()
            .tables
            .tools
            .get(tool)
            .map(|data| data.snapshot(tool))
            .ok_or_else(|| StatsError::not_found("tool", tool))
    }

    pub fn snapshot_global(&self) -> GlobalSnapshot {
        let state = self.read();
        state.tables.global(state.correlator.pending_len())
    }

    fn route(&self, boundaries: Vec<Boundary>, derived: Correlated) {
        for b in boundaries {
            if let Err(e) = self.delegation.record_boundary(&b.session, b.kind, b.ts) {
                tracing::warn!(session = %b.session, error = %e, "session boundary rejected");
            }
        }
        for edge in &derived.edges {
            if let Err(e) = self.delegation.record_edge(edge) {
                tracing::warn!(session = %edge.session, error = %e, "delegation edge rejected");
            }
        }
        for run in &derived.agent_runs {
            if let Err(e) = self.agents.process_agent_invocation(run) {
                tracing::debug!(agent = %run.agent, error = %e, "agent run skipped");
            }
        }
    }
}

impl Aggregate for Aggregator {
    fn kind(&self) -> &'static str {
        "aggregation-store"
    }

    fn reset(&self) {
        {
            let mut state = self.write();
            state.tables = Tables::new(self.config.max_centroids);
            state.correlator.reset();
        }
        self.agents.reset();
        self.delegation.reset();
    }

    fn merge_from(&self, other: &dyn Aggregate) -> Result<()> {
        let other = crate::merge::downcast::<Self>(self, other)?;
        let incoming = other.read().tables.clone();
        self.write().tables.absorb(incoming);
        self.agents.merge_from(&other.agents)?;
        self.delegation.merge_from(&other.delegation)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn utc_hour(ts: OffsetDateTime) -> usize {
    usize::from(ts.to_offset(UtcOffset::UTC).hour())
}

/// Busiest hour; the earliest wins ties.
fn peak_hour(hourly: &[u64; 24]) -> u8 {
    let mut best = 0usize;
    for (h, n) in hourly.iter().enumerate() {
        if *n > hourly[best] {
            best = h;
        }
    }
    best as u8
}

fn most_active_hours(hourly: &[u64; 24]) -> Vec<u8> {
    let mut hours: Vec<(u8, u64)> = (0u8..24)
        .map(|h| (h, hourly[h as usize]))
        .filter(|(_, n)| *n > 0)
        .collect();
    hours.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    hours.truncate(MOST_ACTIVE_HOURS);
    hours.into_iter().map(|(h, _)| h).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{Parameters, TOOL_ERROR_CODE};

    fn at(secs: i64) -> OffsetDateTime {
        // 2023-11-14T22:13:20Z
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    fn inv(session: &str, tool: &str, secs: i64, duration: Option<i64>, ok: bool) -> CompletedInvocation {
        CompletedInvocation {
            invocation_id: format!("{session}-{tool}-{secs}"),
            tool_name: tool.into(),
            session: session.into(),
            invoked_at: at(secs),
            completed_at: at(secs) + Duration::milliseconds(duration.unwrap_or(0)),
            duration_ms: duration,
            success: ok,
            error: (!ok).then(|| ErrorEntry::new(TOOL_ERROR_CODE, format!("{tool} failed"))),
            parameters: Parameters::default(),
            result_payload: None,
        }
    }

    #[test]
    fn per_tool_update_rules() {
        let store = Aggregator::default();
        store.process_invocation(&inv("s1", "Bash", 0, Some(100), true)).unwrap();
        store.process_invocation(&inv("s1", "Bash", 10, Some(300), false)).unwrap();
        store.process_invocation(&inv("s2", "Bash", 20, None, false)).unwrap();
        let bash = store.snapshot_tool("Bash").unwrap();
        assert_eq!(bash.total_calls, 3);
        assert_eq!(bash.success_count, 1);
        assert_eq!(bash.failure_count, 2);
        assert_eq!(bash.unique_sessions, 2);
        assert_eq!(bash.avg_duration_ms, 200.0);
        assert_eq!(bash.first_used, Some(at(0)));
        assert_eq!(bash.last_used, Some(at(20)));
        assert_eq!(bash.error_types.get(TOOL_ERROR_CODE), Some(&2));
        assert_eq!(bash.common_errors, ["Bash failed"]);
        // Only timed calls land in the hour histogram.
        assert_eq!(bash.hourly_usage.iter().sum::<u64>(), 2);
        assert_eq!(bash.peak_hour, 22);
    }

    #[test]
    fn validation_rejects_without_mutation() {
        let store = Aggregator::default();
        let mut bad = inv("s1", "", 0, Some(1), true);
        assert!(matches!(
            store.process_invocation(&bad),
            Err(StatsError::InvalidInvocation(_))
        ));
        bad = inv("", "Bash", 0, Some(1), true);
        assert!(store.process_invocation(&bad).is_err());
        bad = inv("s1", "Bash", 0, Some(1), true);
        bad.invoked_at = OffsetDateTime::UNIX_EPOCH;
        assert!(store.process_invocation(&bad).is_err());
        let global = store.snapshot_global();
        assert_eq!(global.total_tool_calls, 0);
        assert_eq!(global.total_sessions, 0);
    }

    #[test]
    fn untimestamped_invocation_never_reaches_tool_stats() {
        let store = Aggregator::default();
        store.process_event(&Event::ToolInvocation {
            session: "s1".into(),
            ts: OffsetDateTime::UNIX_EPOCH,
            invocation_id: "i1".into(),
            tool_name: "Bash".into(),
            parameters: Parameters::default(),
        });
        store.process_event(&Event::ToolResult {
            session: "s1".into(),
            ts: at(0),
            invocation_id: "i1".into(),
            tool_name: None,
            output: None,
            error: None,
            result_payload: None,
        });
        store.quiesce();
        assert!(store.snapshot_tool("Bash").is_err());
        assert_eq!(store.snapshot_global().total_tool_calls, 0);

        let mut stale = inv("s1", "Read", 0, Some(5), true);
        stale.invoked_at = OffsetDateTime::UNIX_EPOCH;
        store.apply(Correlated {
            completed: vec![stale],
            ..Correlated::default()
        });
        assert!(store.snapshot_tool("Read").is_err());
    }

    #[test]
    fn quiesce_keeps_calls_inside_their_window() {
        let store = Aggregator::default();
        store.process_event(&Event::ToolInvocation {
            session: "s1".into(),
            ts: at(0),
            invocation_id: "r1".into(),
            tool_name: "Read".into(),
            parameters: Parameters::default(),
        });
        store.process_event(&Event::UserInput {
            session: "s1".into(),
            ts: at(1),
            text: "next".into(),
        });
        store.quiesce();
        assert!(store.snapshot_tool("Read").is_err());
        assert_eq!(store.pending_invocations(), 1);
        assert_eq!(store.snapshot_global().pending_invocations, 1);
    }

    #[test]
    fn error_ring_is_bounded_fifo_and_distinct() {
        let mut tool = ToolData::new(100);
        for i in 0..12 {
            tool.remember_error(&format!("e{i}"));
        }
        tool.remember_error("e11");
        assert_eq!(tool.common_errors.len(), ERROR_RING_CAPACITY);
        assert_eq!(tool.common_errors.front().map(String::as_str), Some("e2"));
        assert_eq!(tool.common_errors.back().map(String::as_str), Some("e11"));
    }

    #[test]
    fn peak_hour_ties_go_low() {
        let mut hourly = [0u64; 24];
        hourly[5] = 3;
        hourly[2] = 3;
        hourly[9] = 1;
        assert_eq!(peak_hour(&hourly), 2);
        assert_eq!(peak_hour(&[0; 24]), 0);
        assert_eq!(most_active_hours(&hourly), [2, 5, 9]);
    }

    #[test]
    fn events_update_session_counters() {
        let store = Aggregator::default();
        store.process_event(&Event::UserInput {
            session: "s1".into(),
            ts: at(0),
            text: "hi".into(),
        });
        store.process_event(&Event::AssistantText {
            session: "s1".into(),
            ts: at(1),
            text: "<command-name>/review</command-name>".into(),
            input_tokens: 10,
            output_tokens: 5,
            model: None,
        });
        store.process_event(&Event::SystemEvent {
            session: "s1".into(),
            ts: at(2),
            event_kind: "info".into(),
            message: String::new(),
        });
        store.process_event(&Event::SessionSummary {
            session: "s1".into(),
            ts: at(3),
            tokens: TokenUsage::from_counts(100, 50),
            errors: vec![ErrorEntry::new("E1", "summary error")],
        });
        let s = store.snapshot_session("s1").unwrap();
        assert_eq!(s.user_messages, 1);
        assert_eq!(s.assistant_messages, 1);
        assert_eq!(s.system_messages, 1);
        assert_eq!(s.commands_used, 1);
        assert_eq!(s.tokens, TokenUsage::from_counts(110, 55));
        assert_eq!(s.errors.len(), 1);
        assert_eq!(s.duration_ms, 3000);

        let g = store.snapshot_global();
        assert_eq!(g.commands.get("/review"), Some(&1));
        assert_eq!(g.total_tokens.total, 165);
        assert_eq!(g.error_patterns.len(), 1);
        assert!(g.error_patterns[0].tools.is_empty());

        let kinds: Vec<String> = store
            .delegation()
            .boundaries("s1")
            .into_iter()
            .map(|b| b.kind)
            .collect();
        assert_eq!(kinds, [BOUNDARY_START, BOUNDARY_SUMMARY]);
    }

    #[test]
    fn unknown_session_and_tool_not_found() {
        let store = Aggregator::default();
        assert!(matches!(
            store.snapshot_session("nope"),
            Err(StatsError::NotFound { .. })
        ));
        assert!(store.snapshot_tool("nope").is_err());
    }

    #[test]
    fn snapshots_are_detached() {
        let store = Aggregator::default();
        store.process_invocation(&inv("s1", "Read", 0, Some(5), true)).unwrap();
        let before = store.snapshot_session("s1").unwrap();
        store.process_invocation(&inv("s1", "Read", 1, Some(5), true)).unwrap();
        assert_eq!(before.total_tool_calls, 1);
        assert_eq!(before.invocations.len(), 1);
    }

    #[test]
    fn global_extras() {
        let store = Aggregator::default();
        store.process_invocation(&inv("s1", "Bash", 0, Some(1000), true)).unwrap();
        store.process_invocation(&inv("s1", "Read", 0, Some(1000), false)).unwrap();
        store.process_invocation(&inv("s1", "Read", 60, Some(10), false)).unwrap();
        store.process_invocation(&inv("s2", "Bash", 120, Some(10), true)).unwrap();
        let g = store.snapshot_global();
        assert_eq!(g.total_tool_calls, 4);
        assert_eq!(g.success_rate, 0.5);
        let period = g.period.unwrap();
        assert_eq!(period.duration_ms, 120_000);
        assert_eq!(g.performance.tool_calls_per_minute, 2.0);
        assert_eq!(g.performance.max_consecutive_failures, 2);
        assert_eq!(g.performance.peak_concurrency, 2);
        assert_eq!(g.performance.avg_response_time_ms, 505.0);
        assert_eq!(g.daily_activity.len(), 1);
        assert_eq!(g.daily_activity[0].date, "2023-11-14");
        assert_eq!(g.daily_activity[0].sessions, 2);
        assert_eq!(g.daily_activity[0].unique_tools, 2);
        assert_eq!(g.daily_activity[0].errors, 2);
        assert_eq!(g.top_errors[0].tool_name, "Read");
        assert_eq!(g.top_errors[0].percentage, 100.0);
        assert_eq!(g.error_patterns[0].tools, ["Read"]);
        assert_eq!(g.most_active_hours, [22]);
        assert_eq!(g.avg_session_duration_ms, 30_000.0);
        let names: Vec<&str> = g.tools_by_calls().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["Bash", "Read"]);
    }
}
