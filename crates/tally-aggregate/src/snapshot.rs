//! Read-only views returned by the aggregators. Every value here is an owned
//! copy; later recording never changes a snapshot already handed out.

use std::collections::BTreeMap;

use serde::Serialize;
use tally_core::{CompletedInvocation, ErrorEntry, TokenUsage};
use time::OffsetDateTime;

/// Per session × tool counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolSessionStats {
    pub tool_name: String,
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration_ms: i64,
    /// Calls that reported a duration.
    pub timed_calls: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
}

impl ToolSessionStats {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, inv: &CompletedInvocation) {
        self.call_count += 1;
        if inv.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        if let Some(d) = inv.duration_ms {
            self.timed_calls += 1;
            self.total_duration_ms += d;
            self.min_duration_ms = Some(self.min_duration_ms.map_or(d, |m| m.min(d)));
            self.max_duration_ms = Some(self.max_duration_ms.map_or(d, |m| m.max(d)));
        }
        self.last_used = Some(self.last_used.map_or(inv.invoked_at, |l| l.max(inv.invoked_at)));
        self.refresh_avg();
    }

    pub fn absorb(&mut self, other: &ToolSessionStats) {
        self.call_count += other.call_count;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.total_duration_ms += other.total_duration_ms;
        self.timed_calls += other.timed_calls;
        self.min_duration_ms = min_opt(self.min_duration_ms, other.min_duration_ms);
        self.max_duration_ms = max_opt(self.max_duration_ms, other.max_duration_ms);
        self.last_used = max_opt(self.last_used, other.last_used);
        self.refresh_avg();
    }

    fn refresh_avg(&mut self) {
        self.avg_duration_ms = if self.timed_calls == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.timed_calls as f64
        };
    }
}

/// An error observed within a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorOccurrence {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    /// Empty for errors reported by a session summary.
    pub tool_name: String,
    pub invocation_id: Option<String>,
    pub error: ErrorEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub duration_ms: i64,
    pub user_messages: u64,
    pub assistant_messages: u64,
    pub system_messages: u64,
    pub total_tool_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Fraction of calls that failed, `0.0..=1.0`.
    pub error_rate: f64,
    pub commands_used: u64,
    pub tokens: TokenUsage,
    pub tool_stats: BTreeMap<String, ToolSessionStats>,
    pub errors: Vec<ErrorOccurrence>,
    pub invocations: Vec<CompletedInvocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSnapshot {
    pub name: String,
    pub total_calls: u64,
    pub unique_sessions: usize,
    pub success_count: u64,
    pub failure_count: u64,
    /// Fraction, `0.0..=1.0`.
    pub success_rate: f64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: f64,
    pub std_dev_ms: f64,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub median_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub error_types: BTreeMap<String, u64>,
    pub common_errors: Vec<String>,
    pub hourly_usage: Vec<u64>,
    pub peak_hour: u8,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_used: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
}

/// Failures sharing a code and message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPattern {
    pub code: String,
    pub message: String,
    pub count: u64,
    pub tools: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorFrequency {
    pub error_code: String,
    pub error_message: String,
    pub tool_name: String,
    pub count: u64,
    /// Share of all errors, `0..=100`.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyActivity {
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub sessions: usize,
    pub tool_calls: u64,
    pub unique_tools: usize,
    pub success_rate: f64,
    pub total_duration_ms: i64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HourActivity {
    pub hour: u8,
    pub tool_calls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub avg_response_time_ms: f64,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub tool_calls_per_minute: f64,
    pub tool_calls_per_hour: f64,
    pub max_consecutive_failures: u64,
    pub peak_concurrency: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Period {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalSnapshot {
    pub period: Option<Period>,
    pub total_sessions: usize,
    pub avg_session_duration_ms: f64,
    pub total_tool_calls: u64,
    pub total_success: u64,
    pub total_failure: u64,
    /// Fraction, `0.0..=1.0`.
    pub success_rate: f64,
    pub total_tokens: TokenUsage,
    pub tools: BTreeMap<String, ToolSnapshot>,
    pub commands: BTreeMap<String, u64>,
    pub error_patterns: Vec<ErrorPattern>,
    pub top_errors: Vec<ErrorFrequency>,
    pub most_active_hours: Vec<u8>,
    pub hourly_activity: Vec<HourActivity>,
    pub daily_activity: Vec<DailyActivity>,
    pub performance: PerformanceMetrics,
    /// Invocations still waiting on a result in the store's own correlator.
    pub pending_invocations: usize,
}

impl GlobalSnapshot {
    /// Tools ordered by call count, then name.
    pub fn tools_by_calls(&self) -> Vec<&ToolSnapshot> {
        let mut tools: Vec<&ToolSnapshot> = self.tools.values().collect();
        tools.sort_by(|a, b| b.total_calls.cmp(&a.total_calls).then(a.name.cmp(&b.name)));
        tools
    }

    /// Commands ordered by usage, then name.
    pub fn commands_by_usage(&self) -> Vec<(&str, u64)> {
        let mut commands: Vec<(&str, u64)> =
            self.commands.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        commands.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        commands
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub agent: String,
    pub invocations: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: f64,
    pub std_dev_ms: f64,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionPattern {
    pub from: String,
    pub to: String,
    pub count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub last_session: String,
}

/// Two agents seen in the same sessions; `agent_a < agent_b`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoOccurrence {
    pub agent_a: String,
    pub agent_b: String,
    pub count: u64,
    pub sessions: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelegationChain {
    pub session: String,
    pub agents: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionBoundary {
    pub kind: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DelegationStats {
    /// Distinct `(from, to)` patterns.
    pub total_transitions: usize,
    /// Sum of all pattern counts.
    pub transition_events: u64,
    pub total_cooccurrences: usize,
    pub sessions_with_chains: usize,
    pub avg_chain_length: f64,
}

pub(crate) fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

pub(crate) fn max_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

pub(crate) fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::Parameters;

    fn inv(duration: Option<i64>, success: bool, secs: i64) -> CompletedInvocation {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap();
        CompletedInvocation {
            invocation_id: format!("i{secs}"),
            tool_name: "Bash".into(),
            session: "s1".into(),
            invoked_at: at,
            completed_at: at,
            duration_ms: duration,
            success,
            error: None,
            parameters: Parameters::default(),
            result_payload: None,
        }
    }

    #[test]
    fn session_tool_stats_average_ignores_untimed() {
        let mut s = ToolSessionStats::new("Bash");
        s.record(&inv(Some(100), true, 0));
        s.record(&inv(Some(300), true, 5));
        s.record(&inv(None, false, 2));
        assert_eq!(s.call_count, 3);
        assert_eq!(s.failure_count, 1);
        assert_eq!(s.avg_duration_ms, 200.0);
        assert_eq!(s.min_duration_ms, Some(100));
        assert_eq!(s.max_duration_ms, Some(300));
        assert_eq!(
            s.last_used,
            Some(OffsetDateTime::from_unix_timestamp(1_700_000_005).unwrap())
        );
    }

    #[test]
    fn absorb_sums() {
        let mut a = ToolSessionStats::new("Bash");
        a.record(&inv(Some(10), true, 0));
        let mut b = ToolSessionStats::new("Bash");
        b.record(&inv(Some(30), false, 1));
        a.absorb(&b);
        assert_eq!(a.call_count, 2);
        assert_eq!(a.success_count, 1);
        assert_eq!(a.avg_duration_ms, 20.0);
        assert_eq!(a.max_duration_ms, Some(30));
    }

    #[test]
    fn option_bounds() {
        assert_eq!(min_opt(Some(3), None), Some(3));
        assert_eq!(max_opt(Some(3), Some(9)), Some(9));
        assert_eq!(min_opt::<i32>(None, None), None);
        assert_eq!(ratio(1, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}
