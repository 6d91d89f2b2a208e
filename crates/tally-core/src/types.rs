use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::params::Parameters;

/// Error code synthesized for invocations whose result never arrived.
pub const TIMEOUT_CODE: &str = "TIMEOUT";
pub const TIMEOUT_MESSAGE: &str = "Tool invocation timed out - no result received";
/// Error code for results flagged `is_error`.
pub const TOOL_ERROR_CODE: &str = "TOOL_ERROR";
pub const TOOL_ERROR_MESSAGE: &str = "Tool execution failed";

/// Source agent used when a session has not delegated before.
pub const ROOT_AGENT: &str = "root";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub total: u64,
}

impl TokenUsage {
    pub fn from_counts(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
    }

    pub fn is_empty(&self) -> bool {
        self.input == 0 && self.output == 0 && self.total == 0
    }
}

/// A coded error, as reported by a failed tool or a session summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorEntry {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn timeout() -> Self {
        Self::new(TIMEOUT_CODE, TIMEOUT_MESSAGE)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == TIMEOUT_CODE
    }
}

impl std::fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(d) if !d.is_empty() => write!(f, "{}: {} - {}", self.code, self.message, d),
            _ => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// A tool invocation paired with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedInvocation {
    pub invocation_id: String,
    pub tool_name: String,
    pub session: String,
    #[serde(with = "time::serde::rfc3339")]
    pub invoked_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    /// Absent for timed-out invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEntry>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Value>,
}

impl CompletedInvocation {
    pub fn timed_out(&self) -> bool {
        self.error.as_ref().is_some_and(ErrorEntry::is_timeout)
    }
}

/// A directed hand-off between two agents within one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationEdge {
    pub session: String,
    pub from_agent: String,
    pub to_agent: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

/// One completed run of a sub-agent, fed to the per-agent statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub agent: String,
    pub session: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub duration_ms: i64,
    pub success: bool,
    /// Certainty of the agent attribution, in `[0, 1]`.
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_accumulates() {
        let mut t = TokenUsage::from_counts(10, 5);
        t.add(&TokenUsage {
            input: 1,
            output: 2,
            total: 3,
        });
        assert_eq!(t, TokenUsage { input: 11, output: 7, total: 18 });
    }

    #[test]
    fn error_entry_display() {
        let mut e = ErrorEntry::new("E1", "boom");
        assert_eq!(e.to_string(), "E1: boom");
        e.details = Some("stack".into());
        assert_eq!(e.to_string(), "E1: boom - stack");
        assert!(ErrorEntry::timeout().is_timeout());
    }

    #[test]
    fn completed_invocation_serializes_rfc3339() {
        let ts = crate::timefmt::parse_rfc3339("2025-01-01T00:00:00Z").unwrap();
        let inv = CompletedInvocation {
            invocation_id: "i1".into(),
            tool_name: "Bash".into(),
            session: "s1".into(),
            invoked_at: ts,
            completed_at: ts,
            duration_ms: Some(0),
            success: true,
            error: None,
            parameters: Parameters::default(),
            result_payload: None,
        };
        let v = serde_json::to_value(&inv).unwrap();
        assert_eq!(v["invoked_at"], "2025-01-01T00:00:00Z");
        assert!(v.get("error").is_none());
        assert!(!inv.timed_out());
    }
}
