use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::params::Parameters;
use crate::types::{ErrorEntry, TokenUsage};

/// One normalized record lifted out of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    UserInput {
        session: String,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        text: String,
    },
    ToolInvocation {
        session: String,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        invocation_id: String,
        tool_name: String,
        parameters: Parameters,
    },
    ToolResult {
        session: String,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        invocation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_payload: Option<Value>,
    },
    AssistantText {
        session: String,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        text: String,
        input_tokens: u64,
        output_tokens: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    SystemEvent {
        session: String,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        event_kind: String,
        message: String,
    },
    SessionSummary {
        session: String,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        tokens: TokenUsage,
        errors: Vec<ErrorEntry>,
    },
}

impl Event {
    pub fn session(&self) -> &str {
        match self {
            Event::UserInput { session, .. }
            | Event::ToolInvocation { session, .. }
            | Event::ToolResult { session, .. }
            | Event::AssistantText { session, .. }
            | Event::SystemEvent { session, .. }
            | Event::SessionSummary { session, .. } => session,
        }
    }

    pub fn ts(&self) -> OffsetDateTime {
        match self {
            Event::UserInput { ts, .. }
            | Event::ToolInvocation { ts, .. }
            | Event::ToolResult { ts, .. }
            | Event::AssistantText { ts, .. }
            | Event::SystemEvent { ts, .. }
            | Event::SessionSummary { ts, .. } => *ts,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::UserInput { .. } => "user_input",
            Event::ToolInvocation { .. } => "tool_invocation",
            Event::ToolResult { .. } => "tool_result",
            Event::AssistantText { .. } => "assistant_text",
            Event::SystemEvent { .. } => "system_event",
            Event::SessionSummary { .. } => "session_summary",
        }
    }

    pub fn is_tool_event(&self) -> bool {
        matches!(self, Event::ToolInvocation { .. } | Event::ToolResult { .. })
    }

    /// `Some(true)` for a successful result, `Some(false)` for a failed one.
    pub fn result_success(&self) -> Option<bool> {
        match self {
            Event::ToolResult { error, .. } => Some(error.is_none()),
            _ => None,
        }
    }
}
