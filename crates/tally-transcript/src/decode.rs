use serde::Deserialize;
use serde_json::Value;
use tally_core::timefmt::{parse_rfc3339, SENTINEL};
use tally_core::types::TOOL_ERROR_MESSAGE;
use tally_core::{ErrorEntry, Event, Parameters, Result, StatsError, TokenUsage};
use time::OffsetDateTime;

use crate::options::ParseOptions;

/// Decode one transcript line into the events it carries.
///
/// Records with several content blocks (a text reply followed by tool calls,
/// or a batch of tool results) expand into one event per block. Records that
/// carry nothing of interest decode to an empty vector.
pub fn decode_record(line: &[u8], line_no: usize, opts: &ParseOptions) -> Result<Vec<Event>> {
    let record: Value = serde_json::from_slice(line)
        .map_err(|e| StatsError::invalid_record(line_no, e.to_string()))?;
    if !record.is_object() {
        return Err(StatsError::invalid_record(line_no, "record is not an object"));
    }

    let record_type = record
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StatsError::invalid_entry(format!("line {line_no}: missing type tag")))?;

    let ts = match record
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(parse_rfc3339)
    {
        Some(ts) => ts,
        None if opts.strict_mode => {
            return Err(StatsError::invalid_record(line_no, "unparseable timestamp"));
        }
        None => {
            tracing::debug!(line = line_no, "timestamp missing or unparseable, using sentinel");
            SENTINEL
        }
    };

    let session = record
        .get("sessionId")
        .or_else(|| record.get("session_id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| opts.default_session.clone())
        .ok_or_else(|| StatsError::invalid_entry(format!("line {line_no}: missing sessionId")))?;

    match record_type {
        "user" => {
            let message = require_message(&record, line_no, record_type)?;
            Ok(decode_user(message, session, ts))
        }
        "assistant" => {
            let message = require_message(&record, line_no, record_type)?;
            Ok(decode_assistant(message, session, ts, opts))
        }
        "system" if opts.skip_system_records => Ok(Vec::new()),
        "system" => Ok(vec![decode_system(&record, session, ts)]),
        "summary" => Ok(vec![decode_summary(&record, session, ts)]),
        other if opts.strict_mode => Err(StatsError::invalid_entry(format!(
            "line {line_no}: unknown record type {other:?}"
        ))),
        _ => Ok(Vec::new()),
    }
}

fn require_message<'a>(record: &'a Value, line_no: usize, kind: &str) -> Result<&'a Value> {
    record
        .get("message")
        .filter(|m| m.is_object())
        .ok_or_else(|| StatsError::invalid_entry(format!("line {line_no}: {kind} record without message")))
}

fn decode_user(message: &Value, session: String, ts: OffsetDateTime) -> Vec<Event> {
    let mut text = String::new();
    let mut results = Vec::new();

    match message.get("content") {
        Some(Value::String(s)) => text.push_str(s),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|v| v.as_str()) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                            text.push_str(t);
                        }
                    }
                    Some("tool_result") => {
                        if let Some(ev) = decode_tool_result(block, &session, ts) {
                            results.push(ev);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let mut events = Vec::with_capacity(results.len() + 1);
    if results.is_empty() || !text.is_empty() {
        events.push(Event::UserInput {
            session,
            ts,
            text,
        });
    }
    events.extend(results);
    events
}

fn decode_tool_result(block: &Value, session: &str, ts: OffsetDateTime) -> Option<Event> {
    let invocation_id = block
        .get("tool_use_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())?;

    let output = block
        .get("output")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| block.get("content").and_then(flatten_text));

    let is_error = block
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let error = match block.get("error").and_then(|v| v.as_str()) {
        Some(e) if !e.is_empty() => Some(e.to_string()),
        _ if is_error => Some(TOOL_ERROR_MESSAGE.to_string()),
        _ => None,
    };

    Some(Event::ToolResult {
        session: session.to_string(),
        ts,
        invocation_id: invocation_id.to_string(),
        tool_name: block
            .get("tool_name")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        output,
        error,
        result_payload: block.get("result").filter(|v| !v.is_null()).cloned(),
    })
}

/// Collapse a string or an array of text blocks into one string.
fn flatten_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let joined: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        }
        _ => None,
    }
}

fn decode_assistant(
    message: &Value,
    session: String,
    ts: OffsetDateTime,
    opts: &ParseOptions,
) -> Vec<Event> {
    let usage = message.get("usage");
    let token = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };

    let mut text = String::new();
    let mut invocations = Vec::new();

    match message.get("content") {
        Some(Value::String(s)) => text.push_str(s),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|v| v.as_str()) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                            text.push_str(t);
                        }
                    }
                    Some("tool_use") => {
                        let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("");
                        let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("");
                        if id.is_empty() || name.is_empty() {
                            tracing::debug!(session = %session, "tool_use block without id or name");
                            continue;
                        }
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        let parameters = if opts.parse_tool_parameters {
                            Parameters::decode(name, input)
                        } else {
                            Parameters::opaque(input)
                        };
                        invocations.push(Event::ToolInvocation {
                            session: session.clone(),
                            ts,
                            invocation_id: id.to_string(),
                            tool_name: name.to_string(),
                            parameters,
                        });
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let mut events = Vec::with_capacity(invocations.len() + 1);
    events.push(Event::AssistantText {
        session,
        ts,
        text,
        input_tokens: token("input_tokens"),
        output_tokens: token("output_tokens"),
        model: message
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    });
    events.extend(invocations);
    events
}

fn decode_system(record: &Value, session: String, ts: OffsetDateTime) -> Event {
    let message = record.get("message");
    let event_kind = record
        .get("subtype")
        .and_then(|v| v.as_str())
        .or_else(|| message.and_then(|m| m.get("event")).and_then(|v| v.as_str()))
        .unwrap_or("system")
        .to_string();

    let text = match message {
        Some(Value::String(s)) => Some(s.clone()),
        Some(m) => m
            .get("content")
            .and_then(flatten_text)
            .or_else(|| m.get("text").and_then(|v| v.as_str()).map(str::to_string)),
        None => None,
    }
    .or_else(|| record.get("content").and_then(flatten_text))
    .unwrap_or_default();

    Event::SystemEvent {
        session,
        ts,
        event_kind,
        message: text,
    }
}

fn decode_summary(record: &Value, session: String, ts: OffsetDateTime) -> Event {
    let field = |key: &str| {
        record
            .get(key)
            .or_else(|| record.get("message").and_then(|m| m.get(key)))
    };

    let mut tokens = field("tokens_used")
        .and_then(|v| TokenUsage::deserialize(v).ok())
        .unwrap_or_default();
    if tokens.total == 0 {
        tokens.total = tokens.input + tokens.output;
    }

    let errors = field("errors")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| ErrorEntry::deserialize(e).ok())
                .collect()
        })
        .unwrap_or_default();

    Event::SessionSummary {
        session,
        ts,
        tokens,
        errors,
    }
}
