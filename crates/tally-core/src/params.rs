use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BashParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub run_in_background: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadParams {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditParams {
    pub file_path: String,
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteParams {
    pub file_path: String,
    pub content: String,
}

/// Shared shape of `WebSearch`, `Grep` and `Glob` inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
}

/// Input of the delegation tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Tool input, decoded into a known shape when the tool is recognized.
///
/// Anything that fails to decode stays `Opaque` so no information is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "input", rename_all = "snake_case")]
pub enum Parameters {
    Bash(BashParams),
    Read(ReadParams),
    Edit(EditParams),
    Write(WriteParams),
    Search(SearchParams),
    Task(TaskParams),
    Opaque(Value),
}

impl Default for Parameters {
    fn default() -> Self {
        Self::Opaque(Value::Null)
    }
}

impl Parameters {
    pub fn opaque(input: Value) -> Self {
        Self::Opaque(input)
    }

    /// Decode `input` according to `tool_name`, falling back to `Opaque`.
    pub fn decode(tool_name: &str, input: Value) -> Self {
        let decoded = match tool_name {
            "Bash" | "bash" => BashParams::deserialize(&input).map(Self::Bash).ok(),
            "Read" | "read" => ReadParams::deserialize(&input).map(Self::Read).ok(),
            "Edit" | "edit" => EditParams::deserialize(&input).map(Self::Edit).ok(),
            "Write" | "write" => WriteParams::deserialize(&input).map(Self::Write).ok(),
            "WebSearch" | "Grep" | "Glob" | "search" => {
                SearchParams::deserialize(&input).map(Self::Search).ok()
            }
            "Task" | "task" => TaskParams::deserialize(&input).map(Self::Task).ok(),
            _ => None,
        };
        decoded.unwrap_or(Self::Opaque(input))
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }

    /// Sub-agent named by a delegation input, if any.
    pub fn subagent(&self) -> Option<&str> {
        let name = match self {
            Self::Task(p) => p.subagent_type.as_deref(),
            Self::Opaque(v) => v.get("subagent_type").and_then(Value::as_str),
            _ => None,
        };
        name.map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Sub-agent echoed in a result payload, looked up at the top level and
/// under a nested `input`.
pub fn subagent_in_payload(payload: &Value) -> Option<&str> {
    payload
        .get("subagent_type")
        .or_else(|| payload.get("input").and_then(|i| i.get("subagent_type")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
