use std::sync::LazyLock;

use regex::Regex;

static COMMAND_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<command-name>([^<]*)</command-name>").unwrap());

/// Slash-command names tagged inline in assistant text, trimmed, empties skipped.
pub fn extract_commands(text: &str) -> Vec<String> {
    if !text.contains("<command-name>") {
        return Vec::new();
    }
    COMMAND_TAG
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
