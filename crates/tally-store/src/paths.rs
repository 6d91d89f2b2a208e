use std::path::PathBuf;

/// Per-user store root: `~/.tally/`.
/// Honors `TALLY_HOME` when set.
pub fn store_root() -> PathBuf {
    if let Some(dir) = std::env::var_os("TALLY_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".tally"),
        None => PathBuf::from(".tally"),
    }
}

/// Default Claude data directory: `~/.claude/`.
pub fn default_claude_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".claude"))
        .unwrap_or_else(|| PathBuf::from(".claude"))
}
