use thiserror::Error;

pub type Result<T> = std::result::Result<T, StatsError>;

/// Every failure the statistics pipeline can surface.
#[derive(Debug, Error)]
pub enum StatsError {
    /// A single transcript line could not be decoded.
    #[error("line {line}: invalid record: {reason}")]
    InvalidRecord { line: usize, reason: String },

    /// A decoded record lacks its `type` tag or its mandatory payload.
    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("tool invocation {invocation_id} timed out")]
    Timeout { invocation_id: String },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot merge: {0}")]
    MergeIncompatible(String),
}

impl StatsError {
    pub fn invalid_record(line: usize, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            line,
            reason: reason.into(),
        }
    }

    pub fn invalid_entry(message: impl Into<String>) -> Self {
        Self::InvalidEntry(message.into())
    }

    pub fn invalid_invocation(message: impl Into<String>) -> Self {
        Self::InvalidInvocation(message.into())
    }

    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn merge_incompatible(message: impl Into<String>) -> Self {
        Self::MergeIncompatible(message.into())
    }

    /// Parse-level failures are the only ones a lenient reader may skip.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidRecord { .. } | Self::InvalidEntry(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_record_carries_line_number() {
        let err = StatsError::invalid_record(42, "expected value");
        assert_eq!(err.to_string(), "line 42: invalid record: expected value");
        assert!(err.is_recoverable());
    }

    #[test]
    fn io_errors_are_terminal() {
        let err: StatsError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn not_found_names_kind_and_key() {
        let err = StatsError::not_found("session", "abc");
        assert_eq!(err.to_string(), "session not found: abc");
    }
}
