const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024; // 1MB
const DEFAULT_MAX_MEMORY_BYTES: usize = 100 * 1024 * 1024; // 100MB

/// Decoder configuration.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Initial line buffer; lines up to twice this size are accepted.
    pub buffer_size: usize,
    /// Decode inputs of recognized tools into typed parameters.
    pub parse_tool_parameters: bool,
    pub skip_system_records: bool,
    /// Terminate the stream at the first parse failure.
    pub strict_mode: bool,
    /// Surface non-fatal parse failures as `Err` items instead of skipping silently.
    pub collect_errors: bool,
    /// Advisory cap on a single buffered line.
    pub max_memory_bytes: usize,
    /// Session attributed to records that carry no `sessionId`.
    pub default_session: Option<String>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            parse_tool_parameters: true,
            skip_system_records: false,
            strict_mode: false,
            collect_errors: false,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            default_session: None,
        }
    }
}

impl ParseOptions {
    /// Longest line the reader will buffer before rejecting it.
    pub fn max_line_len(&self) -> usize {
        self.buffer_size
            .saturating_mul(2)
            .min(self.max_memory_bytes)
            .max(1)
    }
}
