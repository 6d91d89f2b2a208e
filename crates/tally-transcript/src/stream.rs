use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tally_core::{Event, Result, StatsError};

use crate::decode::decode_record;
use crate::filter::{EventFilter, Sampler};
use crate::options::ParseOptions;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ParseStats {
    pub lines_read: usize,
    pub events_decoded: usize,
    pub events_emitted: usize,
    pub events_filtered: usize,
    /// Lines dropped because they failed to decode.
    pub lines_skipped: usize,
}

enum Line {
    Eof,
    Ready,
    TooLong(usize),
}

/// Lazy, pull-based event sequence over a line-oriented reader.
///
/// Yields `Ok(event)` for every event passing the filter. Parse failures are
/// yielded as `Err` when `collect_errors` is set, and end the sequence in
/// strict mode. I/O failures always end the sequence.
pub struct EventStream<R> {
    reader: R,
    options: ParseOptions,
    filter: EventFilter,
    sampler: Sampler,
    buf: Vec<u8>,
    pending: VecDeque<Event>,
    line_no: usize,
    stats: ParseStats,
    done: bool,
}

impl<R: Read> EventStream<BufReader<R>> {
    pub fn from_reader(reader: R, options: ParseOptions, filter: EventFilter) -> Self {
        let reader = BufReader::with_capacity(options.buffer_size.max(1), reader);
        Self::new(reader, options, filter)
    }
}

impl<R: BufRead> EventStream<R> {
    pub fn new(reader: R, options: ParseOptions, filter: EventFilter) -> Self {
        let sampler = filter.sampler();
        Self {
            reader,
            options,
            filter,
            sampler,
            buf: Vec::new(),
            pending: VecDeque::new(),
            line_no: 0,
            stats: ParseStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    fn read_line(&mut self) -> std::io::Result<Line> {
        self.buf.clear();
        let limit = self.options.max_line_len();
        let n = (&mut self.reader)
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(Line::Eof);
        }
        self.line_no += 1;

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            return Ok(Line::Ready);
        }
        if self.buf.len() <= limit {
            // final line without a trailing newline
            return Ok(Line::Ready);
        }

        // Oversized: discard through the next newline without buffering it.
        let mut dropped = self.buf.len();
        self.buf.clear();
        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                break;
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    dropped += i;
                    self.reader.consume(i + 1);
                    break;
                }
                None => {
                    let len = available.len();
                    dropped += len;
                    self.reader.consume(len);
                }
            }
        }
        Ok(Line::TooLong(dropped))
    }

    /// Route a parse failure according to strict / collect settings.
    fn reject(&mut self, err: StatsError) -> Option<Result<Event>> {
        self.stats.lines_skipped += 1;
        tracing::debug!(error = %err, "skipping transcript line");
        if self.options.strict_mode {
            self.done = true;
            return Some(Err(err));
        }
        if self.options.collect_errors {
            return Some(Err(err));
        }
        None
    }
}

impl<R: BufRead> Iterator for EventStream<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(event) = self.pending.pop_front() {
                if !self.filter.matches(&event) || !self.sampler.keep() {
                    self.stats.events_filtered += 1;
                    continue;
                }
                if self
                    .filter
                    .max_events
                    .is_some_and(|max| self.stats.events_emitted >= max)
                {
                    self.done = true;
                    return None;
                }
                self.stats.events_emitted += 1;
                return Some(Ok(event));
            }

            match self.read_line() {
                Ok(Line::Eof) => {
                    self.done = true;
                    return None;
                }
                Ok(Line::TooLong(len)) => {
                    self.stats.lines_read += 1;
                    let err = StatsError::invalid_record(
                        self.line_no,
                        format!("line of {len} bytes exceeds the {} byte limit", self.options.max_line_len()),
                    );
                    if let Some(item) = self.reject(err) {
                        return Some(item);
                    }
                }
                Ok(Line::Ready) => {
                    if self.buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    self.stats.lines_read += 1;
                    match decode_record(&self.buf, self.line_no, &self.options) {
                        Ok(events) => {
                            self.stats.events_decoded += events.len();
                            self.pending.extend(events);
                        }
                        Err(err) => {
                            if let Some(item) = self.reject(err) {
                                return Some(item);
                            }
                        }
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(StatsError::Io(e)));
                }
            }
        }
    }
}

/// Open a transcript file and stream its events.
///
/// Records without a `sessionId` are attributed to the file stem unless
/// `options.default_session` says otherwise.
pub fn parse_file(
    path: &Path,
    mut options: ParseOptions,
    filter: EventFilter,
) -> Result<EventStream<BufReader<File>>> {
    let file = File::open(path)?;
    if options.default_session.is_none() {
        options.default_session = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty());
    }
    Ok(EventStream::from_reader(file, options, filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const USER: &str = r#"{"type":"user","sessionId":"s1","timestamp":"2025-01-15T10:00:00Z","message":{"content":"hi"}}"#;

    fn stream(input: &str, options: ParseOptions) -> EventStream<BufReader<Cursor<Vec<u8>>>> {
        EventStream::from_reader(
            Cursor::new(input.as_bytes().to_vec()),
            options,
            EventFilter::default(),
        )
    }

    #[test]
    fn skips_blank_lines_and_handles_missing_final_newline() {
        let input = format!("\n{USER}\n\n   \n{USER}");
        let mut s = stream(&input, ParseOptions::default());
        let events: Vec<_> = s.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(s.stats().lines_read, 2);
    }

    #[test]
    fn crlf_lines_decode() {
        let input = format!("{USER}\r\n{USER}\r\n");
        let events: Vec<_> = stream(&input, ParseOptions::default())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn lenient_mode_skips_silently() {
        let input = format!("{USER}\n{{broken\n{USER}\n");
        let mut s = stream(&input, ParseOptions::default());
        let items: Vec<_> = s.by_ref().collect();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|r| r.is_ok()));
        assert_eq!(s.stats().lines_skipped, 1);
    }

    #[test]
    fn collect_errors_reports_and_continues() {
        let opts = ParseOptions {
            collect_errors: true,
            ..Default::default()
        };
        let input = format!("{USER}\n{{broken\n{USER}\n");
        let items: Vec<_> = stream(&input, opts).collect();
        assert_eq!(items.len(), 3);
        assert!(matches!(
            items[1],
            Err(StatsError::InvalidRecord { line: 2, .. })
        ));
        assert!(items[2].is_ok());
    }

    #[test]
    fn strict_mode_terminates_at_first_error() {
        let opts = ParseOptions {
            strict_mode: true,
            ..Default::default()
        };
        let input = format!("{USER}\n{{broken\n{USER}\n");
        let items: Vec<_> = stream(&input, opts).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[test]
    fn oversized_line_is_rejected_and_reading_resumes() {
        let opts = ParseOptions {
            buffer_size: 64,
            collect_errors: true,
            ..Default::default()
        };
        let long = format!(
            r#"{{"type":"user","sessionId":"s1","message":{{"content":"{}"}}}}"#,
            "x".repeat(500)
        );
        let input = format!("{long}\n{USER}\n");
        let mut s = stream(&input, opts);
        let items: Vec<_> = s.by_ref().collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(StatsError::InvalidRecord { line: 1, .. })));
        assert!(items[1].is_ok());
    }

    #[test]
    fn line_up_to_twice_buffer_is_accepted() {
        let opts = ParseOptions {
            buffer_size: 80,
            ..Default::default()
        };
        assert!(USER.len() > 80 && USER.len() <= 160);
        let events: Vec<_> = stream(USER, opts).collect::<Result<_>>().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn max_events_stops_the_stream() {
        let input = format!("{USER}\n{USER}\n{USER}\n");
        let filter = EventFilter {
            max_events: Some(2),
            ..Default::default()
        };
        let s = EventStream::from_reader(
            Cursor::new(input.into_bytes()),
            ParseOptions::default(),
            filter,
        );
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn open_failure_is_terminal_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.jsonl");
        let err = parse_file(&missing, ParseOptions::default(), EventFilter::default())
            .err()
            .unwrap();
        assert!(matches!(err, StatsError::Io(_)));
    }

    #[test]
    fn file_stem_becomes_default_session() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("abc-123.jsonl");
        std::fs::write(
            &path,
            "{\"type\":\"summary\",\"summary\":\"x\",\"timestamp\":\"2025-01-15T10:00:00Z\"}\n",
        )
        .unwrap();
        let events: Vec<_> = parse_file(&path, ParseOptions::default(), EventFilter::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(events[0].session(), "abc-123");
    }
}
