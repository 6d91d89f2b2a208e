use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tally_core::{Result, StatsError};
use tally_transcript::{parse_file, EventFilter, ParseOptions, ParseStats};

use crate::store::Aggregator;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub parse: ParseOptions,
    pub filter: EventFilter,
    /// Reader threads; clamped to `1..=files`.
    pub workers: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            parse: ParseOptions::default(),
            filter: EventFilter::default(),
            workers: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub stats: ParseStats,
    /// Invocations still awaiting a result at end of file.
    pub pending: usize,
    /// Set when the reader stopped on an I/O failure.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub files: Vec<FileReport>,
}

impl IngestReport {
    pub fn events(&self) -> usize {
        self.files.iter().map(|f| f.stats.events_emitted).sum()
    }

    pub fn lines_skipped(&self) -> usize {
        self.files.iter().map(|f| f.stats.lines_skipped).sum()
    }

    pub fn failed_files(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.error.is_some())
    }
}

/// Reads `files` on up to `workers` threads into the shared `aggregator`.
///
/// Each reader owns its parser and correlator. Invocations a file leaves
/// unanswered are handed to the store's correlator, where they expire only
/// once event time from any file passes their deadline. In strict mode the first parse failure stops
/// every reader and is returned.
pub fn ingest_files(
    aggregator: &Aggregator,
    files: &[PathBuf],
    options: &IngestOptions,
) -> Result<IngestReport> {
    let workers = options.workers.clamp(1, files.len().max(1));
    let next = AtomicUsize::new(0);
    let cancelled = AtomicBool::new(false);
    let first_error: Mutex<Option<StatsError>> = Mutex::new(None);
    let reports: Mutex<Vec<FileReport>> = Mutex::new(Vec::with_capacity(files.len()));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if cancelled.load(Ordering::Relaxed) {
                    break;
                }
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(path) = files.get(i) else {
                    break;
                };
                match ingest_file(aggregator, path, options, &cancelled) {
                    Ok(report) => reports
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(report),
                    Err(e) => {
                        cancelled.store(true, Ordering::Relaxed);
                        first_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(e);
                    }
                }
            });
        }
    });

    if let Some(e) = first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
        return Err(e);
    }
    let mut files = reports.into_inner().unwrap_or_else(PoisonError::into_inner);
    files.sort_by(|a, b| a.path.cmp(&b.path));
    let report = IngestReport { files };
    tracing::debug!(
        files = report.files.len(),
        events = report.events(),
        skipped = report.lines_skipped(),
        "ingest finished"
    );
    Ok(report)
}

/// Reads one transcript. Returns `Err` only for strict-mode failures.
pub fn ingest_file(
    aggregator: &Aggregator,
    path: &Path,
    options: &IngestOptions,
    cancelled: &AtomicBool,
) -> Result<FileReport> {
    let strict = options.parse.strict_mode;
    let mut stream = match parse_file(path, options.parse.clone(), options.filter.clone()) {
        Ok(stream) => stream,
        Err(e) if strict => return Err(e),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot open transcript");
            return Ok(FileReport {
                path: path.to_path_buf(),
                stats: ParseStats::default(),
                pending: 0,
                error: Some(e.to_string()),
            });
        }
    };

    let mut correlator = aggregator.new_correlator();
    let mut error = None;
    while let Some(item) = stream.next() {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(FileReport {
                path: path.to_path_buf(),
                stats: stream.stats().clone(),
                pending: 0,
                error: Some("cancelled".to_string()),
            });
        }
        match item {
            Ok(event) => {
                aggregator.observe(&event);
                aggregator.apply(correlator.process(&event));
            }
            Err(e) if strict => return Err(e),
            Err(e) if e.is_recoverable() => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "transcript read failed");
                error = Some(e.to_string());
            }
        }
    }
    let pending = correlator.pending_len();
    aggregator.adopt_pending(correlator);

    tracing::debug!(
        path = %path.display(),
        events = stream.stats().events_emitted,
        pending,
        "transcript ingested"
    );
    Ok(FileReport {
        path: path.to_path_buf(),
        stats: stream.stats().clone(),
        pending,
        error,
    })
}
