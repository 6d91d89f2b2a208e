use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use globset::{Glob, GlobMatcher};
use thiserror::Error;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

static TRANSCRIPT_GLOB: LazyLock<GlobMatcher> =
    LazyLock::new(|| Glob::new("*.jsonl").unwrap().compile_matcher());

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no project specified and the current directory has no transcripts")]
    NoCurrentProject,

    #[error("project directory does not exist: {}", .0.display())]
    ProjectNotFound(PathBuf),

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Locates transcript files under `<claude_dir>/projects/<sanitized-project>/`.
#[derive(Debug, Clone)]
pub struct Discovery {
    projects_dir: PathBuf,
}

impl Discovery {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Directory for a project given as a path or an already-sanitized name.
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.projects_dir.join(project_key(project))
    }

    /// Transcripts of `project` (or of the current directory), sorted by path.
    ///
    /// Files whose best-effort timestamp shows they cannot overlap
    /// `[since, until]` are left out.
    pub fn find_log_files(
        &self,
        project: Option<&str>,
        since: Option<OffsetDateTime>,
        until: Option<OffsetDateTime>,
    ) -> Result<Vec<PathBuf>, DiscoveryError> {
        let key = match project {
            Some(p) => project_key(p),
            None => self
                .current_project()
                .ok_or(DiscoveryError::NoCurrentProject)?,
        };
        let dir = self.projects_dir.join(&key);
        if !dir.is_dir() {
            return Err(DiscoveryError::ProjectNotFound(dir));
        }

        in_window(transcripts_in(&dir)?, since, until)
    }

    /// Transcripts of every project, sorted by path.
    pub fn find_all_log_files(
        &self,
        since: Option<OffsetDateTime>,
        until: Option<OffsetDateTime>,
    ) -> Result<Vec<PathBuf>, DiscoveryError> {
        if !self.projects_dir.is_dir() {
            return Err(DiscoveryError::ProjectNotFound(self.projects_dir.clone()));
        }
        let entries = fs::read_dir(&self.projects_dir).map_err(|source| DiscoveryError::Io {
            path: self.projects_dir.clone(),
            source,
        })?;
        let mut all = Vec::new();
        for dir in entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()) {
            all.extend(transcripts_in(&dir)?);
        }
        in_window(all, since, until)
    }

    /// Sanitized key of the working directory, when it has a project directory.
    pub fn current_project(&self) -> Option<String> {
        let cwd = std::env::current_dir().ok()?;
        let key = sanitize_project_path(&cwd.to_string_lossy());
        self.projects_dir.join(&key).is_dir().then_some(key)
    }

    /// Whether `path` (raw or sanitized) names a project holding at least one transcript.
    pub fn validate_project(&self, path: &str) -> bool {
        [path.to_string(), sanitize_project_path(path)]
            .iter()
            .map(|key| self.projects_dir.join(key))
            .filter(|dir| dir.is_dir())
            .any(|dir| transcripts_in(&dir).is_ok_and(|files| !files.is_empty()))
    }
}

/// Replaces every path separator with `-`; a leading separator becomes a leading `-`.
pub fn sanitize_project_path(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c == '/' || c == std::path::MAIN_SEPARATOR {
                '-'
            } else {
                c
            }
        })
        .collect()
}

/// Sanitized names pass through; paths are made absolute and sanitized.
fn project_key(project: &str) -> String {
    if project.starts_with('-') {
        return project.to_string();
    }
    let path = Path::new(project);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    sanitize_project_path(&absolute.to_string_lossy())
}

fn transcripts_in(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let entries = fs::read_dir(dir).map_err(|source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| TRANSCRIPT_GLOB.is_match(name))
        })
        .collect())
}

fn in_window(
    candidates: Vec<PathBuf>,
    since: Option<OffsetDateTime>,
    until: Option<OffsetDateTime>,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    let mut files = Vec::with_capacity(candidates.len());
    for path in candidates {
        if (since.is_some() || until.is_some()) && !may_overlap(&path, since, until) {
            tracing::debug!(path = %path.display(), "transcript outside time window");
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Best-effort timestamp for a transcript: `YYYY-MM-DD-HH-MM-SS` or
/// `YYYY-MM-DD` at the start of the file stem, else the modification time.
pub fn file_timestamp(path: &Path) -> Option<OffsetDateTime> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(timestamp_from_stem)
        .or_else(|| modified(path))
}

fn timestamp_from_stem(stem: &str) -> Option<OffsetDateTime> {
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    let date = parse_date(&parts[..3])?;
    let time = if parts.len() >= 6 {
        parse_time(&parts[3..6]).unwrap_or(Time::MIDNIGHT)
    } else {
        Time::MIDNIGHT
    };
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

fn parse_date(parts: &[&str]) -> Option<Date> {
    let [y, m, d] = parts else { return None };
    if y.len() != 4 || m.len() != 2 || d.len() != 2 {
        return None;
    }
    let month = Month::try_from(m.parse::<u8>().ok()?).ok()?;
    Date::from_calendar_date(y.parse().ok()?, month, d.parse().ok()?).ok()
}

fn parse_time(parts: &[&str]) -> Option<Time> {
    let [h, m, s] = parts else { return None };
    if [h, m, s].iter().any(|p| p.len() != 2) {
        return None;
    }
    Time::from_hms(h.parse().ok()?, m.parse().ok()?, s.parse().ok()?).ok()
}

fn modified(path: &Path) -> Option<OffsetDateTime> {
    let mtime = fs::metadata(path).ok()?.modified().ok()?;
    Some(OffsetDateTime::from(mtime))
}

/// A transcript spans from its stamped start to its last write. It is only
/// ruled out when it was last written before `since` or starts after `until`.
fn may_overlap(path: &Path, since: Option<OffsetDateTime>, until: Option<OffsetDateTime>) -> bool {
    if let (Some(since), Some(last_write)) = (since, modified(path)) {
        if last_write < since {
            return false;
        }
    }
    if let (Some(until), Some(start)) = (until, file_timestamp(path)) {
        if start > until {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "{}\n").unwrap();
        path
    }

    #[test]
    fn sanitizes_separators() {
        assert_eq!(
            sanitize_project_path("/Users/me/Code/app"),
            "-Users-me-Code-app"
        );
        assert_eq!(sanitize_project_path("relative/dir"), "relative-dir");
        assert_eq!(project_key("-already-sanitized"), "-already-sanitized");
        assert_eq!(project_key("/abs/path"), "-abs-path");
    }

    #[test]
    fn finds_sorted_jsonl_only() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("-work-app");
        fs::create_dir_all(&project).unwrap();
        touch(&project, "b.jsonl");
        touch(&project, "a.jsonl");
        touch(&project, "notes.txt");
        fs::create_dir_all(project.join("sub.jsonl")).unwrap();

        let discovery = Discovery::new(tmp.path());
        let files = discovery
            .find_log_files(Some("/work/app"), None, None)
            .unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.jsonl", "b.jsonl"]);

        let same = discovery
            .find_log_files(Some("-work-app"), None, None)
            .unwrap();
        assert_eq!(same, files);
    }

    #[test]
    fn all_projects_are_merged() {
        let tmp = tempfile::tempdir().unwrap();
        for (dir, name) in [("-b", "2.jsonl"), ("-a", "1.jsonl"), ("-a", "3.jsonl")] {
            let project = tmp.path().join(dir);
            fs::create_dir_all(&project).unwrap();
            touch(&project, name);
        }
        touch(tmp.path(), "stray.jsonl");

        let files = Discovery::new(tmp.path())
            .find_all_log_files(None, None)
            .unwrap();
        let rel: Vec<PathBuf> = files
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            rel,
            [
                Path::new("-a").join("1.jsonl"),
                Path::new("-a").join("3.jsonl"),
                Path::new("-b").join("2.jsonl"),
            ]
        );

        let missing = Discovery::new(tmp.path().join("nope"));
        assert!(matches!(
            missing.find_all_log_files(None, None),
            Err(DiscoveryError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn missing_project_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let discovery = Discovery::new(tmp.path());
        assert!(matches!(
            discovery.find_log_files(Some("-nowhere"), None, None),
            Err(DiscoveryError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn filename_timestamps() {
        let full = timestamp_from_stem("2025-02-03-04-05-06-abc").unwrap();
        assert_eq!(
            (full.year(), u8::from(full.month()), full.day()),
            (2025, 2, 3)
        );
        assert_eq!((full.hour(), full.minute(), full.second()), (4, 5, 6));
        let day = timestamp_from_stem("2025-02-03-session").unwrap();
        assert_eq!(day.hour(), 0);
        assert!(timestamp_from_stem("0f9c2a1e-uuid-like").is_none());
        assert!(timestamp_from_stem("2025-13-01").is_none());
    }

    #[test]
    fn falls_back_to_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let path = touch(tmp.path(), "4b1c9e7a-0d2f.jsonl");
        let ts = file_timestamp(&path).unwrap();
        assert!((OffsetDateTime::now_utc() - ts).whole_minutes().abs() < 5);
    }

    #[test]
    fn window_prunes_files_that_cannot_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("-p");
        fs::create_dir_all(&project).unwrap();
        touch(&project, "2020-01-01-00-00-00.jsonl");
        touch(&project, "2999-01-01.jsonl");
        let discovery = Discovery::new(tmp.path());

        let until = OffsetDateTime::now_utc();
        let files = discovery.find_log_files(Some("-p"), None, Some(until)).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("2020-01-01-00-00-00.jsonl"));

        // Both were written just now, so a past `since` keeps them.
        let since = until - time::Duration::days(1);
        let files = discovery.find_log_files(Some("-p"), Some(since), None).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn validates_projects() {
        let tmp = tempfile::tempdir().unwrap();
        let discovery = Discovery::new(tmp.path());
        fs::create_dir_all(tmp.path().join("-empty")).unwrap();
        fs::create_dir_all(tmp.path().join("-full")).unwrap();
        touch(&tmp.path().join("-full"), "x.jsonl");
        assert!(discovery.validate_project("-full"));
        assert!(discovery.validate_project("/full"));
        assert!(!discovery.validate_project("-empty"));
        assert!(!discovery.validate_project("-missing"));
    }
}
