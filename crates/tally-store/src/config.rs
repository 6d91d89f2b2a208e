use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::paths::{default_claude_dir, store_root};

pub const CONFIG_FILE: &str = "config.json";

const DEFAULT_ORPHAN_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_CENTROIDS: usize = 100;
const DEFAULT_MAX_AGENTS: usize = 1000;
const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
const DEFAULT_DELEGATION_TOOL: &str = "Task";

/// Every settable key, paired with the environment variable that overrides it.
pub const KEYS: &[(&str, &str)] = &[
    ("orphan_timeout_secs", "TALLY_ORPHAN_TIMEOUT_SECS"),
    ("max_centroids", "TALLY_MAX_CENTROIDS"),
    ("max_agents", "TALLY_MAX_AGENTS"),
    ("buffer_size", "TALLY_BUFFER_SIZE"),
    ("delegation_tool", "TALLY_DELEGATION_TOOL"),
    ("claude_dir", "TALLY_CLAUDE_DIR"),
    ("workers", "TALLY_WORKERS"),
];

/// Tunables, resolved as file < environment < command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orphan_timeout_secs: u64,
    pub max_centroids: usize,
    pub max_agents: usize,
    pub buffer_size: usize,
    pub delegation_tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orphan_timeout_secs: DEFAULT_ORPHAN_TIMEOUT_SECS,
            max_centroids: DEFAULT_MAX_CENTROIDS,
            max_agents: DEFAULT_MAX_AGENTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            delegation_tool: DEFAULT_DELEGATION_TOOL.to_string(),
            claude_dir: None,
            workers: None,
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        store_root().join(CONFIG_FILE)
    }

    /// Config file plus environment overrides.
    pub fn resolve() -> anyhow::Result<Self> {
        let mut config = Self::load_file(&Self::default_path())?;
        config.apply_env()?;
        Ok(config)
    }

    /// Reads `path`; a missing file yields the defaults. Unknown keys are ignored.
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Writes `path` under an exclusive lock on its sibling `.lock` file.
    /// Readers never see a half-written file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let lock_path = path.with_extension("lock");
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening {}", lock_path.display()))?;
        lock.lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))?;

        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut staged, self)?;
        staged.write_all(b"\n")?;
        staged
            .persist(path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        for (key, var) in KEYS {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                self.set(key, &value)
                    .with_context(|| format!("environment variable {var}"))?;
            }
        }
        Ok(())
    }

    /// Sets one key from its textual form.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let value = value.trim();
        let mut next = self.clone();
        match key {
            "orphan_timeout_secs" => next.orphan_timeout_secs = parse_num(key, value)?,
            "max_centroids" => next.max_centroids = parse_num(key, value)?,
            "max_agents" => next.max_agents = parse_num(key, value)?,
            "buffer_size" => next.buffer_size = parse_num(key, value)?,
            "delegation_tool" => next.delegation_tool = value.to_string(),
            "claude_dir" => next.claude_dir = Some(PathBuf::from(value)),
            "workers" => next.workers = Some(parse_num(key, value)?),
            _ => anyhow::bail!("unknown config key: {key}"),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "orphan_timeout_secs" => self.orphan_timeout_secs.to_string(),
            "max_centroids" => self.max_centroids.to_string(),
            "max_agents" => self.max_agents.to_string(),
            "buffer_size" => self.buffer_size.to_string(),
            "delegation_tool" => self.delegation_tool.clone(),
            "claude_dir" => self.claude_dir().display().to_string(),
            "workers" => self.workers().to_string(),
            _ => return None,
        };
        Some(value)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_centroids < 2 {
            anyhow::bail!("max_centroids must be at least 2");
        }
        if self.max_agents == 0 {
            anyhow::bail!("max_agents must be positive");
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be positive");
        }
        if self.delegation_tool.trim().is_empty() {
            anyhow::bail!("delegation_tool must not be empty");
        }
        if self.workers == Some(0) {
            anyhow::bail!("workers must be positive");
        }
        Ok(())
    }

    pub fn claude_dir(&self) -> PathBuf {
        self.claude_dir.clone().unwrap_or_else(default_claude_dir)
    }

    /// `<claude_dir>/projects`.
    pub fn projects_dir(&self) -> PathBuf {
        self.claude_dir().join("projects")
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn orphan_timeout(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.orphan_timeout_secs).unwrap_or(i64::MAX))
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{key}: expected a non-negative integer, got {value:?}"))
}
