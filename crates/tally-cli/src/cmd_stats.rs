use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tally_aggregate::{ingest_files, Aggregator, AggregatorConfig, IngestOptions};
use tally_render::{render, OutputFormat, Report, View};
use tally_store::{Config, Discovery};
use tally_transcript::{EventFilter, ParseOptions};
use time::OffsetDateTime;

use crate::timefilter::parse_time_spec;
use crate::CliError;

// ── CLI Schema ──

#[derive(Args)]
pub struct StatsArgs {
    /// summary, tools, agents, commands, sessions, errors, delegation or timeline
    #[arg(default_value = "summary")]
    pub view: View,
    /// Project path or sanitized project name (defaults to the current directory)
    #[arg(long, short, allow_hyphen_values = true)]
    pub project: Option<String>,
    /// Read every project under the transcript directory
    #[arg(long, short, conflicts_with = "project")]
    pub global: bool,
    /// Output format: table, json or csv
    #[arg(long, short, default_value = "table")]
    pub format: OutputFormat,
    /// Start of the window: today, yesterday, 1h, 24h, 7d, YYYY-MM-DD, ...
    #[arg(long)]
    pub since: Option<String>,
    /// End of the window (exclusive), same forms as --since
    #[arg(long)]
    pub until: Option<String>,
    /// Only these sessions (repeatable)
    #[arg(long = "session")]
    pub sessions: Vec<String>,
    /// Only these tools (repeatable, case-insensitive)
    #[arg(long = "include-tool")]
    pub include_tools: Vec<String>,
    /// Skip these tools (repeatable, case-insensitive)
    #[arg(long = "exclude-tool")]
    pub exclude_tools: Vec<String>,
    /// Leaderboard rows to show (0 = all)
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
    /// Fail on the first malformed line
    #[arg(long)]
    pub strict: bool,
    /// Keep roughly this fraction of events, in (0, 1]
    #[arg(long)]
    pub sample_rate: Option<f64>,
    /// Seconds before an unanswered tool call counts as timed out
    #[arg(long, value_name = "SECS")]
    pub orphan_timeout: Option<u64>,
    /// Reader threads
    #[arg(long)]
    pub workers: Option<usize>,
    /// Claude data directory holding `projects/`
    #[arg(long)]
    pub claude_dir: Option<PathBuf>,
}

// ── Command Implementation ──

pub fn execute(args: StatsArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;
    let now = OffsetDateTime::now_utc();
    let since = time_flag("--since", args.since.as_deref(), now)?;
    let until = time_flag("--until", args.until.as_deref(), now)?;
    if let (Some(s), Some(u)) = (since, until) {
        if s >= u {
            return Err(CliError::Usage("--since must be earlier than --until".into()).into());
        }
    }
    if let Some(rate) = args.sample_rate {
        if rate.is_nan() || rate <= 0.0 || rate > 1.0 {
            let msg = format!("--sample-rate must be in (0, 1], got {rate}");
            return Err(CliError::Usage(msg).into());
        }
    }

    let discovery = Discovery::new(config.projects_dir());
    let files = if args.global {
        discovery.find_all_log_files(since, until)?
    } else {
        discovery.find_log_files(args.project.as_deref(), since, until)?
    };
    if files.is_empty() {
        return Err(CliError::NoLogs.into());
    }
    tracing::debug!(files = files.len(), "transcripts selected");

    let aggregator = Aggregator::new(AggregatorConfig {
        orphan_timeout: config.orphan_timeout(),
        delegation_tool: config.delegation_tool.clone(),
        max_centroids: config.max_centroids,
        max_agents: config.max_agents,
    });
    let options = IngestOptions {
        parse: ParseOptions {
            buffer_size: config.buffer_size,
            strict_mode: args.strict,
            ..ParseOptions::default()
        },
        filter: EventFilter {
            start: since,
            end: until,
            sessions: args.sessions,
            include_tools: args.include_tools,
            exclude_tools: args.exclude_tools,
            sample_rate: args.sample_rate,
            ..EventFilter::default()
        },
        workers: config.workers(),
    };

    let ingest = ingest_files(&aggregator, &files, &options).context("reading transcripts")?;
    for failed in ingest.failed_files() {
        tracing::warn!(
            path = %failed.path.display(),
            error = failed.error.as_deref().unwrap_or_default(),
            "transcript could not be read"
        );
    }
    aggregator.quiesce();

    let mut report = Report::collect(&aggregator);
    report.files_scanned = files.len();
    report.events = ingest.events();
    report.lines_skipped = ingest.lines_skipped();

    print!("{}", render(&report, args.view, args.format, args.limit)?);
    Ok(())
}

/// Config file and environment, then command-line overrides.
fn resolve_config(args: &StatsArgs) -> anyhow::Result<Config> {
    let mut config = Config::resolve()?;
    let mut overrides: Vec<(&str, String)> = Vec::new();
    if let Some(secs) = args.orphan_timeout {
        overrides.push(("orphan_timeout_secs", secs.to_string()));
    }
    if let Some(workers) = args.workers {
        overrides.push(("workers", workers.to_string()));
    }
    if let Some(dir) = &args.claude_dir {
        overrides.push(("claude_dir", dir.display().to_string()));
    }
    for (key, value) in overrides {
        config
            .set(key, &value)
            .map_err(|e| CliError::Usage(format!("{key}: {e:#}")))?;
    }
    Ok(config)
}

fn time_flag(
    flag: &str,
    raw: Option<&str>,
    now: OffsetDateTime,
) -> anyhow::Result<Option<OffsetDateTime>> {
    raw.map(|r| parse_time_spec(r, now))
        .transpose()
        .map_err(|e| CliError::Usage(format!("{flag}: {e:#}")).into())
}
