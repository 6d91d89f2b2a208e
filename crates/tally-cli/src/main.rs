mod cmd_config;
mod cmd_stats;
mod timefilter;

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tally_store::{Config, DiscoveryError};
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_NO_LOGS: u8 = 2;
const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(name = "tally", version, about = "Usage statistics for coding-agent transcripts")]
struct Cli {
    /// Log at debug level (TALLY_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Aggregate transcripts and print a view
    Stats(cmd_stats::StatsArgs),
    /// Manage ~/.tally/config.json
    Config {
        #[command(subcommand)]
        cmd: cmd_config::ConfigCmd,
    },
}

/// Failures with a dedicated exit status.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error("no transcripts matched")]
    NoLogs,
    #[error("{0}")]
    Usage(String),
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.cmd {
        Command::Stats(args) => cmd_stats::execute(args),
        Command::Config { cmd } => cmd_config::run(cmd, &Config::default_path()),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TALLY_LOG").unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::NoLogs) => return EXIT_NO_LOGS,
        Some(CliError::Usage(_)) => return EXIT_USAGE,
        None => {}
    }
    match err.downcast_ref::<DiscoveryError>() {
        Some(DiscoveryError::NoCurrentProject | DiscoveryError::ProjectNotFound(_)) => {
            EXIT_NO_LOGS
        }
        _ => EXIT_FAILURE,
    }
}
