use clap::Subcommand;
use std::path::Path;
use tally_store::{Config, KEYS};

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Set a config value
    Set {
        /// Config key (e.g. orphan_timeout_secs)
        key: String,
        /// Config value
        value: String,
    },
    /// Get the effective value of a key (file, then environment)
    Get {
        /// Config key
        key: String,
    },
    /// List every key with its effective value
    List,
}

// ── Dispatch ──

pub fn run(cmd: ConfigCmd, path: &Path) -> anyhow::Result<()> {
    match cmd {
        ConfigCmd::Set { key, value } => set(path, &key, &value),
        ConfigCmd::Get { key } => get(path, &key),
        ConfigCmd::List => list(path),
    }
}

// ── Command Implementations ──

/// `tally config set <key> <value>`. Only the file is written; environment
/// overrides are left out of what gets saved.
pub fn set(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = Config::load_file(path)?;
    config.set(key, value)?;
    config.save(path)?;
    println!("{key} = {}", config.get(key).unwrap_or_default());
    Ok(())
}

/// `tally config get <key>`
pub fn get(path: &Path, key: &str) -> anyhow::Result<()> {
    let config = effective(path)?;
    match config.get(key) {
        Some(val) => println!("{val}"),
        None => anyhow::bail!("unknown config key: {key}"),
    }
    Ok(())
}

/// `tally config list`
pub fn list(path: &Path) -> anyhow::Result<()> {
    let config = effective(path)?;
    for (key, var) in KEYS {
        let value = config.get(key).unwrap_or_default();
        let source = if std::env::var_os(var).is_some() {
            format!("  (from {var})")
        } else {
            String::new()
        };
        println!("{key} = {value}{source}");
    }
    Ok(())
}

fn effective(path: &Path) -> anyhow::Result<Config> {
    let mut config = Config::load_file(path)?;
    config.apply_env()?;
    Ok(config)
}
