//! Where transcripts live and how Tally is configured.

pub mod config;
pub mod discovery;
pub mod paths;

pub use config::{Config, CONFIG_FILE, KEYS};
pub use discovery::{file_timestamp, sanitize_project_path, Discovery, DiscoveryError};
pub use paths::{default_claude_dir, store_root};
