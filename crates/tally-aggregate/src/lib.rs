//! Correlation and streaming statistics over decoded transcript events.

pub mod agents;
pub mod command;
pub mod correlate;
pub mod delegation;
pub mod merge;
pub mod pipeline;
pub mod snapshot;
pub mod store;
pub mod tdigest;
pub mod welford;

pub use agents::{AgentAggregator, DEFAULT_MAX_AGENTS};
pub use command::extract_commands;
pub use correlate::{
    correlate_all, Correlated, Correlator, DEFAULT_DELEGATION_TOOL, DEFAULT_ORPHAN_TIMEOUT,
};
pub use delegation::DelegationGraph;
pub use merge::Aggregate;
pub use pipeline::{ingest_file, ingest_files, FileReport, IngestOptions, IngestReport};
pub use snapshot::*;
pub use store::{Aggregator, AggregatorConfig, BOUNDARY_START, BOUNDARY_SUMMARY};
pub use tdigest::{Centroid, TDigest, DEFAULT_MAX_CENTROIDS};
pub use welford::Welford;
