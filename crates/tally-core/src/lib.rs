pub mod error;
pub mod event;
pub mod params;
pub mod timefmt;
pub mod types;

pub use error::{Result, StatsError};
pub use event::Event;
pub use params::{
    subagent_in_payload, BashParams, EditParams, Parameters, ReadParams, SearchParams, TaskParams,
    WriteParams,
};
pub use types::*;
