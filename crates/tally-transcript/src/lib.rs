mod decode;
mod filter;
mod options;
mod stream;

pub use decode::decode_record;
pub use filter::{EventFilter, OutcomeFilter, Sampler};
pub use options::ParseOptions;
pub use stream::{parse_file, EventStream, ParseStats};
