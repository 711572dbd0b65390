pub mod pipeline;
pub mod service;

pub use pipeline::{relay_stream, ChunkSink, RelayOutcome, SseSink, StreamContext};
pub use service::{CallContext, GenerationService};
