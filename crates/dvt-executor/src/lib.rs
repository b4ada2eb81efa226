//! Bulk operation executor.
//!
//! Chunks entity rows into sub-batches, dispatches them through the pool
//! under a bounded concurrency budget, falls back to one-by-one execution
//! when the server refuses bulk payloads, and streams progress and error
//! events while it works.

mod batch;
mod executor;
mod progress;

pub use batch::{BatchRequest, BatchResult, SubBatchState};
pub use executor::{BulkExecutor, ExecutorConfig, effective_concurrency};
pub use progress::{
    ChannelSink, NullSink, Phase, ProgressEvent, ProgressReceiver, ProgressSink, progress_channel,
};
