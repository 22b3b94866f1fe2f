//! Table Refresh Worker.
//!
//! One invocation applies batches until the source is exhausted or the time budget is
//! spent, then either completes the checkpoint or hands the attempt to the
//! continuation queue. Every invocation applies at least one batch.

pub mod engine;
pub mod tasks;

pub use engine::{DISABLED_CANCEL_MESSAGE, TableRefreshWorker, WorkerRun, WorkerSettings};
pub use tasks::{
    ChannelContinuationQueue, ContinuationQueue, ContinuationTask, ContinuationWorkerPool,
    MemoryContinuationQueue,
};
