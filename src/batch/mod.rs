//! Batch execution of discrete tasks
//!
//! A batch is a flat list of tasks. Tasks are grouped by type into pipeline
//! stages and run with a per-type and a global concurrency bound. Every
//! attempt holds a pool resource for its duration, failed attempts are retried
//! with exponential backoff, and progress can be checkpointed so a rerun of
//! the same batch id skips tasks that already completed.

pub mod checkpoint;
pub mod processor;
mod progress;
mod stage;
mod state;
pub mod types;

pub use checkpoint::{BatchCheckpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use processor::BatchProcessor;
pub use types::{
    BatchResult, BatchState, BatchStatus, Task, TaskCounts, TaskExecution, TaskStatus,
};
