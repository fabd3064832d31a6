//! Dependency-aware stage pipelines
//!
//! Stages declare their dependencies by name. A pipeline is validated when it
//! is created (duplicates, undefined dependencies and cycles are rejected) and
//! executed wave by wave: every stage of a wave runs concurrently, and a wave
//! starts only after the previous one has finished.

pub mod graph;
pub mod manager;
pub mod stage;

pub use graph::DependencyGraph;
pub use manager::{
    Pipeline, PipelineManager, PipelineResult, PipelineStatus, StageExecution, StageStatus,
};
pub use stage::{FnStage, PipelineContext, PipelineStage};
