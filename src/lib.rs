//! # Benchflow
//!
//! Autonomous task orchestration core for multi-agent benchmarking runs.
//!
//! ## Modules
//!
//! - `resource` - Bounded pool of abstract compute resources with load balancing,
//!   auto-scaling, health checks and scoped acquisition
//! - `pipeline` - Dependency-graph stage scheduling in waves with per-stage retry
//! - `batch` - Bounded-parallel task execution with retry, backoff, pause/resume
//!   and checkpointing
//! - `decision` - Multi-criteria decision making with interchangeable strategies
//! - `workflow` - Objective analysis, planning, execution and validation
//! - `runner` - Task runners that perform the actual unit of work
//! - `metrics` - Sinks for finished batch and workflow results
//! - `config` - Configuration for every component
pub mod batch;
pub mod cancel;
pub mod config;
pub mod decision;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod resource;
pub mod retry;
pub mod runner;
pub mod workflow;

pub use config::OrchestratorConfig;
pub use error::{OrchestrationError, OrchestrationResult};
