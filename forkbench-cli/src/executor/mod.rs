//! Benchmark Executor
//!
//! Runs planned fork tasks and turns their outcomes into a report.
//!
//! ## Pipeline Overview
//!
//! ```text
//! ExecutionPlan (planner)
//!       │
//!       ▼
//! ┌─────────────┐
//! │  execution  │  Run fork tasks, contain failures per fork
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │   report    │  Aggregate samples into one entry per fork
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │ formatting  │  Human-readable table
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`execution`] - Settings layering and fork orchestration
//! - [`report`] - Report building
//! - [`formatting`] - Human-readable output formatting
//! - [`metadata`] - System metadata collection

mod execution;
mod formatting;
mod metadata;
mod report;

pub use execution::{
    BenchSettings, DEFAULT_FORKS, ExecutionConfig, ForkOutcome, ForkResult, Orchestrator,
    RunOptions,
};
pub use formatting::format_human_output;
pub use report::{build_entry, build_report};
