#![warn(missing_docs)]
//! # forkbench
//!
//! Micro-benchmark harness in the style of JMH:
//! - **Fork isolation**: every fork runs in a fresh worker process, so heap
//!   and cache state from one benchmark never leaks into the next
//! - **Fixtures**: typed state with invocation, thread or benchmark scope,
//!   set up outside the timed window and torn down in reverse order
//! - **Parameter sweeps**: declared axes (`byte.size`, `block.size`, ...)
//!   expanded into a cartesian product, overridable from the command line
//! - **Calibrated iterations**: batch sizes grow until one iteration is long
//!   enough to time, warm-up iterations are discarded
//! - **Blackhole**: results of the benchmark body are consumed so the
//!   optimizer cannot drop them
//! - **Reports**: JMH-style table, JSON or CSV
//!
//! ## Quick Start
//!
//! ```ignore
//! use forkbench::prelude::*;
//!
//! struct Input(Vec<u8>);
//!
//! impl Fixture for Input {
//!     const SCOPE: Scope = Scope::Benchmark;
//!
//!     fn setup(params: &Params) -> Result<Self, FixtureError> {
//!         let size: usize = params.require("byte.size")?;
//!         Ok(Input(vec![0x5a; size]))
//!     }
//! }
//!
//! #[forkbench::bench(mode = "avgt", unit = "us", params = ["byte.size=4096,65536"])]
//! fn checksum(input: &Input) -> u64 {
//!     input.0.iter().map(|&b| b as u64).sum()
//! }
//!
//! fn main() {
//!     if let Err(e) = forkbench::run() {
//!         eprintln!("Error: {e:#}");
//!         std::process::exit(1);
//!     }
//! }
//! ```
//!
//! ## Allocation Profiling
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: forkbench::TrackingAllocator = forkbench::TrackingAllocator;
//! ```
//!
//! With the allocator installed, `--prof alloc` adds bytes and allocations per
//! operation to every result.

// Re-export core types
pub use forkbench_core::{
    BenchmarkDef, Blackhole, Clock, Combination, Fixture, FixtureDef, FixtureError, FixtureSet,
    ForkFailure, ForkRun, Invocation, InvocationError, ManualClock, MonotonicClock, ParamDef,
    Params, Phase, ScheduleConfig, Scheduler, Scope, TrackingAllocator, benchmarks,
    current_allocation, find_benchmark, reset_allocation_counter, run_fork,
};

// Wire-level fork settings, for driving `run_fork` directly
pub use forkbench_ipc::{ForkConfig, IterationSample, ParamValue};

// Re-export stats
pub use forkbench_stats::{AggregateResult, Mode, ResultAggregator, Sample, TimeUnit};

// Re-export macros
pub use forkbench_macros::bench;

/// Internal re-exports for macro use
#[doc(hidden)]
pub mod internal {
    pub use inventory;
}

/// Prelude for convenient imports
///
/// The `bench` attribute is left out: a glob import of it is ambiguous with the
/// built-in `#[bench]`, so write `#[forkbench::bench(...)]`.
pub mod prelude {
    pub use crate::{
        Blackhole, Fixture, FixtureError, Invocation, InvocationError, Mode, Params, Scope,
        TimeUnit,
    };
}

/// Run the forkbench CLI harness.
///
/// Call this from your benchmark binary's `main()`:
/// ```ignore
/// fn main() {
///     if let Err(e) = forkbench::run() {
///         eprintln!("Error: {e:#}");
///         std::process::exit(1);
///     }
/// }
/// ```
pub use forkbench_cli::run;
