#![warn(missing_docs)]
//! forkbench Core - Worker Runtime
//!
//! This crate provides the execution environment for benchmarks:
//! - `BenchmarkDef` registration through `inventory`
//! - Fixtures with invocation, thread and benchmark scope
//! - The iteration scheduler (calibration, warm-up, measurement)
//! - A `Blackhole` sink against dead-code elimination
//! - Clocks (monotonic with cycle counter, or manual for tests)
//! - Global allocator interceptor for the `alloc` profiler

mod allocator;
mod blackhole;
mod clock;
mod fixture;
mod params;
mod scheduler;
mod worker;

pub use allocator::{
    TrackingAllocator, allocation_tracking_installed, current_allocation,
    reset_allocation_counter,
};
pub use blackhole::Blackhole;
/// Whether this platform provides hardware cycle counters (x86_64 RDTSCP or AArch64 CNTVCT_EL0).
pub use clock::HAS_CYCLE_COUNTER;
pub use clock::{Clock, ManualClock, MonotonicClock, pin_to_cpu};
pub use fixture::{
    Fixture, FixtureDef, FixtureError, FixtureSet, Invocation, InvocationError, Scope,
};
pub use forkbench_stats::{Mode, TimeUnit};
pub use params::{Combination, ParamDef, Params};
pub use scheduler::{
    DEFAULT_MIN_ITERATION_TIME_NS, ForkFailure, ForkRun, IterationPlan, MAX_BATCH_SIZE, Phase,
    PhaseTracker, ScheduleConfig, ScheduleError, Scheduler, run_fork,
};
pub use worker::{WorkerMain, completion_messages, shutdown_requested};

/// Erased benchmark body generated by `#[forkbench::bench]`
pub type RunnerFn = fn(&Invocation<'_>, &mut Blackhole) -> Result<(), InvocationError>;

/// Benchmark definition registered via `#[forkbench::bench]`
#[derive(Debug, Clone)]
pub struct BenchmarkDef {
    /// Unique identifier
    pub id: &'static str,
    /// Human-readable name
    pub name: &'static str,
    /// Group this benchmark belongs to
    pub group: &'static str,
    /// Declared benchmark mode
    pub mode: Mode,
    /// Declared output time unit
    pub time_unit: TimeUnit,
    /// Fixtures the benchmark borrows, in argument order
    pub fixtures: &'static [FixtureDef],
    /// Declared parameter axes, outermost first
    pub params: &'static [ParamDef],
    /// Per-benchmark warm-up iteration override
    pub warmup_iterations: Option<u32>,
    /// Per-benchmark measurement iteration override
    pub measurement_iterations: Option<u32>,
    /// Per-benchmark fork count override
    pub forks: Option<u32>,
    /// Per-benchmark thread count override
    pub threads: Option<u32>,
    /// Per-benchmark fixed batch size
    pub batch_size: Option<u64>,
    /// CPU tokens the blackhole burns per consumed value
    pub blackhole_tokens: Option<u64>,
    /// Function pointer to the wrapper
    pub runner_fn: RunnerFn,
    /// Source file path
    pub file: &'static str,
    /// Source line number
    pub line: u32,
    /// Module path
    pub module_path: &'static str,
}

impl BenchmarkDef {
    /// Declared axis named `name`
    pub fn param(&self, name: &str) -> Option<&ParamDef> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Whether any fixture is invocation-scoped (timed call by call)
    pub fn has_invocation_fixtures(&self) -> bool {
        self.fixtures.iter().any(|f| f.scope == Scope::Invocation)
    }
}

// Collect all registered benchmarks
inventory::collect!(BenchmarkDef);

/// All registered benchmarks, in link order
pub fn benchmarks() -> impl Iterator<Item = &'static BenchmarkDef> {
    inventory::iter::<BenchmarkDef>.into_iter()
}

/// Registered benchmark with this id
pub fn find_benchmark(id: &str) -> Option<&'static BenchmarkDef> {
    benchmarks().find(|b| b.id == id)
}

/// Anchor to prevent LTO from stripping inventory entries
#[used]
#[doc(hidden)]
pub static REGISTRY_ANCHOR: fn() = || {
    for _ in inventory::iter::<BenchmarkDef> {}
};
