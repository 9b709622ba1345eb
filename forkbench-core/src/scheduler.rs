//! Iteration Scheduler
//!
//! Drives one fork: `Idle → WarmingUp → Measuring → Done`.
//!
//! Without a fixed batch size the warm-up starts with a calibration pass
//! that grows the batch until one iteration takes at least the minimum
//! iteration time. Calibration and warm-up iterations are never recorded.
//!
//! With `threads > 1` every iteration is bracketed by barriers: all threads
//! start their timers after the opening barrier and the closing barrier is
//! only passed once every timer has stopped. A failure inside a batch is
//! published before the closing barrier and observed by all threads after
//! it, so the threads always leave together.

use crate::BenchmarkDef;
use crate::allocator::{current_allocation, reset_allocation_counter};
use crate::blackhole::Blackhole;
use crate::clock::{Clock, MonotonicClock};
use crate::fixture::{FixtureDef, FixtureSet, Invocation, InvocationError, Scope, panic_message};
use crate::params::Params;
use forkbench_ipc::{ForkConfig, IterationSample};
use forkbench_stats::{ResultAggregator, Sample};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Barrier, Mutex, MutexGuard};
use thiserror::Error;

/// Default calibration target for one iteration (20 ms)
pub const DEFAULT_MIN_ITERATION_TIME_NS: u64 = 20_000_000;

/// Largest batch calibration will choose
pub const MAX_BATCH_SIZE: u64 = 1 << 30;

/// Largest growth step between two calibration rounds
const MAX_CALIBRATION_FACTOR: u64 = 100;

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// Nothing ran yet
    #[default]
    Idle,
    /// Calibration and warm-up; results are discarded
    WarmingUp,
    /// Measured iterations
    Measuring,
    /// All iterations finished
    Done,
}

impl Phase {
    /// Lower-case label used in reports and on the wire
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::WarmingUp => "warmup",
            Phase::Measuring => "measurement",
            Phase::Done => "done",
        }
    }

    /// Inverse of [`label`](Self::label)
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "idle" => Some(Phase::Idle),
            "warmup" => Some(Phase::WarmingUp),
            "measurement" => Some(Phase::Measuring),
            "done" => Some(Phase::Done),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Scheduler state machine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Transition not allowed by the phase order
    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition {
        /// Current phase
        from: Phase,
        /// Requested phase
        to: Phase,
    },
}

/// Enforces `Idle → WarmingUp → Measuring → Done`
#[derive(Debug, Default)]
pub struct PhaseTracker {
    phase: Phase,
}

impl PhaseTracker {
    /// Tracker in [`Phase::Idle`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to `to`, rejecting anything but the next phase
    pub fn advance(&mut self, to: Phase) -> Result<(), ScheduleError> {
        let legal = matches!(
            (self.phase, to),
            (Phase::Idle, Phase::WarmingUp)
                | (Phase::WarmingUp, Phase::Measuring)
                | (Phase::Measuring, Phase::Done)
        );
        if !legal {
            return Err(ScheduleError::IllegalTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}

/// Iterations of one phase at a fixed batch size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationPlan {
    /// Phase the iterations belong to
    pub phase: Phase,
    /// Number of iterations
    pub iterations: u32,
    /// Invocations per iteration per thread
    pub batch_size: u64,
}

/// Iteration counts and batch policy for one fork
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Warm-up iterations (may be 0)
    pub warmup_iterations: u32,
    /// Measured iterations (at least 1)
    pub measurement_iterations: u32,
    /// Fixed batch size; `None` calibrates
    pub batch_size: Option<u64>,
    /// Calibration target for one iteration
    pub min_iteration_time_ns: u64,
    /// Worker threads
    pub threads: u32,
    /// Record allocation counters per sample
    pub track_allocations: bool,
    /// CPU tokens each thread's blackhole burns per consumed value
    pub blackhole_tokens: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 5,
            measurement_iterations: 5,
            batch_size: None,
            min_iteration_time_ns: DEFAULT_MIN_ITERATION_TIME_NS,
            threads: 1,
            track_allocations: false,
            blackhole_tokens: 0,
        }
    }
}

impl From<&ForkConfig> for ScheduleConfig {
    fn from(config: &ForkConfig) -> Self {
        Self {
            warmup_iterations: config.warmup_iterations,
            measurement_iterations: config.measurement_iterations,
            batch_size: config.batch_size,
            min_iteration_time_ns: config.min_iteration_time_ns,
            threads: config.threads,
            track_allocations: config.track_allocations,
            blackhole_tokens: config.blackhole_tokens,
        }
    }
}

impl ScheduleConfig {
    /// Reject configurations that cannot produce a sample
    pub fn validate(&self) -> Result<(), ForkFailure> {
        if self.measurement_iterations == 0 {
            return Err(ForkFailure::Configuration(
                "measurement iterations must be at least 1".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(ForkFailure::Configuration(
                "thread count must be at least 1".to_string(),
            ));
        }
        if self.batch_size == Some(0) {
            return Err(ForkFailure::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.batch_size.is_none() && self.min_iteration_time_ns == 0 {
            return Err(ForkFailure::Configuration(
                "minimum iteration time must be positive when calibrating".to_string(),
            ));
        }
        Ok(())
    }

    /// Warm-up and measurement plans once the batch size is known
    pub fn plans(&self, batch_size: u64) -> [IterationPlan; 2] {
        [
            IterationPlan {
                phase: Phase::WarmingUp,
                iterations: self.warmup_iterations,
                batch_size,
            },
            IterationPlan {
                phase: Phase::Measuring,
                iterations: self.measurement_iterations,
                batch_size,
            },
        ]
    }
}

/// Why a fork produced no result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForkFailure {
    /// A fixture initializer failed or panicked
    #[error("setup of fixture {fixture} failed: {message}")]
    Setup {
        /// Fixture type name
        fixture: String,
        /// Cause
        message: String,
    },

    /// The benchmark raised during warm-up or measurement
    #[error("{phase} iteration {iteration} failed on thread {thread}: {message}")]
    Measurement {
        /// Phase of the failing iteration (calibration counts as warm-up)
        phase: Phase,
        /// Iteration index within the phase
        iteration: u32,
        /// Worker thread index
        thread: u32,
        /// Cause
        message: String,
    },

    /// The fork configuration is unusable
    #[error("invalid fork configuration: {0}")]
    Configuration(String),
}

/// Everything one successful fork produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkRun {
    /// Measured samples sorted by (iteration, thread)
    pub samples: Vec<IterationSample>,
    /// Warm-up iterations executed (calibration excluded)
    pub warmup_iterations: u32,
    /// Invocations per iteration per thread
    pub batch_size: u64,
    /// Calibration rounds (0 with a fixed batch size)
    pub calibration_rounds: u32,
}

impl ForkRun {
    /// Samples in aggregation order
    pub fn aggregator(&self) -> ResultAggregator {
        self.samples
            .iter()
            .map(|s| Sample::new(s.elapsed_nanos, s.operations))
            .collect()
    }

    /// Total operations across samples
    pub fn operations(&self) -> u64 {
        self.samples.iter().map(|s| s.operations).sum()
    }

    /// Allocated `(bytes, count)` per operation, when tracked
    pub fn allocations_per_op(&self) -> (f64, f64) {
        let ops = self.operations().max(1) as f64;
        let bytes: u64 = self.samples.iter().map(|s| s.alloc_bytes).sum();
        let count: u64 = self.samples.iter().map(|s| s.alloc_count).sum();
        (bytes as f64 / ops, count as f64 / ops)
    }
}

/// Next calibration batch, or `None` when `batch` is final
pub(crate) fn next_batch(batch: u64, slowest_nanos: u64, target_nanos: u64) -> Option<u64> {
    if slowest_nanos >= target_nanos || batch >= MAX_BATCH_SIZE {
        return None;
    }
    let factor = if slowest_nanos == 0 {
        MAX_CALIBRATION_FACTOR
    } else {
        target_nanos
            .div_ceil(slowest_nanos)
            .clamp(2, MAX_CALIBRATION_FACTOR)
    };
    Some(batch.saturating_mul(factor).min(MAX_BATCH_SIZE))
}

/// Fork failure already published to [`Shared`]
struct Aborted;

#[derive(Debug, Clone, Copy)]
struct Measured {
    elapsed_nanos: u64,
    operations: u64,
    alloc_bytes: u64,
    alloc_count: u64,
}

/// State the worker threads of one fork agree on
struct Shared {
    barrier: Barrier,
    failed: AtomicBool,
    failure: Mutex<Option<ForkFailure>>,
    calibrating: AtomicBool,
    batch: AtomicU64,
    slowest: AtomicU64,
    rounds: AtomicU32,
    samples: Mutex<Vec<IterationSample>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new(threads: u32, batch_size: Option<u64>) -> Self {
        Self {
            barrier: Barrier::new(threads as usize),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
            calibrating: AtomicBool::new(batch_size.is_none()),
            batch: AtomicU64::new(batch_size.unwrap_or(1)),
            slowest: AtomicU64::new(0),
            rounds: AtomicU32::new(0),
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Record the first failure of the fork
    fn fail(&self, failure: ForkFailure) -> Aborted {
        let mut slot = lock(&self.failure);
        if slot.is_none() {
            *slot = Some(failure);
        }
        self.failed.store(true, Ordering::SeqCst);
        Aborted
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Per-thread view of the fork
struct ThreadContext<'a> {
    thread: u32,
    bench: &'a BenchmarkDef,
    params: &'a Params,
    benchmark_set: &'a FixtureSet,
    thread_set: &'a FixtureSet,
    invocation_set: FixtureSet,
    per_invocation: bool,
    blackhole: Blackhole,
}

/// Runs forks against a clock
pub struct Scheduler<'c, C: Clock + ?Sized> {
    config: ScheduleConfig,
    clock: &'c C,
}

impl<'c, C: Clock + ?Sized> Scheduler<'c, C> {
    /// Scheduler for `config`, timing with `clock`
    pub fn new(config: ScheduleConfig, clock: &'c C) -> Self {
        Self { config, clock }
    }

    /// Active configuration
    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Run one fork of `bench`.
    ///
    /// Benchmark-scoped fixtures are initialized here, before any worker
    /// thread exists, and torn down after all of them have finished.
    pub fn run(&self, bench: &BenchmarkDef, params: &Params) -> Result<ForkRun, ForkFailure> {
        self.config.validate()?;

        let mut benchmark_set = FixtureSet::new(Scope::Benchmark);
        prepare(&mut benchmark_set, bench.fixtures, Scope::Benchmark, params)?;

        let shared = Shared::new(self.config.threads, self.config.batch_size);
        if self.config.threads == 1 {
            self.thread_main(0, bench, params, &benchmark_set, &shared);
        } else {
            std::thread::scope(|scope| {
                for thread in 0..self.config.threads {
                    let shared = &shared;
                    let benchmark_set = &benchmark_set;
                    scope.spawn(move || {
                        self.thread_main(thread, bench, params, benchmark_set, shared)
                    });
                }
            });
        }

        let failure = lock(&shared.failure).take();
        benchmark_set.retire();
        if let Some(failure) = failure {
            return Err(failure);
        }

        let mut samples = std::mem::take(&mut *lock(&shared.samples));
        samples.sort_by_key(|s| (s.iteration, s.thread));

        Ok(ForkRun {
            samples,
            warmup_iterations: self.config.warmup_iterations,
            batch_size: shared.batch.load(Ordering::SeqCst),
            calibration_rounds: shared.rounds.load(Ordering::SeqCst),
        })
    }

    fn thread_main(
        &self,
        thread: u32,
        bench: &BenchmarkDef,
        params: &Params,
        benchmark_set: &FixtureSet,
        shared: &Shared,
    ) {
        let mut thread_set = FixtureSet::new(Scope::Thread);
        if let Err(failure) = prepare(&mut thread_set, bench.fixtures, Scope::Thread, params) {
            shared.fail(failure);
        }

        // No timer starts before every thread finished its setup
        shared.barrier.wait();
        if shared.failed() {
            return;
        }

        let mut ctx = ThreadContext {
            thread,
            bench,
            params,
            benchmark_set,
            thread_set: &thread_set,
            invocation_set: FixtureSet::new(Scope::Invocation),
            per_invocation: bench.fixtures.iter().any(|f| f.scope == Scope::Invocation),
            blackhole: Blackhole::with_cost(self.config.blackhole_tokens),
        };

        if let Ok(samples) = self.drive(&mut ctx, shared) {
            lock(&shared.samples).extend(samples);
        }
        // thread_set drops here, after the last closing barrier
    }

    fn drive(
        &self,
        ctx: &mut ThreadContext<'_>,
        shared: &Shared,
    ) -> Result<Vec<IterationSample>, Aborted> {
        let mut phases = PhaseTracker::new();
        let enter = |phases: &mut PhaseTracker, to: Phase| {
            phases
                .advance(to)
                .map_err(|e| shared.fail(ForkFailure::Configuration(e.to_string())))
        };

        enter(&mut phases, Phase::WarmingUp)?;
        self.calibrate(ctx, shared)?;

        let batch = shared.batch.load(Ordering::SeqCst);
        let [warmup, measurement] = self.config.plans(batch);

        for index in 0..warmup.iterations {
            self.iteration(ctx, shared, warmup.phase, index, warmup.batch_size)?;
        }

        enter(&mut phases, Phase::Measuring)?;
        let mut samples = Vec::with_capacity(measurement.iterations as usize);
        for index in 0..measurement.iterations {
            let m = self.iteration(ctx, shared, measurement.phase, index, measurement.batch_size)?;
            samples.push(
                IterationSample::new(index, ctx.thread, m.elapsed_nanos, m.operations)
                    .with_allocations(m.alloc_bytes, m.alloc_count),
            );
        }

        enter(&mut phases, Phase::Done)?;
        Ok(samples)
    }

    /// Grow the shared batch until one iteration reaches the minimum time.
    ///
    /// Thread 0 decides; the others follow at the next barrier.
    fn calibrate(&self, ctx: &mut ThreadContext<'_>, shared: &Shared) -> Result<(), Aborted> {
        let mut round = 0;
        while shared.calibrating.load(Ordering::SeqCst) {
            let batch = shared.batch.load(Ordering::SeqCst);
            let measured = self.iteration(ctx, shared, Phase::WarmingUp, round, batch)?;
            shared
                .slowest
                .fetch_max(measured.elapsed_nanos, Ordering::SeqCst);
            shared.barrier.wait();

            if ctx.thread == 0 {
                let slowest = shared.slowest.swap(0, Ordering::SeqCst);
                let rounds = shared.rounds.fetch_add(1, Ordering::SeqCst) + 1;
                match next_batch(batch, slowest, self.config.min_iteration_time_ns) {
                    Some(next) => {
                        tracing::trace!(batch, slowest, next, "calibration round");
                        shared.batch.store(next, Ordering::SeqCst);
                    }
                    None => {
                        tracing::debug!(
                            bench = ctx.bench.id,
                            batch,
                            rounds,
                            "calibrated batch size"
                        );
                        shared.calibrating.store(false, Ordering::SeqCst);
                    }
                }
            }
            shared.barrier.wait();
            round += 1;
        }
        Ok(())
    }

    /// One lock-step iteration: open barrier, timed batch, closing barrier.
    fn iteration(
        &self,
        ctx: &mut ThreadContext<'_>,
        shared: &Shared,
        phase: Phase,
        index: u32,
        batch: u64,
    ) -> Result<Measured, Aborted> {
        shared.barrier.wait();
        let outcome = if ctx.per_invocation {
            self.run_per_invocation(ctx, batch)
        } else {
            self.run_batch(ctx, batch)
        };
        let outcome = outcome.map_err(|failure| {
            shared.fail(match failure {
                BatchFailure::Setup(failure) => failure,
                BatchFailure::Raised(message) => ForkFailure::Measurement {
                    phase,
                    iteration: index,
                    thread: ctx.thread,
                    message,
                },
            })
        });
        shared.barrier.wait();

        if shared.failed() {
            return Err(Aborted);
        }
        outcome
    }

    fn run_batch(&self, ctx: &mut ThreadContext<'_>, batch: u64) -> Result<Measured, BatchFailure> {
        let runner = ctx.bench.runner_fn;
        let inv = Invocation::new(
            ctx.benchmark_set,
            ctx.thread_set,
            &ctx.invocation_set,
            ctx.params,
            ctx.thread,
        );
        let blackhole = &mut ctx.blackhole;

        if self.config.track_allocations {
            reset_allocation_counter();
        }
        let start = self.clock.now_nanos();
        let result = catch_unwind(AssertUnwindSafe(|| {
            for _ in 0..batch {
                runner(&inv, blackhole)?;
            }
            Ok::<(), InvocationError>(())
        }));
        let elapsed_nanos = self.clock.now_nanos().saturating_sub(start);
        let (alloc_bytes, alloc_count) = if self.config.track_allocations {
            current_allocation()
        } else {
            (0, 0)
        };

        settle(result)?;
        Ok(Measured {
            elapsed_nanos,
            operations: batch,
            alloc_bytes,
            alloc_count,
        })
    }

    /// Time call by call so invocation fixtures stay outside the timed window
    fn run_per_invocation(
        &self,
        ctx: &mut ThreadContext<'_>,
        batch: u64,
    ) -> Result<Measured, BatchFailure> {
        let runner = ctx.bench.runner_fn;
        let mut measured = Measured {
            elapsed_nanos: 0,
            operations: batch,
            alloc_bytes: 0,
            alloc_count: 0,
        };

        for _ in 0..batch {
            let mut set = FixtureSet::new(Scope::Invocation);
            prepare(&mut set, ctx.bench.fixtures, Scope::Invocation, ctx.params)
                .map_err(BatchFailure::Setup)?;

            let inv = Invocation::new(
                ctx.benchmark_set,
                ctx.thread_set,
                &set,
                ctx.params,
                ctx.thread,
            );
            let blackhole = &mut ctx.blackhole;

            let (bytes_before, count_before) = current_allocation();
            let start = self.clock.now_nanos();
            let result = catch_unwind(AssertUnwindSafe(|| runner(&inv, blackhole)));
            let end = self.clock.now_nanos();
            if self.config.track_allocations {
                let (bytes_after, count_after) = current_allocation();
                measured.alloc_bytes += bytes_after.wrapping_sub(bytes_before);
                measured.alloc_count += count_after.wrapping_sub(count_before);
            }
            measured.elapsed_nanos += end.saturating_sub(start);

            settle(result)?;
            set.retire();
        }
        Ok(measured)
    }
}

enum BatchFailure {
    Setup(ForkFailure),
    Raised(String),
}

fn settle(
    result: std::thread::Result<Result<(), InvocationError>>,
) -> Result<(), BatchFailure> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(BatchFailure::Raised(err.message().to_string())),
        Err(payload) => Err(BatchFailure::Raised(format!(
            "panicked: {}",
            panic_message(&*payload)
        ))),
    }
}

/// Initialize every fixture of `scope` that the benchmark declares
fn prepare(
    set: &mut FixtureSet,
    fixtures: &[FixtureDef],
    scope: Scope,
    params: &Params,
) -> Result<(), ForkFailure> {
    for def in fixtures.iter().filter(|def| def.scope == scope) {
        set.resolve(def, params)
            .map_err(|e| ForkFailure::Setup {
                fixture: def.short_name().to_string(),
                message: e.to_string(),
            })?;
    }
    Ok(())
}

/// Run one fork of `bench` on the real clock with the fork's parameters
pub fn run_fork(bench: &BenchmarkDef, config: &ForkConfig) -> Result<ForkRun, ForkFailure> {
    let clock = MonotonicClock::new();
    let params = Params::from_wire(&config.params, &config.properties);
    Scheduler::new(ScheduleConfig::from(config), &clock).run(bench, &params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fixture::{Fixture, FixtureError};
    use crate::{Mode, RunnerFn, TimeUnit};
    use std::sync::atomic::AtomicUsize;

    fn bench(fixtures: &'static [FixtureDef], runner_fn: RunnerFn) -> BenchmarkDef {
        BenchmarkDef {
            id: "scheduler_test",
            name: "scheduler_test",
            group: "tests",
            mode: Mode::AverageTime,
            time_unit: TimeUnit::Milliseconds,
            fixtures,
            params: &[],
            warmup_iterations: None,
            measurement_iterations: None,
            forks: None,
            threads: None,
            batch_size: None,
            blackhole_tokens: None,
            runner_fn,
            file: file!(),
            line: line!(),
            module_path: module_path!(),
        }
    }

    fn fixed(warmup: u32, measurement: u32, batch: u64, threads: u32) -> ScheduleConfig {
        ScheduleConfig {
            warmup_iterations: warmup,
            measurement_iterations: measurement,
            batch_size: Some(batch),
            threads,
            ..ScheduleConfig::default()
        }
    }

    #[test]
    fn test_phase_order() {
        let mut tracker = PhaseTracker::new();
        assert_eq!(tracker.phase(), Phase::Idle);
        assert!(tracker.advance(Phase::Measuring).is_err());
        tracker.advance(Phase::WarmingUp).unwrap();
        tracker.advance(Phase::Measuring).unwrap();
        assert_eq!(
            tracker.advance(Phase::WarmingUp),
            Err(ScheduleError::IllegalTransition {
                from: Phase::Measuring,
                to: Phase::WarmingUp
            })
        );
        tracker.advance(Phase::Done).unwrap();
        assert!(tracker.advance(Phase::Done).is_err());
    }

    #[test]
    fn test_phase_labels_round_trip() {
        for phase in [Phase::Idle, Phase::WarmingUp, Phase::Measuring, Phase::Done] {
            assert_eq!(Phase::from_label(phase.label()), Some(phase));
        }
    }

    #[test]
    fn test_next_batch_growth() {
        assert_eq!(next_batch(1, 1_000, 20_000_000), Some(100));
        assert_eq!(next_batch(10_000, 10_000_000, 20_000_000), Some(20_000));
        assert_eq!(next_batch(4, 0, 1_000), Some(400));
        assert_eq!(next_batch(8, 20_000_000, 20_000_000), None);
        assert_eq!(next_batch(1 << 29, 1, u64::MAX), Some(MAX_BATCH_SIZE));
        assert_eq!(next_batch(MAX_BATCH_SIZE, 1, u64::MAX), None);
    }

    #[test]
    fn test_invalid_configuration() {
        let clock = ManualClock::new();
        fn noop(_: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
            Ok(())
        }
        let def = bench(&[], noop);
        let scheduler = Scheduler::new(fixed(0, 0, 1, 1), &clock);
        assert!(matches!(
            scheduler.run(&def, &Params::new()),
            Err(ForkFailure::Configuration(_))
        ));
    }

    static CLOCK_FIXED: ManualClock = ManualClock::new();
    static CALLS_FIXED: AtomicU64 = AtomicU64::new(0);

    fn ten_micros(_: &Invocation<'_>, bh: &mut Blackhole) -> Result<(), InvocationError> {
        CALLS_FIXED.fetch_add(1, Ordering::SeqCst);
        CLOCK_FIXED.advance(10_000);
        bh.consume(42u64);
        Ok(())
    }

    #[test]
    fn test_warmup_discarded_and_batch_averages() {
        let def = bench(&[], ten_micros);
        let run = Scheduler::new(fixed(5, 5, 1000, 1), &CLOCK_FIXED)
            .run(&def, &Params::new())
            .unwrap();

        // Warm-up ran but left no samples
        assert_eq!(CALLS_FIXED.load(Ordering::SeqCst), 10 * 1000);
        assert_eq!(run.samples.len(), 5);
        assert_eq!(run.calibration_rounds, 0);
        for (i, sample) in run.samples.iter().enumerate() {
            assert_eq!(sample.iteration, i as u32);
            assert_eq!(sample.elapsed_nanos, 10_000_000);
            assert_eq!(sample.operations, 1000);
        }

        let avgt = run
            .aggregator()
            .finalize(Mode::AverageTime, TimeUnit::Milliseconds)
            .unwrap();
        assert!((avgt.score - 0.01).abs() < 1e-12);
        let thrpt = run
            .aggregator()
            .finalize(Mode::Throughput, TimeUnit::Seconds)
            .unwrap();
        assert!((thrpt.score - 100_000.0).abs() < 1e-6);
    }

    static CLOCK_CALIBRATE: ManualClock = ManualClock::new();

    fn one_micro(_: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
        CLOCK_CALIBRATE.advance(1_000);
        Ok(())
    }

    #[test]
    fn test_calibration_reaches_min_iteration_time() {
        let def = bench(&[], one_micro);
        let config = ScheduleConfig {
            warmup_iterations: 0,
            measurement_iterations: 2,
            batch_size: None,
            min_iteration_time_ns: 20_000_000,
            ..ScheduleConfig::default()
        };
        let run = Scheduler::new(config, &CLOCK_CALIBRATE)
            .run(&def, &Params::new())
            .unwrap();

        // 1 → 100 → 10_000 → 20_000 (20 ms per iteration)
        assert_eq!(run.batch_size, 20_000);
        assert_eq!(run.calibration_rounds, 4);
        assert_eq!(run.samples.len(), 2);
        assert!(run.samples.iter().all(|s| s.operations == 20_000));
        assert!(run.samples.iter().all(|s| s.elapsed_nanos == 20_000_000));
    }

    static CALLS_FAILING: AtomicU64 = AtomicU64::new(0);

    fn fails_on_third_call(_: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
        if CALLS_FAILING.fetch_add(1, Ordering::SeqCst) == 2 {
            return Err(InvocationError::new("checksum mismatch"));
        }
        Ok(())
    }

    #[test]
    fn test_failure_in_third_measured_iteration() {
        let clock = MonotonicClock::new();
        let def = bench(&[], fails_on_third_call);
        let result = Scheduler::new(fixed(0, 5, 1, 1), &clock).run(&def, &Params::new());
        assert_eq!(
            result,
            Err(ForkFailure::Measurement {
                phase: Phase::Measuring,
                iteration: 2,
                thread: 0,
                message: "checksum mismatch".to_string(),
            })
        );
    }

    fn always_panics(_: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
        panic!("index out of bounds");
    }

    #[test]
    fn test_panic_during_warmup_is_tagged() {
        let clock = MonotonicClock::new();
        let def = bench(&[], always_panics);
        match Scheduler::new(fixed(2, 5, 1, 1), &clock).run(&def, &Params::new()) {
            Err(ForkFailure::Measurement {
                phase,
                iteration,
                message,
                ..
            }) => {
                assert_eq!(phase, Phase::WarmingUp);
                assert_eq!(iteration, 0);
                assert!(message.contains("index out of bounds"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    static SHARED_SETUPS: AtomicUsize = AtomicUsize::new(0);
    static PER_THREAD_SETUPS: AtomicUsize = AtomicUsize::new(0);
    static PER_THREAD_TEARDOWNS: AtomicUsize = AtomicUsize::new(0);
    static SEEN: Mutex<Vec<(u32, usize)>> = Mutex::new(Vec::new());

    struct SharedTable(Vec<u8>);
    struct PerThread;

    impl Fixture for SharedTable {
        const SCOPE: Scope = Scope::Benchmark;
        fn setup(_: &Params) -> Result<Self, FixtureError> {
            SHARED_SETUPS.fetch_add(1, Ordering::SeqCst);
            Ok(SharedTable(vec![7; 64]))
        }
    }

    impl Fixture for PerThread {
        const SCOPE: Scope = Scope::Thread;
        fn setup(_: &Params) -> Result<Self, FixtureError> {
            PER_THREAD_SETUPS.fetch_add(1, Ordering::SeqCst);
            Ok(PerThread)
        }
        fn teardown(&mut self) {
            PER_THREAD_TEARDOWNS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_identity(inv: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
        let table = inv.fixture::<SharedTable>()?;
        inv.fixture::<PerThread>()?;
        SEEN.lock()
            .unwrap()
            .push((inv.thread_index(), table as *const SharedTable as usize));
        Ok(())
    }

    #[test]
    fn test_benchmark_fixture_shared_across_threads() {
        const FIXTURES: &[FixtureDef] = &[
            FixtureDef::of::<SharedTable>(),
            FixtureDef::of::<PerThread>(),
        ];
        let clock = MonotonicClock::new();
        let def = bench(FIXTURES, record_identity);
        let run = Scheduler::new(fixed(1, 2, 3, 2), &clock)
            .run(&def, &Params::new())
            .unwrap();

        assert_eq!(SHARED_SETUPS.load(Ordering::SeqCst), 1);
        assert_eq!(PER_THREAD_SETUPS.load(Ordering::SeqCst), 2);
        assert_eq!(PER_THREAD_TEARDOWNS.load(Ordering::SeqCst), 2);

        let seen = SEEN.lock().unwrap();
        assert_eq!(seen.len(), 2 * (1 + 2) * 3);
        assert!(seen.iter().all(|&(_, addr)| addr == seen[0].1));
        assert!(seen.iter().any(|&(t, _)| t == 0));
        assert!(seen.iter().any(|&(t, _)| t == 1));

        let order: Vec<(u32, u32)> = run.samples.iter().map(|s| (s.iteration, s.thread)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    static GUARD_TEARDOWNS: AtomicUsize = AtomicUsize::new(0);

    struct Guard;
    struct Broken;

    impl Fixture for Guard {
        const SCOPE: Scope = Scope::Benchmark;
        fn setup(_: &Params) -> Result<Self, FixtureError> {
            Ok(Guard)
        }
        fn teardown(&mut self) {
            GUARD_TEARDOWNS.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Fixture for Broken {
        const SCOPE: Scope = Scope::Benchmark;
        fn setup(_: &Params) -> Result<Self, FixtureError> {
            Err(FixtureError::setup("input file missing"))
        }
    }

    fn unreachable_body(_: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
        panic!("benchmark must not run after a setup failure");
    }

    #[test]
    fn test_setup_failure_tears_down_earlier_fixtures() {
        const FIXTURES: &[FixtureDef] = &[FixtureDef::of::<Guard>(), FixtureDef::of::<Broken>()];
        let clock = MonotonicClock::new();
        let def = bench(FIXTURES, unreachable_body);
        let result = Scheduler::new(fixed(1, 1, 1, 1), &clock).run(&def, &Params::new());

        match result {
            Err(ForkFailure::Setup { fixture, message }) => {
                assert_eq!(fixture, "Broken");
                assert!(message.contains("input file missing"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(GUARD_TEARDOWNS.load(Ordering::SeqCst), 1);
    }

    static CLOCK_INVOCATION: ManualClock = ManualClock::new();
    static SCRATCH_SETUPS: AtomicUsize = AtomicUsize::new(0);
    static SCRATCH_TEARDOWNS: AtomicUsize = AtomicUsize::new(0);

    struct Scratch;

    impl Fixture for Scratch {
        const SCOPE: Scope = Scope::Invocation;
        fn setup(_: &Params) -> Result<Self, FixtureError> {
            SCRATCH_SETUPS.fetch_add(1, Ordering::SeqCst);
            CLOCK_INVOCATION.advance(1_000_000);
            Ok(Scratch)
        }
        fn teardown(&mut self) {
            SCRATCH_TEARDOWNS.fetch_add(1, Ordering::SeqCst);
            CLOCK_INVOCATION.advance(1_000_000);
        }
    }

    fn uses_scratch(inv: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
        inv.fixture::<Scratch>()?;
        CLOCK_INVOCATION.advance(100);
        Ok(())
    }

    #[test]
    fn test_invocation_fixtures_stay_outside_timer() {
        const FIXTURES: &[FixtureDef] = &[FixtureDef::of::<Scratch>()];
        let def = bench(FIXTURES, uses_scratch);
        let run = Scheduler::new(fixed(0, 1, 10, 1), &CLOCK_INVOCATION)
            .run(&def, &Params::new())
            .unwrap();

        assert_eq!(run.samples[0].elapsed_nanos, 10 * 100);
        assert_eq!(run.samples[0].operations, 10);
        assert_eq!(SCRATCH_SETUPS.load(Ordering::SeqCst), 10);
        assert_eq!(SCRATCH_TEARDOWNS.load(Ordering::SeqCst), 10);
    }

    static MT_TEARDOWNS: AtomicUsize = AtomicUsize::new(0);
    static MT_CALLS: AtomicU64 = AtomicU64::new(0);

    struct Counter;

    impl Fixture for Counter {
        const SCOPE: Scope = Scope::Thread;
        fn setup(_: &Params) -> Result<Self, FixtureError> {
            Ok(Counter)
        }
        fn teardown(&mut self) {
            MT_TEARDOWNS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fails_on_thread_one(inv: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
        inv.fixture::<Counter>()?;
        MT_CALLS.fetch_add(1, Ordering::SeqCst);
        if inv.thread_index() == 1 {
            return Err(InvocationError::new("thread one gave up"));
        }
        Ok(())
    }

    #[test]
    fn test_multithreaded_failure_releases_all_threads() {
        const FIXTURES: &[FixtureDef] = &[FixtureDef::of::<Counter>()];
        let clock = MonotonicClock::new();
        let def = bench(FIXTURES, fails_on_thread_one);
        let result = Scheduler::new(fixed(0, 3, 4, 3), &clock).run(&def, &Params::new());

        match result {
            Err(ForkFailure::Measurement {
                phase,
                iteration,
                thread,
                ..
            }) => {
                assert_eq!(phase, Phase::Measuring);
                assert_eq!(iteration, 0);
                assert_eq!(thread, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Every thread tore down its fixture and nobody ran a second iteration
        assert_eq!(MT_TEARDOWNS.load(Ordering::SeqCst), 3);
        assert!(MT_CALLS.load(Ordering::SeqCst) <= 3 * 4);
    }

    #[test]
    fn test_run_fork_uses_wire_config() {
        fn reads_param(inv: &Invocation<'_>, bh: &mut Blackhole) -> Result<(), InvocationError> {
            let size: usize = inv
                .params()
                .parse_or("scheduler.test.size", 0)
                .map_err(InvocationError::new)?;
            bh.consume(size);
            if size != 16 {
                return Err(InvocationError::new(format!("size was {size}")));
            }
            Ok(())
        }

        let def = bench(&[], reads_param);
        let config = ForkConfig {
            warmup_iterations: 1,
            measurement_iterations: 3,
            batch_size: Some(8),
            params: vec![forkbench_ipc::ParamValue::new("scheduler.test.size", "16")],
            ..ForkConfig::default()
        };
        let run = run_fork(&def, &config).unwrap();
        assert_eq!(run.samples.len(), 3);
        assert_eq!(run.operations(), 24);
        assert_eq!(run.warmup_iterations, 1);
    }

    static SEEN_TOKENS: AtomicU64 = AtomicU64::new(u64::MAX);
    static SEEN_CONSUMED: AtomicU64 = AtomicU64::new(0);

    fn records_blackhole(_: &Invocation<'_>, bh: &mut Blackhole) -> Result<(), InvocationError> {
        bh.consume(7u32);
        SEEN_TOKENS.store(bh.tokens(), Ordering::SeqCst);
        SEEN_CONSUMED.fetch_max(bh.consumed(), Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn test_blackhole_cost_reaches_benchmark_threads() {
        let def = bench(&[], records_blackhole);
        let config = ForkConfig {
            warmup_iterations: 1,
            measurement_iterations: 2,
            batch_size: Some(5),
            blackhole_tokens: 64,
            ..ForkConfig::default()
        };
        let run = run_fork(&def, &config).unwrap();
        assert_eq!(run.operations(), 10);
        assert_eq!(SEEN_TOKENS.load(Ordering::SeqCst), 64);
        // One blackhole per thread lives across warm-up and measurement
        assert_eq!(SEEN_CONSUMED.load(Ordering::SeqCst), 15);
    }
}
