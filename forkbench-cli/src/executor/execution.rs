//! Benchmark Execution
//!
//! Resolves per-benchmark settings and drives the fork tasks of a plan
//! through a [`ForkRunner`]: a fresh worker process per fork, or the
//! in-process runner when a benchmark runs with `forks = 0`.
//!
//! ## Data Flow
//!
//! ```text
//! ExecutionPlan (planner)
//!        │
//!        ▼
//!   ForkTask × N ──► ForkConfig (wire)
//!        │
//!        ▼
//! ┌──────────────────┐
//! │   ForkRunner     │  ProcessRunner / InProcessRunner
//! └────────┬─────────┘
//!          │
//!          ▼
//!  ForkResult (samples, failure, or skipped)
//! ```

use crate::RunError;
use crate::planner::{ExecutionPlan, ForkTask, ParamOverride};
use crate::supervisor::{DEFAULT_WORKER_TIMEOUT, ForkError, ForkRunner};
use forkbench_core::{
    BenchmarkDef, Combination, DEFAULT_MIN_ITERATION_TIME_NS, ForkRun, Mode, ScheduleConfig,
    TimeUnit,
};
use forkbench_ipc::{ForkConfig, ParamValue};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Forks per combination when nothing else decides
pub const DEFAULT_FORKS: u32 = 1;

/// One configuration layer; `None` defers to the next layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Warm-up iterations per fork
    pub warmup_iterations: Option<u32>,
    /// Measured iterations per fork
    pub measurement_iterations: Option<u32>,
    /// Forks per combination
    pub forks: Option<u32>,
    /// Thread-count axis
    pub threads: Option<Vec<u32>>,
    /// Fixed invocations per iteration
    pub batch_size: Option<u64>,
    /// CPU tokens the blackhole burns per consumed value
    pub blackhole_tokens: Option<u64>,
    /// Benchmark mode
    pub mode: Option<Mode>,
    /// Output time unit
    pub time_unit: Option<TimeUnit>,
}

/// Run-wide execution configuration
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Command-line layer, above the benchmark attribute
    pub overrides: RunOptions,
    /// forkbench.toml layer, below the benchmark attribute
    pub defaults: RunOptions,
    /// Calibration target for one iteration
    pub min_iteration_time_ns: u64,
    /// `-p` axis overrides
    pub params: Vec<ParamOverride>,
    /// `-D` and `[properties]` passthrough
    pub properties: Vec<(String, String)>,
    /// Record allocation counters (the `alloc` profiler)
    pub track_allocations: bool,
    /// Time allowed for one worker process
    pub worker_timeout: Duration,
    /// Wall-clock budget for the whole run
    pub run_budget: Option<Duration>,
    /// Fork processes run in parallel
    pub jobs: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            overrides: RunOptions::default(),
            defaults: RunOptions::default(),
            min_iteration_time_ns: DEFAULT_MIN_ITERATION_TIME_NS,
            params: Vec::new(),
            properties: Vec::new(),
            track_allocations: false,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
            run_budget: None,
            jobs: 1,
        }
    }
}

/// Settings of one benchmark after layering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchSettings {
    /// Warm-up iterations per fork
    pub warmup_iterations: u32,
    /// Measured iterations per fork
    pub measurement_iterations: u32,
    /// Forks per combination; 0 runs once in-process
    pub forks: u32,
    /// Thread-count axis
    pub threads: Vec<u32>,
    /// Fixed invocations per iteration; `None` calibrates
    pub batch_size: Option<u64>,
    /// CPU tokens the blackhole burns per consumed value
    pub blackhole_tokens: u64,
    /// Benchmark mode
    pub mode: Mode,
    /// Output time unit
    pub time_unit: TimeUnit,
}

impl ExecutionConfig {
    /// Layer the settings for `bench`: command line, then the benchmark
    /// attribute, then forkbench.toml, then built-in defaults.
    ///
    /// Mode and unit are output choices: the command line and the
    /// `[output]` table both override the attribute.
    pub fn resolve_for_benchmark(&self, bench: &BenchmarkDef) -> Result<BenchSettings, RunError> {
        let base = ScheduleConfig::default();
        let (o, d) = (&self.overrides, &self.defaults);

        let settings = BenchSettings {
            warmup_iterations: o
                .warmup_iterations
                .or(bench.warmup_iterations)
                .or(d.warmup_iterations)
                .unwrap_or(base.warmup_iterations),
            measurement_iterations: o
                .measurement_iterations
                .or(bench.measurement_iterations)
                .or(d.measurement_iterations)
                .unwrap_or(base.measurement_iterations),
            forks: o.forks.or(bench.forks).or(d.forks).unwrap_or(DEFAULT_FORKS),
            threads: o
                .threads
                .clone()
                .or_else(|| bench.threads.map(|t| vec![t]))
                .or_else(|| d.threads.clone())
                .unwrap_or_else(|| vec![base.threads]),
            batch_size: o.batch_size.or(bench.batch_size).or(d.batch_size),
            blackhole_tokens: o
                .blackhole_tokens
                .or(bench.blackhole_tokens)
                .or(d.blackhole_tokens)
                .unwrap_or(base.blackhole_tokens),
            mode: o.mode.or(d.mode).unwrap_or(bench.mode),
            time_unit: o.time_unit.or(d.time_unit).unwrap_or(bench.time_unit),
        };

        if settings.threads.is_empty() {
            return Err(RunError::Configuration(format!(
                "{}: thread list is empty",
                bench.id
            )));
        }
        for &threads in &settings.threads {
            let schedule = ScheduleConfig {
                warmup_iterations: settings.warmup_iterations,
                measurement_iterations: settings.measurement_iterations,
                batch_size: settings.batch_size,
                min_iteration_time_ns: self.min_iteration_time_ns,
                threads,
                track_allocations: self.track_allocations,
                blackhole_tokens: settings.blackhole_tokens,
            };
            schedule
                .validate()
                .map_err(|e| RunError::Configuration(format!("{}: {}", bench.id, e)))?;
        }

        Ok(settings)
    }

    /// Wire configuration for one fork of `combination`
    pub fn fork_config(&self, settings: &BenchSettings, combination: &Combination) -> ForkConfig {
        ForkConfig {
            warmup_iterations: settings.warmup_iterations,
            measurement_iterations: settings.measurement_iterations,
            batch_size: settings.batch_size,
            min_iteration_time_ns: self.min_iteration_time_ns,
            threads: combination.threads,
            params: combination.to_param_values(),
            properties: self
                .properties
                .iter()
                .map(|(k, v)| ParamValue::new(k, v))
                .collect(),
            track_allocations: self.track_allocations,
            blackhole_tokens: settings.blackhole_tokens,
        }
    }
}

/// What happened to one fork task
#[derive(Debug)]
pub enum ForkOutcome {
    /// Every measured iteration succeeded
    Completed(ForkRun),
    /// The fork failed; no result
    Failed(ForkError),
    /// Not started; the reason
    Skipped(String),
}

/// Result from executing a single fork task
#[derive(Debug)]
pub struct ForkResult {
    /// The task
    pub task: ForkTask,
    /// Its outcome
    pub outcome: ForkOutcome,
    /// Wall time spent on the task
    pub duration: Duration,
}

/// Runs every task of a plan, containing failures per fork
pub struct Orchestrator<'r> {
    config: ExecutionConfig,
    isolated: &'r dyn ForkRunner,
    in_process: &'r dyn ForkRunner,
    show_progress: bool,
}

impl<'r> Orchestrator<'r> {
    /// Create an orchestrator; `isolated` serves forks ≥ 1, `in_process` serves `forks = 0`
    pub fn new(
        config: ExecutionConfig,
        isolated: &'r dyn ForkRunner,
        in_process: &'r dyn ForkRunner,
    ) -> Self {
        Self {
            config,
            isolated,
            in_process,
            show_progress: true,
        }
    }

    /// Enable or disable the progress bar
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Execute all tasks of `plan`, returning one result per task in plan order
    pub fn execute(&self, plan: &ExecutionPlan) -> Result<Vec<ForkResult>, RunError> {
        let tasks = plan.tasks();
        let started = Instant::now();

        let pb = if self.show_progress {
            ProgressBar::new(tasks.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        if tasks.iter().any(|t| !t.isolated()) {
            tracing::warn!("forks = 0: running without process isolation");
        }

        let jobs = self.config.jobs.max(1);
        // In-process runs share this process and are never parallelized
        let (parallel, serial): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .enumerate()
            .partition(|(_, task)| jobs > 1 && task.isolated());

        let mut results: Vec<(usize, ForkResult)> = Vec::with_capacity(parallel.len() + serial.len());

        if !parallel.is_empty() {
            let pool = ThreadPoolBuilder::new()
                .num_threads(jobs.min(parallel.len()))
                .build()
                .map_err(|e| RunError::Configuration(format!("failed to build job pool: {e}")))?;
            let done: Vec<(usize, ForkResult)> = pool.install(|| {
                parallel
                    .into_par_iter()
                    .map(|(index, task)| {
                        let result = self.execute_single(task, started);
                        pb.inc(1);
                        (index, result)
                    })
                    .collect()
            });
            results.extend(done);
        }

        for (index, task) in serial {
            pb.set_message(task.describe());
            let result = self.execute_single(task, started);
            pb.inc(1);
            results.push((index, result));
        }

        pb.finish_and_clear();
        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    /// Execute a single fork task
    fn execute_single(&self, task: ForkTask, run_started: Instant) -> ForkResult {
        if let Some(budget) = self.config.run_budget {
            if run_started.elapsed() >= budget {
                tracing::info!(task = %task.describe(), "run budget exhausted, skipping");
                return ForkResult {
                    task,
                    outcome: ForkOutcome::Skipped(format!("run budget of {budget:?} exhausted")),
                    duration: Duration::ZERO,
                };
            }
        }

        let start = Instant::now();
        let fork_config = self.config.fork_config(&task.settings, &task.combination);
        let runner = if task.isolated() {
            self.isolated
        } else {
            self.in_process
        };

        tracing::debug!(task = %task.describe(), "starting fork");
        let outcome = match runner.run(&task, &fork_config) {
            Ok(run) => {
                tracing::debug!(
                    task = %task.describe(),
                    samples = run.samples.len(),
                    batch_size = run.batch_size,
                    "fork complete"
                );
                ForkOutcome::Completed(run)
            }
            Err(e) => {
                tracing::warn!(task = %task.describe(), error = %e, "fork failed");
                ForkOutcome::Failed(e)
            }
        };

        ForkResult {
            task,
            outcome,
            duration: start.elapsed(),
        }
    }
}
