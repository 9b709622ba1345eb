//! Benchmark Planner
//!
//! Turns the registry into an ordered list of fork tasks:
//! - Regex pattern matching on benchmark ID
//! - Per-benchmark settings (CLI > attribute > forkbench.toml > defaults)
//! - Cartesian expansion of parameter axes and thread counts
//!
//! Ordering: benchmarks alphabetically by ID, then combinations with the
//! first declared axis outermost and the thread count innermost, then forks.

use crate::RunError;
use crate::executor::{BenchSettings, ExecutionConfig};
use forkbench_core::{BenchmarkDef, Combination, ParamDef};
use std::collections::BTreeSet;

/// `-p name=v1,v2`: replaces the declared values of one axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamOverride {
    /// Axis name
    pub name: String,
    /// Replacement values, in order
    pub values: Vec<String>,
}

impl std::str::FromStr for ParamOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, values) = s
            .split_once('=')
            .ok_or_else(|| format!("expected name=v1,v2 but got '{s}'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("missing parameter name in '{s}'"));
        }
        let values: Vec<String> = values
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            return Err(format!("parameter '{name}' needs at least one value"));
        }
        Ok(Self {
            name: name.to_string(),
            values,
        })
    }
}

/// One benchmark with its resolved settings and combinations
#[derive(Debug, Clone)]
pub struct PlannedBenchmark {
    /// Registered definition
    pub bench: &'static BenchmarkDef,
    /// Resolved run settings
    pub settings: BenchSettings,
    /// Parameter × thread combinations, in run order
    pub combinations: Vec<Combination>,
}

/// One fork to run
#[derive(Debug, Clone)]
pub struct ForkTask {
    /// Benchmark to run
    pub bench: &'static BenchmarkDef,
    /// Resolved run settings
    pub settings: BenchSettings,
    /// Coordinates of this fork
    pub combination: Combination,
    /// 1-based fork number; 0 for an in-process run
    pub fork: u32,
}

impl ForkTask {
    /// Whether this task runs in a fresh worker process
    pub fn isolated(&self) -> bool {
        self.fork > 0
    }

    /// `benchmark [params, threads] fork N`, for diagnostics
    pub fn describe(&self) -> String {
        format!("{} [{}] fork {}", self.bench.id, self.combination, self.fork)
    }
}

/// Execution plan for benchmarks
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// Ordered list of benchmarks to run
    pub benchmarks: Vec<PlannedBenchmark>,
}

impl ExecutionPlan {
    /// Flatten into fork tasks in run order
    pub fn tasks(&self) -> Vec<ForkTask> {
        let mut tasks = Vec::new();
        for planned in &self.benchmarks {
            // forks = 0 still measures once, without a worker process
            let forks: Vec<u32> = if planned.settings.forks == 0 {
                vec![0]
            } else {
                (1..=planned.settings.forks).collect()
            };
            for combination in &planned.combinations {
                for &fork in &forks {
                    tasks.push(ForkTask {
                        bench: planned.bench,
                        settings: planned.settings.clone(),
                        combination: combination.clone(),
                        fork,
                    });
                }
            }
        }
        tasks
    }

    /// Whether nothing was selected
    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }
}

/// Benchmarks whose ID matches `filter`, sorted by ID
pub fn select_benchmarks(
    benchmarks: impl IntoIterator<Item = &'static BenchmarkDef>,
    filter: &regex::Regex,
) -> Vec<&'static BenchmarkDef> {
    let mut selected: Vec<_> = benchmarks
        .into_iter()
        .filter(|b| filter.is_match(b.id))
        .collect();

    // Sort alphabetically for deterministic execution order
    selected.sort_by_key(|b| b.id);
    selected
}

/// Cartesian product of the parameter axes and the thread counts.
///
/// An override replaces the values of the axis with the same name; axes
/// without an override keep their declared values.
pub fn expand_combinations(
    params: &[ParamDef],
    overrides: &[ParamOverride],
    threads: &[u32],
) -> Vec<Combination> {
    let axes: Vec<(&str, Vec<String>)> = params
        .iter()
        .map(|axis| {
            let values = match overrides.iter().find(|o| o.name == axis.name) {
                Some(o) => o.values.clone(),
                None => axis.values.iter().map(|v| v.to_string()).collect(),
            };
            (axis.name, values)
        })
        .collect();

    let mut points: Vec<Vec<(String, String)>> = vec![Vec::new()];
    for (name, values) in &axes {
        let mut next = Vec::with_capacity(points.len() * values.len());
        for point in &points {
            for value in values {
                let mut extended = point.clone();
                extended.push((name.to_string(), value.clone()));
                next.push(extended);
            }
        }
        points = next;
    }

    points
        .into_iter()
        .flat_map(|point| {
            threads
                .iter()
                .map(move |&t| Combination::new(point.clone(), t))
        })
        .collect()
}

/// Build the execution plan for every benchmark matching `filter`.
///
/// Fails before anything runs: [`RunError::NoMatch`] when nothing matches,
/// [`RunError::Configuration`] for unusable settings or a `-p` override no
/// selected benchmark declares.
pub fn build_plan(
    benchmarks: impl IntoIterator<Item = &'static BenchmarkDef>,
    filter: &regex::Regex,
    config: &ExecutionConfig,
) -> Result<ExecutionPlan, RunError> {
    let selected = select_benchmarks(benchmarks, filter);
    if selected.is_empty() {
        return Err(RunError::NoMatch {
            pattern: filter.as_str().to_string(),
        });
    }

    let declared: BTreeSet<&str> = selected
        .iter()
        .flat_map(|b| b.params.iter().map(|p| p.name))
        .collect();
    if let Some(unknown) = config
        .params
        .iter()
        .find(|o| !declared.contains(o.name.as_str()))
    {
        return Err(RunError::Configuration(format!(
            "parameter '{}' is not declared by any selected benchmark",
            unknown.name
        )));
    }

    let mut planned = Vec::with_capacity(selected.len());
    for bench in selected {
        let settings = config.resolve_for_benchmark(bench)?;
        let combinations = expand_combinations(bench.params, &config.params, &settings.threads);
        tracing::debug!(
            bench = bench.id,
            combinations = combinations.len(),
            forks = settings.forks,
            "planned benchmark"
        );
        planned.push(PlannedBenchmark {
            bench,
            settings,
            combinations,
        });
    }

    Ok(ExecutionPlan {
        benchmarks: planned,
    })
}
