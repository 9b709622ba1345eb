#![warn(missing_docs)]
//! forkbench CLI Library
//!
//! Command-line runner for benchmark binaries. Call `forkbench::run()` from
//! `main`: the same binary is both the supervisor, which selects benchmarks
//! and spawns one worker process per fork, and the worker, re-executed with
//! `--forkbench-worker`.
//!
//! # Example
//!
//! ```ignore
//! use forkbench::prelude::*;
//!
//! #[forkbench::bench(mode = "thrpt", unit = "s")]
//! fn pass_int() -> u64 {
//!     black_box(42)
//! }
//!
//! fn main() {
//!     if let Err(e) = forkbench::run() {
//!         eprintln!("Error: {e:#}");
//!         std::process::exit(1);
//!     }
//! }
//! ```

mod config;
mod executor;
mod planner;
mod profilers;
mod supervisor;

pub use config::*;
pub use executor::{
    BenchSettings, DEFAULT_FORKS, ExecutionConfig, ForkOutcome, ForkResult, Orchestrator,
    RunOptions, build_entry, build_report, format_human_output,
};
pub use planner::{
    ExecutionPlan, ForkTask, ParamOverride, PlannedBenchmark, build_plan, expand_combinations,
    select_benchmarks,
};
pub use profilers::{Profiler, resolve_profilers};
pub use supervisor::*;

use clap::Parser;
use clap::error::ErrorKind;
use forkbench_core::{BenchmarkDef, Mode, TimeUnit, WorkerMain, benchmarks};
use forkbench_report::{OutputFormat, generate_csv_report, generate_json_report};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Run-level errors; each one ends the run with exit code 1
#[derive(Debug, Error)]
pub enum RunError {
    /// The pattern selected no benchmark; nothing was run
    #[error("no benchmark matches pattern '{pattern}'")]
    NoMatch {
        /// The selection pattern
        pattern: String,
    },

    /// Malformed run parameters, rejected before any fork starts
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unknown profiler, or one that cannot work in this binary
    #[error("profiler error: {0}")]
    Profiler(String),

    /// The command line could not be parsed
    #[error("Error parsing command line:\n{0}")]
    Usage(String),

    /// `--fail-on-error` and at least one fork failed
    #[error("{failed} of {total} forks failed")]
    ForkFailures {
        /// Failed forks
        failed: usize,
        /// All forks in the report
        total: usize,
    },
}

/// forkbench CLI arguments
#[derive(Parser, Debug)]
#[command(name = "forkbench")]
#[command(version, about = "forkbench - fork-isolated micro-benchmark harness")]
pub struct Cli {
    /// Regex selecting benchmarks by id
    #[arg(default_value = ".*")]
    pub pattern: String,

    /// Warm-up iterations per fork
    #[arg(short = 'w', long)]
    pub warmup_iterations: Option<u32>,

    /// Measured iterations per fork
    #[arg(short = 'i', long)]
    pub iterations: Option<u32>,

    /// Forks per parameter combination (0 runs in-process, without isolation)
    #[arg(short = 'f', long)]
    pub forks: Option<u32>,

    /// Worker threads per fork; a comma list adds a thread-count axis
    #[arg(short = 't', long, value_delimiter = ',')]
    pub threads: Option<Vec<u32>>,

    /// Fixed invocations per iteration (disables calibration)
    #[arg(short = 'b', long)]
    pub batch_size: Option<u64>,

    /// CPU tokens the blackhole burns per consumed value
    #[arg(long)]
    pub blackhole_tokens: Option<u64>,

    /// Calibration target for a single iteration, e.g. 20ms
    #[arg(long)]
    pub min_iteration_time: Option<String>,

    /// Benchmark mode for every benchmark: avgt or thrpt
    #[arg(long)]
    pub mode: Option<Mode>,

    /// Output time unit for every benchmark: ns, us, ms, s, m
    #[arg(long)]
    pub time_unit: Option<TimeUnit>,

    /// Override a parameter axis, e.g. -p block.size=65536,262144
    #[arg(short = 'p', long = "param", value_name = "NAME=V1,V2")]
    pub params: Vec<ParamOverride>,

    /// Property passed through to fixture setup
    #[arg(short = 'D', value_name = "KEY=VALUE", value_parser = parse_property)]
    pub properties: Vec<(String, String)>,

    /// Enable a profiler (see --list-profilers)
    #[arg(long = "prof", value_name = "NAME")]
    pub profilers: Vec<String>,

    /// Output format: human, json, csv
    #[arg(long)]
    pub format: Option<String>,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Fork processes run in parallel
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Time allowed for one worker process, e.g. 10m
    #[arg(long)]
    pub worker_timeout: Option<String>,

    /// Wall-clock budget for the whole run; remaining forks are skipped
    #[arg(long)]
    pub run_budget: Option<String>,

    /// Exit with code 1 when any fork failed
    #[arg(long)]
    pub fail_on_error: bool,

    /// List matching benchmarks and exit
    #[arg(short = 'l', long)]
    pub list: bool,

    /// List matching benchmarks with their parameters and fixtures
    #[arg(long)]
    pub list_with_params: bool,

    /// List available profilers
    #[arg(long)]
    pub list_profilers: bool,

    /// List available result formats
    #[arg(long)]
    pub list_result_formats: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Internal: Run as worker process (used by supervisor)
    #[arg(long, hide = true)]
    pub forkbench_worker: bool,

    /// Internal: Absorb cargo bench's --bench flag
    #[arg(long, hide = true)]
    pub bench: bool,
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE but got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing property name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Run the forkbench CLI with the process arguments.
///
/// Help and version requests print and return `Ok`; every other failure is
/// returned as an error, which the binary turns into exit code 1.
pub fn run() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                e.print()?;
                return Ok(());
            }
            _ => return Err(RunError::Usage(e.to_string()).into()),
        },
    };
    run_with_cli(cli)
}

/// Run the forkbench CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    // Worker mode first: the supervisor is waiting for the handshake
    if cli.forkbench_worker {
        init_logging(false);
        return run_worker_mode();
    }

    init_logging(cli.verbose);

    if cli.list_profilers {
        println!("Available profilers:");
        for profiler in Profiler::ALL {
            println!("{:>10}: {}", profiler.name(), profiler.description());
        }
        return Ok(());
    }

    if cli.list_result_formats {
        println!("Available formats: {}", OutputFormat::ALL.map(OutputFormat::name).join(", "));
        return Ok(());
    }

    let filter = Regex::new(&cli.pattern).map_err(|e| {
        RunError::Configuration(format!("invalid pattern '{}': {}", cli.pattern, e))
    })?;

    if cli.list || cli.list_with_params {
        print!("{}", format_benchmark_list(&filter, cli.list_with_params));
        return Ok(());
    }

    let config = ForkbenchConfig::discover()
        .map_err(|e| RunError::Configuration(format!("{e:#}")))?
        .unwrap_or_default();

    run_benchmarks(&cli, &config, &filter)
}

/// `RUST_LOG` wins; otherwise debug for forkbench crates with `-v`, warnings only without.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,forkbench=debug,forkbench_core=debug,forkbench_cli=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Reports go to stdout; logs must not interleave with them
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run as a worker process (IPC mode)
fn run_worker_mode() -> anyhow::Result<()> {
    let mut worker = WorkerMain::new();
    worker
        .run()
        .map_err(|e| anyhow::anyhow!("Worker error: {}", e))
}

/// Benchmark listing for `--list` and `--list-with-params`
pub fn format_benchmark_list(filter: &Regex, with_params: bool) -> String {
    let selected = select_benchmarks(benchmarks(), filter);
    let mut output = String::from("Benchmarks:\n");
    for bench in selected {
        output.push_str(bench.id);
        output.push('\n');
        if with_params {
            output.push_str(&describe_benchmark(bench));
        }
    }
    output
}

fn describe_benchmark(bench: &BenchmarkDef) -> String {
    let mut out = format!(
        "  mode: {}, unit: {}, group: {} ({}:{})\n",
        bench.mode, bench.time_unit, bench.group, bench.file, bench.line
    );
    for param in bench.params {
        out.push_str(&format!(
            "  param \"{}\" = {{{}}}\n",
            param.name,
            param.values.join(", ")
        ));
    }
    for fixture in bench.fixtures {
        out.push_str(&format!("  fixture {} ({})\n", fixture.short_name(), fixture.scope));
    }
    out
}

/// Build an ExecutionConfig: forkbench.toml layer, CLI layer, run-wide settings.
fn build_execution_config(
    cli: &Cli,
    config: &ForkbenchConfig,
    profilers: &[Profiler],
) -> Result<ExecutionConfig, RunError> {
    let duration = |cli_value: &Option<String>, file_value: &Option<String>, what: &str| {
        cli_value
            .as_ref()
            .or(file_value.as_ref())
            .map(|raw| {
                ForkbenchConfig::parse_duration(raw)
                    .map(Duration::from_nanos)
                    .map_err(|e| RunError::Configuration(format!("{what}: {e}")))
            })
            .transpose()
    };

    let runner = &config.runner;
    let time_unit = config
        .output
        .time_unit
        .as_deref()
        .map(str::parse::<TimeUnit>)
        .transpose()
        .map_err(|e| RunError::Configuration(format!("output.time_unit: {e}")))?;

    let defaults = RunOptions {
        warmup_iterations: runner.warmup_iterations,
        measurement_iterations: runner.iterations,
        forks: runner.forks,
        threads: runner.threads.map(|t| vec![t]),
        batch_size: runner.batch_size,
        blackhole_tokens: runner.blackhole_tokens,
        mode: None,
        time_unit,
    };
    let overrides = RunOptions {
        warmup_iterations: cli.warmup_iterations,
        measurement_iterations: cli.iterations,
        forks: cli.forks,
        threads: cli.threads.clone(),
        batch_size: cli.batch_size,
        blackhole_tokens: cli.blackhole_tokens,
        mode: cli.mode,
        time_unit: cli.time_unit,
    };

    let jobs = cli.jobs.or(runner.jobs).unwrap_or(1);
    if jobs == 0 {
        return Err(RunError::Configuration("jobs must be at least 1".to_string()));
    }

    // CLI properties override file properties with the same key
    let mut properties: BTreeMap<String, String> = config.properties.clone();
    properties.extend(cli.properties.iter().cloned());

    let defaults_config = ExecutionConfig::default();
    Ok(ExecutionConfig {
        overrides,
        defaults,
        min_iteration_time_ns: duration(
            &cli.min_iteration_time,
            &runner.min_iteration_time,
            "min_iteration_time",
        )?
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(defaults_config.min_iteration_time_ns),
        params: cli.params.clone(),
        properties: properties.into_iter().collect(),
        track_allocations: profilers.contains(&Profiler::Alloc),
        worker_timeout: duration(&cli.worker_timeout, &runner.timeout, "worker_timeout")?
            .unwrap_or(defaults_config.worker_timeout),
        run_budget: duration(&cli.run_budget, &runner.run_budget, "run_budget")?,
        jobs,
    })
}

fn run_benchmarks(cli: &Cli, config: &ForkbenchConfig, filter: &Regex) -> anyhow::Result<()> {
    let profilers = resolve_profilers(&cli.profilers)?;
    let format: OutputFormat = cli
        .format
        .as_deref()
        .or(config.output.format.as_deref())
        .unwrap_or("human")
        .parse()
        .map_err(RunError::Configuration)?;
    let exec_config = build_execution_config(cli, config, &profilers)?;
    let fail_on_error = cli.fail_on_error || config.runner.fail_on_error.unwrap_or(false);

    let plan = build_plan(benchmarks(), filter, &exec_config)?;
    let fork_count = plan.tasks().len();
    eprintln!(
        "# Running {} benchmark(s), {} fork(s), {} job(s)",
        plan.benchmarks.len(),
        fork_count,
        exec_config.jobs
    );

    let process_runner = ProcessRunner::current_exe(exec_config.worker_timeout)?;
    let in_process = InProcessRunner;
    let orchestrator = Orchestrator::new(exec_config.clone(), &process_runner, &in_process);

    let start_time = Instant::now();
    let results = orchestrator.execute(&plan)?;
    let total_duration_ms = start_time.elapsed().as_secs_f64() * 1000.0;

    let profiler_names: Vec<String> = profilers.iter().map(|p| p.name().to_string()).collect();
    let report = build_report(&results, &exec_config, &profiler_names, total_duration_ms);

    let output = match format {
        OutputFormat::Json => generate_json_report(&report)?,
        OutputFormat::Csv => generate_csv_report(&report),
        OutputFormat::Human => format_human_output(&report),
    };

    if let Some(ref path) = cli.output {
        let mut file = std::fs::File::create(path)?;
        file.write_all(output.as_bytes())?;
        eprintln!("Report written to: {}", path.display());
    } else {
        print!("{}", output);
        std::io::stdout().flush()?;
    }

    if fail_on_error && report.summary.failed > 0 {
        return Err(RunError::ForkFailures {
            failed: report.summary.failed,
            total: report.summary.total,
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("forkbench").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_flags() {
        let cli = parse(&[
            "^codec", "-w", "2", "-i", "3", "-f", "0", "-t", "1,4", "-p", "block.size=64,128",
            "-D", "byte.size=4096", "--time-unit", "us", "--mode", "thrpt", "--prof", "alloc",
        ]);
        assert_eq!(cli.pattern, "^codec");
        assert_eq!(cli.warmup_iterations, Some(2));
        assert_eq!(cli.iterations, Some(3));
        assert_eq!(cli.forks, Some(0));
        assert_eq!(cli.threads, Some(vec![1, 4]));
        assert_eq!(cli.params[0].values, vec!["64", "128"]);
        assert_eq!(cli.properties, vec![("byte.size".to_string(), "4096".to_string())]);
        assert_eq!(cli.time_unit, Some(TimeUnit::Microseconds));
        assert_eq!(cli.mode, Some(Mode::Throughput));
        assert_eq!(cli.profilers, vec!["alloc"]);
    }

    #[test]
    fn test_malformed_flags_are_rejected() {
        assert!(Cli::try_parse_from(["forkbench", "-i", "many"]).is_err());
        assert!(Cli::try_parse_from(["forkbench", "--time-unit", "fortnight"]).is_err());
        assert!(Cli::try_parse_from(["forkbench", "-D", "novalue"]).is_err());
        assert!(Cli::try_parse_from(["forkbench", "-p", "block.size"]).is_err());
    }

    #[test]
    fn test_cli_properties_override_file_properties() {
        let cli = parse(&["-D", "byte.size=1", "-D", "extra=yes"]);
        let mut config = ForkbenchConfig::default();
        config.properties.insert("byte.size".to_string(), "999".to_string());
        config.properties.insert("block.size".to_string(), "64".to_string());

        let exec = build_execution_config(&cli, &config, &[]).unwrap();
        assert_eq!(
            exec.properties,
            vec![
                ("block.size".to_string(), "64".to_string()),
                ("byte.size".to_string(), "1".to_string()),
                ("extra".to_string(), "yes".to_string()),
            ]
        );
    }

    #[test]
    fn test_durations_layer_cli_over_file() {
        let cli = parse(&["--min-iteration-time", "5ms"]);
        let mut config = ForkbenchConfig::default();
        config.runner.min_iteration_time = Some("50ms".to_string());
        config.runner.run_budget = Some("2m".to_string());

        let exec = build_execution_config(&cli, &config, &[]).unwrap();
        assert_eq!(exec.min_iteration_time_ns, 5_000_000);
        assert_eq!(exec.run_budget, Some(Duration::from_secs(120)));
        assert_eq!(exec.worker_timeout, DEFAULT_WORKER_TIMEOUT);
    }

    #[test]
    fn test_bad_file_values_are_configuration_errors() {
        let cli = parse(&[]);
        let mut config = ForkbenchConfig::default();
        config.output.time_unit = Some("fortnight".to_string());
        assert!(matches!(
            build_execution_config(&cli, &config, &[]),
            Err(RunError::Configuration(_))
        ));

        let mut config = ForkbenchConfig::default();
        config.runner.timeout = Some("soon".to_string());
        assert!(matches!(
            build_execution_config(&cli, &config, &[]),
            Err(RunError::Configuration(_))
        ));
    }

    #[test]
    fn test_blackhole_tokens_layer_cli_over_file() {
        let mut config = ForkbenchConfig::default();
        config.runner.blackhole_tokens = Some(8);

        let exec = build_execution_config(&parse(&[]), &config, &[]).unwrap();
        assert_eq!(exec.defaults.blackhole_tokens, Some(8));
        assert_eq!(exec.overrides.blackhole_tokens, None);

        let exec = build_execution_config(&parse(&["--blackhole-tokens", "128"]), &config, &[])
            .unwrap();
        assert_eq!(exec.overrides.blackhole_tokens, Some(128));
    }

    #[test]
    fn test_alloc_profiler_turns_on_tracking() {
        let exec = build_execution_config(&parse(&[]), &ForkbenchConfig::default(), &[Profiler::Alloc])
            .unwrap();
        assert!(exec.track_allocations);
    }

    #[test]
    fn test_no_match_ends_the_run_before_any_fork() {
        let cli = parse(&["^no_such_benchmark$"]);
        let config = ForkbenchConfig::default();
        let filter = Regex::new(&cli.pattern).unwrap();
        let err = run_benchmarks(&cli, &config, &filter).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::NoMatch { .. })
        ));
    }
}
