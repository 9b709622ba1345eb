//! Report Building
//!
//! One [`ReportEntry`] per fork task. A completed fork is aggregated here,
//! in the supervisor, from the samples its worker streamed back.

use super::execution::{ExecutionConfig, ForkOutcome, ForkResult};
use super::metadata::build_report_meta;
use forkbench_report::{AllocationMetrics, ParamEntry, Report, ReportConfig, ReportEntry};

/// Report line for one fork task
pub fn build_entry(result: &ForkResult, track_allocations: bool) -> ReportEntry {
    let task = &result.task;
    let settings = &task.settings;
    let entry = ReportEntry::new(
        task.bench.id,
        task.bench.group,
        settings.mode,
        settings.time_unit,
        task.combination.threads,
        task.combination
            .params
            .iter()
            .map(|(name, value)| ParamEntry {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        task.fork,
    );

    match &result.outcome {
        ForkOutcome::Completed(run) => {
            match run.aggregator().finalize(settings.mode, settings.time_unit) {
                Ok(aggregate) => {
                    let entry = entry.succeeded(&aggregate, run.batch_size);
                    if track_allocations {
                        let (bytes_per_op, allocs_per_op) = run.allocations_per_op();
                        entry.with_alloc(AllocationMetrics {
                            bytes_per_op,
                            allocs_per_op,
                        })
                    } else {
                        entry
                    }
                }
                Err(e) => entry.failed(
                    "aggregate",
                    Some("measurement".to_string()),
                    format!("{}: {}", task.describe(), e),
                ),
            }
        }
        ForkOutcome::Failed(e) => entry.failed(e.kind(), e.phase(), format!("{}: {}", task.describe(), e)),
        ForkOutcome::Skipped(reason) => entry.skipped(reason.clone()),
    }
}

/// Build a complete Report from fork results
pub fn build_report(
    results: &[ForkResult],
    config: &ExecutionConfig,
    profilers: &[String],
    total_duration_ms: f64,
) -> Report {
    let entries = results
        .iter()
        .map(|r| build_entry(r, config.track_allocations))
        .collect();

    let (o, d) = (&config.overrides, &config.defaults);
    let report_config = ReportConfig {
        warmup_iterations: o.warmup_iterations.or(d.warmup_iterations).unwrap_or(5),
        measurement_iterations: o
            .measurement_iterations
            .or(d.measurement_iterations)
            .unwrap_or(5),
        forks: o.forks.or(d.forks).unwrap_or(super::execution::DEFAULT_FORKS),
        batch_size: o.batch_size.or(d.batch_size),
        min_iteration_time_ns: config.min_iteration_time_ns,
        profilers: profilers.to_vec(),
    };

    Report::new(build_report_meta(report_config), entries, total_duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ForkTask;
    use crate::supervisor::{ForkError, SupervisorError};
    use crate::executor::BenchSettings;
    use forkbench_core::{
        BenchmarkDef, Blackhole, Combination, ForkRun, Invocation, InvocationError, Mode, TimeUnit,
    };
    use forkbench_ipc::IterationSample;
    use forkbench_report::EntryStatus;
    use std::time::Duration;

    fn noop(_: &Invocation<'_>, _: &mut Blackhole) -> Result<(), InvocationError> {
        Ok(())
    }

    static BENCH: BenchmarkDef = BenchmarkDef {
        id: "codec::compress",
        name: "compress",
        group: "codec",
        mode: Mode::AverageTime,
        time_unit: TimeUnit::Milliseconds,
        fixtures: &[],
        params: &[],
        warmup_iterations: None,
        measurement_iterations: None,
        forks: None,
        threads: None,
        batch_size: None,
        blackhole_tokens: None,
        runner_fn: noop,
        file: "",
        line: 0,
        module_path: "",
    };

    fn result(outcome: ForkOutcome, mode: Mode) -> ForkResult {
        ForkResult {
            task: ForkTask {
                bench: &BENCH,
                settings: BenchSettings {
                    warmup_iterations: 5,
                    measurement_iterations: 5,
                    forks: 1,
                    threads: vec![1],
                    batch_size: Some(1000),
                    blackhole_tokens: 0,
                    mode,
                    time_unit: if mode == Mode::AverageTime {
                        TimeUnit::Milliseconds
                    } else {
                        TimeUnit::Seconds
                    },
                },
                combination: Combination::new(vec![("block.size".into(), "65536".into())], 1),
                fork: 1,
            },
            outcome,
            duration: Duration::from_millis(60),
        }
    }

    fn five_by_10ms() -> ForkRun {
        ForkRun {
            samples: (0..5)
                .map(|i| IterationSample::new(i, 0, 10_000_000, 1000).with_allocations(64_000, 1000))
                .collect(),
            warmup_iterations: 5,
            batch_size: 1000,
            calibration_rounds: 0,
        }
    }

    #[test]
    fn test_completed_fork_scores_in_declared_unit() {
        let entry = build_entry(
            &result(ForkOutcome::Completed(five_by_10ms()), Mode::AverageTime),
            false,
        );
        assert_eq!(entry.status, EntryStatus::Success);
        assert!((entry.score.unwrap() - 0.01).abs() < 1e-12);
        assert_eq!(entry.score_unit, "ms/op");
        assert_eq!(entry.cnt, 5);
        assert_eq!(entry.params_label(), "block.size=65536");
        assert!(entry.alloc.is_none());

        let thrpt = build_entry(
            &result(ForkOutcome::Completed(five_by_10ms()), Mode::Throughput),
            true,
        );
        assert!((thrpt.score.unwrap() - 100_000.0).abs() < 1e-6);
        assert_eq!(thrpt.score_unit, "ops/s");
        let alloc = thrpt.alloc.unwrap();
        assert_eq!(alloc.bytes_per_op, 64.0);
        assert_eq!(alloc.allocs_per_op, 1.0);
    }

    #[test]
    fn test_failed_fork_has_no_score_and_names_the_fork() {
        let entry = build_entry(
            &result(
                ForkOutcome::Failed(ForkError::Supervisor(SupervisorError::Timeout(
                    Duration::from_secs(600),
                ))),
                Mode::AverageTime,
            ),
            false,
        );
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(entry.score.is_none());
        let error = entry.error.unwrap();
        assert_eq!(error.kind, "timeout");
        assert!(error.message.contains("codec::compress"));
        assert!(error.message.contains("block.size=65536"));
        assert!(error.message.contains("fork 1"));
    }

    #[test]
    fn test_empty_run_is_reported_not_scored() {
        let empty = ForkRun {
            samples: Vec::new(),
            warmup_iterations: 0,
            batch_size: 1,
            calibration_rounds: 0,
        };
        let entry = build_entry(&result(ForkOutcome::Completed(empty), Mode::AverageTime), false);
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.error.unwrap().kind, "aggregate");
    }
}
