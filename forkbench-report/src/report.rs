//! Report Data Structures

use chrono::{DateTime, Utc};
use forkbench_stats::{AggregateResult, Mode, TimeUnit};
use serde::{Deserialize, Serialize};

/// Version of the JSON layout below
pub const SCHEMA_VERSION: u32 = 1;

/// Complete run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub meta: ReportMeta,
    pub results: Vec<ReportEntry>,
    pub summary: ReportSummary,
}

impl Report {
    /// Assemble a report, deriving the summary from `results`
    pub fn new(meta: ReportMeta, results: Vec<ReportEntry>, total_duration_ms: f64) -> Self {
        let summary = ReportSummary::from_entries(&results, total_duration_ms);
        Self {
            meta,
            results,
            summary,
        }
    }
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMeta {
    pub schema_version: u32,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub system: SystemInfo,
    pub config: ReportConfig,
}

/// Run configuration captured in report metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    pub warmup_iterations: u32,
    pub measurement_iterations: u32,
    pub forks: u32,
    pub batch_size: Option<u64>,
    pub min_iteration_time_ns: u64,
    pub profilers: Vec<String>,
}

/// System information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub cpu: String,
    pub cpu_cores: u32,
    pub memory_gb: f64,
}

/// One `name=value` coordinate of a combination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub value: String,
}

/// Outcome of one (benchmark, combination, fork)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Produced a score
    Success,
    /// Setup, measurement or worker failure
    Failed,
    /// Not run because the run budget ran out
    Skipped,
}

/// Failure details of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// `setup`, `measurement`, `configuration`, `crashed`, `timeout`, ...
    pub kind: String,
    /// Scheduler phase, when known
    pub phase: Option<String>,
    pub message: String,
}

/// Allocation profile normalized per operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationMetrics {
    pub bytes_per_op: f64,
    pub allocs_per_op: f64,
}

/// One report line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub benchmark: String,
    pub group: String,
    pub mode: Mode,
    pub threads: u32,
    pub params: Vec<ParamEntry>,
    /// 1-based fork number
    pub fork: u32,
    pub status: EntryStatus,
    pub score: Option<f64>,
    pub score_unit: String,
    pub unit: TimeUnit,
    /// Samples aggregated
    pub cnt: usize,
    pub operations: u64,
    pub elapsed_nanos: u64,
    pub batch_size: Option<u64>,
    /// Per-sample scores, informational
    pub raw_scores: Vec<f64>,
    pub alloc: Option<AllocationMetrics>,
    pub error: Option<FailureInfo>,
}

impl ReportEntry {
    /// Entry without outcome yet
    pub fn new(
        benchmark: impl Into<String>,
        group: impl Into<String>,
        mode: Mode,
        unit: TimeUnit,
        threads: u32,
        params: Vec<ParamEntry>,
        fork: u32,
    ) -> Self {
        Self {
            benchmark: benchmark.into(),
            group: group.into(),
            mode,
            threads,
            params,
            fork,
            status: EntryStatus::Skipped,
            score: None,
            score_unit: mode.score_unit(unit),
            unit,
            cnt: 0,
            operations: 0,
            elapsed_nanos: 0,
            batch_size: None,
            raw_scores: Vec::new(),
            alloc: None,
            error: None,
        }
    }

    /// Record a successful aggregate
    pub fn succeeded(mut self, result: &AggregateResult, batch_size: u64) -> Self {
        self.status = EntryStatus::Success;
        self.score = Some(result.score);
        self.score_unit = result.score_unit();
        self.cnt = result.samples;
        self.operations = result.operations;
        self.elapsed_nanos = result.elapsed_nanos;
        self.batch_size = Some(batch_size);
        self.raw_scores = result.sample_scores.clone();
        self
    }

    /// Record a failure
    pub fn failed(mut self, kind: impl Into<String>, phase: Option<String>, message: impl Into<String>) -> Self {
        self.status = EntryStatus::Failed;
        self.score = None;
        self.error = Some(FailureInfo {
            kind: kind.into(),
            phase,
            message: message.into(),
        });
        self
    }

    /// Mark as skipped with a reason
    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.status = EntryStatus::Skipped;
        self.error = Some(FailureInfo {
            kind: "skipped".to_string(),
            phase: None,
            message: reason.into(),
        });
        self
    }

    /// Attach allocation metrics
    pub fn with_alloc(mut self, alloc: AllocationMetrics) -> Self {
        self.alloc = Some(alloc);
        self
    }

    /// `name=value` pairs joined by commas
    pub fn params_label(&self) -> String {
        self.params
            .iter()
            .map(|p| format!("{}={}", p.name, p.value))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parameter value by name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

/// Report summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_duration_ms: f64,
}

impl ReportSummary {
    /// Count entries by status
    pub fn from_entries(entries: &[ReportEntry], total_duration_ms: f64) -> Self {
        let count = |status| entries.iter().filter(|e| e.status == status).count();
        Self {
            total: entries.len(),
            succeeded: count(EntryStatus::Success),
            failed: count(EntryStatus::Failed),
            skipped: count(EntryStatus::Skipped),
            total_duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkbench_stats::{ResultAggregator, Sample};

    fn entry(fork: u32) -> ReportEntry {
        ReportEntry::new(
            "codec::compress",
            "codec",
            Mode::AverageTime,
            TimeUnit::Milliseconds,
            1,
            vec![ParamEntry {
                name: "block.size".to_string(),
                value: "65536".to_string(),
            }],
            fork,
        )
    }

    #[test]
    fn test_entry_lifecycle() {
        let aggregator: ResultAggregator =
            std::iter::repeat_n(Sample::new(10_000_000, 1000), 5).collect();
        let result = aggregator
            .finalize(Mode::AverageTime, TimeUnit::Milliseconds)
            .unwrap();

        let ok = entry(1).succeeded(&result, 1000);
        assert_eq!(ok.status, EntryStatus::Success);
        assert_eq!(ok.cnt, 5);
        assert_eq!(ok.score_unit, "ms/op");
        assert_eq!(ok.batch_size, Some(1000));
        assert_eq!(ok.params_label(), "block.size=65536");
        assert_eq!(ok.param("block.size"), Some("65536"));

        let bad = entry(2).failed("measurement", Some("measurement".to_string()), "boom");
        assert_eq!(bad.status, EntryStatus::Failed);
        assert!(bad.score.is_none());
        assert_eq!(bad.error.as_ref().map(|e| e.kind.as_str()), Some("measurement"));
    }

    #[test]
    fn test_summary_counts() {
        let aggregator: ResultAggregator = [Sample::new(100, 1)].into_iter().collect();
        let result = aggregator
            .finalize(Mode::AverageTime, TimeUnit::Nanoseconds)
            .unwrap();
        let entries = vec![
            entry(1).succeeded(&result, 1),
            entry(2).failed("setup", None, "no input"),
            entry(3).skipped("run budget exhausted"),
        ];
        let summary = ReportSummary::from_entries(&entries, 12.5);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
    }
}
