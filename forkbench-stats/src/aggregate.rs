//! Result Aggregation
//!
//! Both modes are computed from totals (Σelapsed / Σops and its inverse)
//! rather than by averaging per-iteration rates, so an iteration that ran
//! twice as many operations weighs twice as much.

use crate::units::{Mode, TimeUnit};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One measured iteration: elapsed wall time and the operations it covered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Elapsed time of the timed window in nanoseconds
    pub elapsed_nanos: u64,
    /// Benchmark invocations inside the window
    pub operations: u64,
}

impl Sample {
    /// Create a sample
    #[inline]
    pub fn new(elapsed_nanos: u64, operations: u64) -> Self {
        Self {
            elapsed_nanos,
            operations,
        }
    }

    fn score(&self, mode: Mode, unit: TimeUnit) -> Option<f64> {
        ratio(
            mode,
            unit,
            self.elapsed_nanos as u128,
            self.operations as u128,
        )
        .ok()
    }
}

/// Why a set of samples cannot be turned into a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AggregateError {
    /// `finalize` was called before any sample was added
    #[error("no samples to aggregate")]
    Empty,
    /// Samples exist but none of them performed an operation
    #[error("samples cover zero operations")]
    NoOperations,
    /// Samples exist but the clock never advanced
    #[error("samples cover zero elapsed time")]
    NoElapsedTime,
}

/// Final statistic for one (benchmark, combination, fork)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Mode the score was computed for
    pub mode: Mode,
    /// Output time unit
    pub unit: TimeUnit,
    /// Time per op in `unit`, or ops per `unit`
    pub score: f64,
    /// Number of samples aggregated
    pub samples: usize,
    /// Total operations across samples
    pub operations: u64,
    /// Total elapsed nanoseconds across samples
    pub elapsed_nanos: u64,
    /// Score of each sample on its own, in sample order (informational)
    pub sample_scores: Vec<f64>,
}

impl AggregateResult {
    /// Unit label for the score, e.g. `ms/op`
    pub fn score_unit(&self) -> String {
        self.mode.score_unit(self.unit)
    }
}

/// Ordered sample sequence of the current fork
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    samples: Vec<Sample>,
}

impl ResultAggregator {
    /// Empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample; order of insertion is preserved
    pub fn add(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Samples in insertion order
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples recorded
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether nothing was recorded yet
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Compute the score for `mode` in `unit`.
    ///
    /// Pure: calling it repeatedly, or with another mode/unit, never changes
    /// the recorded samples.
    pub fn finalize(&self, mode: Mode, unit: TimeUnit) -> Result<AggregateResult, AggregateError> {
        if self.samples.is_empty() {
            return Err(AggregateError::Empty);
        }

        let elapsed: u128 = self.samples.iter().map(|s| s.elapsed_nanos as u128).sum();
        let operations: u128 = self.samples.iter().map(|s| s.operations as u128).sum();
        let score = ratio(mode, unit, elapsed, operations)?;

        Ok(AggregateResult {
            mode,
            unit,
            score,
            samples: self.samples.len(),
            operations: u64::try_from(operations).unwrap_or(u64::MAX),
            elapsed_nanos: u64::try_from(elapsed).unwrap_or(u64::MAX),
            sample_scores: self
                .samples
                .iter()
                .map(|s| s.score(mode, unit).unwrap_or(f64::NAN))
                .collect(),
        })
    }
}

impl Extend<Sample> for ResultAggregator {
    fn extend<I: IntoIterator<Item = Sample>>(&mut self, iter: I) {
        self.samples.extend(iter);
    }
}

impl FromIterator<Sample> for ResultAggregator {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

fn ratio(
    mode: Mode,
    unit: TimeUnit,
    elapsed_nanos: u128,
    operations: u128,
) -> Result<f64, AggregateError> {
    if operations == 0 {
        return Err(AggregateError::NoOperations);
    }
    if elapsed_nanos == 0 {
        return Err(AggregateError::NoElapsedTime);
    }

    let elapsed_in_unit = unit.convert_nanos(elapsed_nanos as f64);
    let operations = operations as f64;

    Ok(match mode {
        Mode::AverageTime => elapsed_in_unit / operations,
        Mode::Throughput => operations / elapsed_in_unit,
    })
}
