#![warn(missing_docs)]
//! forkbench Result Aggregation
//!
//! Turns the per-iteration samples of one fork into a single score:
//! - Average time: total elapsed over total operations, in the output unit
//! - Throughput: total operations over total elapsed, per output unit

mod aggregate;
mod units;

pub use aggregate::{AggregateError, AggregateResult, ResultAggregator, Sample};
pub use units::{Mode, TimeUnit};
