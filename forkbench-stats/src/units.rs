//! Benchmark modes and output time units

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What the aggregate score means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Time per operation (`avgt`)
    AverageTime,
    /// Operations per time unit (`thrpt`)
    Throughput,
}

impl Mode {
    /// Short label used in reports and on the command line
    pub fn short_label(self) -> &'static str {
        match self {
            Mode::AverageTime => "avgt",
            Mode::Throughput => "thrpt",
        }
    }

    /// Score unit label, e.g. `ms/op` or `ops/s`
    pub fn score_unit(self, unit: TimeUnit) -> String {
        match self {
            Mode::AverageTime => format!("{}/op", unit.symbol()),
            Mode::Throughput => format!("ops/{}", unit.symbol()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_label())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "avgt" | "average_time" | "averagetime" | "average" => Ok(Mode::AverageTime),
            "thrpt" | "throughput" => Ok(Mode::Throughput),
            other => Err(format!(
                "unknown benchmark mode '{other}' (expected avgt or thrpt)"
            )),
        }
    }
}

/// Output time unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    /// ns
    Nanoseconds,
    /// us
    Microseconds,
    /// ms
    Milliseconds,
    /// s
    Seconds,
    /// min
    Minutes,
}

impl TimeUnit {
    /// Nanoseconds in one unit
    pub fn nanos(self) -> f64 {
        match self {
            TimeUnit::Nanoseconds => 1.0,
            TimeUnit::Microseconds => 1_000.0,
            TimeUnit::Milliseconds => 1_000_000.0,
            TimeUnit::Seconds => 1_000_000_000.0,
            TimeUnit::Minutes => 60_000_000_000.0,
        }
    }

    /// Short symbol
    pub fn symbol(self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "ns",
            TimeUnit::Microseconds => "us",
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "min",
        }
    }

    /// Convert a nanosecond quantity into this unit
    #[inline]
    pub fn convert_nanos(self, nanos: f64) -> f64 {
        nanos / self.nanos()
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ns" | "nanoseconds" => Ok(TimeUnit::Nanoseconds),
            "us" | "µs" | "microseconds" => Ok(TimeUnit::Microseconds),
            "ms" | "milliseconds" => Ok(TimeUnit::Milliseconds),
            "s" | "seconds" => Ok(TimeUnit::Seconds),
            "m" | "min" | "minutes" => Ok(TimeUnit::Minutes),
            other => Err(format!("unknown time unit '{other}'")),
        }
    }
}
