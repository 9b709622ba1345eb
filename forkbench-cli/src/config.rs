//! Configuration loading from forkbench.toml
//!
//! The file is discovered by walking up from the current directory. Every
//! `[runner]` key is optional: an unset key leaves the decision to the
//! benchmark attribute or the built-in default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Name of the configuration file
pub const CONFIG_FILE: &str = "forkbench.toml";

/// forkbench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ForkbenchConfig {
    /// Runner configuration
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
    /// Passthrough properties visible to fixture setup
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Runner configuration for benchmark execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Warm-up iterations per fork
    pub warmup_iterations: Option<u32>,
    /// Measured iterations per fork
    pub iterations: Option<u32>,
    /// Forks per combination (0 runs in-process)
    pub forks: Option<u32>,
    /// Worker threads per fork
    pub threads: Option<u32>,
    /// Fixed invocations per iteration
    pub batch_size: Option<u64>,
    /// CPU tokens the blackhole burns per consumed value
    pub blackhole_tokens: Option<u64>,
    /// Calibration target for one iteration (e.g. "20ms")
    pub min_iteration_time: Option<String>,
    /// Time allowed for one worker process (e.g. "10m")
    pub timeout: Option<String>,
    /// Wall-clock budget for the whole run
    pub run_budget: Option<String>,
    /// Fork processes run in parallel
    pub jobs: Option<usize>,
    /// Exit non-zero when any fork failed
    pub fail_on_error: Option<bool>,
}

/// Output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Default output format: "human", "json", "csv"
    pub format: Option<String>,
    /// Output time unit for every benchmark: "ns", "us", "ms", "s", "m"
    pub time_unit: Option<String>,
}

impl ForkbenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Discover the nearest `forkbench.toml` walking up from the current directory.
    ///
    /// `Ok(None)` when there is none; a file that exists but does not parse is an error.
    pub fn discover() -> anyhow::Result<Option<Self>> {
        let mut dir = std::env::current_dir()?;
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.is_file() {
                tracing::debug!(path = %config_path.display(), "loading configuration");
                return Self::load(&config_path).map(Some);
            }
            if !dir.pop() {
                return Ok(None);
            }
        }
    }

    /// Generate a commented configuration as TOML string
    pub fn default_toml() -> String {
        r#"# forkbench configuration

[runner]
# Warm-up iterations per fork (discarded)
warmup_iterations = 5
# Measured iterations per fork
iterations = 5
# Forks per parameter combination; 0 runs in-process without isolation
forks = 1
# Worker threads per fork
threads = 1
# Fixed invocations per iteration (uncomment to disable calibration)
# batch_size = 1000
# Calibration target for a single iteration
min_iteration_time = "20ms"
# Time allowed for one worker process
timeout = "10m"
# Wall-clock budget for the whole run (uncomment to enable)
# run_budget = "30m"
# Fork processes run in parallel
jobs = 1
# Exit non-zero when any fork failed
fail_on_error = false

[output]
# human, json or csv
format = "human"
# Override every benchmark's output unit (uncomment to enable)
# time_unit = "ms"

[properties]
# Passed through to fixtures, like -D on the command line
# "byte.size" = "1048576"
"#
        .to_string()
    }

    /// Parse duration string (e.g., "20ms", "60s", "2m") to nanoseconds
    pub fn parse_duration(s: &str) -> anyhow::Result<u64> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic() || *c == 'µ')
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Invalid duration: {}", s));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok((value * multiplier as f64) as u64)
    }
}
