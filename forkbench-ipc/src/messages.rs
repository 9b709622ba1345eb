//! IPC Message Types

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// One measured iteration of one worker thread.
///
/// Warm-up and calibration iterations never produce one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
#[repr(C)]
pub struct IterationSample {
    /// Zero-based measurement iteration index
    pub iteration: u32,
    /// Worker thread index inside the fork
    pub thread: u32,
    /// Time spent inside the timed window
    pub elapsed_nanos: u64,
    /// Benchmark invocations performed inside the window
    pub operations: u64,
    /// Bytes allocated inside the window (0 unless allocation tracking is on)
    pub alloc_bytes: u64,
    /// Allocation calls inside the window
    pub alloc_count: u64,
}

impl IterationSample {
    /// Timing-only sample
    #[inline]
    pub fn new(iteration: u32, thread: u32, elapsed_nanos: u64, operations: u64) -> Self {
        Self {
            iteration,
            thread,
            elapsed_nanos,
            operations,
            alloc_bytes: 0,
            alloc_count: 0,
        }
    }

    /// Attach allocation counters
    #[inline]
    pub fn with_allocations(mut self, bytes: u64, count: u64) -> Self {
        self.alloc_bytes = bytes;
        self.alloc_count = count;
        self
    }
}

/// A named parameter value (one coordinate of a combination, or a passthrough property)
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ParamValue {
    /// Parameter name, e.g. `byte.size`
    pub name: String,
    /// Raw value; fixtures interpret it
    pub value: String,
}

impl ParamValue {
    /// Build from anything string-like
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Everything a worker needs to run one fork
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ForkConfig {
    /// Warm-up iterations (discarded)
    pub warmup_iterations: u32,
    /// Measured iterations (at least one)
    pub measurement_iterations: u32,
    /// Fixed invocations per iteration; `None` calibrates against `min_iteration_time_ns`
    pub batch_size: Option<u64>,
    /// Calibration target for a single iteration
    pub min_iteration_time_ns: u64,
    /// Worker threads invoking the benchmark concurrently
    pub threads: u32,
    /// Combination coordinates for this fork
    pub params: Vec<ParamValue>,
    /// Passthrough properties (`-D key=value`)
    pub properties: Vec<ParamValue>,
    /// Record allocation counters per iteration
    pub track_allocations: bool,
    /// CPU tokens the blackhole burns per consumed value
    pub blackhole_tokens: u64,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 5,
            measurement_iterations: 5,
            batch_size: None,
            min_iteration_time_ns: 20_000_000,
            threads: 1,
            params: Vec::new(),
            properties: Vec::new(),
            track_allocations: false,
            blackhole_tokens: 0,
        }
    }
}

/// Worker facts advertised in the handshake
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct WorkerCapabilities {
    /// Must equal [`crate::PROTOCOL_VERSION`]
    pub protocol_version: u32,
    /// Worker process id
    pub pid: u32,
    /// Hardware cycle counter available
    pub has_cycle_counter: bool,
    /// The tracking allocator is the global allocator in this binary
    pub alloc_tracking_installed: bool,
    /// Logical CPUs visible to the worker
    pub cpu_count: u32,
}

impl WorkerCapabilities {
    /// Capabilities of the current process
    pub fn detect(has_cycle_counter: bool, alloc_tracking_installed: bool) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            pid: std::process::id(),
            has_cycle_counter,
            alloc_tracking_installed,
            cpu_count: std::thread::available_parallelism()
                .map(|p| p.get() as u32)
                .unwrap_or(1),
        }
    }
}

/// Failure categories reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum FailureKind {
    /// A fixture initializer returned an error or panicked
    Setup,
    /// The benchmark raised during warm-up or a measured iteration
    Measurement,
    /// The fork configuration was rejected by the worker
    Configuration,
    /// No benchmark with the requested id is registered in this binary
    NotFound,
}

/// Messages sent from worker to supervisor
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum WorkerMessage {
    /// Handshake, first message on the pipe
    Hello(WorkerCapabilities),

    /// One measured iteration, in iteration order
    Sample(IterationSample),

    /// The fork finished; every sample has been sent
    Complete {
        /// Warm-up iterations executed (calibration excluded)
        warmup_iterations: u32,
        /// Invocations per iteration per thread
        batch_size: u64,
        /// Calibration rounds needed to pick `batch_size`
        calibration_rounds: u32,
    },

    /// The fork failed; any samples already sent must be discarded
    Failure {
        /// Category
        kind: FailureKind,
        /// Scheduler phase in which the failure happened
        phase: String,
        /// Fixture type for setup failures
        fixture: Option<String>,
        /// Iteration index within the phase
        iteration: Option<u32>,
        /// Worker thread index
        thread: Option<u32>,
        /// Human-readable cause
        message: String,
    },
}

/// Commands sent from supervisor to worker
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum SupervisorCommand {
    /// Run one fork of one benchmark
    Run {
        /// Benchmark id
        bench_id: String,
        /// 1-based fork number, for diagnostics
        fork: u32,
        /// Fork parameters
        config: ForkConfig,
    },

    /// Exit after the current command
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_with_allocations() {
        let sample = IterationSample::new(3, 1, 1_000, 10).with_allocations(640, 10);
        assert_eq!(sample.iteration, 3);
        assert_eq!(sample.thread, 1);
        assert_eq!(sample.alloc_bytes, 640);
        assert_eq!(sample.alloc_count, 10);
    }

    #[test]
    fn test_fork_config_default_measures() {
        let config = ForkConfig::default();
        assert!(config.measurement_iterations >= 1);
        assert_eq!(config.threads, 1);
        assert!(config.batch_size.is_none());
    }

    #[test]
    fn test_capabilities_carry_protocol_version() {
        let caps = WorkerCapabilities::detect(false, false);
        assert_eq!(caps.protocol_version, crate::PROTOCOL_VERSION);
        assert!(caps.cpu_count >= 1);
        assert_eq!(caps.pid, std::process::id());
    }
}
