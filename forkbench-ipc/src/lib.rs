#![warn(missing_docs)]
//! forkbench IPC Protocol
//!
//! Wire protocol between the supervisor (the process that owns the run) and
//! the short-lived worker processes that each host exactly one fork.
//! Messages are rkyv archives inside length-prefixed frames, validated on
//! read so a half-written or corrupted frame from a dying worker surfaces as
//! an error instead of garbage samples.

mod framing;
mod messages;

pub use framing::{FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, read_frame, write_frame};
pub use messages::{
    FailureKind, ForkConfig, IterationSample, ParamValue, SupervisorCommand, WorkerCapabilities,
    WorkerMessage,
};

/// Protocol version exchanged in the worker's `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable naming the inherited `<read_fd>,<write_fd>` pair.
pub const IPC_FD_ENV: &str = "FORKBENCH_IPC_FD";

/// Hidden command-line flag that switches a benchmark binary into worker mode.
pub const WORKER_FLAG: &str = "--forkbench-worker";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_sample_layout() {
        // Six 8/4-byte fields, no padding surprises on the hot path
        assert_eq!(std::mem::size_of::<IterationSample>(), 40);
        assert_eq!(std::mem::align_of::<IterationSample>(), 8);
    }

    #[test]
    fn test_worker_flag_is_long_option() {
        assert!(WORKER_FLAG.starts_with("--"));
    }
}
