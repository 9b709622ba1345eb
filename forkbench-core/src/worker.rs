//! Worker Process Entry Point
//!
//! A worker hosts exactly one fork: it greets the supervisor, runs the
//! fork it is asked for, streams the measured samples back and exits when
//! the supervisor shuts it down or closes the pipe.
//!
//! On Unix, uses fd 3/4 for IPC (named by `FORKBENCH_IPC_FD`) and installs
//! a SIGTERM handler for graceful shutdown. Elsewhere it falls back to
//! stdin/stdout and skips signal handling.

use crate::allocator::allocation_tracking_installed;
use crate::clock::{HAS_CYCLE_COUNTER, pin_to_cpu};
use crate::fixture::panic_message;
use crate::find_benchmark;
use crate::scheduler::{ForkFailure, ForkRun, Phase, run_fork};
use forkbench_ipc::{
    FailureKind, ForkConfig, FrameError, FrameReader, FrameWriter, IPC_FD_ENV, SupervisorCommand,
    WorkerCapabilities, WorkerMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use std::os::unix::io::FromRawFd;

/// Set by the SIGTERM handler.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether the supervisor asked this worker to stop.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Install a SIGTERM handler that only sets `SHUTDOWN_REQUESTED`.
#[cfg(unix)]
fn install_sigterm_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigterm_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(not(unix))]
fn install_sigterm_handler() {}

enum IpcTransport {
    #[cfg(unix)]
    Fds { read_fd: i32, write_fd: i32 },
    Stdio,
}

fn detect_transport() -> IpcTransport {
    #[cfg(unix)]
    if let Ok(val) = std::env::var(IPC_FD_ENV) {
        if let Some((r, w)) = val.split_once(',') {
            if let (Ok(read_fd), Ok(write_fd)) = (r.trim().parse(), w.trim().parse()) {
                return IpcTransport::Fds { read_fd, write_fd };
            }
        }
        tracing::warn!(
            "invalid {IPC_FD_ENV}={val:?} (expected <read_fd>,<write_fd>), falling back to stdio"
        );
    }
    IpcTransport::Stdio
}

impl ForkFailure {
    /// Wire form of this failure
    pub fn to_message(&self) -> WorkerMessage {
        match self {
            ForkFailure::Setup { fixture, message } => WorkerMessage::Failure {
                kind: FailureKind::Setup,
                phase: Phase::Idle.label().to_string(),
                fixture: Some(fixture.clone()),
                iteration: None,
                thread: None,
                message: message.clone(),
            },
            ForkFailure::Measurement {
                phase,
                iteration,
                thread,
                message,
            } => WorkerMessage::Failure {
                kind: FailureKind::Measurement,
                phase: phase.label().to_string(),
                fixture: None,
                iteration: Some(*iteration),
                thread: Some(*thread),
                message: message.clone(),
            },
            ForkFailure::Configuration(message) => WorkerMessage::Failure {
                kind: FailureKind::Configuration,
                phase: Phase::Idle.label().to_string(),
                fixture: None,
                iteration: None,
                thread: None,
                message: message.clone(),
            },
        }
    }

    /// Rebuild a failure from its wire fields; `None` for [`FailureKind::NotFound`]
    pub fn from_wire(
        kind: FailureKind,
        phase: &str,
        fixture: Option<String>,
        iteration: Option<u32>,
        thread: Option<u32>,
        message: String,
    ) -> Option<Self> {
        match kind {
            FailureKind::Setup => Some(ForkFailure::Setup {
                fixture: fixture.unwrap_or_else(|| "<unknown>".to_string()),
                message,
            }),
            FailureKind::Measurement => Some(ForkFailure::Measurement {
                phase: Phase::from_label(phase).unwrap_or(Phase::Measuring),
                iteration: iteration.unwrap_or(0),
                thread: thread.unwrap_or(0),
                message,
            }),
            FailureKind::Configuration => Some(ForkFailure::Configuration(message)),
            FailureKind::NotFound => None,
        }
    }
}

/// Messages that report a finished fork, in sending order
pub fn completion_messages(run: &ForkRun) -> Vec<WorkerMessage> {
    let mut messages: Vec<WorkerMessage> =
        run.samples.iter().copied().map(WorkerMessage::Sample).collect();
    messages.push(WorkerMessage::Complete {
        warmup_iterations: run.warmup_iterations,
        batch_size: run.batch_size,
        calibration_rounds: run.calibration_rounds,
    });
    messages
}

/// Worker main loop
pub struct WorkerMain {
    reader: FrameReader<Box<dyn std::io::Read>>,
    writer: FrameWriter<Box<dyn std::io::Write>>,
}

impl WorkerMain {
    /// Create a worker on fd 3/4 when `FORKBENCH_IPC_FD` is set, otherwise stdin/stdout.
    pub fn new() -> Self {
        match detect_transport() {
            #[cfg(unix)]
            IpcTransport::Fds { read_fd, write_fd } => {
                // SAFETY: the supervisor dup2'ed both pipe ends onto these fds
                // before exec; nothing else in this process owns them.
                let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
                let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
                Self {
                    reader: FrameReader::new(Box::new(read_file) as Box<dyn std::io::Read>),
                    writer: FrameWriter::new(Box::new(write_file) as Box<dyn std::io::Write>),
                }
            }
            IpcTransport::Stdio => Self {
                reader: FrameReader::new(Box::new(std::io::stdin()) as Box<dyn std::io::Read>),
                writer: FrameWriter::new(Box::new(std::io::stdout()) as Box<dyn std::io::Write>),
            },
        }
    }

    /// Serve commands until shutdown or end of stream
    pub fn run(&mut self) -> Result<(), FrameError> {
        install_sigterm_handler();

        self.writer.write(&WorkerMessage::Hello(WorkerCapabilities::detect(
            HAS_CYCLE_COUNTER,
            allocation_tracking_installed(),
        )))?;

        loop {
            if shutdown_requested() {
                break;
            }

            let command: SupervisorCommand = match self.reader.read() {
                Ok(command) => command,
                Err(FrameError::EndOfStream) => break,
                Err(e) => return Err(e),
            };

            match command {
                SupervisorCommand::Run {
                    bench_id,
                    fork,
                    config,
                } => {
                    self.run_fork(&bench_id, fork, &config)?;
                    if shutdown_requested() {
                        break;
                    }
                }
                SupervisorCommand::Shutdown => break,
            }
        }

        Ok(())
    }

    fn run_fork(&mut self, bench_id: &str, fork: u32, config: &ForkConfig) -> Result<(), FrameError> {
        let Some(bench) = find_benchmark(bench_id) else {
            return self.writer.write(&WorkerMessage::Failure {
                kind: FailureKind::NotFound,
                phase: Phase::Idle.label().to_string(),
                fixture: None,
                iteration: None,
                thread: None,
                message: format!("benchmark not found: {bench_id}"),
            });
        };

        // Spawned threads inherit the mask, so pin only single-threaded forks
        if config.threads == 1 {
            if let Err(e) = pin_to_cpu(0) {
                tracing::debug!("could not pin worker to cpu 0: {e}");
            }
        }

        tracing::debug!(bench = bench_id, fork, threads = config.threads, "worker running fork");

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run_fork(bench, config)));
        let messages = match outcome {
            Ok(Ok(run)) => completion_messages(&run),
            Ok(Err(failure)) => vec![failure.to_message()],
            Err(payload) => vec![
                ForkFailure::Configuration(format!(
                    "scheduler panicked: {}",
                    panic_message(&*payload)
                ))
                .to_message(),
            ],
        };

        for message in &messages {
            self.writer.write(message)?;
        }
        Ok(())
    }
}

impl Default for WorkerMain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkbench_ipc::IterationSample;

    #[test]
    fn test_failure_wire_round_trip() {
        let failures = [
            ForkFailure::Setup {
                fixture: "Codec".to_string(),
                message: "no input".to_string(),
            },
            ForkFailure::Measurement {
                phase: Phase::WarmingUp,
                iteration: 1,
                thread: 2,
                message: "boom".to_string(),
            },
            ForkFailure::Configuration("threads must be at least 1".to_string()),
        ];

        for failure in failures {
            let WorkerMessage::Failure {
                kind,
                phase,
                fixture,
                iteration,
                thread,
                message,
            } = failure.to_message()
            else {
                panic!("not a failure message");
            };
            let back = ForkFailure::from_wire(kind, &phase, fixture, iteration, thread, message);
            assert_eq!(back, Some(failure));
        }
    }

    #[test]
    fn test_not_found_has_no_fork_failure() {
        assert_eq!(
            ForkFailure::from_wire(FailureKind::NotFound, "idle", None, None, None, "x".into()),
            None
        );
    }

    #[test]
    fn test_completion_messages_order() {
        let run = ForkRun {
            samples: vec![
                IterationSample::new(0, 0, 100, 10),
                IterationSample::new(1, 0, 120, 10),
            ],
            warmup_iterations: 3,
            batch_size: 10,
            calibration_rounds: 2,
        };
        let messages = completion_messages(&run);
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], WorkerMessage::Sample(s) if s.iteration == 0));
        assert!(matches!(messages[1], WorkerMessage::Sample(s) if s.iteration == 1));
        assert!(matches!(
            messages[2],
            WorkerMessage::Complete {
                warmup_iterations: 3,
                batch_size: 10,
                calibration_rounds: 2
            }
        ));
    }
}
