//! Supervisor Process
//!
//! Realizes forks as worker processes: the current binary re-executed with
//! `--forkbench-worker`, commands on fd 3 and messages on fd 4.

use forkbench_core::{ForkFailure, ForkRun, run_fork};
use forkbench_ipc::{
    ForkConfig, FrameError, FrameReader, FrameWriter, IPC_FD_ENV, IterationSample,
    PROTOCOL_VERSION, SupervisorCommand, WORKER_FLAG, WorkerCapabilities, WorkerMessage,
};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::planner::ForkTask;

/// Default time allowed for one worker process
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const DRAIN_WINDOW: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pipe ends live at or above this fd so dup2 onto 3 and 4 never clobbers one
const PIPE_FD_FLOOR: RawFd = 10;

/// Failures of the worker process itself, as opposed to the benchmark
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The worker binary could not be started or its pipes not created
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(#[from] std::io::Error),

    /// A frame could not be written or decoded
    #[error("IPC error: {0}")]
    IpcError(String),

    /// The worker exited or hung up before finishing the fork
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// No progress within the worker timeout; the process was killed
    #[error("worker timed out after {0:?}")]
    Timeout(Duration),

    /// The worker has no benchmark registered under this id
    #[error("benchmark not found in worker: {0}")]
    BenchmarkNotFound(String),

    /// The worker sent a message out of sequence
    #[error("worker protocol error: expected {expected}, got {got}")]
    ProtocolError {
        /// What the supervisor was waiting for
        expected: String,
        /// What arrived instead
        got: String,
    },
}

impl From<FrameError> for SupervisorError {
    fn from(e: FrameError) -> Self {
        SupervisorError::IpcError(e.to_string())
    }
}

impl SupervisorError {
    /// Short category used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::SpawnFailed(_) => "spawn",
            SupervisorError::IpcError(_) => "ipc",
            SupervisorError::WorkerCrashed(_) => "crashed",
            SupervisorError::Timeout(_) => "timeout",
            SupervisorError::BenchmarkNotFound(_) => "not_found",
            SupervisorError::ProtocolError { .. } => "protocol",
        }
    }
}

/// Why one fork produced no result
#[derive(Debug, Error)]
pub enum ForkError {
    /// The benchmark or one of its fixtures failed
    #[error(transparent)]
    Failure(#[from] ForkFailure),
    /// The fork environment failed
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl ForkError {
    /// Short category used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            ForkError::Failure(ForkFailure::Setup { .. }) => "setup",
            ForkError::Failure(ForkFailure::Measurement { .. }) => "measurement",
            ForkError::Failure(ForkFailure::Configuration(_)) => "configuration",
            ForkError::Supervisor(e) => e.kind(),
        }
    }

    /// Scheduler phase of the failure, when the worker reported one
    pub fn phase(&self) -> Option<String> {
        match self {
            ForkError::Failure(ForkFailure::Setup { .. }) => Some("setup".to_string()),
            ForkError::Failure(ForkFailure::Measurement { phase, .. }) => {
                Some(phase.label().to_string())
            }
            _ => None,
        }
    }
}

/// Runs one fork task to completion
pub trait ForkRunner: Send + Sync {
    /// Run `task` with the wire configuration `config`
    fn run(&self, task: &ForkTask, config: &ForkConfig) -> Result<ForkRun, ForkError>;
}

/// Result of polling for data
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(std::io::Error),
}

/// Wait for data to be available on a file descriptor with timeout
fn wait_for_data(fd: RawFd, timeout: Duration) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        PollResult::Error(std::io::Error::last_os_error())
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // Readable even while the peer hangs up: drain what was written first
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

/// Create a close-on-exec pipe above `PIPE_FD_FLOOR`, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let read = raise_fd(fds[0]);
    let write = raise_fd(fds[1]);
    match (read, write) {
        (Ok(r), Ok(w)) => Ok((r, w)),
        (Ok(fd), Err(e)) | (Err(e), Ok(fd)) => {
            close_fd(fd);
            Err(e)
        }
        (Err(e), Err(_)) => Err(e),
    }
}

/// Move `fd` to the lowest free slot at or above `PIPE_FD_FLOOR`, close-on-exec.
fn raise_fd(fd: RawFd) -> Result<RawFd, std::io::Error> {
    let high = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, PIPE_FD_FLOOR) };
    let result = if high < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(high)
    };
    close_fd(fd);
    result
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Worker process handle
pub struct WorkerHandle {
    child: Child,
    reader: FrameReader<std::fs::File>,
    writer: FrameWriter<std::fs::File>,
    capabilities: WorkerCapabilities,
    timeout: Duration,
    msg_read_fd: RawFd,
}

impl WorkerHandle {
    /// Spawn `binary` as a worker and complete the handshake.
    pub fn spawn(binary: &Path, timeout: Duration) -> Result<Self, SupervisorError> {
        // cmd pipe: supervisor writes, worker reads from fd 3
        let (cmd_read, cmd_write) = create_pipe()?;
        // msg pipe: worker writes to fd 4, supervisor reads
        let (msg_read, msg_write) = match create_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                return Err(SupervisorError::SpawnFailed(e));
            }
        };

        let mut command = Command::new(binary);
        command
            .arg(WORKER_FLAG)
            .env(IPC_FD_ENV, "3,4")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        // Every pipe end sits above fd 4 and is close-on-exec, so the dup2
        // targets are the only descriptors the worker inherits.
        unsafe {
            command.pre_exec(move || {
                for (src, dst) in [(cmd_read, 3), (msg_write, 4)] {
                    if libc::dup2(src, dst) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let flags = libc::fcntl(dst, libc::F_GETFD);
                    libc::fcntl(dst, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
                }
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                close_fd(msg_read);
                close_fd(msg_write);
                return Err(SupervisorError::SpawnFailed(e));
            }
        };

        // The child owns these ends now
        close_fd(cmd_read);
        close_fd(msg_write);

        let writer_file = unsafe { std::fs::File::from_raw_fd(cmd_write) };
        let reader_file = unsafe { std::fs::File::from_raw_fd(msg_read) };

        let mut handle = Self {
            child,
            reader: FrameReader::new(reader_file),
            writer: FrameWriter::new(writer_file),
            capabilities: WorkerCapabilities::detect(false, false),
            timeout,
            msg_read_fd: msg_read,
        };
        handle.wait_for_hello()?;
        tracing::debug!(pid = handle.capabilities.pid, "worker ready");
        Ok(handle)
    }

    fn wait_for_hello(&mut self) -> Result<(), SupervisorError> {
        let msg = match self.next_message(Instant::now() + self.timeout)? {
            Some(msg) => msg,
            None => {
                self.kill();
                return Err(SupervisorError::Timeout(self.timeout));
            }
        };

        match msg {
            WorkerMessage::Hello(caps) => {
                if caps.protocol_version != PROTOCOL_VERSION {
                    return Err(SupervisorError::ProtocolError {
                        expected: format!("protocol version {}", PROTOCOL_VERSION),
                        got: format!("protocol version {}", caps.protocol_version),
                    });
                }
                self.capabilities = caps;
                Ok(())
            }
            other => Err(SupervisorError::ProtocolError {
                expected: "Hello".to_string(),
                got: format!("{:?}", other),
            }),
        }
    }

    /// Capabilities advertised in the handshake
    pub fn capabilities(&self) -> &WorkerCapabilities {
        &self.capabilities
    }

    /// Run one fork of `bench_id` and collect its samples
    pub fn run_fork(
        &mut self,
        bench_id: &str,
        fork: u32,
        config: &ForkConfig,
    ) -> Result<ForkRun, ForkError> {
        self.writer
            .write(&SupervisorCommand::Run {
                bench_id: bench_id.to_string(),
                fork,
                config: config.clone(),
            })
            .map_err(SupervisorError::from)?;

        let deadline = Instant::now() + self.timeout;
        let mut samples: Vec<IterationSample> = Vec::new();

        loop {
            let Some(msg) = self.next_message(deadline)? else {
                return Err(self.handle_timeout().into());
            };

            match msg {
                WorkerMessage::Sample(sample) => samples.push(sample),
                WorkerMessage::Complete {
                    warmup_iterations,
                    batch_size,
                    calibration_rounds,
                } => {
                    return Ok(ForkRun {
                        samples,
                        warmup_iterations,
                        batch_size,
                        calibration_rounds,
                    });
                }
                WorkerMessage::Failure {
                    kind,
                    phase,
                    fixture,
                    iteration,
                    thread,
                    message,
                } => {
                    // Samples already received belong to the failed fork
                    return Err(
                        match ForkFailure::from_wire(kind, &phase, fixture, iteration, thread, message)
                        {
                            Some(failure) => ForkError::Failure(failure),
                            None => SupervisorError::BenchmarkNotFound(bench_id.to_string()).into(),
                        },
                    );
                }
                WorkerMessage::Hello(_) => {
                    return Err(SupervisorError::ProtocolError {
                        expected: "Sample/Complete/Failure".to_string(),
                        got: "Hello".to_string(),
                    }
                    .into());
                }
            }
        }
    }

    /// Next message before `deadline`; `Ok(None)` when the deadline passed
    fn next_message(&mut self, deadline: Instant) -> Result<Option<WorkerMessage>, SupervisorError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            // Buffered bytes are invisible to poll; a partial frame there can
            // only complete while the worker lives
            if self.reader.has_buffered_data() {
                if !self.is_alive() {
                    return Err(SupervisorError::WorkerCrashed(
                        "worker exited with a partial frame buffered".to_string(),
                    ));
                }
            } else {
                match wait_for_data(self.msg_read_fd, remaining.min(POLL_INTERVAL)) {
                    PollResult::DataAvailable => {}
                    PollResult::Timeout => {
                        if !self.is_alive() {
                            return Err(SupervisorError::WorkerCrashed(self.exit_description()));
                        }
                        continue;
                    }
                    PollResult::PipeClosed => {
                        return Err(SupervisorError::WorkerCrashed(self.exit_description()));
                    }
                    PollResult::Error(e) => {
                        return Err(SupervisorError::WorkerCrashed(format!("pipe error: {}", e)));
                    }
                }
            }

            return match self.reader.read::<WorkerMessage>() {
                Ok(msg) => Ok(Some(msg)),
                Err(FrameError::EndOfStream) => {
                    Err(SupervisorError::WorkerCrashed(self.exit_description()))
                }
                Err(e) => {
                    if !self.is_alive() {
                        return Err(SupervisorError::WorkerCrashed(self.exit_description()));
                    }
                    Err(SupervisorError::IpcError(e.to_string()))
                }
            };
        }
    }

    /// SIGTERM, drain for a short window, then SIGKILL.
    fn handle_timeout(&mut self) -> SupervisorError {
        tracing::warn!(pid = self.child.id(), timeout = ?self.timeout, "worker timed out");
        let _ = send_sigterm(self.child.id());

        let drain_deadline = Instant::now() + DRAIN_WINDOW;
        loop {
            let remaining = drain_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match wait_for_data(self.msg_read_fd, remaining) {
                PollResult::DataAvailable => match self.reader.read::<WorkerMessage>() {
                    Ok(WorkerMessage::Sample(_)) => continue,
                    _ => break,
                },
                _ => break,
            }
        }

        self.kill();
        SupervisorError::Timeout(self.timeout)
    }

    fn exit_description(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!("worker exited unexpectedly ({})", status),
            _ => "worker closed the connection unexpectedly".to_string(),
        }
    }

    /// Shutdown the worker gracefully
    pub fn shutdown(mut self) -> Result<(), SupervisorError> {
        self.writer.write(&SupervisorCommand::Shutdown)?;
        let _ = self.child.wait();
        Ok(())
    }

    /// Check if worker process is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = send_sigterm(self.child.id());
            std::thread::sleep(Duration::from_millis(50));
            self.kill();
        }
    }
}

/// One fresh worker process per fork
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: PathBuf,
    timeout: Duration,
}

impl ProcessRunner {
    /// Re-execute the current binary
    pub fn current_exe(timeout: Duration) -> Result<Self, SupervisorError> {
        let binary = std::env::current_exe().map_err(SupervisorError::SpawnFailed)?;
        Ok(Self::with_binary(binary, timeout))
    }

    /// Use another binary as worker (it must register the same benchmarks)
    pub fn with_binary(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

/// Reject a fork the worker cannot honor, before sending it
fn check_capabilities(caps: &WorkerCapabilities, config: &ForkConfig) -> Result<(), ForkFailure> {
    if config.track_allocations && !caps.alloc_tracking_installed {
        return Err(ForkFailure::Configuration(format!(
            "worker {} cannot track allocations: TrackingAllocator is not its #[global_allocator]",
            caps.pid
        )));
    }
    if config.threads > caps.cpu_count {
        tracing::warn!(
            pid = caps.pid,
            threads = config.threads,
            cpus = caps.cpu_count,
            "more benchmark threads than CPUs visible to the worker"
        );
    }
    Ok(())
}

impl ForkRunner for ProcessRunner {
    fn run(&self, task: &ForkTask, config: &ForkConfig) -> Result<ForkRun, ForkError> {
        let mut worker = WorkerHandle::spawn(&self.binary, self.timeout)?;
        if let Err(failure) = check_capabilities(worker.capabilities(), config) {
            let _ = worker.shutdown();
            return Err(failure.into());
        }
        let result = worker.run_fork(task.bench.id, task.fork, config);
        if worker.is_alive() {
            let _ = worker.shutdown();
        }
        result
    }
}

/// Runs the scheduler in the supervisor process, without isolation
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessRunner;

impl ForkRunner for InProcessRunner {
    fn run(&self, task: &ForkTask, config: &ForkConfig) -> Result<ForkRun, ForkError> {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run_fork(task.bench, config)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ForkFailure::Configuration(format!("scheduler panicked: {message}")))
            })
            .map_err(ForkError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkbench_core::Phase;

    #[test]
    fn test_error_kinds_and_phases() {
        let measurement: ForkError = ForkFailure::Measurement {
            phase: Phase::Measuring,
            iteration: 2,
            thread: 0,
            message: "boom".to_string(),
        }
        .into();
        assert_eq!(measurement.kind(), "measurement");
        assert_eq!(measurement.phase().as_deref(), Some("measurement"));

        let setup: ForkError = ForkFailure::Setup {
            fixture: "Input".to_string(),
            message: "missing file".to_string(),
        }
        .into();
        assert_eq!(setup.kind(), "setup");
        assert_eq!(setup.phase().as_deref(), Some("setup"));

        let timeout: ForkError = SupervisorError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(timeout.kind(), "timeout");
        assert!(timeout.phase().is_none());
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let result = WorkerHandle::spawn(
            Path::new("/nonexistent/forkbench-worker"),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(SupervisorError::SpawnFailed(_))));
    }

    #[test]
    fn test_pipe_ends_stay_clear_of_worker_fds() {
        let (read, write) = create_pipe().unwrap();
        assert!(read >= PIPE_FD_FLOOR && write >= PIPE_FD_FLOOR);
        for fd in [read, write] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
        close_fd(read);
        close_fd(write);
    }

    #[test]
    fn test_hung_worker_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let script = std::env::temp_dir().join(format!("forkbench-hang-{}.sh", std::process::id()));
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let started = Instant::now();
        let result = WorkerHandle::spawn(&script, Duration::from_millis(500));
        let _ = std::fs::remove_file(&script);

        assert!(matches!(result, Err(SupervisorError::Timeout(t)) if t == Duration::from_millis(500)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_capabilities_gate_allocation_tracking() {
        let config = ForkConfig {
            track_allocations: true,
            ..ForkConfig::default()
        };
        let without = WorkerCapabilities::detect(false, false);
        let err = check_capabilities(&without, &config).unwrap_err();
        assert!(matches!(err, ForkFailure::Configuration(ref m) if m.contains("TrackingAllocator")));

        let with = WorkerCapabilities::detect(false, true);
        assert!(check_capabilities(&with, &config).is_ok());
        assert!(check_capabilities(&without, &ForkConfig::default()).is_ok());
    }

    #[test]
    fn test_worker_that_exits_without_hello_is_a_crash() {
        let result = WorkerHandle::spawn(Path::new("/bin/true"), Duration::from_secs(5));
        assert!(matches!(result, Err(SupervisorError::WorkerCrashed(_))));
    }
}
