//! Process adapter.
//!
//! Starts the command named by a [`CommandDescriptor`] either attached to a
//! pseudo-terminal or to three pipes, and hands back the same
//! (stdin, stdout, stderr) triple in both cases. With a pty the terminal
//! carries both input and output and stderr is an empty, already-finished
//! reader.

use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use protocol::{CommandDescriptor, SENTINEL_EXIT_CODE, SIGNAL_EXIT_BASE};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::watch;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, trace, warn};

/// Rows of a freshly allocated terminal, before the client reports its size.
pub const DEFAULT_ROWS: u16 = 24;

/// Columns of a freshly allocated terminal.
pub const DEFAULT_COLS: u16 = 80;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Buffer between the blocking PTY pumps and the async side.
const PTY_PIPE_SIZE: usize = 64 * 1024;

/// Boxed async reader for process output.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed async writer for process input.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors that can occur while starting or controlling a process.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The descriptor does not name a runnable command.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The program could not be started.
    #[error("failed to start {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// The pseudo-terminal could not be allocated or wired up.
    #[error("failed to set up PTY: {0}")]
    Pty(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The process was started without a PTY.
    #[error("process {0} has no terminal")]
    NotATty(u32),

    /// Failed to kill the process.
    #[error("failed to kill process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal termination with a status code.
    Exited(i32),
    /// Terminated by the given signal number.
    Signaled(i32),
    /// The status could not be obtained.
    Unknown,
}

impl ExitOutcome {
    /// The exit code reported to the client.
    ///
    /// A signalled process reports `128 + signal`; an unobtainable status
    /// reports the sentinel code.
    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => code,
            ExitOutcome::Signaled(signal) if signal > 0 => SIGNAL_EXIT_BASE + signal,
            ExitOutcome::Signaled(_) | ExitOutcome::Unknown => SENTINEL_EXIT_CODE,
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(signal)) => ExitOutcome::Signaled(signal),
            (None, None) => ExitOutcome::Unknown,
        }
    }
}

/// The uniform I/O triple of a started process.
pub struct ProcessIo {
    /// Writes reach the process input. Shutting it down delivers EOF.
    pub stdin: BoxWriter,
    /// Process output.
    pub stdout: BoxReader,
    /// Process error output. Always empty in TTY mode.
    pub stderr: BoxReader,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo").finish_non_exhaustive()
    }
}

/// A running (or finished) child process.
///
/// The pty master is present only in TTY mode; the pipe triple lives in the
/// [`ProcessIo`] returned next to the handle.
pub struct ProcessHandle {
    pid: u32,
    pty: Option<Mutex<Box<dyn MasterPty + Send>>>,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("tty", &self.is_tty())
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

/// Start the command described by `descriptor`.
///
/// Must be called from within a tokio runtime.
pub fn start(descriptor: &CommandDescriptor) -> Result<(ProcessHandle, ProcessIo), ProcessError> {
    descriptor
        .validate()
        .map_err(|e| ProcessError::InvalidCommand(e.to_string()))?;
    for entry in descriptor.malformed_environment() {
        warn!(entry, "Dropping environment entry that is not KEY=VALUE");
    }

    let program = resolve_program(&descriptor.program)?;
    if descriptor.tty_requested {
        start_pty(descriptor, &program)
    } else {
        start_piped(descriptor, &program)
    }
}

/// Locate a bare program name on the server's `PATH`.
///
/// Names containing a path separator are used as given.
fn resolve_program(program: &str) -> Result<PathBuf, ProcessError> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(program));
    }

    which::which(program).map_err(|e| ProcessError::SpawnFailed {
        program: program.to_string(),
        reason: e.to_string(),
    })
}

fn start_piped(
    descriptor: &CommandDescriptor,
    program: &Path,
) -> Result<(ProcessHandle, ProcessIo), ProcessError> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(&descriptor.arguments)
        .env_clear()
        .envs(descriptor.environment_pairs())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if !descriptor.working_directory.is_empty() {
        cmd.current_dir(&descriptor.working_directory);
    }

    let spawn_failed = |reason: String| ProcessError::SpawnFailed {
        program: descriptor.program.clone(),
        reason,
    };

    let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| spawn_failed("process exited before its pid was read".to_string()))?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
        return Err(spawn_failed("standard pipes were not created".to_string()));
    };

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let outcome = match child.wait().await {
            Ok(status) => ExitOutcome::from(status),
            Err(e) => {
                warn!(pid, error = %e, "Failed to wait for process");
                ExitOutcome::Unknown
            }
        };
        debug!(pid, ?outcome, "Process exited");
        exit_tx.send_replace(Some(outcome));
    });

    let handle = ProcessHandle {
        pid,
        pty: None,
        exit: exit_rx,
    };
    let io = ProcessIo {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
    };
    Ok((handle, io))
}

fn start_pty(
    descriptor: &CommandDescriptor,
    program: &Path,
) -> Result<(ProcessHandle, ProcessIo), ProcessError> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ProcessError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(&descriptor.arguments);
    cmd.env_clear();
    for (key, value) in descriptor.environment_pairs() {
        cmd.env(key, value);
    }
    // Without an explicit directory the pty builder would pick $HOME.
    if !descriptor.working_directory.is_empty() {
        cmd.cwd(&descriptor.working_directory);
    } else if let Ok(dir) = std::env::current_dir() {
        cmd.cwd(dir);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ProcessError::SpawnFailed {
            program: descriptor.program.clone(),
            reason: e.to_string(),
        })?;
    // The child holds its own copy of the slave; ours would keep the
    // terminal open after the child exits.
    drop(pair.slave);

    let pid = child
        .process_id()
        .ok_or_else(|| ProcessError::Pty("spawned process has no pid".to_string()))?;
    // Reaped below through waitpid so a signal number is not lost.
    drop(child);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ProcessError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ProcessError::Pty(e.to_string()))?;

    let (stdout, stdout_bridge) = tokio::io::duplex(PTY_PIPE_SIZE);
    let stdout_bridge = SyncIoBridge::new(stdout_bridge);
    tokio::task::spawn_blocking(move || pump_pty_output(pid, reader, stdout_bridge));

    let (stdin, stdin_bridge) = tokio::io::duplex(PTY_PIPE_SIZE);
    let stdin_bridge = SyncIoBridge::new(stdin_bridge);
    tokio::task::spawn_blocking(move || pump_pty_input(pid, stdin_bridge, writer));

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::task::spawn_blocking(move || {
        let outcome = reap(pid);
        debug!(pid, ?outcome, "Process exited");
        exit_tx.send_replace(Some(outcome));
    });

    let handle = ProcessHandle {
        pid,
        pty: Some(Mutex::new(pair.master)),
        exit: exit_rx,
    };
    let io = ProcessIo {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(tokio::io::empty()),
    };
    Ok((handle, io))
}

/// Copy terminal output to the async side until the terminal closes.
///
/// Linux reports EIO on the master once the last slave descriptor is gone,
/// which is the normal end of a pty session.
fn pump_pty_output(
    pid: u32,
    mut reader: Box<dyn Read + Send>,
    mut out: SyncIoBridge<DuplexStream>,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if out.write_all(&buffer[..n]).is_err() {
                    trace!(pid, "PTY output consumer gone");
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => break,
            Err(e) => {
                warn!(pid, error = %e, "Error reading from PTY");
                break;
            }
        }
    }
    let _ = out.shutdown();
    trace!(pid, "PTY output finished");
}

/// Copy async input into the terminal until the input side closes.
///
/// Dropping the terminal writer sends end-of-file to the foreground process.
fn pump_pty_input(
    pid: u32,
    mut input: SyncIoBridge<DuplexStream>,
    mut writer: Box<dyn Write + Send>,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).and_then(|_| writer.flush()) {
                    trace!(pid, error = %e, "PTY input closed");
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    drop(writer);
    trace!(pid, "PTY input finished");
}

/// Block until `pid` terminates and collect its status.
fn reap(pid: u32) -> ExitOutcome {
    let Ok(raw) = i32::try_from(pid) else {
        return ExitOutcome::Unknown;
    };
    loop {
        match waitpid(Pid::from_raw(raw), None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitOutcome::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return ExitOutcome::Signaled(signal as i32),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(pid, error = %e, "Failed to wait for process");
                return ExitOutcome::Unknown;
            }
        }
    }
}

impl ProcessHandle {
    /// Returns the process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process runs on a pseudo-terminal.
    pub fn is_tty(&self) -> bool {
        self.pty.is_some()
    }

    /// Whether the process has terminated and been reaped.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the process to terminate.
    ///
    /// Safe to call from several tasks; each sees the same outcome.
    pub async fn wait(&self) -> ExitOutcome {
        let mut exit = self.exit.clone();
        let outcome = match exit.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(ExitOutcome::Unknown),
            Err(_) => ExitOutcome::Unknown,
        };
        outcome
    }

    /// Apply new terminal dimensions.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        let master = self.pty.as_ref().ok_or(ProcessError::NotATty(self.pid))?;
        master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::ResizeFailed(e.to_string()))?;

        debug!(pid = self.pid, rows, cols, "Resized PTY");
        Ok(())
    }

    /// Current terminal dimensions as `(rows, cols)`.
    pub fn size(&self) -> Result<(u16, u16), ProcessError> {
        let master = self.pty.as_ref().ok_or(ProcessError::NotATty(self.pid))?;
        let size = master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_size()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        Ok((size.rows, size.cols))
    }

    /// Forcibly terminate the process. A process that already exited is
    /// left alone.
    pub fn kill(&self) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Ok(());
        }

        let raw = i32::try_from(self.pid).map_err(|e| ProcessError::KillFailed {
            pid: self.pid,
            reason: e.to_string(),
        })?;
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::KillFailed {
                pid: self.pid,
                reason: e.to_string(),
            }),
        }
    }

    /// Kill the process if it is still running and wait for it to be reaped.
    pub async fn terminate(&self) -> ExitOutcome {
        if let Err(e) = self.kill() {
            warn!(pid = self.pid, error = %e, "Failed to kill process");
        }
        self.wait().await
    }
}
