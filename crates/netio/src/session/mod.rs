//! Server-side command session.
//!
//! One session serves one connection and runs exactly one command:
//!
//! ```text
//! Accepting → Decoding → Starting → Running → Draining → Closed
//! ```
//!
//! After the exit code is sent the session keeps reading the command stream
//! until the client closes it. The client only does that once it has read all
//! output and the exit code, so nothing is torn down underneath it.

pub mod process;
pub mod relay;
pub mod rpc;

use std::sync::Arc;

use mux::{MuxError, Role};
use protocol::{CommandDescriptor, ExitStatusReport, MessageStream, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle::StreamBundle;
use process::{ExitOutcome, ProcessError};
use relay::Consumer;

pub use process::{ProcessHandle, ProcessIo};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that end a session before an exit code could be reported.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The stream bundle could not be established.
    #[error("failed to establish streams: {0}")]
    Transport(#[from] MuxError),

    /// The command descriptor could not be decoded.
    #[error("failed to decode command: {0}")]
    Decode(#[source] ProtocolError),

    /// The client closed the command stream without sending a command.
    #[error("client sent no command")]
    NoCommand,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepting,
    Decoding,
    Starting,
    Running,
    Draining,
    Closed,
}

/// What happened to the command of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    /// Process ID, if the command started.
    pub pid: Option<u32>,
    /// Exit code sent (or due) to the client.
    pub exit_code: i32,
    /// The client went away while the command was running and it was killed.
    pub orphaned: bool,
}

/// A server-side session over one connection.
pub struct Session {
    id: SessionId,
    transport: mux::Session,
    state: SessionState,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl Session {
    /// Wrap an accepted connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            transport: mux::Session::new(io, Role::Server),
            state: SessionState::Accepting,
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "Session state change");
        self.state = state;
    }

    /// Serve the connection to completion.
    ///
    /// The connection is closed when this returns, whatever the outcome.
    pub async fn run(&mut self) -> Result<SessionReport, SessionError> {
        let result = self.serve().await;
        self.transport.close();
        self.transition(SessionState::Closed);
        result
    }

    async fn serve(&mut self) -> Result<SessionReport, SessionError> {
        let StreamBundle {
            command,
            rpc,
            stdin,
            stdout,
            mut stderr,
        } = StreamBundle::accept(&self.transport).await?;

        self.transition(SessionState::Decoding);
        let mut command = MessageStream::new(command);
        let descriptor: CommandDescriptor = command
            .recv()
            .await
            .map_err(SessionError::Decode)?
            .ok_or(SessionError::NoCommand)?;

        info!(
            program = %descriptor.program,
            args = ?descriptor.arguments,
            tty = descriptor.tty_requested,
            compress = descriptor.compress,
            "Command received"
        );

        self.transition(SessionState::Starting);
        let (process, io) = match process::start(&descriptor) {
            Ok(started) => started,
            Err(e) => {
                warn!(error = %e, "Failed to start command");
                report_start_failure(&e, stdout, &mut stderr).await;
                let exit_code = ExitStatusReport::sentinel().code;
                self.drain(&mut command, exit_code).await;
                return Ok(SessionReport {
                    pid: None,
                    exit_code,
                    orphaned: false,
                });
            }
        };

        let process = Arc::new(process);
        let pid = process.pid();
        info!(pid, "Process started");

        self.transition(SessionState::Running);
        let consumer = Consumer {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        };
        tokio::spawn(relay::relay(io, consumer));
        tokio::spawn({
            let process = Arc::clone(&process);
            async move {
                let applied = rpc::listen(rpc, &process).await;
                debug!(applied, "Resize listener finished");
            }
        });

        let mut orphaned = false;
        let outcome = tokio::select! {
            outcome = process.wait() => outcome,
            _ = self.transport.closed() => {
                warn!(pid, "Client disconnected while the process was running, killing it");
                orphaned = true;
                process.terminate().await
            }
        };

        let exit_code = outcome.code();
        match outcome {
            ExitOutcome::Exited(_) => info!(pid, exit_code, "Process exited"),
            _ => info!(pid, exit_code, ?outcome, "Process ended abnormally"),
        }

        if !orphaned {
            self.drain(&mut command, exit_code).await;
        }

        Ok(SessionReport {
            pid: Some(pid),
            exit_code,
            orphaned,
        })
    }

    /// Send the exit code, then wait for the client to close the command
    /// stream.
    async fn drain<S>(&mut self, command: &mut MessageStream<S>, exit_code: i32)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(SessionState::Draining);

        if let Err(e) = command.send(&ExitStatusReport::new(exit_code)).await {
            warn!(error = %e, "Failed to send exit code");
            return;
        }

        match command.drain().await {
            Ok(trailing) => debug!(trailing, "Client closed the command stream"),
            Err(e) => debug!(error = %e, "Command stream ended with error"),
        }
    }
}

/// Tell the client why nothing runs: the reason on stderr, then EOF on both
/// output streams.
async fn report_start_failure<O, E>(error: &ProcessError, mut stdout: O, stderr: &mut E)
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let message = format!("netio: {error}\n");
    if let Err(e) = stderr.write_all(message.as_bytes()).await {
        debug!(error = %e, "Failed to report start failure");
    }
    let _ = stderr.shutdown().await;
    let _ = stdout.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::StreamBundle;
    use protocol::CommandDescriptor;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    fn connected() -> (mux::Session, Session) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = mux::Session::new(client_io, Role::Client);
        (client, Session::new(server_io))
    }

    #[tokio::test]
    async fn test_full_exchange() {
        let (client, mut server) = connected();
        assert_eq!(server.state(), SessionState::Accepting);
        assert_eq!(server.id().len(), 36);

        let server_task = tokio::spawn(async move {
            let report = server.run().await;
            (report, server.state())
        });

        let bundle = StreamBundle::open(&client).await.unwrap();
        let mut command = MessageStream::new(bundle.command);
        command
            .send(&CommandDescriptor::new("sh", ["-c", "printf out; printf err >&2; exit 4"]))
            .await
            .unwrap();

        let mut stdout = bundle.stdout;
        let mut stderr = bundle.stderr;
        let mut out = String::new();
        let mut err = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        stderr.read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "out");
        assert_eq!(err, "err");

        let report: ExitStatusReport = command.recv().await.unwrap().unwrap();
        assert_eq!(report.code, 4);

        client.close();
        let (report, state) = timeout(Duration::from_secs(10), server_task)
            .await
            .unwrap()
            .unwrap();
        let report = report.unwrap();
        assert_eq!(report.exit_code, 4);
        assert!(!report.orphaned);
        assert_eq!(state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_undecodable_command_drops_connection() {
        let (client, mut server) = connected();
        let server_task = tokio::spawn(async move { server.run().await });

        let mut bundle = StreamBundle::open(&client).await.unwrap();
        bundle.command.write_all(b"NTIO\0\0\0\x02\0\xc1").await.unwrap();

        let result = timeout(Duration::from_secs(10), server_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SessionError::Decode(_))));
        timeout(Duration::from_secs(10), client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_gone_before_bundle() {
        let (client, mut server) = connected();
        drop(client);

        let result = timeout(Duration::from_secs(10), server.run()).await.unwrap();
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(server.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_empty_program_reports_sentinel() {
        let (client, mut server) = connected();
        let server_task = tokio::spawn(async move { server.run().await });

        let bundle = StreamBundle::open(&client).await.unwrap();
        let mut command = MessageStream::new(bundle.command);
        command.send(&CommandDescriptor::default()).await.unwrap();

        let mut stderr = bundle.stderr;
        let mut err = String::new();
        stderr.read_to_string(&mut err).await.unwrap();
        assert!(err.contains("program name is empty"), "stderr was {err:?}");

        let report: ExitStatusReport = command.recv().await.unwrap().unwrap();
        assert_eq!(report, ExitStatusReport::sentinel());

        client.close();
        let report = server_task.await.unwrap().unwrap();
        assert_eq!(report.pid, None);
    }
}
