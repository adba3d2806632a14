//! Client driver.
//!
//! Mirror of the server session: open the stream bundle, send the command,
//! relay local stdio until the remote output is exhausted, read the exit code
//! and close the connection. Closing is what releases the server, which
//! waits for it before tearing anything down.

pub mod terminal;

use anyhow::{Context, Result};
use mux::Role;
use protocol::{CommandDescriptor, ExitStatusReport, MessageStream, SENTINEL_EXIT_CODE};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::bundle::StreamBundle;
use crate::session::process::{BoxReader, BoxWriter, ProcessIo};
use crate::session::relay::{self, Consumer};
use crate::session::rpc::ResizeSender;
use terminal::{RawModeGuard, SignalSuppressor};

/// Everything the client needs to run one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Server address.
    pub addr: String,
    /// Allocate a pseudo-terminal on the server.
    pub tty: bool,
    /// Request stream compression.
    pub compress: bool,
    /// Remote working directory; empty for the server's default.
    pub working_directory: String,
    /// `KEY=VALUE` environment for the remote command.
    pub environment: Vec<String>,
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

impl ClientOptions {
    /// Build the descriptor sent to the server.
    pub fn descriptor(&self) -> CommandDescriptor {
        let (program, arguments) = match self.command.split_first() {
            Some((program, arguments)) => (program.clone(), arguments.to_vec()),
            None => (String::new(), Vec::new()),
        };

        let mut descriptor = CommandDescriptor::new(program, arguments)
            .with_environment(self.environment.iter().cloned())
            .with_working_directory(self.working_directory.clone())
            .with_tty(self.tty);
        descriptor.compress = self.compress;
        descriptor
    }
}

/// The local end of the relay.
pub struct LocalIo {
    pub stdin: BoxReader,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
}

impl LocalIo {
    /// The process's own standard streams.
    pub fn stdio() -> Self {
        Self {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }
}

impl std::fmt::Debug for LocalIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIo").finish_non_exhaustive()
    }
}

/// Client side of one remote command.
#[derive(Debug)]
pub struct Client {
    options: ClientOptions,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    /// Run the command against the process's own terminal.
    ///
    /// Returns the remote exit code.
    pub async fn run(&self) -> Result<i32> {
        self.run_with(LocalIo::stdio()).await
    }

    /// Run the command relaying to `local`.
    ///
    /// Failing to connect or to set up the session is an error. Once the
    /// command is under way, a missing exit code yields the sentinel code.
    pub async fn run_with(&self, local: LocalIo) -> Result<i32> {
        let descriptor = self.options.descriptor();
        descriptor.validate().context("Nothing to run")?;

        let stream = TcpStream::connect(&self.options.addr)
            .await
            .with_context(|| format!("Failed to connect to {}", self.options.addr))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to disable Nagle's algorithm");
        }

        let transport = mux::Session::new(stream, Role::Client);
        let StreamBundle {
            command,
            rpc,
            stdin,
            stdout,
            stderr,
        } = StreamBundle::open(&transport)
            .await
            .context("Failed to open session streams")?;

        let mut command = MessageStream::new(command);
        command
            .send(&descriptor)
            .await
            .context("Failed to send command")?;
        info!(command = ?descriptor.command_line(), tty = descriptor.tty_requested, "Command sent");

        let mut terminal = None;
        let mut resizes = None;
        if descriptor.tty_requested {
            let suppressor = SignalSuppressor::start().context("Failed to install signal handlers")?;
            let guard = RawModeGuard::enable().context("Failed to switch terminal to raw mode")?;
            terminal = Some((guard, suppressor));

            resizes = Some(tokio::spawn(async move {
                let mut sender = ResizeSender::new(rpc);
                terminal::forward_resizes(&mut sender).await;
            }));
        } else {
            drop(rpc);
        }

        let remote = ProcessIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        };
        let consumer = Consumer {
            stdin: local.stdin,
            stdout: local.stdout,
            stderr: local.stderr,
        };
        let stats = relay::relay(remote, consumer).await;
        debug!(?stats, "Remote output exhausted");

        let code = match command.recv::<ExitStatusReport>().await {
            Ok(Some(report)) => report.code,
            Ok(None) => {
                error!("Connection closed before the exit code arrived");
                SENTINEL_EXIT_CODE
            }
            Err(e) => {
                error!(error = %e, "Failed to read exit code");
                SENTINEL_EXIT_CODE
            }
        };

        // Everything has been read; closing lets the server finish.
        transport.close();
        if let Some(task) = resizes {
            task.abort();
        }
        if let Some((guard, suppressor)) = terminal {
            drop(suppressor);
            if let Err(e) = guard.restore() {
                debug!(error = %e, "Failed to restore terminal mode");
            }
        }

        debug!(code, "Remote command finished");
        Ok(code)
    }
}
