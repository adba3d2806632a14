//! Local terminal handling for TTY sessions.

use std::io;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use protocol::ResizeEvent;
use tokio::io::AsyncWrite;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::session::rpc::ResizeSender;

/// Puts the terminal in raw mode and restores it when dropped, including
/// during a panic unwind.
#[derive(Debug)]
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Enable raw mode on the controlling terminal.
    pub fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        debug!("Terminal switched to raw mode");
        Ok(Self { active: true })
    }

    /// Restore the previous terminal mode now.
    pub fn restore(mut self) -> io::Result<()> {
        self.active = false;
        disable_raw_mode()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = disable_raw_mode();
        }
    }
}

/// Current local terminal size as a resize event.
pub fn current_size() -> io::Result<ResizeEvent> {
    let (columns, rows) = size()?;
    Ok(ResizeEvent::new(rows, columns))
}

/// Keeps interrupt and stop signals from terminating the client while a
/// remote terminal session runs. Keystrokes like Ctrl-C travel to the
/// remote process as bytes instead.
///
/// SIGSTOP cannot be caught, so SIGTSTP (terminal stop) stands in for it.
#[derive(Debug)]
pub struct SignalSuppressor {
    tasks: Vec<JoinHandle<()>>,
}

impl SignalSuppressor {
    /// Start swallowing SIGINT, SIGQUIT and SIGTSTP.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start() -> io::Result<Self> {
        let kinds = [
            ("SIGINT", SignalKind::interrupt()),
            ("SIGQUIT", SignalKind::quit()),
            ("SIGTSTP", SignalKind::from_raw(nix::libc::SIGTSTP)),
        ];

        let mut tasks = Vec::with_capacity(kinds.len());
        for (name, kind) in kinds {
            let mut stream = signal(kind)?;
            tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    trace!(signal = name, "Ignoring signal during terminal session");
                }
            }));
        }
        Ok(Self { tasks })
    }
}

impl Drop for SignalSuppressor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Report the local terminal size now and after every window change.
///
/// Runs until sending fails, which happens once the session is gone.
pub async fn forward_resizes<W>(sender: &mut ResizeSender<W>)
where
    W: AsyncWrite + Unpin,
{
    let mut window_changes = match signal(SignalKind::window_change()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to watch terminal resizes");
            return;
        }
    };

    loop {
        match current_size() {
            Ok(event) => {
                if let Err(e) = sender.send(event).await {
                    debug!(error = %e, "Stopped forwarding resizes");
                    break;
                }
            }
            Err(e) => debug!(error = %e, "Failed to read terminal size"),
        }

        if window_changes.recv().await.is_none() {
            break;
        }
    }
}
