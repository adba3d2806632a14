//! Resize side-channel.
//!
//! The client sends [`ResizeEvent`]s wrapped in [`RpcEnvelope`]s; the server
//! applies them to the pty of a TTY session. Nothing is acknowledged.

use protocol::{MessageStream, ResizeEvent, RpcEnvelope, RpcMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::process::ProcessHandle;

/// Decode the rpc stream and apply resize events until it closes.
///
/// Events that arrive before the listener starts wait in the stream. An
/// undecodable message ends the listener without touching the rest of the
/// session. Returns the number of resizes applied.
pub async fn listen<R>(rpc: R, process: &ProcessHandle) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut rpc = MessageStream::new(rpc);
    let mut applied = 0;

    loop {
        let envelope: RpcEnvelope = match rpc.recv().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                trace!("RPC stream closed");
                break;
            }
            Err(e) => {
                debug!(error = %e, "RPC stream unreadable, stopping listener");
                break;
            }
        };

        match RpcMessage::from_envelope(&envelope) {
            Ok(RpcMessage::Resize(event)) => {
                if !process.is_tty() {
                    trace!(?event, "Ignoring resize for a process without a terminal");
                    continue;
                }
                match process.resize(event.rows, event.columns) {
                    Ok(()) => applied += 1,
                    Err(e) => warn!(error = %e, "Failed to apply resize"),
                }
            }
            Ok(RpcMessage::Unknown(kind)) => {
                debug!(kind = %kind, "Skipping unknown RPC message");
            }
            Err(e) => {
                debug!(error = %e, "Malformed RPC message, stopping listener");
                break;
            }
        }
    }

    applied
}

/// Client end of the side-channel.
#[derive(Debug)]
pub struct ResizeSender<W> {
    stream: MessageStream<W>,
}

impl<W: AsyncWrite + Unpin> ResizeSender<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream: MessageStream::new(stream),
        }
    }

    /// Send one resize event.
    pub async fn send(&mut self, event: ResizeEvent) -> protocol::Result<()> {
        let envelope = RpcMessage::Resize(event).to_envelope()?;
        self.stream.send(&envelope).await
    }

    /// Close the side-channel.
    pub async fn close(&mut self) -> protocol::Result<()> {
        self.stream.shutdown().await
    }
}
