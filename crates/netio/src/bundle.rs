//! The fixed set of five logical streams a session runs over.
//!
//! Streams are correlated by creation order alone, so both ends go through
//! the single routine below and never open or accept streams one by one.

use mux::{MuxError, Session, Stream};
use tracing::trace;

/// The five logical streams of one command session.
#[derive(Debug)]
pub struct StreamBundle {
    /// Descriptor in, exit code out, then drained until the client closes.
    pub command: Stream,
    /// Resize notifications from the client.
    pub rpc: Stream,
    /// Client input for the process.
    pub stdin: Stream,
    /// Process output.
    pub stdout: Stream,
    /// Process error output.
    pub stderr: Stream,
}

impl StreamBundle {
    /// Open the bundle from the client side.
    pub async fn open(session: &Session) -> Result<Self, MuxError> {
        Self::establish(session, Side::Open).await
    }

    /// Accept the bundle on the server side.
    pub async fn accept(session: &Session) -> Result<Self, MuxError> {
        Self::establish(session, Side::Accept).await
    }

    async fn establish(session: &Session, side: Side) -> Result<Self, MuxError> {
        // Order is the protocol: command, rpc, stdin, stdout, stderr.
        let command = side.next(session).await?;
        let rpc = side.next(session).await?;
        let stdin = side.next(session).await?;
        let stdout = side.next(session).await?;
        let stderr = side.next(session).await?;

        trace!(?side, "stream bundle established");
        Ok(Self {
            command,
            rpc,
            stdin,
            stdout,
            stderr,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Open,
    Accept,
}

impl Side {
    async fn next(self, session: &Session) -> Result<Stream, MuxError> {
        match self {
            Side::Open => session.open_stream().await,
            Side::Accept => session.accept_stream().await,
        }
    }
}
