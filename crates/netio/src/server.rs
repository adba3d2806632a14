//! Connection dispatcher.
//!
//! Accepts TCP connections and runs one [`Session`] per connection on its own
//! task. A panic while serving one connection is logged and contained; the
//! accept loop and the other connections carry on. Failing to bind or to
//! accept is fatal.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::session::Session;

/// Listening side of netio.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
}

impl Server {
    /// Bind the listener.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {addr}"))?;
        Ok(Self { listener })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until accepting fails.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Listening");
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("Failed to accept connection")?;
            spawn_connection(stream, peer);
        }
    }
}

/// Serve one connection on a supervised task.
///
/// The returned handle completes when the connection is done, whether the
/// session finished, failed, or panicked.
pub fn spawn_connection(stream: TcpStream, peer: SocketAddr) -> JoinHandle<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Failed to disable Nagle's algorithm");
    }

    let session = Session::new(stream);
    let span = info_span!("session", id = %session.id(), %peer);
    supervise(serve(session), span)
}

/// Run `task` on its own task and contain any panic it raises.
fn supervise<F>(task: F, span: Span) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let worker = tokio::spawn(task.instrument(span.clone()));

    tokio::spawn(
        async move {
            match worker.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => error!("Session panicked, connection dropped"),
                Err(e) => warn!(error = %e, "Session task cancelled"),
            }
        }
        .instrument(span),
    )
}

async fn serve(mut session: Session) {
    info!("Connection accepted");
    match session.run().await {
        Ok(report) => info!(
            exit_code = report.exit_code,
            orphaned = report.orphaned,
            "Connection closed"
        ),
        Err(e) => warn!(error = %e, "Connection dropped"),
    }
}
