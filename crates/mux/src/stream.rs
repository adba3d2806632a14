//! Logical byte streams within a mux session.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::frame::{MuxFrame, StreamId, INITIAL_WINDOW, MAX_CHUNK_SIZE};

/// Buffer between a stream handle and its pumps.
pub(crate) const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Consumed bytes collected before credit is returned to the peer.
const WINDOW_UPDATE_THRESHOLD: usize = INITIAL_WINDOW as usize / 4;

/// One ordered, reliable, bidirectional byte stream.
///
/// Shutting down the write side sends a close to the peer, which then reads
/// end-of-stream. Dropping the stream closes both directions.
pub struct Stream {
    id: StreamId,
    io: DuplexStream,
}

impl Stream {
    pub(crate) fn new(id: StreamId, io: DuplexStream) -> Self {
        Self { id, io }
    }

    /// Identifier of this stream within its session.
    pub fn id(&self) -> StreamId {
        self.id
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Receive-side accounting for one stream.
///
/// Counts bytes the peer has sent that have not yet been credited back. A
/// peer that exceeds [`INITIAL_WINDOW`] is breaking the protocol.
#[derive(Debug, Default)]
pub(crate) struct RecvWindow {
    outstanding: AtomicUsize,
}

impl RecvWindow {
    /// Record `len` received bytes. Returns false if the peer overran its
    /// window.
    pub(crate) fn receive(&self, len: usize) -> bool {
        let outstanding = self.outstanding.fetch_add(len, Ordering::AcqRel) + len;
        outstanding <= INITIAL_WINDOW as usize
    }

    fn credit(&self, len: usize) {
        self.outstanding.fetch_sub(len, Ordering::AcqRel);
    }
}

/// Move bytes received from the peer into the stream handle.
///
/// Credit goes back to the peer only once bytes have been handed to the
/// handle, so a reader that stops reading stalls the peer's writer after one
/// window. Once the handle is dropped, data is discarded but still credited.
/// Ends when the peer closes the stream (the sender is dropped).
pub(crate) async fn pump_inbound(
    id: StreamId,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: WriteHalf<DuplexStream>,
    window: Arc<RecvWindow>,
    outbound: mpsc::Sender<MuxFrame>,
) {
    let mut handle_open = true;
    let mut consumed = 0usize;

    while let Some(data) = rx.recv().await {
        if handle_open && writer.write_all(&data).await.is_err() {
            trace!(stream_id = id, "stream handle dropped, discarding inbound data");
            handle_open = false;
        }

        consumed += data.len();
        if consumed >= WINDOW_UPDATE_THRESHOLD {
            window.credit(consumed);
            let credit = MuxFrame::Window {
                id,
                credit: consumed as u32,
            };
            if outbound.send(credit).await.is_err() {
                return;
            }
            consumed = 0;
        }
    }

    if handle_open {
        let _ = writer.shutdown().await;
    }
    trace!(stream_id = id, "inbound half closed");
}

/// Move bytes written to the stream handle out to the peer.
///
/// Each chunk waits for send credit before it is queued. Sends a close frame
/// once the handle shuts down or is dropped.
pub(crate) async fn pump_outbound(
    id: StreamId,
    mut reader: ReadHalf<DuplexStream>,
    outbound: mpsc::Sender<MuxFrame>,
    credit: Arc<Semaphore>,
    closed: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = closed.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        // n is at most MAX_CHUNK_SIZE, well inside one window.
        let permits = tokio::select! {
            _ = closed.cancelled() => return,
            permits = credit.acquire_many(n as u32) => permits,
        };
        match permits {
            Ok(permits) => permits.forget(),
            Err(_) => return,
        }

        let frame = MuxFrame::Data {
            id,
            data: Bytes::copy_from_slice(&buf[..n]),
        };
        if outbound.send(frame).await.is_err() {
            return;
        }
    }

    let _ = outbound.send(MuxFrame::Close { id }).await;
    trace!(stream_id = id, "outbound half closed");
}
