//! Mux session: many logical streams over one connection.
//!
//! A session owns two background tasks. The read loop decodes frames from the
//! connection and routes them to streams; the write loop serializes frames
//! queued by every stream onto the connection. Frames for a stream are queued
//! in order, so each stream preserves byte order end to end.
//!
//! Each direction of a stream has a credit window of [`INITIAL_WINDOW`]
//! bytes. A writer waits once it has that much unacknowledged data in flight;
//! the receiver returns credit as its reader consumes. A slow reader stalls
//! only its own stream's writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use protocol::{read_frame, write_frame, FrameCodec};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{MuxError, Result};
use crate::frame::{MuxFrame, StreamId, INITIAL_WINDOW};
use crate::stream::{pump_inbound, pump_outbound, RecvWindow, Stream, STREAM_BUFFER_SIZE};

/// Frames queued for the connection before writers wait.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Which end of the connection a session sits on.
///
/// Determines the stream id space so both ends can open streams without
/// colliding: clients use odd ids, servers even ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Per-stream routing state.
struct Slot {
    /// Present until the peer closes its write side.
    inbound: Option<Inbound>,
    /// Send credit, alive while the local outbound pump runs.
    credit: Weak<Semaphore>,
}

struct Inbound {
    tx: mpsc::UnboundedSender<Bytes>,
    window: Arc<RecvWindow>,
}

impl Slot {
    fn is_finished(&self) -> bool {
        self.inbound.is_none() && self.credit.strong_count() == 0
    }
}

struct Shared {
    streams: Mutex<HashMap<StreamId, Slot>>,
    outbound: mpsc::Sender<MuxFrame>,
    closed: CancellationToken,
}

impl Shared {
    /// Register stream `id` and start its pumps.
    fn attach(&self, id: StreamId) -> Stream {
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (remote_read, remote_write) = tokio::io::split(remote);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let window = Arc::new(RecvWindow::default());
        let credit = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));

        self.streams.lock().unwrap_or_else(PoisonError::into_inner).insert(
            id,
            Slot {
                inbound: Some(Inbound {
                    tx: inbound_tx,
                    window: Arc::clone(&window),
                }),
                credit: Arc::downgrade(&credit),
            },
        );

        tokio::spawn(pump_inbound(
            id,
            inbound_rx,
            remote_write,
            window,
            self.outbound.clone(),
        ));
        tokio::spawn(pump_outbound(
            id,
            remote_read,
            self.outbound.clone(),
            credit,
            self.closed.clone(),
        ));

        Stream::new(id, local)
    }

    /// Route one frame from the peer. Errors are protocol violations.
    fn dispatch(&self, frame: MuxFrame, accept_tx: &mpsc::UnboundedSender<Stream>) -> Result<()> {
        match frame {
            MuxFrame::Open { id } => {
                if self.is_known(id) {
                    warn!(stream_id = id, "peer reopened an active stream, ignoring");
                    return Ok(());
                }
                trace!(stream_id = id, "peer opened stream");
                let stream = self.attach(id);
                if accept_tx.send(stream).is_err() {
                    debug!(stream_id = id, "no acceptor for stream, dropping it");
                }
            }
            MuxFrame::Data { id, data } => {
                let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(slot) = streams.get_mut(&id) else {
                    trace!(stream_id = id, "data for unknown stream, discarding");
                    return Ok(());
                };
                let Some(inbound) = &slot.inbound else {
                    trace!(stream_id = id, "data after close, discarding");
                    return Ok(());
                };
                if !inbound.window.receive(data.len()) {
                    return Err(MuxError::InvalidFrame(format!(
                        "peer overran the receive window of stream {id}"
                    )));
                }
                if inbound.tx.send(data).is_err() {
                    slot.inbound = None;
                }
            }
            MuxFrame::Close { id } => {
                trace!(stream_id = id, "peer closed stream");
                let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(slot) = streams.get_mut(&id) {
                    slot.inbound = None;
                    if slot.is_finished() {
                        streams.remove(&id);
                    }
                }
            }
            MuxFrame::Window { id, credit } => {
                let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(slot) = streams.get(&id) else {
                    return Ok(());
                };
                if let Some(semaphore) = slot.credit.upgrade() {
                    // An honest peer never credits beyond one window.
                    let room =
                        (INITIAL_WINDOW as usize).saturating_sub(semaphore.available_permits());
                    semaphore.add_permits((credit as usize).min(room));
                } else if slot.is_finished() {
                    streams.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn is_known(&self, id: StreamId) -> bool {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Mark the session closed and end every stream's inbound half.
    fn shutdown(&self) {
        self.closed.cancel();
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A multiplexed session over one connection.
///
/// Streams are accepted in the order the peer opened them. Closing or
/// dropping the session ends every stream; the connection closing ends the
/// session.
pub struct Session {
    shared: Arc<Shared>,
    next_id: AtomicU32,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
}

impl Session {
    /// Start a session over `io`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(io: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, outbound_rx, shared.closed.clone()));
        tokio::spawn(read_loop(reader, Arc::clone(&shared), accept_tx));

        Self {
            shared,
            next_id: AtomicU32::new(role.first_stream_id()),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Open a new stream to the peer.
    pub async fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.attach(id);
        self.shared
            .outbound
            .send(MuxFrame::Open { id })
            .await
            .map_err(|_| MuxError::SessionClosed)?;

        trace!(stream_id = id, "opened stream");
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx.recv().await.ok_or(MuxError::SessionClosed)
    }

    /// Close the session and the connection beneath it.
    ///
    /// Frames already queued are still written before the connection shuts
    /// down.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the session has ended, for any reason.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<Stream>,
) where
    R: AsyncRead + Unpin,
{
    let codec = FrameCodec::without_compression();
    loop {
        let result = tokio::select! {
            _ = shared.closed.cancelled() => break,
            result = read_frame(&mut reader, &codec) => result,
        };

        match result {
            Ok(Some(frame)) => match MuxFrame::from_frame(frame)
                .and_then(|frame| shared.dispatch(frame, &accept_tx))
            {
                Ok(()) => {}
                Err(e) => {
                    warn!(error = %e, "protocol violation from peer, closing session");
                    break;
                }
            },
            Ok(None) => {
                debug!("connection closed by peer");
                break;
            }
            Err(e) if e.is_closed() => {
                debug!(error = %e, "connection lost");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to read frame, closing session");
                break;
            }
        }
    }

    shared.shutdown();
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<MuxFrame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let codec = FrameCodec::without_compression();
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = closed.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = write_frame(&mut writer, &codec, &frame.to_frame()).await {
            debug!(error = %e, "failed to write frame, closing session");
            break;
        }
    }

    closed.cancel();
    let _ = writer.shutdown().await;
}
