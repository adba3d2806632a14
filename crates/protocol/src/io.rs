//! Async frame and message I/O over byte streams.
//!
//! Frames are read incrementally: the 8-byte prefix is validated before the
//! body is read, so an oversized length is rejected without buffering it.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::framing::{parse_prefix, Frame, FrameCodec, FRAME_PREFIX_SIZE};
use crate::messages::{from_msgpack, to_msgpack};

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, codec: &FrameCodec) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; FRAME_PREFIX_SIZE];
    let mut filled = 0;
    while filled < FRAME_PREFIX_SIZE {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::ConnectionClosed(format!(
                "stream ended inside a frame header ({} of {} bytes)",
                filled, FRAME_PREFIX_SIZE
            )));
        }
        filled += n;
    }

    let content_len = parse_prefix(&prefix)?;
    let mut content = vec![0u8; content_len];
    reader.read_exact(&mut content).await?;

    codec.decode_content(&content).map(Some)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, codec: &FrameCodec, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = codec.encode(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// A byte stream carrying MessagePack messages, one per frame.
#[derive(Debug)]
pub struct MessageStream<S> {
    inner: S,
    codec: FrameCodec,
}

impl<S> MessageStream<S> {
    /// Wrap a stream using the default (compressing) codec.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            codec: FrameCodec::new(),
        }
    }
}

impl<S: AsyncWrite + Unpin> MessageStream<S> {
    /// Encode and send one message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let frame = Frame::new(to_msgpack(message)?);
        write_frame(&mut self.inner, &self.codec, &frame).await
    }

    /// Signal end-of-stream to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> MessageStream<S> {
    /// Receive and decode one message. `Ok(None)` means the peer closed the stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match read_frame(&mut self.inner, &self.codec).await? {
            Some(frame) => from_msgpack(&frame.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Read and discard everything until the peer closes the stream.
    ///
    /// Returns the number of bytes discarded. A reset or aborted stream
    /// counts as closed.
    pub async fn drain(&mut self) -> Result<u64> {
        match tokio::io::copy(&mut self.inner, &mut tokio::io::sink()).await {
            Ok(n) => Ok(n),
            Err(err) => match ProtocolError::from(err) {
                ProtocolError::ConnectionClosed(_) => Ok(0),
                other => Err(other),
            },
        }
    }
}
