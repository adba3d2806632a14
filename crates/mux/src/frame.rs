//! Mux frames carried inside protocol frames.
//!
//! # Payload Format
//!
//! ```text
//! [kind:1][stream_id:4 BE][data...]
//! ```
//!
//! - `KIND_OPEN` (0x01): opener → acceptor, empty data
//! - `KIND_DATA` (0x02): either direction, raw bytes
//! - `KIND_CLOSE` (0x03): either direction, the sender will write no more
//! - `KIND_WINDOW` (0x04): either direction, data is a 4 byte BE credit the
//!   receiver of the frame may add to its send window for the stream

use bytes::Bytes;
use protocol::Frame;

use crate::error::{MuxError, Result};

/// Frame kind: open a new stream.
pub const KIND_OPEN: u8 = 0x01;

/// Frame kind: stream data.
pub const KIND_DATA: u8 = 0x02;

/// Frame kind: half-close a stream.
pub const KIND_CLOSE: u8 = 0x03;

/// Frame kind: grant send credit on a stream.
pub const KIND_WINDOW: u8 = 0x04;

/// Bytes a peer may have outstanding on one stream before it waits for
/// credit.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Size of the kind byte plus the stream id.
pub const MUX_HEADER_SIZE: usize = 5;

/// Largest data chunk placed in one frame.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// Identifier of a logical stream within one session.
pub type StreamId = u32;

/// A single multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    /// Open stream `id`.
    Open { id: StreamId },
    /// Bytes for stream `id`.
    Data { id: StreamId, data: Bytes },
    /// The sender has finished writing stream `id`.
    Close { id: StreamId },
    /// The sender consumed `credit` bytes of stream `id`; the receiver may
    /// send that many more.
    Window { id: StreamId, credit: u32 },
}

impl MuxFrame {
    /// The stream this frame belongs to.
    pub fn stream_id(&self) -> StreamId {
        match self {
            MuxFrame::Open { id }
            | MuxFrame::Data { id, .. }
            | MuxFrame::Close { id }
            | MuxFrame::Window { id, .. } => *id,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            MuxFrame::Open { .. } => KIND_OPEN,
            MuxFrame::Data { .. } => KIND_DATA,
            MuxFrame::Close { .. } => KIND_CLOSE,
            MuxFrame::Window { .. } => KIND_WINDOW,
        }
    }

    /// Build the protocol frame carrying this mux frame.
    pub fn to_frame(&self) -> Frame {
        let data_len = match self {
            MuxFrame::Data { data, .. } => data.len(),
            MuxFrame::Window { .. } => 4,
            _ => 0,
        };

        let mut payload = Vec::with_capacity(MUX_HEADER_SIZE + data_len);
        payload.push(self.kind());
        payload.extend_from_slice(&self.stream_id().to_be_bytes());
        match self {
            MuxFrame::Data { data, .. } => payload.extend_from_slice(data),
            MuxFrame::Window { credit, .. } => payload.extend_from_slice(&credit.to_be_bytes()),
            MuxFrame::Open { .. } | MuxFrame::Close { .. } => {}
        }
        Frame::new(payload)
    }

    /// Parse a mux frame out of a protocol frame.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let payload = frame.payload;
        if payload.len() < MUX_HEADER_SIZE {
            return Err(MuxError::InvalidFrame(format!(
                "payload of {} bytes is shorter than the {} byte header",
                payload.len(),
                MUX_HEADER_SIZE
            )));
        }

        let id = StreamId::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        match payload[0] {
            KIND_OPEN => Ok(MuxFrame::Open { id }),
            KIND_CLOSE => Ok(MuxFrame::Close { id }),
            KIND_DATA => {
                let data = Bytes::from(payload).slice(MUX_HEADER_SIZE..);
                Ok(MuxFrame::Data { id, data })
            }
            KIND_WINDOW => match payload[MUX_HEADER_SIZE..] {
                [a, b, c, d] => Ok(MuxFrame::Window {
                    id,
                    credit: u32::from_be_bytes([a, b, c, d]),
                }),
                _ => Err(MuxError::InvalidFrame(format!(
                    "window frame for stream {} carries {} bytes, expected 4",
                    id,
                    payload.len() - MUX_HEADER_SIZE
                ))),
            },
            other => Err(MuxError::InvalidFrame(format!(
                "unknown frame kind 0x{:02x} for stream {}",
                other, id
            ))),
        }
    }
}
