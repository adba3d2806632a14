//! # netio Protocol Library
//!
//! Wire definitions shared by the netio client and server.
//!
//! ## Overview
//!
//! - **Message Definitions**: the command descriptor, the exit status report
//!   and the forward-compatible RPC envelope
//! - **Frame Codec**: length-prefixed framing with optional LZ4 compression
//! - **Async I/O**: reading and writing frames and messages on any tokio stream
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │        Logical stream (mux)             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{CommandDescriptor, MessageStream};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let (client, server) = tokio::io::duplex(4096);
//! let mut client = MessageStream::new(client);
//! let mut server = MessageStream::new(server);
//!
//! let descriptor = CommandDescriptor::new("echo", ["hello"]);
//! client.send(&descriptor).await.unwrap();
//! let decoded: CommandDescriptor = server.recv().await.unwrap().unwrap();
//! assert_eq!(decoded, descriptor);
//! # });
//! ```

pub mod error;
pub mod framing;
pub mod io;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    FRAME_PREFIX_SIZE, MAX_FRAME_SIZE,
};
pub use io::{read_frame, write_frame, MessageStream};
pub use messages::{
    CommandDescriptor, ExitStatusReport, ResizeEvent, RpcEnvelope, RpcMessage, PROTOCOL_VERSION,
    SENTINEL_EXIT_CODE, SIGNAL_EXIT_BASE,
};
