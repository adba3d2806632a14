//! # netio Stream Multiplexer
//!
//! Carries many ordered, independent byte streams over one connection.
//!
//! Each stream implements [`tokio::io::AsyncRead`] and
//! [`tokio::io::AsyncWrite`]. Shutting down a stream's write side delivers
//! end-of-stream to the peer while the other direction stays usable. The
//! acceptor sees streams in exactly the order the opener created them.
//!
//! ```rust,no_run
//! use mux::{Role, Session};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn run(tcp: tokio::net::TcpStream) -> mux::Result<()> {
//! let session = Session::new(tcp, Role::Client);
//! let mut stream = session.open_stream().await?;
//! stream.write_all(b"hello").await.ok();
//! stream.shutdown().await.ok();
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod frame;
pub mod session;
pub mod stream;

pub use error::{MuxError, Result};
pub use frame::{MuxFrame, StreamId};
pub use session::{Role, Session};
pub use stream::Stream;
