//! # netio
//!
//! Run a command on another host as if it were local: its output streams
//! back, local input goes to it, and the client exits with its exit code.
//!
//! ## Architecture
//!
//! ```text
//!  client                                   server
//! ┌──────────────┐   one TCP connection   ┌──────────────────────┐
//! │ Client       │  ┌──────────────────┐  │ Dispatcher           │
//! │  local stdio ├──┤ command  rpc     ├──┤  └─ Session          │
//! │  raw mode    │  │ stdin stdout     │  │      ├─ Process      │
//! │  resizes     │  │ stderr           │  │      ├─ Relay        │
//! └──────────────┘  └──────────────────┘  │      └─ Resize RPC   │
//!                       (mux streams)     └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: `~/.netiorc` loading, environment overrides, validation
//! - [`logging`]: tracing subscriber and panic hook
//! - [`bundle`]: the five streams of a session, in their fixed order
//! - [`session`]: server session, process adapter, relay, resize listener
//! - [`server`]: connection dispatcher
//! - [`client`]: client driver and local terminal handling

pub mod bundle;
pub mod client;
pub mod config;
pub mod logging;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use bundle::StreamBundle;
pub use client::{Client, ClientOptions, LocalIo};
pub use config::Config;
pub use server::Server;
pub use session::{Session, SessionError, SessionReport, SessionState};
