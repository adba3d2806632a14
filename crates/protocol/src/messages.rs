//! Protocol message definitions for netio.
//!
//! Two logical streams carry structured messages:
//!
//! - the `command` stream carries one [`CommandDescriptor`] from the client
//!   and one [`ExitStatusReport`] back from the server;
//! - the `rpc` stream carries zero or more [`RpcEnvelope`]s from the client.
//!
//! All messages are serialized using MessagePack, one message per frame.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Exit code reported when no real exit status could be obtained.
pub const SENTINEL_EXIT_CODE: i32 = -1;

/// Base added to a signal number to form the exit code of a signalled process.
pub const SIGNAL_EXIT_BASE: i32 = 128;

// ============================================================================
// Command stream messages
// ============================================================================

/// The request describing the single command a session runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed to the program.
    pub arguments: Vec<String>,
    /// `KEY=VALUE` entries forming the whole child environment.
    pub environment: Vec<String>,
    /// Working directory. Empty means the server's default directory.
    pub working_directory: String,
    /// Whether the command runs attached to a pseudo-terminal.
    pub tty_requested: bool,
    /// Stream compression request. Carried on the wire, not acted upon.
    pub compress: bool,
}

impl CommandDescriptor {
    /// Create a descriptor for `program` with the given arguments.
    pub fn new<I, S>(program: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the environment list.
    pub fn with_environment<I, S>(mut self, environment: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environment = environment.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Request a pseudo-terminal.
    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty_requested = tty;
        self
    }

    /// Check that the descriptor names something to run.
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(ProtocolError::InvalidCommand(
                "program name is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Split the environment entries into key/value pairs.
    ///
    /// Entries without `=` or with an empty key cannot be expressed as a
    /// variable and are skipped; [`Self::malformed_environment`] lists them.
    pub fn environment_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.environment.iter().filter_map(|entry| split_env_entry(entry))
    }

    /// Environment entries that [`Self::environment_pairs`] skips.
    pub fn malformed_environment(&self) -> impl Iterator<Item = &str> {
        self.environment
            .iter()
            .filter(|entry| split_env_entry(entry).is_none())
            .map(String::as_str)
    }

    /// Program followed by its arguments, for display.
    pub fn command_line(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect()
    }
}

fn split_env_entry(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=').filter(|(key, _)| !key.is_empty())
}

/// The exit code of the remote command, sent once by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatusReport {
    /// Exit code, or [`SENTINEL_EXIT_CODE`] if none could be obtained.
    pub code: i32,
}

impl ExitStatusReport {
    /// Create a report for the given code.
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// Report used when the command never produced a real status.
    pub fn sentinel() -> Self {
        Self::new(SENTINEL_EXIT_CODE)
    }
}

// ============================================================================
// RPC stream messages
// ============================================================================

/// Terminal resize notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeEvent {
    /// New terminal rows.
    pub rows: u16,
    /// New terminal columns.
    pub columns: u16,
}

impl ResizeEvent {
    /// Envelope kind for resize events.
    pub const KIND: &'static str = "resize";

    /// Create a resize event.
    pub fn new(rows: u16, columns: u16) -> Self {
        Self { rows, columns }
    }
}

/// Self-describing envelope for messages on the `rpc` stream.
///
/// The body is the MessagePack encoding of the message named by `kind`, so a
/// reader can skip kinds it does not know without losing its place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Message kind discriminator.
    pub kind: String,
    /// Encoded message body.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl RpcEnvelope {
    /// Wrap an encodable message under `kind`.
    pub fn wrap<T: Serialize>(kind: impl Into<String>, message: &T) -> Result<Self> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            kind: kind.into(),
            body: rmp_serde::to_vec_named(message)?,
        })
    }

    fn open<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(&self.body)?)
    }
}

/// The closed set of RPC messages this version understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    /// Terminal resize notification.
    Resize(ResizeEvent),
    /// A message kind this version does not know; skipped by readers.
    Unknown(String),
}

impl RpcMessage {
    /// Encode into an envelope.
    pub fn to_envelope(&self) -> Result<RpcEnvelope> {
        match self {
            RpcMessage::Resize(event) => RpcEnvelope::wrap(ResizeEvent::KIND, event),
            RpcMessage::Unknown(kind) => Err(ProtocolError::Serialization(format!(
                "cannot encode unknown rpc kind {kind:?}"
            ))),
        }
    }

    /// Decode from an envelope.
    ///
    /// Unknown kinds decode to [`RpcMessage::Unknown`]; a known kind with a
    /// malformed body is an error.
    pub fn from_envelope(envelope: &RpcEnvelope) -> Result<Self> {
        match envelope.kind.as_str() {
            ResizeEvent::KIND => Ok(RpcMessage::Resize(envelope.open()?)),
            other => Ok(RpcMessage::Unknown(other.to_string())),
        }
    }
}

impl From<ResizeEvent> for RpcMessage {
    fn from(event: ResizeEvent) -> Self {
        RpcMessage::Resize(event)
    }
}

// ============================================================================
// Serialization helpers
// ============================================================================

/// Serialize a message to MessagePack bytes.
///
/// Structs are written as maps keyed by field name, so a reader skips
/// fields it does not know.
pub fn to_msgpack<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Deserialize a message from MessagePack bytes.
pub fn from_msgpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let desc = CommandDescriptor::new("ls", ["-l", "/tmp"])
            .with_environment(["PATH=/usr/bin"])
            .with_working_directory("/var")
            .with_tty(true);

        assert_eq!(desc.program, "ls");
        assert_eq!(desc.arguments, vec!["-l", "/tmp"]);
        assert_eq!(desc.environment, vec!["PATH=/usr/bin"]);
        assert_eq!(desc.working_directory, "/var");
        assert!(desc.tty_requested);
        assert!(!desc.compress);
        assert_eq!(desc.command_line(), vec!["ls", "-l", "/tmp"]);
    }

    #[test]
    fn test_descriptor_msgpack() {
        let desc = CommandDescriptor::new("echo", ["hello world", "ünïcödé"])
            .with_environment(["A=1", "B=two=2"]);
        let bytes = to_msgpack(&desc).unwrap();
        let decoded: CommandDescriptor = from_msgpack(&bytes).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn test_descriptor_validate() {
        assert!(CommandDescriptor::new("true", Vec::<String>::new())
            .validate()
            .is_ok());

        let err = CommandDescriptor::new("  ", Vec::<String>::new())
            .validate()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(_)));
    }

    #[test]
    fn test_environment_pairs() {
        let desc = CommandDescriptor::new("env", Vec::<String>::new()).with_environment([
            "HOME=/root",
            "EMPTY=",
            "NOEQUALS",
            "=nokey",
            "URL=a=b",
        ]);

        let pairs: Vec<_> = desc.environment_pairs().collect();
        assert_eq!(
            pairs,
            vec![("HOME", "/root"), ("EMPTY", ""), ("URL", "a=b")]
        );

        let skipped: Vec<_> = desc.malformed_environment().collect();
        assert_eq!(skipped, vec!["NOEQUALS", "=nokey"]);
    }

    #[test]
    fn test_descriptor_encoded_as_map() {
        let bytes = to_msgpack(&CommandDescriptor::new("true", Vec::<String>::new())).unwrap();
        // fixmap with six entries
        assert_eq!(bytes[0], 0x86);
    }

    #[test]
    fn test_newer_descriptor_with_extra_field_decodes() {
        #[derive(Serialize)]
        struct NewerDescriptor {
            program: String,
            arguments: Vec<String>,
            environment: Vec<String>,
            working_directory: String,
            priority: u8,
            tty_requested: bool,
            compress: bool,
        }

        let bytes = to_msgpack(&NewerDescriptor {
            program: "ls".to_string(),
            arguments: vec!["-l".to_string()],
            environment: vec!["A=1".to_string()],
            working_directory: "/tmp".to_string(),
            priority: 5,
            tty_requested: true,
            compress: false,
        })
        .unwrap();

        let decoded: CommandDescriptor = from_msgpack(&bytes).unwrap();
        assert_eq!(
            decoded,
            CommandDescriptor::new("ls", ["-l"])
                .with_environment(["A=1"])
                .with_working_directory("/tmp")
                .with_tty(true)
        );
    }

    #[test]
    fn test_exit_status_report() {
        assert_eq!(ExitStatusReport::sentinel().code, SENTINEL_EXIT_CODE);

        let bytes = to_msgpack(&ExitStatusReport::new(7)).unwrap();
        let decoded: ExitStatusReport = from_msgpack(&bytes).unwrap();
        assert_eq!(decoded.code, 7);
    }

    #[test]
    fn test_resize_envelope() {
        let message = RpcMessage::from(ResizeEvent::new(50, 132));
        let envelope = message.to_envelope().unwrap();
        assert_eq!(envelope.kind, "resize");
        assert_eq!(envelope.version, PROTOCOL_VERSION);

        let bytes = to_msgpack(&envelope).unwrap();
        let decoded: RpcEnvelope = from_msgpack(&bytes).unwrap();
        assert_eq!(RpcMessage::from_envelope(&decoded).unwrap(), message);
    }

    #[test]
    fn test_unknown_kind_is_not_an_error() {
        let envelope = RpcEnvelope::wrap("signal", &("SIGHUP", 1u8)).unwrap();
        let message = RpcMessage::from_envelope(&envelope).unwrap();
        assert_eq!(message, RpcMessage::Unknown("signal".to_string()));
    }

    #[test]
    fn test_known_kind_with_bad_body() {
        let envelope = RpcEnvelope {
            version: PROTOCOL_VERSION,
            kind: ResizeEvent::KIND.to_string(),
            body: vec![0xc1],
        };
        assert!(RpcMessage::from_envelope(&envelope).is_err());
    }

    #[test]
    fn test_unknown_cannot_be_encoded() {
        assert!(RpcMessage::Unknown("x".to_string()).to_envelope().is_err());
    }

    #[test]
    fn test_typical_descriptor_size() {
        let desc = CommandDescriptor::new("/bin/sh", ["-c", "make -j8 all"])
            .with_environment(["PATH=/usr/local/bin:/usr/bin:/bin", "TERM=xterm-256color"]);
        let bytes = to_msgpack(&desc).unwrap();
        assert!(bytes.len() < 1024, "descriptor too large: {} bytes", bytes.len());
    }
}
