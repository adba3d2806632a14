//! Error types for the multiplexer.

use protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur on a multiplexed session.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The session has ended; no stream can be opened or accepted.
    #[error("session closed")]
    SessionClosed,

    /// The peer sent a frame that does not follow the mux wire format.
    #[error("invalid mux frame: {0}")]
    InvalidFrame(String),

    /// Framing failure on the underlying connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type alias for mux operations.
pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_closed_display() {
        assert_eq!(MuxError::SessionClosed.to_string(), "session closed");
    }

    #[test]
    fn test_from_protocol_error() {
        let err: MuxError = ProtocolError::ConnectionClosed("eof".to_string()).into();
        assert!(matches!(err, MuxError::Protocol(_)));
        assert_eq!(err.to_string(), "protocol error: connection closed: eof");
    }
}
