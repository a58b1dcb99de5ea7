//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Framing errors
    /// A reply line did not start with a three digit status code.
    #[error("malformed reply line: {0}")]
    MalformedReply(String),

    /// A line in a multi-line reply carried a different status code.
    #[error("status code changed mid-reply: expected {expected}, got {got}")]
    MixedStatus {
        /// Status code of the first line.
        expected: u16,
        /// Status code of the offending line.
        got: u16,
    },

    /// A reply ran past the line limit. Its remaining lines were consumed
    /// and dropped.
    #[error("reply with status {code} exceeds {limit} lines")]
    ReplyTooLong {
        /// Status code of the oversized reply.
        code: u16,
        /// Line limit that was exceeded.
        limit: usize,
    },

    /// An asynchronous event could not be interpreted.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    // Command errors
    /// A command argument contained characters that cannot be sent.
    #[error("invalid command argument: {0}")]
    InvalidArgument(String),

    /// The daemon answered a command with a non-success status.
    #[error("command rejected with {code}: {message}")]
    Rejected {
        /// Status code returned by the daemon.
        code: u16,
        /// Text of the final reply line.
        message: String,
    },

    // Handshake errors
    /// The daemon refused the supplied authentication cookie.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Any other I/O failure on the control socket.
    #[error("control socket I/O failed: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Returns true when the error means the socket is no longer usable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionClosed(_) | ProtocolError::Io(_)
        )
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
