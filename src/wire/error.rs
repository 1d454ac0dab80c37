//! Wire protocol error types.

use std::fmt;
use std::io;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Wire protocol errors.
#[derive(Debug)]
pub enum WireError {
    /// I/O error
    Io(io::Error),

    /// Protocol error (malformed header, bad body, etc.)
    Protocol(String),

    /// Opcode not part of the supported set
    UnknownOpCode(i32),

    /// Document length prefix is invalid
    MalformedDocument(String),

    /// Message too large
    MessageTooLarge { size: usize, max: usize },

    /// Document could not be encoded
    Encode(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Io(e) => write!(f, "I/O error: {}", e),
            WireError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            WireError::UnknownOpCode(op) => write!(f, "Unknown opcode: {}", op),
            WireError::MalformedDocument(msg) => write!(f, "Malformed document: {}", msg),
            WireError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max: {})", size, max)
            }
            WireError::Encode(msg) => write!(f, "Encode error: {}", msg),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        WireError::Io(err)
    }
}

impl From<bson::ser::Error> for WireError {
    fn from(err: bson::ser::Error) -> Self {
        WireError::Encode(err.to_string())
    }
}

impl WireError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        WireError::Protocol(msg.into())
    }

    /// Whether the error came from the underlying transport.
    pub fn is_io(&self) -> bool {
        matches!(self, WireError::Io(_))
    }
}
