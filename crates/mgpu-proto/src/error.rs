//! Error types for wire message construction and parsing.

use thiserror::Error;

/// Errors raised while building or parsing protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The message failed JSON (de)serialization.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required field was missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// An unknown `cmd`/`type` tag was received.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The underlying connection failed while reading or writing a message.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A message exceeded the fixed read buffer size.
    #[error("message exceeds {limit} byte buffer")]
    TooLarge {
        /// The configured buffer limit, in bytes.
        limit: usize,
    },

    /// The peer closed the connection before a full message was read.
    #[error("connection closed before a complete message was received")]
    ConnectionClosed,
}
