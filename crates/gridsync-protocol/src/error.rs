//! Error types for the gridsync wire protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Failures while encoding or decoding replication frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The buffer ended before a complete field could be read
    #[error("Truncated frame: needed {needed} more bytes while reading {context}")]
    Truncated {
        /// Field being decoded
        context: &'static str,
        /// Bytes missing
        needed: usize,
    },

    /// Envelope checksum did not match its contents
    #[error("CRC mismatch: expected {expected:x}, got {actual:x}")]
    ChecksumMismatch {
        /// CRC stored in the envelope
        expected: u32,
        /// CRC computed over the received bytes
        actual: u32,
    },

    /// Envelope carries a version this build cannot read
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown frame type byte
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Unknown operation kind code
    #[error("Unknown operation kind: {0}")]
    UnknownOperationKind(u8),

    /// Unknown reject code
    #[error("Unknown reject code: {0}")]
    UnknownRejectCode(u8),

    /// A field decoded to a value that is not allowed in its position
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Kind-specific payload could not be (de)serialized
    #[error("Payload codec error: {0}")]
    Payload(#[from] bincode::Error),
}

impl ProtocolError {
    /// Create a malformed-frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
