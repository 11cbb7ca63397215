//! Error types for the packet codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while encoding or decoding packets.
///
/// Malformed input is always reported through this type; the codec never
/// panics on untrusted bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Input is not valid CBOR.
    #[error("decode error: {0}")]
    Decode(String),

    /// Input is valid CBOR but does not match the expected packet shape.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// Description of the mismatch.
        message: String,
    },

    /// Packet type code is not recognized.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),
}

impl CodecError {
    /// Creates an invalid-structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }
}
