//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The file does not start with the `MDB` magic bytes.
    #[error("invalid magic bytes: not a table file")]
    InvalidMagic,

    /// The format version byte is not one this codec understands.
    #[error("unsupported format version: {version}")]
    UnsupportedVersion {
        /// The version byte found in the header.
        version: u8,
    },

    /// A value carried a tag byte outside the known range.
    #[error("unknown value tag: {tag:#04x}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
    },

    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A length prefix points past the end of the buffer.
    #[error("length out of bounds: claimed {claimed}, remaining {remaining}")]
    LengthOutOfBounds {
        /// Length the prefix claimed.
        claimed: usize,
        /// Bytes actually remaining in the buffer.
        remaining: usize,
    },

    /// Failed to encode a record.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }
}
