//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Argument outside of the accepted domain
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),

    /// Crypt-mask byte has no registered handle
    #[error("crypt mask 0x{0:02x} not found")]
    NotFound(u8),

    /// Frame shorter than its fixed part or announced length
    #[error("frame too short: need {need} bytes, got {got}")]
    FrameTooShort {
        /// Bytes required
        need: usize,
        /// Bytes available
        got: usize,
    },

    /// Frame structure inconsistent with its indicators
    #[error("malformed frame")]
    FrameMalformed,

    /// Unknown frame indicator value
    #[error("unknown indicator {0}")]
    UnknownIndicator(u8),

    /// Unsupported advertisement version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Output buffer cannot hold the encoded value
    #[error("buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall {
        /// Bytes required
        need: usize,
        /// Bytes available
        got: usize,
    },

    /// Key missing, authentication failure or cipher error
    #[error("crypto failure")]
    Crypto,
}
