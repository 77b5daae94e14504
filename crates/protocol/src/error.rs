//! Protocol errors

use thiserror::Error;

/// Errors raised while decoding a frame.
///
/// Every variant is fatal for the connection that produced the bytes.
/// A short buffer is not an error; see [`crate::Decoded::Incomplete`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Bad preamble")]
    BadPreamble,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("Invalid keep-alive flag: {0:#04x}")]
    InvalidKeepAlive(u8),
}
