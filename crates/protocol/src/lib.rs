//! totpgate Protocol - Frame format and codec
//!
//! This crate defines the wire format spoken between clients and the daemon:
//! - `MessageType`: The eight handshake and data message kinds
//! - `Message`: A decoded frame (type, send timestamp, keep-alive, payload)
//! - `encode`/`try_decode`: Pure functions over byte sequences
//!
//! Decoding is incremental: `try_decode` reports `Decoded::Incomplete` until a
//! whole frame is buffered, so callers can feed it arbitrarily small reads.

mod decode;
mod error;
mod frame;

pub use decode::*;
pub use error::*;
pub use frame::*;
