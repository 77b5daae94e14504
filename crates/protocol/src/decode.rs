//! Incremental frame decoding

use bytes::{Buf, Bytes};

use crate::error::ProtocolError;
use crate::frame::{CLOSE_CONNECTION, HEADER_LEN, KEEP_ALIVE, Message, MessageType, PREAMBLE};

/// Outcome of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame; `consumed` bytes must be removed from the buffer
    Frame { message: Message, consumed: usize },

    /// Not enough bytes yet; at least `needed` bytes in total are required
    Incomplete { needed: usize },
}

/// Try to decode one frame from the front of `buf`.
///
/// Never mutates `buf`. The declared payload length is checked against
/// `max_payload` as soon as the header is available, so a hostile length is
/// rejected before the caller buffers the payload.
pub fn try_decode(buf: &[u8], max_payload: usize) -> Result<Decoded, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::Incomplete { needed: HEADER_LEN });
    }

    let mut header = &buf[..HEADER_LEN];

    if &header[..PREAMBLE.len()] != PREAMBLE {
        return Err(ProtocolError::BadPreamble);
    }
    header.advance(PREAMBLE.len());

    let message_type = MessageType::try_from(header.get_u8())?;
    let timestamp = header.get_u64();
    let checksum = header.get_u32();

    let keep_alive = match header.get_u8() {
        KEEP_ALIVE => true,
        CLOSE_CONNECTION => false,
        other => return Err(ProtocolError::InvalidKeepAlive(other)),
    };

    let declared = header.get_u64();
    if declared > max_payload as u64 {
        return Err(ProtocolError::PayloadTooLarge {
            size: declared,
            max: max_payload,
        });
    }

    let Some(total) = usize::try_from(declared)
        .ok()
        .and_then(|len| HEADER_LEN.checked_add(len))
    else {
        return Err(ProtocolError::PayloadTooLarge {
            size: declared,
            max: max_payload,
        });
    };
    if buf.len() < total {
        return Ok(Decoded::Incomplete { needed: total });
    }

    let payload = &buf[HEADER_LEN..total];
    let computed = crc32fast::hash(payload);
    if computed != checksum {
        return Err(ProtocolError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    Ok(Decoded::Frame {
        message: Message {
            message_type,
            timestamp,
            keep_alive,
            payload: Bytes::copy_from_slice(payload),
        },
        consumed: total,
    })
}
