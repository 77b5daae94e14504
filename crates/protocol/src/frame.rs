//! Message and frame definitions

use bytes::{BufMut, Bytes};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;

/// Frame preamble: protocol magic plus version, 7 bytes, no padding
pub const PREAMBLE: &[u8; 7] = b"TOTPv1\0";

/// Fixed header size: preamble + type + timestamp + checksum + keep-alive + length
pub const HEADER_LEN: usize = PREAMBLE.len() + 1 + 8 + 4 + 1 + 8;

/// Default maximum payload size (64KB)
pub const DEFAULT_MAX_PAYLOAD: usize = 65536;

/// Keep-alive byte: sender keeps the connection open
pub const KEEP_ALIVE: u8 = 0x01;

/// Keep-alive byte: sender closes the connection after this frame
pub const CLOSE_CONNECTION: u8 = 0x00;

/// Message type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client to server, payload is the identifier
    AuthRequest = 1,
    /// Server to client, payload is the challenge string
    AuthChallenge = 2,
    /// Client to server, challenge encrypted under the TOTP code
    AuthResponse = 3,
    /// Server to client, the response did not verify
    AuthRetry = 4,
    /// Server to client, session key and next secret encrypted under the TOTP code
    AuthSuccess = 5,
    /// Client to server, new shared secret encrypted under the session key
    AuthUpdate = 6,
    /// Server to client, handshake rejected; the connection closes
    AuthFailure = 7,
    /// Client to server, application data encrypted under the session key
    Payload = 8,
}

impl MessageType {
    /// Whether this type is sent by clients (as opposed to the server)
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            MessageType::AuthRequest
                | MessageType::AuthResponse
                | MessageType::AuthUpdate
                | MessageType::Payload
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::AuthRequest),
            2 => Ok(MessageType::AuthChallenge),
            3 => Ok(MessageType::AuthResponse),
            4 => Ok(MessageType::AuthRetry),
            5 => Ok(MessageType::AuthSuccess),
            6 => Ok(MessageType::AuthUpdate),
            7 => Ok(MessageType::AuthFailure),
            8 => Ok(MessageType::Payload),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type
    pub message_type: MessageType,

    /// Send time in seconds since Unix epoch
    pub timestamp: u64,

    /// Whether the sender keeps the connection open after this frame
    pub keep_alive: bool,

    /// Payload bytes (semantics depend on the type)
    pub payload: Bytes,
}

impl Message {
    /// Create a keep-alive message stamped with the current time
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self::at(message_type, unix_now(), payload)
    }

    /// Create a keep-alive message with an explicit timestamp
    pub fn at(message_type: MessageType, timestamp: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            timestamp,
            keep_alive: true,
            payload: payload.into(),
        }
    }

    /// Create a message that asks the peer to close after it
    pub fn closing(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        let mut message = Self::new(message_type, payload);
        message.keep_alive = false;
        message
    }

    /// Encode this message into a complete frame
    pub fn encode(&self) -> Vec<u8> {
        encode_at(
            self.message_type,
            self.timestamp,
            &self.payload,
            self.keep_alive,
        )
    }
}

/// Encode a frame stamped with the current time
pub fn encode(message_type: MessageType, payload: &[u8], keep_alive: bool) -> Vec<u8> {
    encode_at(message_type, unix_now(), payload, keep_alive)
}

/// Encode a frame with an explicit timestamp
pub fn encode_at(
    message_type: MessageType,
    timestamp: u64,
    payload: &[u8],
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(PREAMBLE);
    out.put_u8(message_type as u8);
    out.put_u64(timestamp);
    out.put_u32(crc32fast::hash(payload));
    out.put_u8(if keep_alive { KEEP_ALIVE } else { CLOSE_CONNECTION });
    out.put_u64(payload.len() as u64);
    out.put_slice(payload);
    out
}

/// Current time in seconds since Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
