//! totpgate Crypto - One-time codes and field encryption
//!
//! This crate provides:
//! - TOTP code generation and skew-tolerant verification (HMAC-SHA256/512)
//! - Secret and challenge generation from the OS random source
//! - AES-256-GCM encryption keyed by a TOTP code or a session key
//! - Sealing and opening of the encrypted handshake fields

mod aes;
mod handshake;
mod totp;

pub use aes::*;
pub use handshake::*;
pub use totp::*;
