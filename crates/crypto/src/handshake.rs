//! Handshake field sealing
//!
//! Two handshake fields are encrypted under a key derived from the TOTP code of
//! the shared secret at the carrying frame's timestamp:
//! - the challenge echoed back in an auth response
//! - the session key and next secret carried by an auth success
//!
//! Later fields (secret updates, payloads) use the session key directly.

use thiserror::Error;

use crate::aes::{AesError, Aes256GcmCipher, SESSION_KEY_LEN};
use crate::totp::{TotpEngine, TotpError, constant_time_eq};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("TOTP error: {0}")]
    Totp(#[from] TotpError),

    #[error("Cipher error: {0}")]
    Aes(#[from] AesError),

    #[error("Malformed handshake field: {0}")]
    Malformed(&'static str),
}

/// Plaintext of an auth success payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessPayload {
    pub session_key: [u8; SESSION_KEY_LEN],
    pub new_secret: String,
}

impl SuccessPayload {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SESSION_KEY_LEN + self.new_secret.len());
        out.extend_from_slice(&self.session_key);
        out.extend_from_slice(self.new_secret.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() <= SESSION_KEY_LEN {
            return Err(HandshakeError::Malformed("success payload too short"));
        }
        let (key, secret) = bytes.split_at(SESSION_KEY_LEN);

        let mut session_key = [0u8; SESSION_KEY_LEN];
        session_key.copy_from_slice(key);
        let new_secret = std::str::from_utf8(secret)
            .map_err(|_| HandshakeError::Malformed("secret is not UTF-8"))?
            .to_string();

        Ok(Self {
            session_key,
            new_secret,
        })
    }
}

/// Client: encrypt the challenge under the code for `timestamp`
pub fn seal_response(
    engine: &TotpEngine,
    secret: &str,
    challenge: &str,
    timestamp: u64,
) -> Result<Vec<u8>, HandshakeError> {
    let code = engine.code_at(secret.as_bytes(), timestamp)?;
    Ok(Aes256GcmCipher::from_code(&code).encrypt(challenge.as_bytes())?)
}

/// Server: check a sealed response against every step in the skew window
/// around `timestamp`
pub fn verify_response(
    engine: &TotpEngine,
    secret: &str,
    challenge: &str,
    sealed: &[u8],
    timestamp: u64,
) -> bool {
    engine.candidate_counters(timestamp).any(|counter| {
        let Ok(code) = engine.code_for_counter(secret.as_bytes(), counter) else {
            return false;
        };
        Aes256GcmCipher::from_code(&code)
            .decrypt(sealed)
            .map(|plain| constant_time_eq(&plain, challenge.as_bytes()))
            .unwrap_or(false)
    })
}

/// Server: encrypt the session key and next secret under the code for `timestamp`
pub fn seal_success(
    engine: &TotpEngine,
    secret: &str,
    timestamp: u64,
    payload: &SuccessPayload,
) -> Result<Vec<u8>, HandshakeError> {
    let code = engine.code_at(secret.as_bytes(), timestamp)?;
    Ok(Aes256GcmCipher::from_code(&code).encrypt(&payload.to_bytes())?)
}

/// Client: open an auth success payload stamped with `timestamp`
pub fn open_success(
    engine: &TotpEngine,
    secret: &str,
    timestamp: u64,
    sealed: &[u8],
) -> Result<SuccessPayload, HandshakeError> {
    let code = engine.code_at(secret.as_bytes(), timestamp)?;
    let plain = Aes256GcmCipher::from_code(&code).decrypt(sealed)?;
    SuccessPayload::from_bytes(&plain)
}
