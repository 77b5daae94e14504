//! Authentication module

use thiserror::Error;
use totpgate_crypto::{
    Aes256GcmCipher, HandshakeError, SESSION_KEY_LEN, SuccessPayload, TotpEngine,
    generate_challenge, generate_secret, seal_success, verify_response,
};

use crate::config::AuthConfig;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Timestamp outside tolerance window: drift {0}s")]
    TimestampOutOfWindow(u64),

    #[error("Challenge response did not verify")]
    CodeMismatch,

    #[error("Retries exhausted after {0} attempts")]
    RetriesExhausted(u8),

    #[error("Sealed field could not be opened")]
    Undecryptable,

    #[error("Handshake crypto error: {0}")]
    Handshake(#[from] HandshakeError),
}

/// TOTP engine plus handshake policy, shared by every session on a server
pub struct Authenticator {
    engine: TotpEngine,
    policy: AuthConfig,
}

impl Authenticator {
    pub fn new(engine: TotpEngine, policy: AuthConfig) -> Self {
        Self { engine, policy }
    }

    pub fn engine(&self) -> &TotpEngine {
        &self.engine
    }

    pub fn policy(&self) -> &AuthConfig {
        &self.policy
    }

    /// Reject timestamps further than the skew tolerance from `now`
    pub fn check_timestamp(&self, timestamp: u64, now: u64) -> Result<(), AuthError> {
        // Client-supplied, so any u64 is possible
        let drift = now.abs_diff(timestamp);
        if drift > self.engine.tolerance_secs() {
            return Err(AuthError::TimestampOutOfWindow(drift));
        }
        Ok(())
    }

    pub fn new_challenge(&self) -> String {
        generate_challenge(self.policy.challenge_length)
    }

    pub fn new_secret(&self) -> String {
        generate_secret(self.policy.secret_length)
    }

    /// Verify a sealed challenge response received at `now`
    ///
    /// A stale timestamp and a wrong code are indistinguishable to the caller's
    /// peer; both count against the retry budget.
    pub fn verify(
        &self,
        secret: &str,
        challenge: &str,
        sealed: &[u8],
        timestamp: u64,
        now: u64,
    ) -> Result<(), AuthError> {
        self.check_timestamp(timestamp, now)?;
        if verify_response(&self.engine, secret, challenge, sealed, timestamp) {
            Ok(())
        } else {
            Err(AuthError::CodeMismatch)
        }
    }

    /// Seal the session key and next secret for an auth success sent at `timestamp`
    pub fn seal_success(
        &self,
        secret: &str,
        timestamp: u64,
        session_key: [u8; SESSION_KEY_LEN],
        new_secret: &str,
    ) -> Result<Vec<u8>, AuthError> {
        let payload = SuccessPayload {
            session_key,
            new_secret: new_secret.to_string(),
        };
        Ok(seal_success(&self.engine, secret, timestamp, &payload)?)
    }

    /// Open a field sealed under the session key
    pub fn open_with_session_key(
        &self,
        session_key: &[u8; SESSION_KEY_LEN],
        sealed: &[u8],
    ) -> Result<Vec<u8>, AuthError> {
        Aes256GcmCipher::new(session_key)
            .decrypt(sealed)
            .map_err(|_| AuthError::Undecryptable)
    }
}
