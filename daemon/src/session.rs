//! Per-connection handshake state machine
//!
//! The session never touches sockets. `AuthSession::handle` consumes one
//! decoded message and returns the actions the multiplexer must carry out:
//! - `SendFrame`: encode and queue this message on the connection
//! - `Close`: close the connection once queued frames have been written
//!
//! Time is passed in, so transitions are deterministic under test.
//!
//! ```text
//! ┌──────┐ AuthRequest ┌───────────────┐ AuthResponse ok ┌───────────────┐
//! │ Init │────────────>│ ChallengeSent │────────────────>│ Authenticated │
//! └──────┘             └───────────────┘                 └───────────────┘
//!     │                   │    ↺ AuthRetry                   │  ↺ AuthUpdate
//!     │                   │ retries exhausted                │  ↺ Payload
//!     │                   ↓                                  │
//!     └──────────────>┌────────┐<────────────────────────────┘
//!   protocol misuse   │ Failed │   protocol misuse
//!                     └────────┘
//! ```

use bytes::Bytes;
use std::fmt;
use totpgate_crypto::{SESSION_KEY_LEN, generate_session_key};
use totpgate_protocol::{Message, MessageType};
use totpgate_storage::{SecretStore, validate_record};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, Authenticator};

/// Longest identifier accepted in an auth request
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Waiting for an auth request
    Init,
    /// Challenge issued, waiting for the sealed response
    ChallengeSent,
    /// Session key issued
    Authenticated,
    /// Handshake rejected; the connection is closing
    Failed,
}

/// Actions returned by the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send this message to the peer
    SendFrame(Message),

    /// Close the connection after pending frames are flushed
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Receives decrypted application data from authenticated sessions
pub trait PayloadHandler {
    fn on_payload(&mut self, identifier: &str, data: Vec<u8>);
}

/// Payload handler that only logs what arrives
#[derive(Debug, Default)]
pub struct LoggingPayloadHandler;

impl PayloadHandler for LoggingPayloadHandler {
    fn on_payload(&mut self, identifier: &str, data: Vec<u8>) {
        info!("Payload from {}: {} bytes", identifier, data.len());
    }
}

/// Collaborators a session needs while handling one message
pub struct SessionContext<'a> {
    pub authenticator: &'a Authenticator,
    pub store: &'a mut dyn SecretStore,
    pub handler: &'a mut dyn PayloadHandler,
}

/// Handshake state for one connection
pub struct AuthSession {
    state: AuthState,
    identifier: Option<String>,
    secret: Option<String>,
    enrolled: bool,
    pending_challenge: Option<String>,
    session_key: Option<[u8; SESSION_KEY_LEN]>,
    retry_count: u8,
}

impl fmt::Debug for AuthSession {
    // Secrets, challenges and keys stay out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("state", &self.state)
            .field("identifier", &self.identifier)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSession {
    pub fn new() -> Self {
        Self {
            state: AuthState::Init,
            identifier: None,
            secret: None,
            enrolled: false,
            pending_challenge: None,
            session_key: None,
            retry_count: 0,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Session key, present only while authenticated
    pub fn session_key(&self) -> Option<&[u8; SESSION_KEY_LEN]> {
        self.session_key.as_ref()
    }

    /// Handle one decoded message received at `now` (unix seconds)
    pub fn handle(
        &mut self,
        message: &Message,
        now: u64,
        ctx: &mut SessionContext<'_>,
    ) -> Vec<SessionAction> {
        if self.state == AuthState::Failed {
            debug!("Ignoring {:?} on failed session", message.message_type);
            return Vec::new();
        }

        if !message.message_type.is_client_message() {
            self.fail();
            return vec![SessionAction::Close {
                reason: format!("client sent server message {:?}", message.message_type),
            }];
        }

        match (self.state, message.message_type) {
            (AuthState::Init, MessageType::AuthRequest) => self.on_auth_request(message, now, ctx),
            (AuthState::ChallengeSent, MessageType::AuthResponse) => {
                self.on_auth_response(message, now, ctx)
            }
            (AuthState::Authenticated, MessageType::AuthUpdate) => {
                self.on_auth_update(message, now, ctx)
            }
            (AuthState::Authenticated, MessageType::Payload) => self.on_payload(message, now, ctx),
            (state, message_type) => {
                self.reject(now, format!("{:?} not allowed in state {:?}", message_type, state))
            }
        }
    }

    fn on_auth_request(
        &mut self,
        message: &Message,
        now: u64,
        ctx: &mut SessionContext<'_>,
    ) -> Vec<SessionAction> {
        if let Err(e) = ctx.authenticator.check_timestamp(message.timestamp, now) {
            return self.reject(now, format!("auth request rejected: {}", e));
        }

        let identifier = match parse_identifier(&message.payload) {
            Ok(identifier) => identifier,
            Err(reason) => return self.reject(now, reason.to_string()),
        };

        let (secret, enrolled) = match ctx.store.get(&identifier) {
            Ok(Some(secret)) => (secret, true),
            Ok(None) if ctx.authenticator.policy().auto_enroll => {
                let secret = ctx.authenticator.new_secret();
                if let Err(e) = ctx.store.put(&identifier, &secret) {
                    error!("Failed to enroll {}: {}", identifier, e);
                    return self.reject(now, "secret store write failed".to_string());
                }
                info!("Enrolled new identifier {}", identifier);
                (secret, true)
            }
            Ok(None) => {
                // Answer exactly as for a known identifier, but never verify
                debug!("Unknown identifier {}, issuing decoy challenge", identifier);
                (ctx.authenticator.new_secret(), false)
            }
            Err(e) => {
                error!("Secret lookup for {} failed: {}", identifier, e);
                return self.reject(now, "secret store read failed".to_string());
            }
        };

        let challenge = ctx.authenticator.new_challenge();
        let reply = Message::at(
            MessageType::AuthChallenge,
            now,
            Bytes::from(challenge.clone().into_bytes()),
        );

        debug!("Challenge issued to {}", identifier);
        self.identifier = Some(identifier);
        self.secret = Some(secret);
        self.enrolled = enrolled;
        self.pending_challenge = Some(challenge);
        self.state = AuthState::ChallengeSent;

        vec![SessionAction::SendFrame(reply)]
    }

    fn on_auth_response(
        &mut self,
        message: &Message,
        now: u64,
        ctx: &mut SessionContext<'_>,
    ) -> Vec<SessionAction> {
        let (Some(identifier), Some(secret), Some(challenge)) = (
            self.identifier.clone(),
            self.secret.clone(),
            self.pending_challenge.clone(),
        ) else {
            return self.reject(now, "challenge state missing".to_string());
        };

        let verified = if self.enrolled {
            ctx.authenticator
                .verify(&secret, &challenge, &message.payload, message.timestamp, now)
        } else {
            Err(AuthError::CodeMismatch)
        };

        if let Err(e) = verified {
            self.retry_count = self.retry_count.saturating_add(1);
            let max_retries = ctx.authenticator.policy().max_retries;

            if self.retry_count >= max_retries {
                warn!(
                    "Handshake for {} failed: {}",
                    identifier,
                    AuthError::RetriesExhausted(self.retry_count)
                );
                let reason = AuthError::RetriesExhausted(self.retry_count).to_string();
                return self.reject(now, reason);
            }

            warn!(
                "Handshake attempt {}/{} for {} failed: {}",
                self.retry_count, max_retries, identifier, e
            );
            return vec![SessionAction::SendFrame(Message::at(
                MessageType::AuthRetry,
                now,
                Bytes::new(),
            ))];
        }

        let session_key = generate_session_key();
        let new_secret = ctx.authenticator.new_secret();

        let sealed = match ctx
            .authenticator
            .seal_success(&secret, now, session_key, &new_secret)
        {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("Failed to seal success for {}: {}", identifier, e);
                return self.reject(now, "sealing failed".to_string());
            }
        };

        // Persist before the client learns the new secret
        if let Err(e) = ctx.store.put(&identifier, &new_secret) {
            error!("Failed to rotate secret for {}: {}", identifier, e);
            return self.reject(now, "secret store write failed".to_string());
        }

        info!("Authenticated {}", identifier);
        self.secret = Some(new_secret);
        self.pending_challenge = None;
        self.session_key = Some(session_key);
        self.state = AuthState::Authenticated;

        vec![SessionAction::SendFrame(Message::at(
            MessageType::AuthSuccess,
            now,
            Bytes::from(sealed),
        ))]
    }

    fn on_auth_update(
        &mut self,
        message: &Message,
        now: u64,
        ctx: &mut SessionContext<'_>,
    ) -> Vec<SessionAction> {
        if let Err(e) = ctx.authenticator.check_timestamp(message.timestamp, now) {
            return self.reject(now, format!("auth update rejected: {}", e));
        }

        let (Some(identifier), Some(session_key)) = (self.identifier.clone(), self.session_key)
        else {
            return self.reject(now, "session state missing".to_string());
        };

        let new_secret = match ctx
            .authenticator
            .open_with_session_key(&session_key, &message.payload)
            .ok()
            .and_then(|plain| String::from_utf8(plain).ok())
        {
            Some(secret) => secret,
            None => return self.reject(now, "auth update could not be opened".to_string()),
        };

        if validate_record(&identifier, &new_secret).is_err() {
            return self.reject(now, "auth update carried an invalid secret".to_string());
        }

        if let Err(e) = ctx.store.put(&identifier, &new_secret) {
            error!("Failed to store updated secret for {}: {}", identifier, e);
            return self.reject(now, "secret store write failed".to_string());
        }

        info!("Secret updated for {}", identifier);
        self.secret = Some(new_secret);
        Vec::new()
    }

    fn on_payload(
        &mut self,
        message: &Message,
        now: u64,
        ctx: &mut SessionContext<'_>,
    ) -> Vec<SessionAction> {
        let (Some(identifier), Some(session_key)) = (self.identifier.clone(), self.session_key)
        else {
            return self.reject(now, "session state missing".to_string());
        };

        match ctx
            .authenticator
            .open_with_session_key(&session_key, &message.payload)
        {
            Ok(data) => {
                ctx.handler.on_payload(&identifier, data);
                Vec::new()
            }
            Err(e) => self.reject(now, format!("payload from {} rejected: {}", identifier, e)),
        }
    }

    /// Send an auth failure and close
    fn reject(&mut self, now: u64, reason: String) -> Vec<SessionAction> {
        self.fail();

        let mut failure = Message::at(MessageType::AuthFailure, now, Bytes::new());
        failure.keep_alive = false;

        vec![
            SessionAction::SendFrame(failure),
            SessionAction::Close { reason },
        ]
    }

    fn fail(&mut self) {
        self.state = AuthState::Failed;
        self.pending_challenge = None;
        self.session_key = None;
    }
}

fn parse_identifier(payload: &[u8]) -> Result<String, &'static str> {
    if payload.len() > MAX_IDENTIFIER_LEN {
        return Err("identifier too long");
    }
    let identifier = std::str::from_utf8(payload).map_err(|_| "identifier is not UTF-8")?;
    // Any valid secret works here; only the identifier is being checked
    validate_record(identifier, "-").map_err(|_| "identifier not representable")?;
    Ok(identifier.to_string())
}
