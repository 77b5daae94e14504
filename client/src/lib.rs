//! totpgate Client Library
//!
//! Async client for the totpgate handshake:
//! 1. `AuthRequest` carrying the identifier
//! 2. `AuthChallenge` from the server
//! 3. `AuthResponse` with the challenge sealed under the current TOTP code
//! 4. `AuthSuccess` carrying the session key and the next secret,
//!    or `AuthRetry`/`AuthFailure`
//!
//! After success the client owns the rotated secret; the old one no longer
//! authenticates.

use bytes::{Buf, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use totpgate_crypto::{
    Aes256GcmCipher, HandshakeError, SESSION_KEY_LEN, TotpConfig, TotpEngine, TotpError,
    open_success, seal_response,
};
use totpgate_protocol::{
    DEFAULT_MAX_PAYLOAD, Decoded, Message, MessageType, ProtocolError, try_decode, unix_now,
};
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("TOTP error: {0}")]
    Totp(#[from] TotpError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] HandshakeError),

    #[error("Server asked for another response")]
    Retry,

    #[error("Server rejected the handshake")]
    Rejected,

    #[error("Server closed the connection")]
    Closed,

    #[error("Unexpected {0:?} from server")]
    Unexpected(MessageType),
}

/// Keys issued by a successful handshake
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub session_key: [u8; SESSION_KEY_LEN],
    /// Secret to use for the next handshake
    pub new_secret: String,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}

/// A connection to a totpgate server
pub struct TotpClient {
    stream: TcpStream,
    buffer: BytesMut,
    engine: TotpEngine,
    max_payload: usize,
    challenge: Option<String>,
}

impl TotpClient {
    /// Connect using the TOTP parameters the server is configured with
    pub async fn connect(addr: impl ToSocketAddrs, config: TotpConfig) -> Result<Self, ClientError> {
        let engine = TotpEngine::new(config)?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            engine,
            max_payload: DEFAULT_MAX_PAYLOAD,
            challenge: None,
        })
    }

    pub fn engine(&self) -> &TotpEngine {
        &self.engine
    }

    /// Write one frame
    pub async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        self.stream.write_all(&message.encode()).await?;
        Ok(())
    }

    /// Read the next complete frame
    ///
    /// Returns `ClientError::Closed` if the server hangs up first.
    pub async fn next_message(&mut self) -> Result<Message, ClientError> {
        loop {
            match try_decode(&self.buffer, self.max_payload)? {
                Decoded::Frame { message, consumed } => {
                    self.buffer.advance(consumed);
                    debug!("Received {:?}", message.message_type);
                    return Ok(message);
                }
                Decoded::Incomplete { .. } => {
                    if self.stream.read_buf(&mut self.buffer).await? == 0 {
                        return Err(ClientError::Closed);
                    }
                }
            }
        }
    }

    /// Send an auth request and wait for the challenge
    pub async fn request_challenge(&mut self, identifier: &str) -> Result<String, ClientError> {
        let request = Message::new(MessageType::AuthRequest, identifier.as_bytes().to_vec());
        self.send(&request).await?;

        let reply = self.next_message().await?;
        match reply.message_type {
            MessageType::AuthChallenge => {
                let challenge = std::str::from_utf8(&reply.payload)
                    .map_err(|_| HandshakeError::Malformed("challenge is not UTF-8"))?
                    .to_string();
                self.challenge = Some(challenge.clone());
                Ok(challenge)
            }
            MessageType::AuthFailure => Err(ClientError::Rejected),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Answer the outstanding challenge with `secret`
    ///
    /// On `ClientError::Retry` the challenge stays outstanding and this may be
    /// called again.
    pub async fn respond(&mut self, secret: &str) -> Result<SessionKeys, ClientError> {
        let Some(challenge) = self.challenge.as_deref() else {
            return Err(HandshakeError::Malformed("no outstanding challenge").into());
        };

        let timestamp = unix_now();
        let sealed = seal_response(&self.engine, secret, challenge, timestamp)?;
        self.send(&Message::at(MessageType::AuthResponse, timestamp, sealed)).await?;

        let reply = self.next_message().await?;
        match reply.message_type {
            MessageType::AuthSuccess => {
                self.challenge = None;
                let success = open_success(&self.engine, secret, reply.timestamp, &reply.payload)?;
                Ok(SessionKeys {
                    session_key: success.session_key,
                    new_secret: success.new_secret,
                })
            }
            MessageType::AuthRetry => Err(ClientError::Retry),
            MessageType::AuthFailure => {
                self.challenge = None;
                Err(ClientError::Rejected)
            }
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Run the whole handshake with a single attempt
    pub async fn authenticate(
        &mut self,
        identifier: &str,
        secret: &str,
    ) -> Result<SessionKeys, ClientError> {
        self.request_challenge(identifier).await?;
        self.respond(secret).await
    }

    /// Send application data sealed under the session key
    pub async fn send_payload(&mut self, keys: &SessionKeys, data: &[u8]) -> Result<(), ClientError> {
        let sealed = seal(keys, data)?;
        self.send(&Message::new(MessageType::Payload, sealed)).await
    }

    /// Replace the stored secret; the server sends no reply
    pub async fn update_secret(
        &mut self,
        keys: &SessionKeys,
        new_secret: &str,
    ) -> Result<(), ClientError> {
        let sealed = seal(keys, new_secret.as_bytes())?;
        self.send(&Message::new(MessageType::AuthUpdate, sealed)).await
    }

    /// Send a frame asking the server to close after replying
    pub async fn send_closing(
        &mut self,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.send(&Message::closing(message_type, payload)).await
    }

    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn seal(keys: &SessionKeys, plaintext: &[u8]) -> Result<Vec<u8>, ClientError> {
    Aes256GcmCipher::new(&keys.session_key)
        .encrypt(plaintext)
        .map_err(|e| HandshakeError::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use totpgate_crypto::{SuccessPayload, generate_session_key, seal_success, verify_response};
    use totpgate_protocol::encode;

    const SECRET: &str = "JFAYYXHEMEIMMATA2TCN4EFC5H3WJP2QF4RAQVOHLVFV2TL5WX7WUCRZABJCIPIB";

    /// Read one frame from a raw server-side socket
    async fn read_frame(stream: &mut TcpStream, buffer: &mut BytesMut) -> Option<Message> {
        loop {
            if let Decoded::Frame { message, consumed } =
                try_decode(buffer, DEFAULT_MAX_PAYLOAD).unwrap()
            {
                buffer.advance(consumed);
                return Some(message);
            }
            if stream.read_buf(buffer).await.unwrap() == 0 {
                return None;
            }
        }
    }

    /// One-connection server accepting SECRET for any identifier
    async fn fake_server(listener: TcpListener, next_secret: &'static str) -> Vec<Message> {
        let engine = TotpEngine::new(TotpConfig::default()).unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = BytesMut::new();
        let mut seen = Vec::new();
        let challenge = "CHALLENGECHALLENGECHALLENGE23456";

        while let Some(message) = read_frame(&mut stream, &mut buffer).await {
            let reply = match message.message_type {
                MessageType::AuthRequest => {
                    Some(Message::new(MessageType::AuthChallenge, challenge.as_bytes().to_vec()))
                }
                MessageType::AuthResponse => {
                    if verify_response(&engine, SECRET, challenge, &message.payload, message.timestamp)
                    {
                        let payload = SuccessPayload {
                            session_key: [7u8; SESSION_KEY_LEN],
                            new_secret: next_secret.to_string(),
                        };
                        let now = unix_now();
                        let sealed = seal_success(&engine, SECRET, now, &payload).unwrap();
                        Some(Message::at(MessageType::AuthSuccess, now, sealed))
                    } else {
                        Some(Message::new(MessageType::AuthRetry, Vec::<u8>::new()))
                    }
                }
                _ => None,
            };
            seen.push(message);
            if let Some(reply) = reply {
                stream.write_all(&reply.encode()).await.unwrap();
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_authenticate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_server(listener, "ROTATEDSECRET"));

        let mut client = TotpClient::connect(addr, TotpConfig::default()).await.unwrap();
        let keys = client.authenticate("alice", SECRET).await.unwrap();
        assert_eq!(keys.session_key, [7u8; SESSION_KEY_LEN]);
        assert_eq!(keys.new_secret, "ROTATEDSECRET");

        client.shutdown().await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(seen[0].payload.as_ref(), b"alice");
        assert_eq!(seen[1].message_type, MessageType::AuthResponse);
    }

    #[tokio::test]
    async fn test_retry_keeps_challenge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_server(listener, "ROTATEDSECRET"));

        let mut client = TotpClient::connect(addr, TotpConfig::default()).await.unwrap();
        client.request_challenge("alice").await.unwrap();

        let err = client.respond("WRONGSECRET").await.unwrap_err();
        assert!(matches!(err, ClientError::Retry));

        // The same challenge can be answered again
        let keys = client.respond(SECRET).await.unwrap();
        assert_eq!(keys.new_secret, "ROTATEDSECRET");

        client.shutdown().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_respond_without_challenge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TotpClient::connect(addr, TotpConfig::default()).await.unwrap();
        let err = client.respond(SECRET).await.unwrap_err();
        assert!(matches!(err, ClientError::Crypto(HandshakeError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_payload_sealed_under_session_key() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_server(listener, "ROTATEDSECRET"));

        let keys = SessionKeys {
            session_key: generate_session_key(),
            new_secret: "UNUSED".to_string(),
        };
        let mut client = TotpClient::connect(addr, TotpConfig::default()).await.unwrap();
        client.send_payload(&keys, b"hello").await.unwrap();
        client.update_secret(&keys, "NEXTSECRET").await.unwrap();
        client.shutdown().await.unwrap();

        let seen = server.await.unwrap();
        let cipher = Aes256GcmCipher::new(&keys.session_key);
        assert_eq!(seen[0].message_type, MessageType::Payload);
        assert_eq!(cipher.decrypt(&seen[0].payload).unwrap(), b"hello");
        assert_eq!(seen[1].message_type, MessageType::AuthUpdate);
        assert_eq!(cipher.decrypt(&seen[1].payload).unwrap(), b"NEXTSECRET");
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut bytes = encode(MessageType::AuthChallenge, b"first", true);
            bytes.extend_from_slice(&encode(MessageType::AuthRetry, b"", true));
            for chunk in bytes.chunks(5) {
                stream.write_all(chunk).await.unwrap();
                stream.flush().await.unwrap();
            }
        });

        let mut client = TotpClient::connect(addr, TotpConfig::default()).await.unwrap();
        let first = client.next_message().await.unwrap();
        assert_eq!(first.message_type, MessageType::AuthChallenge);
        assert_eq!(first.payload.as_ref(), b"first");
        let second = client.next_message().await.unwrap();
        assert_eq!(second.message_type, MessageType::AuthRetry);

        server.await.unwrap();
        assert!(matches!(client.next_message().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_failure_and_unexpected_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(&encode(MessageType::AuthRetry, b"", true))
                .await
                .unwrap();
            stream
                .write_all(&encode(MessageType::AuthFailure, b"", false))
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let mut client = TotpClient::connect(addr, TotpConfig::default()).await.unwrap();
        assert!(matches!(
            client.request_challenge("alice").await,
            Err(ClientError::Unexpected(MessageType::AuthRetry))
        ));
        assert!(matches!(
            client.request_challenge("alice").await,
            Err(ClientError::Rejected)
        ));

        client.shutdown().await.unwrap();
        server.await.unwrap();
    }

    #[test]
    fn test_session_keys_debug_is_redacted() {
        let keys = SessionKeys {
            session_key: [1u8; SESSION_KEY_LEN],
            new_secret: "TOPSECRET".to_string(),
        };
        assert!(!format!("{:?}", keys).contains("TOPSECRET"));
    }
}
