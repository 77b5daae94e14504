//! Per-connection socket state

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use totpgate_protocol::{Decoded, Message, ProtocolError, try_decode};
use tracing::trace;

use crate::session::AuthSession;

/// Reasons a connection is torn down by the multiplexer
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Idle timeout after {0:?}")]
    IdleTimeout(Duration),

    #[error("Outbound backlog {size} bytes exceeds {max}")]
    Backlogged { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A client connection owned by the multiplexer
pub struct Connection {
    pub(crate) stream: TcpStream,
    addr: SocketAddr,
    inbound: BytesMut,
    outbound: BytesMut,
    last_activity: Instant,
    pub(crate) session: AuthSession,
    close_reason: Option<String>,
}

impl Connection {
    pub fn new(stream: TcpStream, addr: SocketAddr, now: Instant) -> Self {
        Self {
            stream,
            addr,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            last_activity: now,
            session: AuthSession::new(),
            close_reason: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Read one chunk into the inbound buffer
    ///
    /// Returns `Ok(None)` once the socket has nothing more to give.
    pub fn read_chunk(
        &mut self,
        chunk_size: usize,
        now: Instant,
    ) -> Result<Option<usize>, ConnectionError> {
        let start = self.inbound.len();
        self.inbound.resize(start + chunk_size, 0);

        let result = loop {
            match self.stream.read(&mut self.inbound[start..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match result {
            Ok(0) => {
                self.inbound.truncate(start);
                Err(ConnectionError::PeerClosed)
            }
            Ok(n) => {
                self.inbound.truncate(start + n);
                self.last_activity = now;
                trace!("Read {} bytes from {}, {} buffered", n, self.addr, self.inbound.len());
                Ok(Some(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.inbound.truncate(start);
                Ok(None)
            }
            Err(e) => {
                self.inbound.truncate(start);
                Err(e.into())
            }
        }
    }

    /// Pop the next complete frame from the inbound buffer
    pub fn next_message(&mut self, max_payload: usize) -> Result<Option<Message>, ProtocolError> {
        match try_decode(&self.inbound, max_payload)? {
            Decoded::Frame { message, consumed } => {
                self.inbound.advance(consumed);
                Ok(Some(message))
            }
            Decoded::Incomplete { .. } => Ok(None),
        }
    }

    /// Append an encoded frame to the outbound buffer
    pub fn queue(&mut self, message: &Message, max_outbound: usize) -> Result<(), ConnectionError> {
        self.outbound.extend_from_slice(&message.encode());
        if self.outbound.len() > max_outbound {
            return Err(ConnectionError::Backlogged {
                size: self.outbound.len(),
                max: max_outbound,
            });
        }
        Ok(())
    }

    /// Write as much of the outbound buffer as the socket accepts
    pub fn flush(&mut self, now: Instant) -> Result<usize, ConnectionError> {
        let mut written = 0;

        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.outbound.advance(n);
                    self.last_activity = now;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if written > 0 {
            trace!("Wrote {} bytes to {}, {} pending", written, self.addr, self.outbound.len());
        }
        Ok(written)
    }

    /// Stop processing input; close once the outbound buffer drains
    pub fn close_after_flush(&mut self, reason: String) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
        // Partial frames behind the closing one are never delivered
        self.inbound.clear();
    }

    pub fn is_closing(&self) -> bool {
        self.close_reason.is_some()
    }

    /// Closing and nothing left to write
    pub fn is_drained(&self) -> bool {
        self.is_closing() && self.outbound.is_empty()
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Time since the last successful read or write
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}
