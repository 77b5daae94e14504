//! Single-threaded connection multiplexer
//!
//! One `mio::Poll` watches the listener and every client socket. All
//! connection state is owned by the loop, so nothing is shared or locked.
//! The poll call is the only place the thread waits.
//!
//! mio readiness is edge-triggered: reads continue until `WouldBlock`, and
//! each chunk is decoded and handled before the next is read, so a fast peer
//! cannot grow the inbound buffer past one frame plus one chunk.

use anyhow::{Context, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use totpgate_crypto::TotpEngine;
use totpgate_protocol::unix_now;
use totpgate_storage::SecretStore;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::DaemonConfig;
use crate::connection::{Connection, ConnectionError};
use crate::metrics::Metrics;
use crate::session::{AuthState, PayloadHandler, SessionAction, SessionContext};

const LISTENER: Token = Token(0);

/// Everything the loop needs besides the connection table
struct Services<S, H> {
    config: DaemonConfig,
    authenticator: Authenticator,
    store: S,
    handler: H,
    metrics: Metrics,
}

/// Connection multiplexer
pub struct Multiplexer<S, H> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    services: Services<S, H>,
    last_stats: Instant,
}

impl<S: SecretStore, H: PayloadHandler> Multiplexer<S, H> {
    /// Bind the listener and prepare the poll registry
    pub fn bind(config: DaemonConfig, store: S, handler: H) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let engine = TotpEngine::new(config.totp.clone()).context("invalid [totp] settings")?;
        let authenticator = Authenticator::new(engine, config.auth.clone());

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.server.bind)
            .with_context(|| format!("binding {}", config.server.bind))?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            connections: HashMap::new(),
            next_token: LISTENER.0 + 1,
            services: Services {
                config,
                authenticator,
                store,
                handler,
                metrics: Metrics::new()?,
            },
            last_stats: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn store(&self) -> &S {
        &self.services.store
    }

    pub fn handler(&self) -> &H {
        &self.services.handler
    }

    pub fn metrics(&self) -> &Metrics {
        &self.services.metrics
    }

    /// Handshake state of the connection from `peer`, if still open
    pub fn session_state(&self, peer: SocketAddr) -> Option<AuthState> {
        self.connections
            .values()
            .find(|conn| conn.addr() == peer)
            .map(|conn| conn.session().state())
    }

    /// Serve until the process exits
    pub fn serve(&mut self) -> Result<()> {
        self.run(&AtomicBool::new(false))
    }

    /// Serve until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let interval = self.services.config.server.poll_interval();

        while !shutdown.load(Ordering::Relaxed) {
            self.poll_once(Some(interval))?;
        }

        info!("Shutting down, closing {} connections", self.connections.len());
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, "server shutdown");
        }
        Ok(())
    }

    /// Wait for readiness once, service ready sockets, then evict idle ones
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable() || event.is_read_closed()))
            .collect();

        for (token, readable) in ready {
            if token == LISTENER {
                self.accept_all();
            } else {
                self.service(token, readable);
            }
        }

        self.evict_idle(Instant::now());
        self.maybe_log_stats();
        Ok(())
    }

    /// Close every connection idle for longer than the configured timeout
    pub fn evict_idle(&mut self, now: Instant) {
        let timeout = self.services.config.server.idle_timeout();

        let idle: Vec<(Token, Duration)> = self
            .connections
            .iter()
            .filter_map(|(token, conn)| {
                let idle_for = conn.idle_for(now);
                (idle_for > timeout).then_some((*token, idle_for))
            })
            .collect();

        for (token, idle_for) in idle {
            self.close(token, ConnectionError::IdleTimeout(idle_for));
        }
    }

    fn accept_all(&mut self) {
        loop {
            let (mut stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    break;
                }
            };

            if self.connections.len() >= self.services.config.server.max_connections {
                warn!("Refusing {}: connection limit reached", addr);
                continue;
            }

            let token = Token(self.next_token);
            self.next_token += 1;

            if let Err(e) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                error!("Failed to register {}: {}", addr, e);
                continue;
            }

            debug!("Accepted connection from {}", addr);
            self.connections.insert(token, Connection::new(stream, addr, Instant::now()));
            self.services.metrics.connections_accepted.inc();
            self.services
                .metrics
                .active_connections
                .set(self.connections.len() as i64);
        }
    }

    fn service(&mut self, token: Token, readable: bool) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        match self.services.drive(conn, readable) {
            Ok(()) if conn.is_drained() => {
                let reason = conn.close_reason().unwrap_or_default().to_string();
                self.close(token, reason);
            }
            Ok(()) => {}
            Err(e) => {
                if matches!(e, ConnectionError::Protocol(_)) {
                    self.services.metrics.protocol_errors.inc();
                }
                self.close(token, e);
            }
        }
    }

    fn close(&mut self, token: Token, reason: impl std::fmt::Display) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!("Deregister of {} failed: {}", conn.addr(), e);
        }
        info!("Closing connection to {}: {}", conn.addr(), reason);

        self.services.metrics.connections_closed.inc();
        self.services
            .metrics
            .active_connections
            .set(self.connections.len() as i64);
    }

    fn maybe_log_stats(&mut self) {
        let interval = self.services.config.monitoring.stats_interval;
        if interval == 0 || self.last_stats.elapsed() < Duration::from_secs(interval) {
            return;
        }
        self.last_stats = Instant::now();

        let metrics = &self.services.metrics;
        info!(
            "Stats: {} active, {} accepted, {} closed, {} authenticated, {} failed",
            metrics.active_connections.get(),
            metrics.connections_accepted.get(),
            metrics.connections_closed.get(),
            metrics.auth_successes.get(),
            metrics.auth_failures.get()
        );

        match metrics.render() {
            Ok(text) => debug!("Metrics snapshot:\n{}", text),
            Err(e) => warn!("Failed to render metrics: {}", e),
        }
    }
}

impl<S: SecretStore, H: PayloadHandler> Services<S, H> {
    /// Read, process and write for one ready connection
    fn drive(&mut self, conn: &mut Connection, readable: bool) -> Result<(), ConnectionError> {
        let chunk_size = self.config.server.read_chunk_size;

        if readable {
            while !conn.is_closing() {
                if conn.read_chunk(chunk_size, Instant::now())?.is_none() {
                    break;
                }
                self.process(conn)?;
            }
        }

        conn.flush(Instant::now())?;
        Ok(())
    }

    /// Feed every complete inbound frame to the session
    fn process(&mut self, conn: &mut Connection) -> Result<(), ConnectionError> {
        let max_payload = self.config.protocol.max_payload_size;
        let max_outbound = self.config.server.max_outbound_buffer;

        while !conn.is_closing() {
            let Some(message) = conn.next_message(max_payload)? else {
                break;
            };
            self.metrics.frames_received.inc();
            debug!("{:?} from {}", message.message_type, conn.addr());

            let before = conn.session.state();
            let actions = {
                let mut ctx = SessionContext {
                    authenticator: &self.authenticator,
                    store: &mut self.store,
                    handler: &mut self.handler,
                };
                conn.session.handle(&message, unix_now(), &mut ctx)
            };
            self.record_transition(before, conn.session.state());

            for action in actions {
                match action {
                    SessionAction::SendFrame(reply) => {
                        conn.queue(&reply, max_outbound)?;
                        self.metrics.frames_sent.inc();
                    }
                    SessionAction::Close { reason } => conn.close_after_flush(reason),
                }
            }

            if !message.keep_alive {
                conn.close_after_flush("peer requested close".to_string());
            }
        }

        Ok(())
    }

    fn record_transition(&self, before: AuthState, after: AuthState) {
        if before == after {
            return;
        }
        match after {
            AuthState::Authenticated => self.metrics.auth_successes.inc(),
            AuthState::Failed => self.metrics.auth_failures.inc(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LoggingPayloadHandler;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use totpgate_crypto::{TotpConfig, seal_response};
    use totpgate_protocol::{
        Decoded, DEFAULT_MAX_PAYLOAD, HEADER_LEN, Message, MessageType, encode, try_decode,
    };
    use totpgate_storage::MemorySecretStore;

    const SECRET: &str = "JFAYYXHEMEIMMATA2TCN4EFC5H3WJP2QF4RAQVOHLVFV2TL5WX7WUCRZABJCIPIB";

    fn test_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.server.bind = "127.0.0.1:0".parse().unwrap();
        config.monitoring.stats_interval = 0;
        config
    }

    fn server(
        config: DaemonConfig,
    ) -> Multiplexer<MemorySecretStore, LoggingPayloadHandler> {
        let store = MemorySecretStore::with_entries([("alice", SECRET)]);
        Multiplexer::bind(config, store, LoggingPayloadHandler).unwrap()
    }

    fn connect(mux: &mut Multiplexer<MemorySecretStore, LoggingPayloadHandler>) -> TcpStream {
        let client = TcpStream::connect(mux.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        pump(mux);
        client
    }

    fn pump(mux: &mut Multiplexer<MemorySecretStore, LoggingPayloadHandler>) {
        for _ in 0..5 {
            mux.poll_once(Some(Duration::from_millis(10))).unwrap();
        }
    }

    /// Pump the server until the client has a whole frame, or EOF
    fn receive(
        mux: &mut Multiplexer<MemorySecretStore, LoggingPayloadHandler>,
        client: &mut TcpStream,
        buffer: &mut Vec<u8>,
    ) -> Option<Message> {
        for _ in 0..100 {
            if let Decoded::Frame { message, consumed } =
                try_decode(buffer, DEFAULT_MAX_PAYLOAD).unwrap()
            {
                buffer.drain(..consumed);
                return Some(message);
            }

            pump(mux);
            let mut chunk = [0u8; 1024];
            match client.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(_) => return None,
            }
        }
        panic!("no frame received");
    }

    fn is_closed(
        mux: &mut Multiplexer<MemorySecretStore, LoggingPayloadHandler>,
        client: &mut TcpStream,
    ) -> bool {
        let mut buffer = Vec::new();
        receive(mux, client, &mut buffer).is_none() && buffer.is_empty()
    }

    #[test]
    fn test_accept_and_count() {
        let mut mux = server(test_config());
        let _a = connect(&mut mux);
        let _b = connect(&mut mux);
        assert_eq!(mux.connection_count(), 2);
        assert_eq!(mux.metrics().connections_accepted.get(), 2);
    }

    #[test]
    fn test_handshake_over_socket() {
        let mut mux = server(test_config());
        let mut client = connect(&mut mux);
        let mut buffer = Vec::new();

        client
            .write_all(&encode(MessageType::AuthRequest, b"alice", true))
            .unwrap();
        let challenge = receive(&mut mux, &mut client, &mut buffer).unwrap();
        assert_eq!(challenge.message_type, MessageType::AuthChallenge);

        let engine = TotpEngine::new(TotpConfig::default()).unwrap();
        let now = unix_now();
        let challenge = std::str::from_utf8(&challenge.payload).unwrap();
        let sealed = seal_response(&engine, SECRET, challenge, now).unwrap();
        client
            .write_all(&Message::at(MessageType::AuthResponse, now, sealed).encode())
            .unwrap();

        let success = receive(&mut mux, &mut client, &mut buffer).unwrap();
        assert_eq!(success.message_type, MessageType::AuthSuccess);
        assert_eq!(
            mux.session_state(client.local_addr().unwrap()),
            Some(AuthState::Authenticated)
        );
        assert_eq!(mux.metrics().auth_successes.get(), 1);
        assert_ne!(mux.store().get("alice").unwrap().as_deref(), Some(SECRET));
    }

    #[test]
    fn test_frame_split_across_writes() {
        let mut mux = server(test_config());
        let mut client = connect(&mut mux);
        let mut buffer = Vec::new();

        let frame = encode(MessageType::AuthRequest, b"alice", true);
        for byte in &frame {
            client.write_all(std::slice::from_ref(byte)).unwrap();
            pump(&mut mux);
        }

        let reply = receive(&mut mux, &mut client, &mut buffer).unwrap();
        assert_eq!(reply.message_type, MessageType::AuthChallenge);
        assert_eq!(mux.metrics().frames_received.get(), 1);
    }

    #[test]
    fn test_bad_preamble_closes_without_reply() {
        let mut mux = server(test_config());
        let mut client = connect(&mut mux);

        client.write_all(&[0xAB; HEADER_LEN]).unwrap();

        assert!(is_closed(&mut mux, &mut client));
        assert_eq!(mux.connection_count(), 0);
        assert_eq!(mux.metrics().protocol_errors.get(), 1);
    }

    #[test]
    fn test_unauthenticated_payload_gets_failure() {
        let mut mux = server(test_config());
        let mut client = connect(&mut mux);
        let mut buffer = Vec::new();

        client
            .write_all(&encode(MessageType::Payload, b"data", true))
            .unwrap();

        let reply = receive(&mut mux, &mut client, &mut buffer).unwrap();
        assert_eq!(reply.message_type, MessageType::AuthFailure);
        assert!(!reply.keep_alive);
        assert!(receive(&mut mux, &mut client, &mut buffer).is_none());
        assert_eq!(mux.connection_count(), 0);
    }

    #[test]
    fn test_close_flag_closes_after_reply() {
        let mut mux = server(test_config());
        let mut client = connect(&mut mux);
        let mut buffer = Vec::new();

        client
            .write_all(&encode(MessageType::AuthRequest, b"alice", false))
            .unwrap();

        let reply = receive(&mut mux, &mut client, &mut buffer).unwrap();
        assert_eq!(reply.message_type, MessageType::AuthChallenge);
        assert!(receive(&mut mux, &mut client, &mut buffer).is_none());
    }

    #[test]
    fn test_peer_close() {
        let mut mux = server(test_config());
        let client = connect(&mut mux);
        assert_eq!(mux.connection_count(), 1);

        drop(client);
        pump(&mut mux);
        assert_eq!(mux.connection_count(), 0);
    }

    #[test]
    fn test_idle_eviction() {
        let mut mux = server(test_config());
        let _client = connect(&mut mux);

        // Within the timeout the connection stays
        mux.evict_idle(Instant::now() + Duration::from_secs(100));
        assert_eq!(mux.connection_count(), 1);

        mux.evict_idle(Instant::now() + Duration::from_secs(129));
        assert_eq!(mux.connection_count(), 0);
    }

    #[test]
    fn test_idle_eviction_by_loop() {
        let mut config = test_config();
        config.server.idle_timeout = 1;
        let mut mux = server(config);
        let mut client = connect(&mut mux);

        std::thread::sleep(Duration::from_millis(1100));
        assert!(is_closed(&mut mux, &mut client));
        assert_eq!(mux.connection_count(), 0);
    }

    #[test]
    fn test_backlogged_connection_dropped() {
        let mut config = test_config();
        config.server.max_outbound_buffer = HEADER_LEN;
        let mut mux = server(config);
        let mut client = connect(&mut mux);

        // The challenge reply alone exceeds the backlog limit
        client
            .write_all(&encode(MessageType::AuthRequest, b"alice", true))
            .unwrap();

        assert!(is_closed(&mut mux, &mut client));
        assert_eq!(mux.connection_count(), 0);
    }

    #[test]
    fn test_connection_limit() {
        let mut config = test_config();
        config.server.max_connections = 1;
        let mut mux = server(config);

        let _first = connect(&mut mux);
        let mut second = connect(&mut mux);

        assert_eq!(mux.connection_count(), 1);
        assert!(is_closed(&mut mux, &mut second));
    }

    #[test]
    fn test_one_bad_peer_does_not_affect_others() {
        let mut mux = server(test_config());
        let mut good = connect(&mut mux);
        let mut bad = connect(&mut mux);
        let mut buffer = Vec::new();

        bad.write_all(&[0u8; 64]).unwrap();
        assert!(is_closed(&mut mux, &mut bad));

        good.write_all(&encode(MessageType::AuthRequest, b"alice", true))
            .unwrap();
        let reply = receive(&mut mux, &mut good, &mut buffer).unwrap();
        assert_eq!(reply.message_type, MessageType::AuthChallenge);
        assert_eq!(mux.connection_count(), 1);
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let mut config = test_config();
        config.server.read_chunk_size = 0;
        let store = MemorySecretStore::new();
        assert!(Multiplexer::bind(config, store, LoggingPayloadHandler).is_err());
    }

    #[test]
    fn test_stats_snapshot_on_interval() {
        let mut config = test_config();
        config.monitoring.stats_interval = 1;
        let mut mux = server(config);
        let _client = connect(&mut mux);

        let stale = Instant::now() - Duration::from_secs(5);
        mux.last_stats = stale;
        mux.poll_once(Some(Duration::from_millis(1))).unwrap();
        assert!(mux.last_stats > stale);

        // Rendering is what the snapshot logs
        let text = mux.metrics().render().unwrap();
        assert!(text.contains("totpgate_active_connections 1"));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let mut mux = server(test_config());
        let _client = connect(&mut mux);

        let shutdown = AtomicBool::new(true);
        mux.run(&shutdown).unwrap();
        assert_eq!(mux.connection_count(), 0);
    }
}
