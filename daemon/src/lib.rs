//! totpgate Daemon
//!
//! Single-threaded TOTP challenge-response server. A `Multiplexer` owns the
//! listener and every connection; each connection runs an `AuthSession`
//! state machine backed by a `SecretStore`.

pub mod auth;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod multiplexer;
pub mod session;


pub use auth::{AuthError, Authenticator};
pub use config::DaemonConfig;
pub use connection::{Connection, ConnectionError};
pub use metrics::Metrics;
pub use multiplexer::Multiplexer;
pub use session::{
    AuthSession, AuthState, LoggingPayloadHandler, PayloadHandler, SessionAction, SessionContext,
};
