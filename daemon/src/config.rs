//! Daemon configuration

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use totpgate_crypto::{DEFAULT_SECRET_LENGTH, TotpConfig};
use totpgate_protocol::{DEFAULT_MAX_PAYLOAD, HEADER_LEN};

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Listener and event loop configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Frame limits
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Handshake policy
    #[serde(default)]
    pub auth: AuthConfig,

    /// TOTP parameters
    #[serde(default)]
    pub totp: TotpConfig,

    /// Secret store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reject settings the event loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        ensure!(server.read_chunk_size > 0, "server.read_chunk_size must be non-zero");
        ensure!(server.idle_timeout > 0, "server.idle_timeout must be non-zero");
        ensure!(server.poll_interval_ms > 0, "server.poll_interval_ms must be non-zero");
        ensure!(server.max_connections > 0, "server.max_connections must be non-zero");
        ensure!(
            server.max_outbound_buffer >= HEADER_LEN,
            "server.max_outbound_buffer must hold at least one frame header ({} bytes)",
            HEADER_LEN
        );

        let max_payload = self.protocol.max_payload_size;
        ensure!(
            (1..=MAX_PAYLOAD_LIMIT).contains(&max_payload),
            "protocol.max_payload_size must be between 1 and {}",
            MAX_PAYLOAD_LIMIT
        );

        let auth = &self.auth;
        ensure!(auth.max_retries > 0, "auth.max_retries must be non-zero");
        ensure!(auth.challenge_length > 0, "auth.challenge_length must be non-zero");
        ensure!(auth.secret_length > 0, "auth.secret_length must be non-zero");
        Ok(())
    }
}

/// Largest accepted `protocol.max_payload_size`
pub const MAX_PAYLOAD_LIMIT: usize = 16 * 1024 * 1024; // 16MB

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Seconds without reads or writes before a connection is evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Bytes requested per socket read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// Outbound backlog above which a connection is dropped
    #[serde(default = "default_max_outbound_buffer")]
    pub max_outbound_buffer: usize,

    /// Upper bound on a single poll wait, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7307))
}

fn default_idle_timeout() -> u64 {
    128
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_max_outbound_buffer() -> usize {
    1024 * 1024 // 1MB
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            idle_timeout: default_idle_timeout(),
            max_connections: default_max_connections(),
            read_chunk_size: default_read_chunk_size(),
            max_outbound_buffer: default_max_outbound_buffer(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Protocol configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Largest payload a peer may declare
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
        }
    }
}

/// Handshake policy
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Failed responses allowed before the handshake is rejected
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,

    /// Create and persist a secret for identifiers missing from the store
    #[serde(default = "default_auto_enroll")]
    pub auto_enroll: bool,

    /// Challenge length in symbols
    #[serde(default = "default_challenge_length")]
    pub challenge_length: usize,

    /// Length of generated secrets in symbols
    #[serde(default = "default_secret_length")]
    pub secret_length: usize,
}

fn default_max_retries() -> u8 {
    3
}

fn default_auto_enroll() -> bool {
    true
}

fn default_challenge_length() -> usize {
    32
}

fn default_secret_length() -> usize {
    DEFAULT_SECRET_LENGTH
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            auto_enroll: default_auto_enroll(),
            challenge_length: default_challenge_length(),
            secret_length: default_secret_length(),
        }
    }
}

/// Secret store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the `identifier:secret` file
    #[serde(default = "default_secrets_file")]
    pub secrets_file: PathBuf,
}

fn default_secrets_file() -> PathBuf {
    PathBuf::from("totpgate_secrets.txt")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            secrets_file: default_secrets_file(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Seconds between metric snapshots in the log (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

fn default_stats_interval() -> u64 {
    60
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            stats_interval: default_stats_interval(),
        }
    }
}
