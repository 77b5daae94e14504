//! totpgate Daemon
//!
//! Accepts TCP clients, authenticates them with a TOTP challenge-response
//! handshake, and hands decrypted payloads to the payload handler.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use totpgate_daemon::{DaemonConfig, LoggingPayloadHandler, Multiplexer};
use totpgate_storage::FileSecretStore;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = "totpgate.toml";

/// totpgate Daemon - TOTP handshake server
#[derive(Parser, Debug)]
#[command(name = "totpgated")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Override the listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Override the secrets file
    #[arg(long)]
    secrets: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("totpgate daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = if args.config == DEFAULT_CONFIG && !Path::new(DEFAULT_CONFIG).exists() {
        warn!("{} not found, using defaults", DEFAULT_CONFIG);
        DaemonConfig::default()
    } else {
        let config = DaemonConfig::load(&args.config)?;
        info!("Loaded configuration from {}", args.config);
        config
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(secrets) = args.secrets {
        config.storage.secrets_file = secrets.into();
    }

    let store = FileSecretStore::open(&config.storage.secrets_file).with_context(|| {
        format!(
            "opening secrets file {}",
            config.storage.secrets_file.display()
        )
    })?;
    info!(
        "Loaded {} identities from {}",
        store.len(),
        store.path().display()
    );

    let mut multiplexer = Multiplexer::bind(config, store, LoggingPayloadHandler)?;
    multiplexer.serve()
}
