//! totpgate Storage - Shared secret persistence
//!
//! This crate provides:
//! - `SecretStore`: the identifier -> secret interface the daemon calls
//! - `FileSecretStore`: `identifier:secret` lines, rewritten in full on every change
//! - `MemorySecretStore`: volatile map for tests and throwaway deployments

mod file;
mod memory;

pub use file::FileSecretStore;
pub use memory::MemorySecretStore;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Secret store read failed: {0}")]
    ReadFailure(#[source] std::io::Error),

    #[error("Secret store write failed: {0}")]
    WriteFailure(#[source] std::io::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(&'static str),
}

/// Identifier -> secret mapping
///
/// Calls are synchronous; the daemon invokes them from its event-loop thread.
pub trait SecretStore {
    /// Look up the secret for `identifier`
    fn get(&self, identifier: &str) -> Result<Option<String>, StoreError>;

    /// Insert or replace the secret for `identifier`
    fn put(&mut self, identifier: &str, secret: &str) -> Result<(), StoreError>;
}

/// Check that a record survives the `identifier:secret\n` line format
pub fn validate_record(identifier: &str, secret: &str) -> Result<(), StoreError> {
    if identifier.is_empty() {
        return Err(StoreError::InvalidRecord("empty identifier"));
    }
    if secret.is_empty() {
        return Err(StoreError::InvalidRecord("empty secret"));
    }
    let forbidden = |c: char| c == ':' || c == '\n' || c == '\r';
    if identifier.contains(forbidden) {
        return Err(StoreError::InvalidRecord("identifier contains a separator"));
    }
    if secret.contains(forbidden) {
        return Err(StoreError::InvalidRecord("secret contains a separator"));
    }
    if identifier.trim() != identifier {
        return Err(StoreError::InvalidRecord("identifier has surrounding whitespace"));
    }
    if secret.trim() != secret {
        return Err(StoreError::InvalidRecord("secret has surrounding whitespace"));
    }
    Ok(())
}
