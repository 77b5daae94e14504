use std::collections::HashMap;

use crate::{SecretStore, StoreError, validate_record};

/// Volatile secret store
#[derive(Debug, Default, Clone)]
pub struct MemorySecretStore {
    entries: HashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from existing records
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, identifier: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(identifier).cloned())
    }

    fn put(&mut self, identifier: &str, secret: &str) -> Result<(), StoreError> {
        validate_record(identifier, secret)?;
        self.entries.insert(identifier.to_string(), secret.to_string());
        Ok(())
    }
}
