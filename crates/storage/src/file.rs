use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{SecretStore, StoreError, validate_record};

/// Flat-file secret store
///
/// The whole file is loaded at open and rewritten on every `put`. Writes go to
/// a sibling temp file which is then renamed over the original.
pub struct FileSecretStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileSecretStore {
    /// Open a store, loading every record. A missing file yields an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Secret store {} not found, starting empty", path.display());
                String::new()
            }
            Err(e) => return Err(StoreError::ReadFailure(e)),
        };

        let entries = parse(&content);
        debug!("Loaded {} secrets from {}", entries.len(), path.display());

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save_to_disk(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut file = fs::File::create(&tmp_path)?;
            for (identifier, secret) in &self.entries {
                writeln!(file, "{}:{}", identifier, secret)?;
            }
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, identifier: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(identifier).cloned())
    }

    fn put(&mut self, identifier: &str, secret: &str) -> Result<(), StoreError> {
        validate_record(identifier, secret)?;

        let previous = self.entries.insert(identifier.to_string(), secret.to_string());

        if let Err(e) = self.save_to_disk() {
            // Keep memory consistent with what is on disk
            match previous {
                Some(old) => self.entries.insert(identifier.to_string(), old),
                None => self.entries.remove(identifier),
            };
            return Err(StoreError::WriteFailure(e));
        }

        Ok(())
    }
}

fn parse(content: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();

    // `lines` strips the line ending; nothing else is trimmed, so records
    // read back exactly as written
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        match line.split_once(':') {
            Some((identifier, secret)) if validate_record(identifier, secret).is_ok() => {
                entries.insert(identifier.to_string(), secret.to_string());
            }
            _ => warn!("Skipping malformed secret store line {}", index + 1),
        }
    }

    entries
}
