// Credential persistence to the per-user token file

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

use super::types::CredentialRecord;

/// Directory under the home directory holding the token file
const TOKEN_DIR: &str = ".ktalk-mcp";

/// Token file name
const TOKEN_FILE: &str = "token.json";

/// File-based store for the single login record (`~/.ktalk-mcp/token.json`)
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a store at a specific path
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default token file location
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(TOKEN_DIR)
            .join(TOKEN_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted record.
    /// Missing, unreadable, malformed or invalid files all read as "no record".
    pub fn load(&self) -> Option<CredentialRecord> {
        match self.try_load() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Ignoring unusable token file"
                );
                None
            }
        }
    }

    fn try_load(&self) -> Result<Option<CredentialRecord>, StorageError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No token file");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let record: CredentialRecord = serde_json::from_str(&contents)?;
        record.validate().map_err(StorageError::Invalid)?;
        Ok(Some(record))
    }

    /// Persist the record atomically: temp file in the same directory, then rename
    pub fn save(&self, record: &CredentialRecord) -> Result<(), StorageError> {
        record.validate().map_err(StorageError::Invalid)?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !dir.exists() {
            create_private_dir(dir)?;
        }

        let data = serde_json::to_vec_pretty(record)?;
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(TOKEN_FILE);
        let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let result = write_private_file(&tmp_path, &data)
            .and_then(|_| fs::rename(&tmp_path, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        tracing::debug!(path = %self.path.display(), "Token file saved");
        Ok(())
    }

    /// Remove the persisted record; a missing file is fine
    pub fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Token file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

/// Write `data` to a new owner-only file and sync it to disk
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
