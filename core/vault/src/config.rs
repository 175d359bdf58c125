//! Service configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use phantomvault_common::{io_err, Error, Result};
use phantomvault_crypto::{EncryptionEngine, KdfParams};
use phantomvault_storage::fsutil::write_private_file_atomic;
use phantomvault_storage::StorageLayout;

/// Directory under the home directory used when no root is configured.
pub const DEFAULT_ROOT_DIRNAME: &str = ".phantom_vault_storage";

/// Default PBKDF2 iteration count for new credentials and folder keys.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Default plaintext chunk size for file encryption.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default number of backups kept per folder.
pub const DEFAULT_BACKUP_KEEP_COUNT: usize = 3;

/// Settings a [`VaultService`](crate::VaultService) is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceConfig {
    /// Directory holding one subdirectory per OS user.
    pub vault_root: PathBuf,
    /// OS user whose store is opened.
    pub username: String,
    /// PBKDF2 iterations for newly derived keys.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    /// Plaintext bytes per encrypted chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Backups kept per folder after each transition.
    #[serde(default = "default_backup_keep_count")]
    pub backup_keep_count: usize,
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_backup_keep_count() -> usize {
    DEFAULT_BACKUP_KEEP_COUNT
}

impl ServiceConfig {
    /// Configuration with default tuning for `username` under `vault_root`.
    pub fn new(vault_root: impl Into<PathBuf>, username: impl Into<String>) -> Self {
        Self {
            vault_root: vault_root.into(),
            username: username.into(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            backup_keep_count: DEFAULT_BACKUP_KEEP_COUNT,
        }
    }

    /// Configuration rooted at `~/.phantom_vault_storage`.
    ///
    /// # Errors
    /// - `Error::NotFound` if the home directory cannot be determined
    pub fn for_user(username: impl Into<String>) -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| Error::NotFound("home directory".to_string()))?;
        Ok(Self::new(home.join(DEFAULT_ROOT_DIRNAME), username))
    }

    /// KDF parameters for new keys.
    pub fn kdf_params(&self) -> Result<KdfParams> {
        KdfParams::with_iterations(self.kdf_iterations)
    }

    /// Engine configured with these settings.
    pub fn engine(&self) -> Result<EncryptionEngine> {
        EncryptionEngine::new(self.kdf_params()?, self.chunk_size)
    }

    /// On-disk layout for the configured user.
    pub fn layout(&self) -> Result<StorageLayout> {
        StorageLayout::new(&self.vault_root, &self.username)
    }

    /// Check the settings without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        self.layout()?;
        self.engine()?;
        if self.backup_keep_count == 0 {
            return Err(Error::InvalidInput(
                "backup keep count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Read a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(io_err(path))?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as JSON, atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        write_private_file_atomic(path, &json)
    }
}
