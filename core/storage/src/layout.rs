//! On-disk layout of a user's vault root.
//!
//! ```text
//! <vault-root>/<username>/
//!   metadata/profiles.json
//!   metadata/integrity.key
//!   metadata/<profileId>/folders.json
//!   vaults/<profileId>/<folderName>_vault_<folderId>/
//!   backups/<profileId>/<folderName>_<folderId>_backup_<opTag>_<timestampMs>/
//! ```

use std::path::{Component, Path, PathBuf};

use crate::fsutil::ensure_private_dir;
use phantomvault_common::{Error, ProfileId, Result};

const METADATA_DIR: &str = "metadata";
const VAULTS_DIR: &str = "vaults";
const BACKUPS_DIR: &str = "backups";
const PROFILES_FILE: &str = "profiles.json";
const FOLDERS_FILE: &str = "folders.json";
const INTEGRITY_KEY_FILE: &str = "integrity.key";

/// Paths under one OS user's vault root.
///
/// Vault and backup directories are scoped per profile:
/// `vaults/<profileId>/` and `backups/<profileId>/`, not flat `vaults/` and
/// `backups/` directories. Backup names also carry the folder id
/// (`<folderName>_<folderId>_backup_<opTag>_<timestampMs>`). Stores written
/// with the flat layout or `<folderName>_backup_...` names are not found
/// at these paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Layout for `username` under `vault_root`.
    ///
    /// # Errors
    /// - Returns error if `username` is empty or not a single path component
    pub fn new(vault_root: impl AsRef<Path>, username: &str) -> Result<Self> {
        let mut components = Path::new(username).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => {
                return Err(Error::InvalidInput(format!(
                    "Invalid username for vault layout: {:?}",
                    username
                )))
            }
        }
        Ok(Self {
            root: vault_root.as_ref().join(username),
        })
    }

    /// The per-user root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding metadata documents.
    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    /// Profile collection document.
    pub fn profiles_file(&self) -> PathBuf {
        self.metadata_dir().join(PROFILES_FILE)
    }

    /// Key file used for metadata integrity tags.
    pub fn integrity_key_file(&self) -> PathBuf {
        self.metadata_dir().join(INTEGRITY_KEY_FILE)
    }

    /// Per-profile metadata directory.
    pub fn profile_metadata_dir(&self, profile: &ProfileId) -> PathBuf {
        self.metadata_dir().join(profile.as_str())
    }

    /// Folder collection document for a profile.
    pub fn folders_file(&self, profile: &ProfileId) -> PathBuf {
        self.profile_metadata_dir(profile).join(FOLDERS_FILE)
    }

    /// Vault directory for a profile.
    pub fn vaults_dir(&self, profile: &ProfileId) -> PathBuf {
        self.root.join(VAULTS_DIR).join(profile.as_str())
    }

    /// Backup directory for a profile.
    pub fn backups_dir(&self, profile: &ProfileId) -> PathBuf {
        self.root.join(BACKUPS_DIR).join(profile.as_str())
    }

    /// Create the shared directories with owner-only permissions.
    pub fn ensure_directories(&self) -> Result<()> {
        ensure_private_dir(&self.root)?;
        ensure_private_dir(&self.metadata_dir())?;
        ensure_private_dir(&self.root.join(VAULTS_DIR))?;
        ensure_private_dir(&self.root.join(BACKUPS_DIR))
    }

    /// Create a profile's directories with owner-only permissions.
    pub fn ensure_profile_directories(&self, profile: &ProfileId) -> Result<()> {
        self.ensure_directories()?;
        ensure_private_dir(&self.profile_metadata_dir(profile))?;
        ensure_private_dir(&self.vaults_dir(profile))?;
        ensure_private_dir(&self.backups_dir(profile))
    }

    /// Whether `path` lies inside this layout's root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}
