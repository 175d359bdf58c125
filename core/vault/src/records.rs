//! Persisted profile and folder records.
//!
//! Field names are camelCase on disk and unknown fields are rejected.
//! Timestamps are stored as Unix milliseconds.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use phantomvault_common::{Error, FolderId, OperationTag, ProfileId, Result, UnlockMode};

/// One backup taken for a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackupEntry {
    /// When the backup was taken.
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Backup directory.
    pub path: PathBuf,
    /// Why it was taken.
    pub operation: OperationTag,
}

/// Re-encryption left over from a password change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PendingRekey {
    /// Key version folders are being moved away from.
    pub from_version: u32,
    /// Previous password sealed under the current one.
    pub previous_password: String,
}

/// A profile: the isolation boundary for credentials and folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProfileRecord {
    pub id: ProfileId,
    pub name: String,
    pub os_user: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub last_access: DateTime<Utc>,
    /// `salt:hash` of the profile password.
    pub hashed_password: String,
    /// Recovery key sealed under the password.
    pub encrypted_recovery_key: String,
    /// `salt:hash` of the recovery key.
    pub recovery_key_hash: String,
    /// Password sealed under the recovery key.
    pub master_key_encrypted_with_recovery: String,
    /// Bumped on every password change.
    pub key_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_rekey: Option<PendingRekey>,
}

impl ProfileRecord {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid(format!("profile {} has an empty name", self.id)));
        }
        if self.key_version == 0 {
            return Err(invalid(format!("profile {} has key version 0", self.id)));
        }
        if let Some(pending) = &self.pending_rekey {
            if pending.from_version >= self.key_version {
                return Err(invalid(format!(
                    "profile {} has a pending re-encryption from a newer key",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// A folder under vault management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FolderRecord {
    pub id: FolderId,
    pub profile_id: ProfileId,
    pub folder_name: String,
    /// Where the folder lives when unlocked.
    pub folder_path: PathBuf,
    pub is_locked: bool,
    pub uses_master_password: bool,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub last_access: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_mode: Option<UnlockMode>,
    /// Set only while unlocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<PathBuf>,
    /// Set only while locked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_path: Option<PathBuf>,
    /// Key version the vault copy is encrypted under.
    pub key_version: u32,
    /// Digest of the encrypted vault tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_hash: Option<String>,
    #[serde(default)]
    pub backups: Vec<BackupEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_recovery_key_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_custom_recovery_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_password_encrypted_with_recovery: Option<String>,
}

impl FolderRecord {
    /// Label used in backup directory names. Includes the id so folders
    /// that share a display name never share backups.
    pub fn backup_label(&self) -> String {
        format!("{}_{}", self.folder_name, self.id)
    }

    /// Whether the folder still waits for re-encryption under `profile_version`.
    pub fn needs_rekey(&self, profile_version: u32) -> bool {
        self.is_locked && self.uses_master_password && self.key_version < profile_version
    }

    /// Move to the locked state.
    pub fn mark_locked(&mut self, vault_path: PathBuf) {
        self.is_locked = true;
        self.vault_path = Some(vault_path);
        self.original_path = None;
        self.unlock_mode = None;
        self.last_access = Some(Utc::now());
    }

    /// Move to the unlocked state.
    pub fn mark_unlocked(&mut self, mode: UnlockMode) {
        self.is_locked = false;
        self.original_path = Some(self.folder_path.clone());
        self.vault_path = None;
        self.unlock_mode = Some(mode);
        self.vault_hash = None;
        self.last_access = Some(Utc::now());
    }

    fn validate(&self) -> Result<()> {
        if self.folder_name.is_empty() {
            return Err(invalid(format!("folder {} has an empty name", self.id)));
        }
        if self.is_locked {
            if self.vault_path.is_none() || self.original_path.is_some() || self.unlock_mode.is_some() {
                return Err(invalid(format!(
                    "locked folder {} must have only a vault path",
                    self.id
                )));
            }
        } else if self.original_path.is_none() || self.vault_path.is_some() || self.unlock_mode.is_none() {
            return Err(invalid(format!(
                "unlocked folder {} must have only an original path and a mode",
                self.id
            )));
        }

        let custom = [
            &self.custom_password_hash,
            &self.custom_recovery_key_hash,
            &self.encrypted_custom_recovery_key,
            &self.custom_password_encrypted_with_recovery,
        ];
        let present = custom.iter().filter(|c| c.is_some()).count();
        if self.uses_master_password && present != 0 {
            return Err(invalid(format!(
                "folder {} uses the master password but has custom credentials",
                self.id
            )));
        }
        if !self.uses_master_password && present != custom.len() {
            return Err(invalid(format!(
                "folder {} has incomplete custom credentials",
                self.id
            )));
        }
        Ok(())
    }
}

/// The profile collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProfilesDocument {
    #[serde(default)]
    pub profiles: Vec<ProfileRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_profile_id: Option<ProfileId>,
    #[serde(with = "ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
    /// Integrity tag over the document with this field absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl Default for ProfilesDocument {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            active_profile_id: None,
            last_modified: Utc::now(),
            hmac: None,
        }
    }
}

impl ProfilesDocument {
    /// Profile by id.
    pub fn get(&self, id: &ProfileId) -> Option<&ProfileRecord> {
        self.profiles.iter().find(|p| &p.id == id)
    }

    /// Mutable profile by id.
    pub fn get_mut(&mut self, id: &ProfileId) -> Option<&mut ProfileRecord> {
        self.profiles.iter_mut().find(|p| &p.id == id)
    }

    /// Reject duplicate ids or names and a dangling active profile.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !ids.insert(&profile.id) {
                return Err(invalid(format!("duplicate profile id {}", profile.id)));
            }
            if !names.insert(profile.name.as_str()) {
                return Err(invalid(format!("duplicate profile name {}", profile.name)));
            }
        }
        if let Some(active) = &self.active_profile_id {
            if !ids.contains(active) {
                return Err(invalid(format!("active profile {} does not exist", active)));
            }
        }
        Ok(())
    }
}

/// The folder collection of one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FoldersDocument {
    pub profile_id: ProfileId,
    #[serde(default)]
    pub folders: Vec<FolderRecord>,
    #[serde(with = "ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
    /// Integrity tag over the document with this field absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl FoldersDocument {
    /// Empty collection for `profile_id`.
    pub fn empty(profile_id: ProfileId) -> Self {
        Self {
            profile_id,
            folders: Vec::new(),
            last_modified: Utc::now(),
            hmac: None,
        }
    }

    /// Folder by id.
    pub fn get(&self, id: &FolderId) -> Option<&FolderRecord> {
        self.folders.iter().find(|f| &f.id == id)
    }

    /// Mutable folder by id.
    pub fn get_mut(&mut self, id: &FolderId) -> Option<&mut FolderRecord> {
        self.folders.iter_mut().find(|f| &f.id == id)
    }

    /// Mutable folder by id, or `Error::NotFound`.
    pub fn require_mut(&mut self, id: &FolderId) -> Result<&mut FolderRecord> {
        self.get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("folder {}", id)))
    }

    /// Drop a folder. Returns the removed record.
    pub fn remove(&mut self, id: &FolderId) -> Option<FolderRecord> {
        let index = self.folders.iter().position(|f| &f.id == id)?;
        Some(self.folders.remove(index))
    }

    /// Reject duplicate ids, foreign records and inconsistent states.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for folder in &self.folders {
            if folder.profile_id != self.profile_id {
                return Err(Error::ProfileIsolation {
                    profile: self.profile_id.to_string(),
                    folder: folder.id.to_string(),
                });
            }
            if !ids.insert(&folder.id) {
                return Err(invalid(format!("duplicate folder id {}", folder.id)));
            }
            folder.validate()?;
        }
        Ok(())
    }
}

fn invalid(message: String) -> Error {
    Error::Integrity(message)
}
