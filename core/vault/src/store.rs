//! MetadataStore: integrity-protected profile and folder documents.
//!
//! Every document carries an HMAC-SHA256 tag over its serialized form. The
//! tag key is derived per document from a random key kept next to the
//! metadata, so a folder document cannot be swapped between profiles
//! without detection.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, error, info};

use crate::records::{BackupEntry, FolderRecord, FoldersDocument, ProfileRecord, ProfilesDocument};
use phantomvault_common::{io_err, Error, FolderId, ProfileId, Result, UnlockMode};
use phantomvault_crypto::VaultKey;
use phantomvault_storage::fsutil::write_private_file_atomic;
use phantomvault_storage::tree::remove_path;
use phantomvault_storage::StorageLayout;

type HmacSha256 = Hmac<Sha256>;

const PROFILES_CONTEXT: &[u8] = b"phantomvault-profiles";
const FOLDERS_CONTEXT: &[u8] = b"phantomvault-folders:";

/// Durable store for profiles and per-profile folders.
pub struct MetadataStore {
    layout: StorageLayout,
    integrity_key: VaultKey,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    /// Open the store, creating the integrity key on first use.
    ///
    /// # Errors
    /// - `Error::Integrity` if the key file exists but is malformed
    pub fn open(layout: StorageLayout) -> Result<Self> {
        layout.ensure_directories()?;
        let key_path = layout.integrity_key_file();

        let integrity_key = if key_path.exists() {
            let bytes = fs::read(&key_path).map_err(io_err(&key_path))?;
            VaultKey::from_slice(&bytes).map_err(|_| {
                Error::Integrity(format!("{} is not a valid key file", key_path.display()))
            })?
        } else {
            let key = VaultKey::generate();
            write_private_file_atomic(&key_path, key.as_bytes())?;
            info!(path = %key_path.display(), "metadata integrity key created");
            key
        };

        Ok(Self {
            layout,
            integrity_key,
            write_lock: Mutex::new(()),
        })
    }

    /// Layout the store reads from.
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Transaction("metadata lock poisoned".to_string()))
    }

    fn folders_context(profile: &ProfileId) -> Vec<u8> {
        let mut context = FOLDERS_CONTEXT.to_vec();
        context.extend_from_slice(profile.as_str().as_bytes());
        context
    }

    fn tag(&self, context: &[u8], body: &[u8]) -> Result<HmacSha256> {
        let key = self.integrity_key.derive_subkey(context);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| Error::Integrity(format!("integrity key rejected: {}", e)))?;
        mac.update(body);
        Ok(mac)
    }

    fn write_document<T: Serialize>(&self, path: &Path, context: &[u8], doc: &T) -> Result<String> {
        let body = to_json(doc)?;
        let tag = hex::encode(self.tag(context, &body)?.finalize().into_bytes());

        let mut value = serde_json::to_value(doc).map_err(|e| Error::Serialization(e.to_string()))?;
        if let Some(object) = value.as_object_mut() {
            object.insert("hmac".to_string(), serde_json::Value::String(tag.clone()));
        }
        let bytes = serde_json::to_vec_pretty(&value).map_err(|e| Error::Serialization(e.to_string()))?;
        write_private_file_atomic(path, &bytes)?;
        Ok(tag)
    }

    fn read_document<T, F>(&self, path: &Path, context: &[u8], take_tag: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Option<String>,
    {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).map_err(io_err(path))?;
        let mut doc: T = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Integrity(format!("{} is malformed: {}", path.display(), e))
        })?;

        let tag = take_tag(&mut doc)
            .ok_or_else(|| Error::Integrity(format!("{} has no integrity tag", path.display())))?;
        let expected = hex::decode(&tag)
            .map_err(|_| Error::Integrity(format!("{} has a malformed integrity tag", path.display())))?;

        let body = to_json(&doc)?;
        if self.tag(context, &body)?.verify_slice(&expected).is_err() {
            error!(path = %path.display(), "metadata integrity check failed");
            return Err(Error::Integrity(format!(
                "{} failed its integrity check",
                path.display()
            )));
        }
        Ok(Some(doc))
    }

    // ----- profiles -----

    /// Load the profile collection. A missing file is an empty collection.
    ///
    /// # Errors
    /// - `Error::Integrity` on a tag mismatch or an invalid document
    pub fn load_profiles(&self) -> Result<ProfilesDocument> {
        let path = self.layout.profiles_file();
        let doc = self
            .read_document(&path, PROFILES_CONTEXT, |d: &mut ProfilesDocument| d.hmac.take())?
            .unwrap_or_default();
        doc.validate()?;
        Ok(doc)
    }

    /// Validate, tag and atomically write the profile collection.
    pub fn save_profiles(&self, doc: &mut ProfilesDocument) -> Result<()> {
        let _guard = self.lock()?;
        self.save_profiles_locked(doc)
    }

    fn save_profiles_locked(&self, doc: &mut ProfilesDocument) -> Result<()> {
        doc.validate()?;
        doc.hmac = None;
        doc.last_modified = Utc::now();
        let tag = self.write_document(&self.layout.profiles_file(), PROFILES_CONTEXT, doc)?;
        doc.hmac = Some(tag);
        debug!(profiles = doc.profiles.len(), "profiles saved");
        Ok(())
    }

    /// Load, modify and save the profile collection under the write lock.
    ///
    /// Nothing is written if `f` fails.
    pub fn update_profiles<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ProfilesDocument) -> Result<R>,
    {
        let _guard = self.lock()?;
        let mut doc = self.load_profiles()?;
        let result = f(&mut doc)?;
        self.save_profiles_locked(&mut doc)?;
        Ok(result)
    }

    /// Profile by id.
    pub fn get_profile(&self, id: &ProfileId) -> Result<ProfileRecord> {
        self.load_profiles()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("profile {}", id)))
    }

    /// The active profile, if one is set.
    pub fn get_active_profile(&self) -> Result<Option<ProfileRecord>> {
        let doc = self.load_profiles()?;
        Ok(doc
            .active_profile_id
            .as_ref()
            .and_then(|id| doc.get(id))
            .cloned())
    }

    // ----- folders -----

    /// Load a profile's folder collection. A missing file is empty.
    ///
    /// # Errors
    /// - `Error::Integrity` on a tag mismatch or an invalid document
    /// - `Error::ProfileIsolation` if the document belongs to another profile
    pub fn load_folders(&self, profile: &ProfileId) -> Result<FoldersDocument> {
        let path = self.layout.folders_file(profile);
        let doc = self
            .read_document(&path, &Self::folders_context(profile), |d: &mut FoldersDocument| {
                d.hmac.take()
            })?
            .unwrap_or_else(|| FoldersDocument::empty(profile.clone()));
        if &doc.profile_id != profile {
            return Err(Error::ProfileIsolation {
                profile: profile.to_string(),
                folder: doc.profile_id.to_string(),
            });
        }
        doc.validate()?;
        Ok(doc)
    }

    /// Validate, tag and atomically write a profile's folder collection.
    pub fn save_folders(&self, profile: &ProfileId, doc: &mut FoldersDocument) -> Result<()> {
        let _guard = self.lock()?;
        self.save_folders_locked(profile, doc)
    }

    fn save_folders_locked(&self, profile: &ProfileId, doc: &mut FoldersDocument) -> Result<()> {
        if &doc.profile_id != profile {
            return Err(Error::ProfileIsolation {
                profile: profile.to_string(),
                folder: doc.profile_id.to_string(),
            });
        }
        doc.validate()?;
        doc.hmac = None;
        doc.last_modified = Utc::now();
        let tag = self.write_document(
            &self.layout.folders_file(profile),
            &Self::folders_context(profile),
            doc,
        )?;
        doc.hmac = Some(tag);
        debug!(profile = %profile, folders = doc.folders.len(), "folders saved");
        Ok(())
    }

    /// Load, modify and save a folder collection under the write lock.
    ///
    /// Nothing is written if `f` fails.
    pub fn update_folders<F, R>(&self, profile: &ProfileId, f: F) -> Result<R>
    where
        F: FnOnce(&mut FoldersDocument) -> Result<R>,
    {
        let _guard = self.lock()?;
        let mut doc = self.load_folders(profile)?;
        let result = f(&mut doc)?;
        self.save_folders_locked(profile, &mut doc)?;
        Ok(result)
    }

    /// Folder by id within a profile.
    pub fn get_folder(&self, profile: &ProfileId, id: &FolderId) -> Result<FolderRecord> {
        self.load_folders(profile)?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("folder {}", id)))
    }

    /// Set a folder's lock state.
    ///
    /// Locking requires `vault_path`; unlocking requires `unlock_mode`.
    pub fn update_folder_state(
        &self,
        profile: &ProfileId,
        id: &FolderId,
        is_locked: bool,
        vault_path: Option<&Path>,
        unlock_mode: Option<UnlockMode>,
    ) -> Result<FolderRecord> {
        self.update_folders(profile, |doc| {
            let folder = doc.require_mut(id)?;
            if is_locked {
                let vault_path = vault_path.ok_or_else(|| {
                    Error::InvalidInput("locking a folder requires a vault path".to_string())
                })?;
                folder.mark_locked(vault_path.to_path_buf());
            } else {
                let mode = unlock_mode.ok_or_else(|| {
                    Error::InvalidInput("unlocking a folder requires a mode".to_string())
                })?;
                folder.mark_unlocked(mode);
            }
            Ok(folder.clone())
        })
    }

    /// Append to a folder's backup history.
    pub fn add_backup_entry(&self, profile: &ProfileId, id: &FolderId, entry: BackupEntry) -> Result<()> {
        self.update_folders(profile, |doc| {
            doc.require_mut(id)?.backups.push(entry);
            Ok(())
        })
    }

    /// Profile that owns folder `id`, searching every profile.
    pub fn find_folder_owner(&self, id: &FolderId) -> Result<Option<ProfileId>> {
        for profile in self.load_profiles()?.profiles {
            if self.load_folders(&profile.id)?.get(id).is_some() {
                return Ok(Some(profile.id));
            }
        }
        Ok(None)
    }

    /// Profile that registered `path`, searching every profile.
    pub fn find_path_owner(&self, path: &Path) -> Result<Option<(ProfileId, FolderId)>> {
        for profile in self.load_profiles()?.profiles {
            if let Some(folder) = self
                .load_folders(&profile.id)?
                .folders
                .iter()
                .find(|f| f.folder_path == path)
            {
                return Ok(Some((profile.id, folder.id.clone())));
            }
        }
        Ok(None)
    }

    /// Re-read every document and check its tag.
    pub fn validate_integrity(&self) -> Result<()> {
        for profile in self.load_profiles()?.profiles {
            self.load_folders(&profile.id)?;
        }
        Ok(())
    }

    /// Delete a profile's folder metadata.
    pub fn remove_profile_metadata(&self, profile: &ProfileId) -> Result<()> {
        let _guard = self.lock()?;
        remove_path(&self.layout.profile_metadata_dir(profile))
    }
}

fn to_json<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(doc).map_err(|e| Error::Serialization(e.to_string()))
}
