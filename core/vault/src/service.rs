//! VaultService: authorization and orchestration of folder transitions.
//!
//! Every public operation names the profile it acts for. Folder lookups
//! only ever read that profile's document; a folder that exists under a
//! different profile is reported as [`Error::ProfileIsolation`].
//!
//! Each transition runs as one storage transaction on a fresh
//! [`VaultStorageManager`]. The metadata write is the last step inside
//! the transaction, so a failure anywhere, including the write itself,
//! rolls the filesystem back and leaves the stored state untouched.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::cipher::{FolderCipher, MANIFEST_DIR};
use crate::config::ServiceConfig;
use crate::inflight::InFlightRegistry;
use crate::records::{BackupEntry, FolderRecord, PendingRekey, ProfileRecord};
use crate::request::{
    AdminGrant, Credential, FolderLocked, FolderRef, LockRequest, PasswordChanged, ProfileCreated,
    ProfileSummary, RekeyOutcome, UnlockRequest,
};
use crate::store::MetadataStore;
use phantomvault_common::{Error, FolderId, OperationTag, ProfileId, Result, StorageError, UnlockMode};
use phantomvault_crypto::{
    generate_recovery_key, normalize_recovery_key, random_bytes, CredentialStore, EncryptionEngine,
};
use phantomvault_storage::{OperationReport, Progress, StorageLayout, VaultStorageManager};

/// Shortest accepted profile or folder password.
pub const MIN_PASSWORD_LENGTH: usize = 4;

/// The vault engine's composition root.
pub struct VaultService {
    config: ServiceConfig,
    layout: StorageLayout,
    cipher: FolderCipher,
    credentials: CredentialStore,
    store: MetadataStore,
    in_flight: InFlightRegistry,
}

impl VaultService {
    /// Assemble a service from its parts.
    ///
    /// # Preconditions
    /// - `store` was opened on the layout described by `config`
    pub fn new(
        config: ServiceConfig,
        engine: EncryptionEngine,
        credentials: CredentialStore,
        store: MetadataStore,
    ) -> Result<Self> {
        config.validate()?;
        let layout = store.layout().clone();
        Ok(Self {
            config,
            layout,
            cipher: FolderCipher::new(engine),
            credentials,
            store,
            in_flight: InFlightRegistry::new(),
        })
    }

    /// Build every part from `config` and open the metadata store.
    pub fn open(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let engine = config.engine()?;
        let credentials = CredentialStore::new(config.kdf_params()?);
        let store = MetadataStore::open(config.layout()?)?;
        info!(root = %store.layout().root().display(), "vault service opened");
        Self::new(config, engine, credentials, store)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    // ----- profiles -----

    /// Grant for creating the first profile.
    ///
    /// # Errors
    /// - `Error::Credential` once any profile exists
    pub fn bootstrap_grant(&self) -> Result<AdminGrant> {
        if self.store.load_profiles()?.profiles.is_empty() {
            Ok(AdminGrant::new())
        } else {
            Err(Error::Credential)
        }
    }

    /// Grant for creating further profiles, proven with an existing
    /// profile's password.
    pub fn admin_grant(&self, profile_id: &ProfileId, password: &str) -> Result<AdminGrant> {
        self.authenticate(profile_id, password)?;
        Ok(AdminGrant::new())
    }

    /// Create a profile. The first profile becomes the active one.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for an empty name or a short password
    /// - `Error::AlreadyExists` if the name is taken
    pub fn create_profile(&self, _grant: &AdminGrant, name: &str, password: &str) -> Result<ProfileCreated> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("profile name cannot be empty".to_string()));
        }
        check_password(password)?;

        let recovery_key = Zeroizing::new(generate_recovery_key());
        let now = Utc::now();
        let record = ProfileRecord {
            id: new_profile_id()?,
            name: name.to_string(),
            os_user: self.config.username.clone(),
            created_at: now,
            last_access: now,
            hashed_password: self.credentials.hash_password(password, None)?,
            encrypted_recovery_key: self.credentials.seal_secret(recovery_key.as_bytes(), password)?,
            recovery_key_hash: self.credentials.hash_recovery_key(&recovery_key)?,
            master_key_encrypted_with_recovery: self
                .credentials
                .seal_secret(password.as_bytes(), &recovery_key)?,
            key_version: 1,
            pending_rekey: None,
        };
        let profile_id = record.id.clone();

        self.store.update_profiles(|doc| {
            if doc.profiles.iter().any(|p| p.name == record.name) {
                return Err(Error::AlreadyExists(format!("profile named {}", record.name)));
            }
            if doc.active_profile_id.is_none() {
                doc.active_profile_id = Some(record.id.clone());
            }
            doc.profiles.push(record);
            Ok(())
        })?;
        self.layout.ensure_profile_directories(&profile_id)?;

        info!(profile = %profile_id, "profile created");
        Ok(ProfileCreated {
            profile_id,
            recovery_key,
        })
    }

    pub fn list_profiles(&self) -> Result<Vec<ProfileSummary>> {
        let doc = self.store.load_profiles()?;
        Ok(doc
            .profiles
            .iter()
            .map(|p| summarize_profile(p, doc.active_profile_id.as_ref()))
            .collect())
    }

    pub fn active_profile(&self) -> Result<Option<ProfileSummary>> {
        let doc = self.store.load_profiles()?;
        Ok(doc
            .active_profile_id
            .as_ref()
            .and_then(|id| doc.get(id))
            .map(|p| summarize_profile(p, doc.active_profile_id.as_ref())))
    }

    /// Switch the active profile after checking its password.
    pub fn set_active_profile(&self, profile_id: &ProfileId, password: &str) -> Result<()> {
        self.authenticate(profile_id, password)?;
        self.store.update_profiles(|doc| {
            doc.active_profile_id = Some(profile_id.clone());
            if let Some(profile) = doc.get_mut(profile_id) {
                profile.last_access = Utc::now();
            }
            Ok(())
        })?;
        info!(profile = %profile_id, "active profile changed");
        Ok(())
    }

    /// Show the profile's current recovery key again.
    pub fn reveal_recovery_key(&self, profile_id: &ProfileId, password: &str) -> Result<Zeroizing<String>> {
        let profile = self.authenticate(profile_id, password)?;
        self.open_string(&profile.encrypted_recovery_key, password)
    }

    /// Delete a profile together with its vaults, backups and metadata.
    ///
    /// Locked folders of the profile are destroyed with it.
    pub fn remove_profile(&self, profile_id: &ProfileId, credential: &Credential, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(Error::InvalidInput(
                "removing a profile requires confirmation".to_string(),
            ));
        }
        let profile = self.store.get_profile(profile_id)?;
        self.master_secret(&profile, credential)?;

        let manager = VaultStorageManager::new(self.layout.clone(), profile_id.clone())?;
        manager.purge(&manager.vaults_dir())?;
        manager.purge(&manager.backups_dir())?;
        self.store.remove_profile_metadata(profile_id)?;
        self.store.update_profiles(|doc| {
            doc.profiles.retain(|p| &p.id != profile_id);
            if doc.active_profile_id.as_ref() == Some(profile_id) {
                doc.active_profile_id = None;
            }
            Ok(())
        })?;

        warn!(profile = %profile_id, "profile removed with all vault data");
        Ok(())
    }

    // ----- folders -----

    pub fn list_folders(&self, profile_id: &ProfileId) -> Result<Vec<FolderRecord>> {
        self.store.get_profile(profile_id)?;
        Ok(self.store.load_folders(profile_id)?.folders)
    }

    pub fn folder(&self, profile_id: &ProfileId, folder_id: &FolderId) -> Result<FolderRecord> {
        self.resolve_folder(profile_id, &FolderRef::Id(folder_id.clone()))
    }

    /// Register the directory at `path` and lock it.
    ///
    /// `credential` must be the profile's. With `custom_password` the
    /// folder is encrypted under its own password and gets its own
    /// recovery key, returned once in the result.
    ///
    /// # Errors
    /// - `StorageError::SourceMissing` if `path` does not exist
    /// - `Error::InvalidInput` if `path` is not a directory, overlaps the
    ///   vault root, or already looks like an encrypted tree
    /// - `Error::AlreadyExists` if the profile already manages `path`
    /// - `Error::ProfileIsolation` if another profile manages `path`
    pub fn lock_new(
        &self,
        profile_id: &ProfileId,
        path: &Path,
        credential: &Credential,
        custom_password: Option<&str>,
        progress: Progress,
    ) -> Result<FolderLocked> {
        let profile = self.store.get_profile(profile_id)?;
        let master = self.master_secret(&profile, credential)?;

        let path = fs::canonicalize(path).map_err(|_| StorageError::SourceMissing(path.to_path_buf()))?;
        self.check_new_folder(profile_id, &path)?;
        let _guard = self.in_flight.acquire(profile_id, path.to_string_lossy())?;

        let folder_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidInput(format!("{} has no folder name", path.display())))?;
        let folder_id = new_folder_id()?;
        let now = Utc::now();

        let mut record = FolderRecord {
            id: folder_id.clone(),
            profile_id: profile_id.clone(),
            folder_name,
            folder_path: path.clone(),
            is_locked: true,
            uses_master_password: true,
            created_at: now,
            last_access: Some(now),
            unlock_mode: None,
            original_path: None,
            vault_path: None,
            key_version: profile.key_version,
            vault_hash: None,
            backups: Vec::new(),
            custom_password_hash: None,
            custom_recovery_key_hash: None,
            encrypted_custom_recovery_key: None,
            custom_password_encrypted_with_recovery: None,
        };

        let (password, custom_recovery_key) = match custom_password {
            Some(custom) => {
                check_password(custom)?;
                let recovery_key = Zeroizing::new(generate_recovery_key());
                record.uses_master_password = false;
                record.key_version = 1;
                record.custom_password_hash = Some(self.credentials.hash_password(custom, None)?);
                record.custom_recovery_key_hash = Some(self.credentials.hash_recovery_key(&recovery_key)?);
                record.encrypted_custom_recovery_key =
                    Some(self.credentials.seal_secret(recovery_key.as_bytes(), custom)?);
                record.custom_password_encrypted_with_recovery =
                    Some(self.credentials.seal_secret(custom.as_bytes(), &recovery_key)?);
                (Zeroizing::new(custom.to_string()), Some(recovery_key))
            }
            None => (master, None),
        };

        let mut manager = self.manager(profile_id, &progress)?;
        let vault_path = manager.generate_vault_path(&record.folder_name, &folder_id)?;
        let label = record.backup_label();
        let key_version = record.key_version;

        let report = in_transaction(&mut manager, |m| {
            let report = m.move_to_vault(&path, &vault_path)?;
            rebuild_in_place(m, &vault_path, |staging| {
                self.cipher
                    .encrypt_tree(&vault_path, staging, &password, key_version, &progress)
            })?;
            let backup = m.create_backup(&vault_path, &label, OperationTag::PreLock)?;

            record.vault_path = Some(vault_path.clone());
            record.vault_hash = Some(FolderCipher::digest(&vault_path)?);
            record.backups.push(backup_entry(backup, OperationTag::PreLock));
            self.store.update_folders(profile_id, |doc| {
                if doc.folders.iter().any(|f| f.folder_path == record.folder_path) {
                    return Err(Error::AlreadyExists(format!("folder {}", record.folder_path.display())));
                }
                doc.folders.push(record);
                Ok(())
            })?;
            Ok(report)
        })?;

        self.tidy_backups(&manager, profile_id, &folder_id, &label);
        info!(profile = %profile_id, folder = %folder_id, bytes = report.bytes_processed, "folder registered and locked");
        Ok(FolderLocked {
            folder_id,
            vault_path,
            custom_recovery_key,
            report,
        })
    }

    /// Lock a temporarily unlocked folder.
    ///
    /// Order on disk: move the tree into the vault, encrypt it in place
    /// through a staging directory, snapshot the encrypted copy, record
    /// the new state. Any failure restores the original location.
    pub fn lock(&self, request: LockRequest) -> Result<OperationReport> {
        let LockRequest {
            profile_id,
            folder,
            credential,
            progress,
        } = request;
        let found = self.resolve_folder(&profile_id, &folder)?;
        let _guard = self.in_flight.acquire(&profile_id, found.id.as_str())?;
        let folder = self.store.get_folder(&profile_id, &found.id)?;

        if folder.is_locked {
            return Err(Error::InvalidInput(format!("folder {} is already locked", folder.id)));
        }
        let profile = self.store.get_profile(&profile_id)?;
        let password = self.folder_secret(&profile, &folder, &credential)?;
        let key_version = if folder.uses_master_password {
            profile.key_version
        } else {
            folder.key_version
        };

        let original = folder.folder_path.clone();
        if !original.is_dir() {
            return Err(StorageError::SourceMissing(original).into());
        }

        let mut manager = self.manager(&profile_id, &progress)?;
        let vault_path = manager.generate_vault_path(&folder.folder_name, &folder.id)?;
        let label = folder.backup_label();

        let report = in_transaction(&mut manager, |m| {
            let report = m.move_to_vault(&original, &vault_path)?;
            rebuild_in_place(m, &vault_path, |staging| {
                self.cipher
                    .encrypt_tree(&vault_path, staging, &password, key_version, &progress)
            })?;
            let backup = m.create_backup(&vault_path, &label, OperationTag::PreLock)?;
            let digest = FolderCipher::digest(&vault_path)?;

            self.store.update_folders(&profile_id, |doc| {
                let record = doc.require_mut(&folder.id)?;
                record.mark_locked(vault_path.clone());
                record.key_version = key_version;
                record.vault_hash = Some(digest);
                record.backups.push(backup_entry(backup, OperationTag::PreLock));
                Ok(())
            })?;
            Ok(report)
        })?;

        self.tidy_backups(&manager, &profile_id, &folder.id, &label);
        info!(profile = %profile_id, folder = %folder.id, bytes = report.bytes_processed, "folder locked");
        Ok(report)
    }

    /// Unlock a folder.
    ///
    /// The vault copy is checked for readability, its recorded digest and
    /// the key check before anything moves. A permanent unlock also drops
    /// the folder's record and backups once the transaction commits; it
    /// is accepted for temporarily unlocked folders too.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for a permanent unlock without confirmation
    /// - `Error::Credential` for a wrong password or recovery key
    /// - `Error::Integrity` if the vault copy is missing, unreadable or
    ///   does not match its digest
    pub fn unlock(&self, request: UnlockRequest) -> Result<OperationReport> {
        let UnlockRequest {
            profile_id,
            folder,
            credential,
            mode,
            confirmed,
            progress,
        } = request;
        if mode == UnlockMode::Permanent && !confirmed {
            return Err(Error::InvalidInput(
                "permanent unlock requires confirmation".to_string(),
            ));
        }

        let found = self.resolve_folder(&profile_id, &folder)?;
        let _guard = self.in_flight.acquire(&profile_id, found.id.as_str())?;
        let folder = self.store.get_folder(&profile_id, &found.id)?;
        let profile = self.store.get_profile(&profile_id)?;
        let secret = self.folder_secret(&profile, &folder, &credential)?;
        let label = folder.backup_label();

        if !folder.is_locked {
            if mode == UnlockMode::Temporary {
                return Err(Error::InvalidInput(format!("folder {} is already unlocked", folder.id)));
            }
            return self.release_unlocked(&profile_id, &folder);
        }

        let vault_path = folder
            .vault_path
            .clone()
            .ok_or_else(|| Error::Integrity(format!("locked folder {} has no vault path", folder.id)))?;
        let mut manager = self.manager(&profile_id, &progress)?;
        self.check_vault(&manager, &folder, &vault_path)?;
        let password = self.cipher_password(&profile, &folder, &secret)?;
        self.cipher.check_key(&vault_path, &password)?;

        let destination = folder.folder_path.clone();
        let report = in_transaction(&mut manager, |m| {
            let backup = m.create_backup(&vault_path, &label, OperationTag::PreUnlock)?;
            m.move_from_vault(&vault_path, &destination)?;
            let report = rebuild_in_place(m, &destination, |staging| {
                self.cipher.decrypt_tree(&destination, staging, &password, &progress)
            })?;

            self.store.update_folders(&profile_id, |doc| {
                match mode {
                    UnlockMode::Temporary => {
                        let record = doc.require_mut(&folder.id)?;
                        record.mark_unlocked(UnlockMode::Temporary);
                        record.backups.push(backup_entry(backup, OperationTag::PreUnlock));
                    }
                    UnlockMode::Permanent => {
                        doc.remove(&folder.id);
                    }
                }
                Ok(())
            })?;
            Ok(report)
        })?;

        match mode {
            UnlockMode::Temporary => self.tidy_backups(&manager, &profile_id, &folder.id, &label),
            UnlockMode::Permanent => {
                if let Err(e) = manager.remove_all_backups(&label) {
                    warn!(folder = %folder.id, error = %e, "failed to remove backups after permanent unlock");
                }
            }
        }
        info!(profile = %profile_id, folder = %folder.id, mode = %mode, bytes = report.bytes_processed, "folder unlocked");
        Ok(report)
    }

    /// Take a temporarily unlocked folder out of vault management.
    fn release_unlocked(&self, profile_id: &ProfileId, folder: &FolderRecord) -> Result<OperationReport> {
        self.store.update_folders(profile_id, |doc| {
            doc.remove(&folder.id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("folder {}", folder.id)))
        })?;
        let manager = VaultStorageManager::new(self.layout.clone(), profile_id.clone())?;
        if let Err(e) = manager.remove_all_backups(&folder.backup_label()) {
            warn!(folder = %folder.id, error = %e, "failed to remove backups after permanent unlock");
        }
        info!(profile = %profile_id, folder = %folder.id, "folder released from vault management");
        Ok(OperationReport::default())
    }

    /// Check the vault copy (or, for unlocked folders, the original tree).
    pub fn verify_folder(&self, profile_id: &ProfileId, folder: &FolderRef) -> Result<()> {
        let folder = self.resolve_folder(profile_id, folder)?;
        let manager = VaultStorageManager::new(self.layout.clone(), profile_id.clone())?;
        if folder.is_locked {
            let vault_path = folder
                .vault_path
                .clone()
                .ok_or_else(|| Error::Integrity(format!("locked folder {} has no vault path", folder.id)))?;
            self.check_vault(&manager, &folder, &vault_path)
        } else if manager.verify_folder_integrity(&folder.folder_path) {
            Ok(())
        } else {
            Err(Error::Integrity(format!(
                "folder {} is not fully readable",
                folder.folder_path.display()
            )))
        }
    }

    /// Replace a locked folder's vault copy with its newest usable backup.
    ///
    /// A backup is usable when it is readable and passes the key check
    /// with the folder's current password. A still-readable vault copy is
    /// kept as a `pre-restore` backup first.
    pub fn restore_from_backup(
        &self,
        profile_id: &ProfileId,
        folder: &FolderRef,
        credential: &Credential,
        progress: Progress,
    ) -> Result<OperationReport> {
        let found = self.resolve_folder(profile_id, folder)?;
        let _guard = self.in_flight.acquire(profile_id, found.id.as_str())?;
        let folder = self.store.get_folder(profile_id, &found.id)?;
        if !folder.is_locked {
            return Err(Error::InvalidInput(format!(
                "folder {} must be locked to restore a backup",
                folder.id
            )));
        }
        let profile = self.store.get_profile(profile_id)?;
        let secret = self.folder_secret(&profile, &folder, credential)?;
        let password = self.cipher_password(&profile, &folder, &secret)?;
        let vault_path = folder
            .vault_path
            .clone()
            .ok_or_else(|| Error::Integrity(format!("locked folder {} has no vault path", folder.id)))?;

        let mut manager = self.manager(profile_id, &progress)?;
        let label = folder.backup_label();
        let (source, manifest) = manager
            .list_backups(&label)?
            .into_iter()
            .filter(|b| manager.verify_folder_integrity(&b.path))
            .find_map(|b| match self.cipher.check_key(&b.path, &password) {
                Ok(manifest) => Some((b.path, manifest)),
                Err(e) => {
                    debug!(backup = %b.path.display(), error = %e, "backup skipped");
                    None
                }
            })
            .ok_or_else(|| Error::NotFound(format!("usable backup for folder {}", folder.id)))?;

        let keep_current = manager.verify_folder_integrity(&vault_path);
        let report = in_transaction(&mut manager, |m| {
            let parked = if keep_current {
                Some(m.create_backup(&vault_path, &label, OperationTag::PreRestore)?)
            } else {
                None
            };
            let staging = m.staging_path_for(&vault_path)?;
            let report = m.restore_from_backup(&source, &staging)?;
            m.replace_tree(&vault_path, &staging)?;
            let digest = FolderCipher::digest(&vault_path)?;

            self.store.update_folders(profile_id, |doc| {
                let record = doc.require_mut(&folder.id)?;
                record.vault_hash = Some(digest);
                record.key_version = manifest.key_version;
                if let Some(parked) = parked {
                    record.backups.push(backup_entry(parked, OperationTag::PreRestore));
                }
                Ok(())
            })?;
            Ok(report)
        })?;

        self.tidy_backups(&manager, profile_id, &folder.id, &label);
        info!(profile = %profile_id, folder = %folder.id, backup = %source.display(), "vault restored from backup");
        Ok(report)
    }

    /// Apply the retention policy to a folder's backups now.
    pub fn clean_backups(&self, profile_id: &ProfileId, folder: &FolderRef) -> Result<usize> {
        let folder = self.resolve_folder(profile_id, folder)?;
        let manager = VaultStorageManager::new(self.layout.clone(), profile_id.clone())?;
        let removed = manager.clean_old_backups(&folder.backup_label(), self.config.backup_keep_count)?;
        self.prune_backup_entries(profile_id, &folder.id)?;
        Ok(removed)
    }

    // ----- password change -----

    /// Change the profile password and re-encrypt its locked folders.
    ///
    /// The new password, a fresh recovery key and the previous password
    /// (sealed under the new one) are stored in a single write. Folders
    /// are then re-encrypted one transaction each; a folder that fails
    /// stays on the previous key and can be finished with
    /// [`resume_rekey`](Self::resume_rekey). It remains unlockable with the
    /// new password meanwhile.
    ///
    /// # Errors
    /// - `Error::Credential` if `old_password` is wrong
    /// - `Error::Transaction` if an earlier change still has folders that
    ///   cannot be re-encrypted
    pub fn change_password(
        &self,
        profile_id: &ProfileId,
        old_password: &str,
        new_password: &str,
    ) -> Result<PasswordChanged> {
        check_password(new_password)?;
        let profile = self.authenticate(profile_id, old_password)?;

        if profile.pending_rekey.is_some() {
            let outcome = self.rekey_pending(profile_id, old_password)?;
            if !outcome.is_complete() {
                return Err(Error::Transaction(format!(
                    "{} folder(s) still wait for re-encryption from the last password change",
                    outcome.failures.len()
                )));
            }
        }

        let recovery_key = Zeroizing::new(generate_recovery_key());
        let hashed_password = self.credentials.hash_password(new_password, None)?;
        let encrypted_recovery_key = self.credentials.seal_secret(recovery_key.as_bytes(), new_password)?;
        let recovery_key_hash = self.credentials.hash_recovery_key(&recovery_key)?;
        let master_key_encrypted_with_recovery = self
            .credentials
            .seal_secret(new_password.as_bytes(), &recovery_key)?;
        let previous_password = self.credentials.seal_secret(old_password.as_bytes(), new_password)?;

        let key_version = self.store.update_profiles(|doc| {
            let record = doc
                .get_mut(profile_id)
                .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))?;
            record.pending_rekey = Some(PendingRekey {
                from_version: record.key_version,
                previous_password,
            });
            record.key_version += 1;
            record.hashed_password = hashed_password;
            record.encrypted_recovery_key = encrypted_recovery_key;
            record.recovery_key_hash = recovery_key_hash;
            record.master_key_encrypted_with_recovery = master_key_encrypted_with_recovery;
            record.last_access = Utc::now();
            Ok(record.key_version)
        })?;
        info!(profile = %profile_id, key_version, "profile password changed");

        let rekey = self.rekey_pending(profile_id, new_password)?;
        Ok(PasswordChanged { recovery_key, rekey })
    }

    /// Finish re-encryption left over from a password change.
    pub fn resume_rekey(&self, profile_id: &ProfileId, password: &str) -> Result<RekeyOutcome> {
        self.authenticate(profile_id, password)?;
        self.rekey_pending(profile_id, password)
    }

    fn rekey_pending(&self, profile_id: &ProfileId, password: &str) -> Result<RekeyOutcome> {
        let profile = self.store.get_profile(profile_id)?;
        let Some(pending) = profile.pending_rekey.as_ref() else {
            return Ok(RekeyOutcome::default());
        };
        let previous = self.open_string(&pending.previous_password, password)?;

        let mut outcome = RekeyOutcome::default();
        let stragglers = self
            .store
            .load_folders(profile_id)?
            .folders
            .into_iter()
            .filter(|f| f.needs_rekey(profile.key_version));
        for folder in stragglers {
            match self.rekey_folder(&profile, &folder.id, &previous, password) {
                Ok(()) => outcome.rekeyed.push(folder.id),
                Err(e) => {
                    error!(profile = %profile_id, folder = %folder.id, error = %e, "re-encryption failed, folder stays on previous key");
                    outcome.failures.push((folder.id, e.to_string()));
                }
            }
        }

        // Folders the pass did not touch may still hold backups from before
        // the change: unlocked ones, and stragglers relocked in the meantime.
        let manager = self.manager(profile_id, &Progress::silent())?;
        let settled = self
            .store
            .load_folders(profile_id)?
            .folders
            .into_iter()
            .filter(|f| f.uses_master_password && !outcome.failures.iter().any(|(id, _)| id == &f.id));
        for folder in settled {
            let label = folder.backup_label();
            if self.drop_stale_backups(&manager, &folder.id, &label, profile.key_version) > 0 {
                if let Err(e) = self.prune_backup_entries(profile_id, &folder.id) {
                    warn!(folder = %folder.id, error = %e, "backup history update failed");
                }
            }
        }

        if outcome.is_complete() {
            self.store.update_profiles(|doc| {
                if let Some(record) = doc.get_mut(profile_id) {
                    record.pending_rekey = None;
                }
                Ok(())
            })?;
        }
        info!(
            profile = %profile_id,
            rekeyed = outcome.rekeyed.len(),
            failed = outcome.failures.len(),
            "re-encryption pass finished"
        );
        Ok(outcome)
    }

    fn rekey_folder(&self, profile: &ProfileRecord, folder_id: &FolderId, old: &str, new: &str) -> Result<()> {
        let _guard = self.in_flight.acquire(&profile.id, folder_id.as_str())?;
        let folder = self.store.get_folder(&profile.id, folder_id)?;
        if !folder.needs_rekey(profile.key_version) {
            return Ok(());
        }
        let vault_path = folder
            .vault_path
            .clone()
            .ok_or_else(|| Error::Integrity(format!("locked folder {} has no vault path", folder.id)))?;

        let progress = Progress::silent();
        let mut manager = self.manager(&profile.id, &progress)?;
        self.check_vault(&manager, &folder, &vault_path)?;
        let label = folder.backup_label();
        let key_version = profile.key_version;

        // Snapshot after the rebuild so the kept backup opens with `new`.
        in_transaction(&mut manager, |m| {
            rebuild_in_place(m, &vault_path, |staging| {
                self.cipher
                    .rekey_tree(&vault_path, staging, old, new, key_version, &progress)
            })?;
            let backup = m.create_backup(&vault_path, &label, OperationTag::PreRekey)?;
            let digest = FolderCipher::digest(&vault_path)?;

            self.store.update_folders(&profile.id, |doc| {
                let record = doc.require_mut(&folder.id)?;
                record.key_version = key_version;
                record.vault_hash = Some(digest);
                record.backups.push(backup_entry(backup, OperationTag::PreRekey));
                Ok(())
            })
        })?;

        self.drop_stale_backups(&manager, &folder.id, &label, key_version);
        self.tidy_backups(&manager, &profile.id, &folder.id, &label);
        debug!(profile = %profile.id, folder = %folder.id, key_version, "folder re-encrypted");
        Ok(())
    }

    // ----- authorization -----

    fn authenticate(&self, profile_id: &ProfileId, password: &str) -> Result<ProfileRecord> {
        let profile = self.store.get_profile(profile_id)?;
        if self.credentials.verify_password(password, &profile.hashed_password) {
            Ok(profile)
        } else {
            warn!(profile = %profile_id, "profile authentication failed");
            Err(Error::Credential)
        }
    }

    /// Profile password proven by `credential`.
    fn master_secret(&self, profile: &ProfileRecord, credential: &Credential) -> Result<Zeroizing<String>> {
        self.open_credential(
            credential,
            &profile.hashed_password,
            &profile.recovery_key_hash,
            &profile.master_key_encrypted_with_recovery,
        )
        .inspect_err(|_| warn!(profile = %profile.id, "credential rejected"))
    }

    /// Password that `credential` proves for `folder`: the profile
    /// password, or the folder's own one.
    fn folder_secret(
        &self,
        profile: &ProfileRecord,
        folder: &FolderRecord,
        credential: &Credential,
    ) -> Result<Zeroizing<String>> {
        if folder.uses_master_password {
            return self.master_secret(profile, credential);
        }
        match (
            &folder.custom_password_hash,
            &folder.custom_recovery_key_hash,
            &folder.custom_password_encrypted_with_recovery,
        ) {
            (Some(hash), Some(recovery_hash), Some(sealed)) => self
                .open_credential(credential, hash, recovery_hash, sealed)
                .inspect_err(|_| warn!(folder = %folder.id, "folder credential rejected")),
            _ => Err(Error::Integrity(format!(
                "folder {} has incomplete custom credentials",
                folder.id
            ))),
        }
    }

    fn open_credential(
        &self,
        credential: &Credential,
        password_hash: &str,
        recovery_hash: &str,
        sealed_password: &str,
    ) -> Result<Zeroizing<String>> {
        match credential {
            Credential::Password(password) => {
                if self.credentials.verify_password(password, password_hash) {
                    Ok(password.clone())
                } else {
                    Err(Error::Credential)
                }
            }
            Credential::RecoveryKey(key) => {
                let key = Zeroizing::new(normalize_recovery_key(key).ok_or(Error::Credential)?);
                if !self.credentials.verify_recovery_key(&key, recovery_hash) {
                    return Err(Error::Credential);
                }
                self.open_string(sealed_password, &key)
            }
        }
    }

    /// Password the folder's vault copy is actually encrypted under.
    ///
    /// Differs from `secret` only for folders a password change has not
    /// reached yet.
    fn cipher_password(
        &self,
        profile: &ProfileRecord,
        folder: &FolderRecord,
        secret: &Zeroizing<String>,
    ) -> Result<Zeroizing<String>> {
        if !folder.uses_master_password || folder.key_version >= profile.key_version {
            return Ok(secret.clone());
        }
        match &profile.pending_rekey {
            Some(pending) if pending.from_version == folder.key_version => {
                self.open_string(&pending.previous_password, secret)
            }
            _ => Err(Error::Integrity(format!(
                "folder {} is on key version {} with no pending re-encryption",
                folder.id, folder.key_version
            ))),
        }
    }

    fn open_string(&self, sealed: &str, passphrase: &str) -> Result<Zeroizing<String>> {
        let bytes = self
            .credentials
            .open_secret(sealed, passphrase)
            .map_err(|_| Error::Credential)?;
        String::from_utf8(bytes.as_bytes().to_vec())
            .map(Zeroizing::new)
            .map_err(|_| Error::Integrity("sealed secret is not valid UTF-8".to_string()))
    }

    // ----- lookup -----

    /// Find a folder in `profile_id`'s own document.
    ///
    /// # Errors
    /// - `Error::ProfileIsolation` if the folder belongs to another profile
    /// - `Error::NotFound` otherwise
    fn resolve_folder(&self, profile_id: &ProfileId, folder: &FolderRef) -> Result<FolderRecord> {
        let doc = self.store.load_folders(profile_id)?;
        let owner = match folder {
            FolderRef::Id(id) => {
                if let Some(record) = doc.get(id) {
                    return Ok(record.clone());
                }
                self.store.find_folder_owner(id)?
            }
            FolderRef::Path(path) => {
                let path = normalize_path(path);
                if let Some(record) = doc.folders.iter().find(|f| f.folder_path == path) {
                    return Ok(record.clone());
                }
                self.store.find_path_owner(&path)?.map(|(owner, _)| owner)
            }
        };

        match owner {
            Some(owner) if &owner != profile_id => {
                warn!(profile = %profile_id, folder = %folder, "cross-profile folder access rejected");
                Err(Error::ProfileIsolation {
                    profile: profile_id.to_string(),
                    folder: folder.to_string(),
                })
            }
            _ => Err(Error::NotFound(format!("folder {}", folder))),
        }
    }

    fn check_new_folder(&self, profile_id: &ProfileId, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Err(Error::InvalidInput(format!("{} is not a directory", path.display())));
        }
        let root = fs::canonicalize(self.layout.root()).unwrap_or_else(|_| self.layout.root().to_path_buf());
        if path.starts_with(&root) || root.starts_with(path) {
            return Err(Error::InvalidInput(format!(
                "{} overlaps the vault storage root",
                path.display()
            )));
        }
        if path.join(MANIFEST_DIR).exists() {
            return Err(Error::InvalidInput(format!(
                "{} already contains {}",
                path.display(),
                MANIFEST_DIR
            )));
        }
        match self.store.find_path_owner(path)? {
            Some((owner, folder)) if &owner == profile_id => {
                Err(Error::AlreadyExists(format!("{} is registered as {}", path.display(), folder)))
            }
            Some(_) => Err(Error::ProfileIsolation {
                profile: profile_id.to_string(),
                folder: path.display().to_string(),
            }),
            None => Ok(()),
        }
    }

    // ----- storage helpers -----

    fn manager(&self, profile_id: &ProfileId, progress: &Progress) -> Result<VaultStorageManager> {
        Ok(VaultStorageManager::new(self.layout.clone(), profile_id.clone())?.with_progress(progress.clone()))
    }

    /// Readable, matches its recorded digest.
    fn check_vault(&self, manager: &VaultStorageManager, folder: &FolderRecord, vault_path: &Path) -> Result<()> {
        if !manager.path_exists(vault_path) {
            return Err(Error::Integrity(format!("vault copy missing: {}", vault_path.display())));
        }
        if !manager.verify_folder_integrity(vault_path) {
            return Err(Error::Integrity(format!("vault copy unreadable: {}", vault_path.display())));
        }
        let expected = folder
            .vault_hash
            .as_deref()
            .ok_or_else(|| Error::Integrity(format!("folder {} has no recorded digest", folder.id)))?;
        FolderCipher::verify_digest(vault_path, expected).inspect_err(|e| {
            error!(folder = %folder.id, error = %e, "vault copy failed verification");
        })
    }

    /// Retention and history upkeep after a commit. Failures are logged.
    fn tidy_backups(&self, manager: &VaultStorageManager, profile_id: &ProfileId, folder_id: &FolderId, label: &str) {
        if let Err(e) = manager.clean_old_backups(label, self.config.backup_keep_count) {
            warn!(folder = %folder_id, error = %e, "backup cleanup failed");
        }
        if let Err(e) = self.prune_backup_entries(profile_id, folder_id) {
            warn!(folder = %folder_id, error = %e, "backup history update failed");
        }
    }

    /// Delete the folder's backups sealed under a key older than
    /// `key_version`. Returns how many were removed.
    fn drop_stale_backups(
        &self,
        manager: &VaultStorageManager,
        folder_id: &FolderId,
        label: &str,
        key_version: u32,
    ) -> usize {
        let backups = match manager.list_backups(label) {
            Ok(backups) => backups,
            Err(e) => {
                error!(folder = %folder_id, error = %e, "could not list backups sealed under a previous key");
                return 0;
            }
        };
        let mut removed = 0;
        for backup in backups {
            match FolderCipher::read_manifest(&backup.path) {
                Ok(manifest) if manifest.key_version < key_version => match manager.purge(&backup.path) {
                    Ok(()) => removed += 1,
                    Err(e) => error!(
                        folder = %folder_id,
                        path = %backup.path.display(),
                        error = %e,
                        "failed to delete backup sealed under a previous key"
                    ),
                },
                Ok(_) => {}
                Err(e) => debug!(path = %backup.path.display(), error = %e, "skipping backup without a manifest"),
            }
        }
        if removed > 0 {
            info!(folder = %folder_id, removed, key_version, "deleted backups sealed under a previous key");
        }
        removed
    }

    /// Drop history entries whose backup directory no longer exists.
    fn prune_backup_entries(&self, profile_id: &ProfileId, folder_id: &FolderId) -> Result<usize> {
        self.store.update_folders(profile_id, |doc| {
            let Some(folder) = doc.get_mut(folder_id) else {
                return Ok(0);
            };
            let before = folder.backups.len();
            folder.backups.retain(|b| b.path.exists());
            Ok(before - folder.backups.len())
        })
    }
}

/// Run `steps` inside a transaction on `manager`, rolling back on failure.
fn in_transaction<T>(
    manager: &mut VaultStorageManager,
    steps: impl FnOnce(&mut VaultStorageManager) -> Result<T>,
) -> Result<T> {
    manager.begin_transaction()?;
    match steps(manager) {
        Ok(value) => {
            manager.commit_transaction()?;
            Ok(value)
        }
        Err(e) => {
            warn!(error = %e, "operation failed, rolling back");
            if let Err(rollback) = manager.rollback_transaction() {
                error!(error = %rollback, "rollback incomplete, manual recovery required");
            }
            Err(e)
        }
    }
}

/// Build a replacement for `target` in a staging sibling and swap it in.
fn rebuild_in_place(
    manager: &mut VaultStorageManager,
    target: &Path,
    build: impl FnOnce(&Path) -> Result<OperationReport>,
) -> Result<OperationReport> {
    let staging = manager.staging_path_for(target)?;
    let report = build(&staging)?;
    if let Err(e) = manager.replace_tree(target, &staging) {
        if let Err(cleanup) = manager.purge(&staging) {
            warn!(path = %staging.display(), error = %cleanup, "failed to remove staging tree");
        }
        return Err(e);
    }
    Ok(report)
}

fn backup_entry(path: PathBuf, operation: OperationTag) -> BackupEntry {
    BackupEntry {
        timestamp: Utc::now(),
        path,
        operation,
    }
}

fn check_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(Error::InvalidInput(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

fn new_profile_id() -> Result<ProfileId> {
    ProfileId::new(format!(
        "profile_{}_{}",
        Utc::now().timestamp_millis(),
        hex::encode(random_bytes(2))
    ))
}

fn new_folder_id() -> Result<FolderId> {
    FolderId::new(format!(
        "folder_{}_{}",
        Utc::now().timestamp_millis(),
        hex::encode(random_bytes(3))
    ))
}

/// Canonical form of `path`, or of its parent when `path` itself is gone
/// (a locked folder's original location).
fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

fn summarize_profile(profile: &ProfileRecord, active: Option<&ProfileId>) -> ProfileSummary {
    ProfileSummary {
        id: profile.id.clone(),
        name: profile.name.clone(),
        created_at: profile.created_at,
        last_access: profile.last_access,
        is_active: active == Some(&profile.id),
        key_version: profile.key_version,
        rekey_pending: profile.pending_rekey.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantomvault_crypto::{validate_recovery_key_format, KdfParams};
    use phantomvault_storage::tree::list_files;
    use phantomvault_storage::ProgressEvent;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    const PASSWORD: &str = "Sw0rdFish!";

    fn service(dir: &TempDir) -> VaultService {
        let mut config = ServiceConfig::new(dir.path().join("store"), "tester");
        config.kdf_iterations = KdfParams::fast().iterations;
        config.chunk_size = 256;
        VaultService::open(config).unwrap()
    }

    fn profile(service: &VaultService, name: &str) -> ProfileCreated {
        let grant = match service.bootstrap_grant() {
            Ok(grant) => grant,
            Err(_) => {
                let first = service.list_profiles().unwrap().remove(0);
                service.admin_grant(&first.id, PASSWORD).unwrap()
            }
        };
        service.create_profile(&grant, name, PASSWORD).unwrap()
    }

    fn sample_folder(dir: &TempDir, parent: &str, name: &str) -> PathBuf {
        let root = dir.path().join(parent).join(name);
        fs::create_dir_all(root.join("sub/nested")).unwrap();
        fs::write(root.join("readme.txt"), b"top secret").unwrap();
        fs::write(root.join("sub/data.bin"), (0..3000u32).map(|i| (i * 7) as u8).collect::<Vec<_>>()).unwrap();
        fs::write(root.join("sub/nested/empty"), b"").unwrap();
        fs::write(root.join("sub/nested/notes.md"), b"# notes\n").unwrap();
        fs::canonicalize(root).unwrap()
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        list_files(root)
            .unwrap()
            .into_iter()
            .map(|rel| {
                let bytes = fs::read(root.join(&rel)).unwrap();
                (rel, bytes)
            })
            .collect()
    }

    fn password() -> Credential {
        Credential::password(PASSWORD)
    }

    fn cancel_at(stage: &'static str) -> Progress {
        let progress = Progress::silent();
        let token = progress.cancellation().clone();
        progress.with_callback(Arc::new(move |event: &ProgressEvent| {
            if event.stage == stage {
                token.cancel();
            }
        }))
    }

    fn backups_for(service: &VaultService, profile: &ProfileId, folder: &FolderId) -> Vec<PathBuf> {
        let dir = service.layout().backups_dir(profile);
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().contains(folder.as_str()))
            .collect()
    }

    #[test]
    fn test_lock_unlock_permanent_scenario() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        assert!(validate_recovery_key_format(&work.recovery_key));

        let docs = sample_folder(&dir, "home/u", "Docs");
        let before = snapshot(&docs);

        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        assert!(!docs.exists());
        assert!(locked.vault_path.is_dir());
        let vault_name = locked.vault_path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(vault_name, format!("Docs_vault_{}", locked.folder_id));
        assert!(locked.vault_path.starts_with(service.layout().vaults_dir(&work.profile_id)));
        assert!(locked.vault_path.join("readme.txt.enc").is_file());
        assert!(locked.report.bytes_processed > 0);

        let record = service.folder(&work.profile_id, &locked.folder_id).unwrap();
        assert!(record.is_locked);
        assert_eq!(record.vault_path.as_deref(), Some(locked.vault_path.as_path()));
        assert!(record.vault_hash.is_some());
        assert_eq!(record.backups.len(), 1);
        assert_eq!(record.backups[0].operation, OperationTag::PreLock);
        let backup = &record.backups[0].path;
        assert_eq!(backup.parent(), Some(service.layout().backups_dir(&work.profile_id).as_path()));
        let backup_name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(backup_name.starts_with(&format!("Docs_{}_backup_pre-lock_", locked.folder_id)));

        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                password(),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert_eq!(snapshot(&docs), before);
        assert!(!locked.vault_path.exists());
        let record = service.folder(&work.profile_id, &locked.folder_id).unwrap();
        assert!(!record.is_locked);
        assert_eq!(record.unlock_mode, Some(UnlockMode::Temporary));
        assert_eq!(record.original_path.as_deref(), Some(docs.as_path()));
        assert!(record.vault_path.is_none());

        service
            .lock(LockRequest::new(work.profile_id.clone(), docs.clone(), password()))
            .unwrap();
        assert!(!docs.exists());

        service
            .unlock(
                UnlockRequest::new(
                    work.profile_id.clone(),
                    locked.folder_id.clone(),
                    password(),
                    UnlockMode::Permanent,
                )
                .confirmed(),
            )
            .unwrap();
        assert_eq!(snapshot(&docs), before);
        assert!(matches!(
            service.folder(&work.profile_id, &locked.folder_id),
            Err(Error::NotFound(_))
        ));
        assert!(!locked.vault_path.exists());
        assert!(backups_for(&service, &work.profile_id, &locked.folder_id).is_empty());
        assert!(!docs.join(MANIFEST_DIR).exists());
    }

    #[test]
    fn test_wrong_password_leaves_everything_in_place() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);

        assert!(matches!(
            service.lock_new(&work.profile_id, &docs, &Credential::password("nope"), None, Progress::silent()),
            Err(Error::Credential)
        ));
        assert_eq!(snapshot(&docs), before);
        assert!(service.list_folders(&work.profile_id).unwrap().is_empty());

        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        let vault_before = snapshot(&locked.vault_path);
        let result = service.unlock(UnlockRequest::new(
            work.profile_id.clone(),
            locked.folder_id.clone(),
            Credential::password("nope"),
            UnlockMode::Temporary,
        ));
        assert!(matches!(result, Err(Error::Credential)));
        assert_eq!(snapshot(&locked.vault_path), vault_before);
        assert!(!docs.exists());
        assert!(service.folder(&work.profile_id, &locked.folder_id).unwrap().is_locked);
    }

    #[test]
    fn test_failed_lock_restores_original() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);

        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                password(),
                UnlockMode::Temporary,
            ))
            .unwrap();
        let record_before = service.folder(&work.profile_id, &locked.folder_id).unwrap();

        let result = service.lock(
            LockRequest::new(work.profile_id.clone(), locked.folder_id.clone(), password())
                .with_progress(cancel_at("encrypt")),
        );

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(snapshot(&docs), before);
        assert!(!locked.vault_path.exists());
        assert_eq!(service.folder(&work.profile_id, &locked.folder_id).unwrap(), record_before);
        let leftovers: Vec<_> = fs::read_dir(service.layout().vaults_dir(&work.profile_id))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_unlock_keeps_vault_copy() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);

        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        let vault_before = snapshot(&locked.vault_path);
        let record_before = service.folder(&work.profile_id, &locked.folder_id).unwrap();

        let result = service.unlock(
            UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                password(),
                UnlockMode::Temporary,
            )
            .with_progress(cancel_at("decrypt")),
        );

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!docs.exists());
        assert_eq!(snapshot(&locked.vault_path), vault_before);
        assert_eq!(service.folder(&work.profile_id, &locked.folder_id).unwrap(), record_before);
        assert_eq!(backups_for(&service, &work.profile_id, &locked.folder_id).len(), 1);

        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                docs.clone(),
                password(),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert_eq!(snapshot(&docs), before);
    }

    #[test]
    fn test_tampered_metadata_halts_unlock() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();

        let folders_file = service.layout().folders_file(&work.profile_id);
        let original = fs::read_to_string(&folders_file).unwrap();
        fs::write(&folders_file, original.replace("Docs", "Dozs")).unwrap();

        let request = || {
            UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                password(),
                UnlockMode::Temporary,
            )
        };
        assert!(matches!(service.unlock(request()), Err(Error::Integrity(_))));
        assert!(locked.vault_path.is_dir());
        assert!(!docs.exists());
        service
            .cipher
            .check_key(&locked.vault_path, PASSWORD)
            .unwrap();

        fs::write(&folders_file, original).unwrap();
        service.unlock(request()).unwrap();
        assert_eq!(snapshot(&docs), before);
    }

    #[test]
    fn test_tampered_metadata_halts_lock() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                password(),
                UnlockMode::Temporary,
            ))
            .unwrap();
        let backups_before = backups_for(&service, &work.profile_id, &locked.folder_id).len();

        let folders_file = service.layout().folders_file(&work.profile_id);
        let original = fs::read_to_string(&folders_file).unwrap();
        fs::write(&folders_file, original.replace("Docs", "Dozs")).unwrap();

        let result = service.lock(LockRequest::new(work.profile_id.clone(), docs.clone(), password()));
        assert!(matches!(result, Err(Error::Integrity(_))));
        assert_eq!(snapshot(&docs), before);
        assert!(!locked.vault_path.exists());
        assert_eq!(
            backups_for(&service, &work.profile_id, &locked.folder_id).len(),
            backups_before
        );
        assert_eq!(fs::read_to_string(&folders_file).unwrap(), original.replace("Docs", "Dozs"));
    }

    #[test]
    fn test_profiles_are_isolated() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let home = profile(&service, "home");

        let work_docs = sample_folder(&dir, "a", "Docs");
        let home_docs = sample_folder(&dir, "b", "Docs");
        let work_locked = service
            .lock_new(&work.profile_id, &work_docs, &password(), None, Progress::silent())
            .unwrap();
        let home_locked = service
            .lock_new(&home.profile_id, &home_docs, &password(), None, Progress::silent())
            .unwrap();

        assert_ne!(work_locked.vault_path, home_locked.vault_path);
        assert!(work_locked.vault_path.starts_with(service.layout().vaults_dir(&work.profile_id)));
        assert!(home_locked.vault_path.starts_with(service.layout().vaults_dir(&home.profile_id)));

        let result = service.unlock(UnlockRequest::new(
            work.profile_id.clone(),
            home_locked.folder_id.clone(),
            password(),
            UnlockMode::Temporary,
        ));
        assert!(matches!(result, Err(Error::ProfileIsolation { .. })));
        let result = service.unlock(UnlockRequest::new(
            work.profile_id.clone(),
            home_docs.clone(),
            password(),
            UnlockMode::Temporary,
        ));
        assert!(matches!(result, Err(Error::ProfileIsolation { .. })));
        assert!(home_locked.vault_path.is_dir());
        assert!(!home_docs.exists());

        assert!(matches!(
            service.folder(&home.profile_id, &work_locked.folder_id),
            Err(Error::ProfileIsolation { .. })
        ));
        assert!(matches!(
            service.folder(&home.profile_id, &FolderId::new("folder_missing").unwrap()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_change_password_rekeys_locked_folders() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let music = sample_folder(&dir, "home", "Music");
        let docs_before = snapshot(&docs);

        let docs_locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        let music_locked = service
            .lock_new(&work.profile_id, &music, &password(), None, Progress::silent())
            .unwrap();

        assert!(matches!(
            service.change_password(&work.profile_id, "wrong", "N3wPassword"),
            Err(Error::Credential)
        ));

        let changed = service
            .change_password(&work.profile_id, PASSWORD, "N3wPassword")
            .unwrap();
        assert!(changed.rekey.is_complete());
        assert_eq!(changed.rekey.rekeyed.len(), 2);
        assert_ne!(*changed.recovery_key, *work.recovery_key);

        let summary = service.list_profiles().unwrap().remove(0);
        assert_eq!(summary.key_version, 2);
        assert!(!summary.rekey_pending);
        let record = service.folder(&work.profile_id, &docs_locked.folder_id).unwrap();
        assert_eq!(record.key_version, 2);
        assert!(record.backups.iter().any(|b| b.operation == OperationTag::PreRekey));

        let cipher = FolderCipher::new(service.config().engine().unwrap());
        assert!(matches!(
            cipher.check_key(&docs_locked.vault_path, PASSWORD),
            Err(Error::Credential)
        ));
        for folder_id in [&docs_locked.folder_id, &music_locked.folder_id] {
            let backups = backups_for(&service, &work.profile_id, folder_id);
            assert!(!backups.is_empty());
            for backup in &backups {
                assert!(matches!(cipher.check_key(backup, PASSWORD), Err(Error::Credential)));
                assert_eq!(cipher.check_key(backup, "N3wPassword").unwrap().key_version, 2);
            }
        }
        assert!(record.backups.iter().all(|b| b.path.exists()));

        let old = service.unlock(UnlockRequest::new(
            work.profile_id.clone(),
            docs_locked.folder_id.clone(),
            password(),
            UnlockMode::Temporary,
        ));
        assert!(matches!(old, Err(Error::Credential)));
        let old_key = service.unlock(UnlockRequest::new(
            work.profile_id.clone(),
            docs_locked.folder_id.clone(),
            Credential::recovery_key(work.recovery_key.as_str()),
            UnlockMode::Temporary,
        ));
        assert!(matches!(old_key, Err(Error::Credential)));

        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                docs_locked.folder_id.clone(),
                Credential::password("N3wPassword"),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert_eq!(snapshot(&docs), docs_before);

        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                music_locked.folder_id.clone(),
                Credential::recovery_key(changed.recovery_key.to_lowercase()),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert!(music.is_dir());
    }

    #[test]
    fn test_interrupted_rekey_resumes() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();

        let busy = service
            .in_flight
            .acquire(&work.profile_id, locked.folder_id.as_str())
            .unwrap();
        let changed = service
            .change_password(&work.profile_id, PASSWORD, "N3wPassword")
            .unwrap();
        drop(busy);

        assert_eq!(changed.rekey.failures.len(), 1);
        assert_eq!(changed.rekey.failures[0].0, locked.folder_id);
        assert!(service.list_profiles().unwrap()[0].rekey_pending);
        assert_eq!(service.folder(&work.profile_id, &locked.folder_id).unwrap().key_version, 1);

        assert!(matches!(
            service.resume_rekey(&work.profile_id, PASSWORD),
            Err(Error::Credential)
        ));
        let outcome = service.resume_rekey(&work.profile_id, "N3wPassword").unwrap();
        assert_eq!(outcome.rekeyed, vec![locked.folder_id.clone()]);
        assert!(!service.list_profiles().unwrap()[0].rekey_pending);
        assert_eq!(service.folder(&work.profile_id, &locked.folder_id).unwrap().key_version, 2);
        let cipher = FolderCipher::new(service.config().engine().unwrap());
        for backup in backups_for(&service, &work.profile_id, &locked.folder_id) {
            assert!(matches!(cipher.check_key(&backup, PASSWORD), Err(Error::Credential)));
        }

        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                Credential::password("N3wPassword"),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert_eq!(snapshot(&docs), before);
    }

    #[test]
    fn test_straggler_unlocks_with_new_password() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();

        let busy = service
            .in_flight
            .acquire(&work.profile_id, locked.folder_id.as_str())
            .unwrap();
        service
            .change_password(&work.profile_id, PASSWORD, "N3wPassword")
            .unwrap();
        drop(busy);

        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                Credential::password("N3wPassword"),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert_eq!(snapshot(&docs), before);

        service
            .lock(LockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                Credential::password("N3wPassword"),
            ))
            .unwrap();
        assert_eq!(service.folder(&work.profile_id, &locked.folder_id).unwrap().key_version, 2);
        let cipher = FolderCipher::new(service.config().engine().unwrap());
        let stale = |backups: Vec<PathBuf>| {
            backups
                .iter()
                .filter(|b| cipher.check_key(b, PASSWORD).is_ok())
                .count()
        };
        assert!(stale(backups_for(&service, &work.profile_id, &locked.folder_id)) > 0);

        let outcome = service.resume_rekey(&work.profile_id, "N3wPassword").unwrap();
        assert!(outcome.rekeyed.is_empty());
        assert!(!service.list_profiles().unwrap()[0].rekey_pending);
        let remaining = backups_for(&service, &work.profile_id, &locked.folder_id);
        assert!(!remaining.is_empty());
        assert_eq!(stale(remaining), 0);
        let record = service.folder(&work.profile_id, &locked.folder_id).unwrap();
        assert!(record.backups.iter().all(|b| b.path.exists()));
    }

    #[test]
    fn test_concurrent_transition_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();

        let _busy = service
            .in_flight
            .acquire(&work.profile_id, locked.folder_id.as_str())
            .unwrap();
        let result = service.unlock(UnlockRequest::new(
            work.profile_id.clone(),
            locked.folder_id.clone(),
            password(),
            UnlockMode::Temporary,
        ));
        assert!(matches!(result, Err(Error::OperationInProgress(_))));
        assert!(locked.vault_path.is_dir());
    }

    #[test]
    fn test_recovery_key_unlocks_master_folder() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();

        assert!(matches!(
            service.unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                Credential::recovery_key("0000-0000-0000-0000"),
                UnlockMode::Temporary,
            )),
            Err(Error::Credential)
        ));
        assert!(matches!(
            service.unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                Credential::recovery_key("not a key"),
                UnlockMode::Temporary,
            )),
            Err(Error::Credential)
        ));

        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                Credential::recovery_key(work.recovery_key.as_str()),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert_eq!(snapshot(&docs), before);
        assert_eq!(
            *service.reveal_recovery_key(&work.profile_id, PASSWORD).unwrap(),
            *work.recovery_key
        );
    }

    #[test]
    fn test_custom_password_folder() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);

        let locked = service
            .lock_new(
                &work.profile_id,
                &docs,
                &password(),
                Some("f0lderOnly"),
                Progress::silent(),
            )
            .unwrap();
        let custom_key = locked.custom_recovery_key.clone().unwrap();
        let record = service.folder(&work.profile_id, &locked.folder_id).unwrap();
        assert!(!record.uses_master_password);
        assert!(record.custom_password_hash.is_some());
        assert!(record.encrypted_custom_recovery_key.is_some());

        let unlock = |credential: Credential| {
            service.unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                credential,
                UnlockMode::Temporary,
            ))
        };
        assert!(matches!(unlock(password()), Err(Error::Credential)));
        assert!(matches!(
            unlock(Credential::recovery_key(work.recovery_key.as_str())),
            Err(Error::Credential)
        ));

        unlock(Credential::password("f0lderOnly")).unwrap();
        assert_eq!(snapshot(&docs), before);

        service
            .lock(LockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                Credential::password("f0lderOnly"),
            ))
            .unwrap();
        unlock(Credential::recovery_key(custom_key.as_str())).unwrap();
        assert_eq!(snapshot(&docs), before);

        let kept = backups_for(&service, &work.profile_id, &locked.folder_id);
        let changed = service
            .change_password(&work.profile_id, PASSWORD, "N3wPassword")
            .unwrap();
        assert!(changed.rekey.rekeyed.is_empty());
        assert_eq!(backups_for(&service, &work.profile_id, &locked.folder_id).len(), kept.len());
    }

    #[test]
    fn test_permanent_unlock_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();

        let result = service.unlock(UnlockRequest::new(
            work.profile_id.clone(),
            locked.folder_id.clone(),
            password(),
            UnlockMode::Permanent,
        ));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(locked.vault_path.is_dir());
    }

    #[test]
    fn test_permanent_unlock_from_temporary() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                password(),
                UnlockMode::Temporary,
            ))
            .unwrap();

        let report = service
            .unlock(
                UnlockRequest::new(
                    work.profile_id.clone(),
                    docs.clone(),
                    password(),
                    UnlockMode::Permanent,
                )
                .confirmed(),
            )
            .unwrap();
        assert_eq!(report.bytes_processed, 0);
        assert_eq!(snapshot(&docs), before);
        assert!(service.list_folders(&work.profile_id).unwrap().is_empty());
        assert!(backups_for(&service, &work.profile_id, &locked.folder_id).is_empty());
    }

    #[test]
    fn test_tampered_vault_is_detected_and_restored() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let before = snapshot(&docs);
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        let folder = FolderRef::Id(locked.folder_id.clone());
        service.verify_folder(&work.profile_id, &folder).unwrap();

        let victim = locked.vault_path.join("sub/data.bin.enc");
        let mut bytes = fs::read(&victim).unwrap();
        bytes[40] ^= 0x01;
        fs::write(&victim, bytes).unwrap();

        assert!(matches!(
            service.verify_folder(&work.profile_id, &folder),
            Err(Error::Integrity(_))
        ));
        let result = service.unlock(UnlockRequest::new(
            work.profile_id.clone(),
            locked.folder_id.clone(),
            password(),
            UnlockMode::Temporary,
        ));
        assert!(matches!(result, Err(Error::Integrity(_))));
        assert!(!docs.exists());

        assert!(matches!(
            service.restore_from_backup(&work.profile_id, &folder, &Credential::password("bad!"), Progress::silent()),
            Err(Error::Credential)
        ));
        service
            .restore_from_backup(&work.profile_id, &folder, &password(), Progress::silent())
            .unwrap();
        service.verify_folder(&work.profile_id, &folder).unwrap();
        let record = service.folder(&work.profile_id, &locked.folder_id).unwrap();
        assert!(record.backups.iter().any(|b| b.operation == OperationTag::PreRestore));

        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                password(),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert_eq!(snapshot(&docs), before);
    }

    #[test]
    fn test_backups_are_capped() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");
        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();

        for _ in 0..3 {
            service
                .unlock(UnlockRequest::new(
                    work.profile_id.clone(),
                    locked.folder_id.clone(),
                    password(),
                    UnlockMode::Temporary,
                ))
                .unwrap();
            service
                .lock(LockRequest::new(work.profile_id.clone(), locked.folder_id.clone(), password()))
                .unwrap();
        }

        let on_disk = backups_for(&service, &work.profile_id, &locked.folder_id);
        assert_eq!(on_disk.len(), 3);
        let record = service.folder(&work.profile_id, &locked.folder_id).unwrap();
        assert_eq!(record.backups.len(), 3);
        assert!(record.backups.iter().all(|b| b.path.exists()));
        assert_eq!(
            service
                .clean_backups(&work.profile_id, &FolderRef::Id(locked.folder_id.clone()))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_lock_new_rejects_bad_paths() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let work = profile(&service, "work");
        let docs = sample_folder(&dir, "home", "Docs");

        assert!(matches!(
            service.lock_new(&work.profile_id, &dir.path().join("missing"), &password(), None, Progress::silent()),
            Err(Error::Storage(StorageError::SourceMissing(_)))
        ));
        assert!(matches!(
            service.lock_new(&work.profile_id, &docs.join("readme.txt"), &password(), None, Progress::silent()),
            Err(Error::InvalidInput(_))
        ));
        let inside = service.layout().root().join("sneaky");
        fs::create_dir_all(&inside).unwrap();
        assert!(matches!(
            service.lock_new(&work.profile_id, &inside, &password(), None, Progress::silent()),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            service.lock_new(&work.profile_id, &docs, &password(), Some("abc"), Progress::silent()),
            Err(Error::InvalidInput(_))
        ));
        assert!(docs.join("readme.txt").exists());

        let locked = service
            .lock_new(&work.profile_id, &docs, &password(), None, Progress::silent())
            .unwrap();
        service
            .unlock(UnlockRequest::new(
                work.profile_id.clone(),
                locked.folder_id.clone(),
                password(),
                UnlockMode::Temporary,
            ))
            .unwrap();
        assert!(matches!(
            service.lock_new(&work.profile_id, &docs, &password(), None, Progress::silent()),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_profile_management() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let grant = service.bootstrap_grant().unwrap();
        assert!(matches!(
            service.create_profile(&grant, "work", "abc"),
            Err(Error::InvalidInput(_))
        ));
        let work = service.create_profile(&grant, "work", PASSWORD).unwrap();
        assert!(work.profile_id.as_str().starts_with("profile_"));
        assert!(matches!(service.bootstrap_grant(), Err(Error::Credential)));
        assert!(matches!(
            service.admin_grant(&work.profile_id, "wrong"),
            Err(Error::Credential)
        ));

        let grant = service.admin_grant(&work.profile_id, PASSWORD).unwrap();
        assert!(matches!(
            service.create_profile(&grant, "work", PASSWORD),
            Err(Error::AlreadyExists(_))
        ));
        let home = service.create_profile(&grant, "home", "h0meP4ss").unwrap();

        assert_eq!(service.active_profile().unwrap().unwrap().id, work.profile_id);
        assert!(matches!(
            service.set_active_profile(&home.profile_id, PASSWORD),
            Err(Error::Credential)
        ));
        service.set_active_profile(&home.profile_id, "h0meP4ss").unwrap();
        let profiles = service.list_profiles().unwrap();
        assert_eq!(profiles.len(), 2);
        assert!(profiles.iter().any(|p| p.id == home.profile_id && p.is_active));

        let docs = sample_folder(&dir, "home", "Docs");
        let locked = service
            .lock_new(&home.profile_id, &docs, &Credential::password("h0meP4ss"), None, Progress::silent())
            .unwrap();

        assert!(matches!(
            service.remove_profile(&home.profile_id, &Credential::password("h0meP4ss"), false),
            Err(Error::InvalidInput(_))
        ));
        service
            .remove_profile(&home.profile_id, &Credential::recovery_key(home.recovery_key.as_str()), true)
            .unwrap();
        assert!(!locked.vault_path.exists());
        assert!(!service.layout().vaults_dir(&home.profile_id).exists());
        assert!(!service.layout().profile_metadata_dir(&home.profile_id).exists());
        assert!(service.active_profile().unwrap().is_none());
        assert_eq!(service.list_profiles().unwrap().len(), 1);
    }
}
