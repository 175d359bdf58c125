//! VaultStorageManager: the transactional filesystem engine.
//!
//! One manager serves one profile. It moves folder trees between their
//! original location and the profile's vault, keeps backups, and logs every
//! step of an open transaction so a failure can be undone.

use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::layout::StorageLayout;
use crate::progress::{OperationReport, Progress};
use crate::transaction::{OperationRecord, StorageOperation, Transaction};
use crate::tree::{copy_tree, folder_size, remove_path, summarize, verify_tree};
use phantomvault_common::{
    io_err, Error, FolderId, OperationTag, ProfileId, Result, StorageError,
};

/// A backup directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Backup directory.
    pub path: PathBuf,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Transactional storage engine scoped to one profile.
pub struct VaultStorageManager {
    layout: StorageLayout,
    profile: ProfileId,
    progress: Progress,
    transaction: Option<Transaction>,
}

impl VaultStorageManager {
    /// Create a manager for `profile`, creating its directories.
    ///
    /// # Postconditions
    /// - The profile's vault and backup directories exist with mode 0700
    pub fn new(layout: StorageLayout, profile: ProfileId) -> Result<Self> {
        layout.ensure_profile_directories(&profile)?;
        Ok(Self {
            layout,
            profile,
            progress: Progress::silent(),
            transaction: None,
        })
    }

    /// Attach progress reporting and cancellation.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Progress context used by copy steps.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// The layout this manager writes into.
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// The profile this manager is scoped to.
    pub fn profile(&self) -> &ProfileId {
        &self.profile
    }

    /// Vault directory for this profile.
    pub fn vaults_dir(&self) -> PathBuf {
        self.layout.vaults_dir(&self.profile)
    }

    /// Backup directory for this profile.
    pub fn backups_dir(&self) -> PathBuf {
        self.layout.backups_dir(&self.profile)
    }

    // ----- path generation -----

    /// `vaults/<profile>/<folderName>_vault_<folderId>`.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if `folder_name` is not a single path component
    pub fn generate_vault_path(&self, folder_name: &str, folder_id: &FolderId) -> Result<PathBuf> {
        check_name(folder_name)?;
        Ok(self
            .vaults_dir()
            .join(format!("{}_vault_{}", folder_name, folder_id)))
    }

    /// `backups/<profile>/<label>_backup_<tag>_<unixMs>`, unique on disk.
    pub fn generate_backup_path(&self, label: &str, tag: OperationTag) -> Result<PathBuf> {
        check_name(label)?;
        let dir = self.backups_dir();
        let mut stamp = Utc::now().timestamp_millis();
        loop {
            let candidate = dir.join(format!("{}_backup_{}_{}", label, tag, stamp));
            if fs::symlink_metadata(&candidate).is_err() {
                return Ok(candidate);
            }
            stamp += 1;
        }
    }

    /// Hidden sibling of `target` used to build a replacement tree.
    pub fn staging_path_for(&self, target: &Path) -> Result<PathBuf> {
        sibling(target, "staging")
    }

    // ----- transaction protocol -----

    /// Open a transaction.
    ///
    /// # Errors
    /// - `Error::Transaction` if one is already open
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::Transaction(
                "a transaction is already open on this manager".to_string(),
            ));
        }
        self.transaction = Some(Transaction::new());
        debug!(profile = %self.profile, "transaction opened");
        Ok(())
    }

    /// Close the transaction. Operations are already on disk; parked trees
    /// from replacements are removed.
    ///
    /// # Errors
    /// - `Error::Transaction` if no transaction is open
    pub fn commit_transaction(&mut self) -> Result<()> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction to commit".to_string()))?;
        let steps = transaction.records().len();
        transaction.commit();
        info!(profile = %self.profile, steps, "transaction committed");
        Ok(())
    }

    /// Undo every completed operation, newest first.
    ///
    /// # Errors
    /// - `Error::Transaction` if no transaction is open, or if any inverse
    ///   failed (all inverses are still attempted)
    pub fn rollback_transaction(&mut self) -> Result<()> {
        let transaction = self
            .transaction
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction to roll back".to_string()))?;
        rollback(&self.profile, transaction)
    }

    /// Whether a transaction is open.
    pub fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Operations logged in the open transaction.
    pub fn transaction_operations(&self) -> &[OperationRecord] {
        self.transaction
            .as_ref()
            .map(|t| t.records())
            .unwrap_or(&[])
    }

    fn log(&mut self, operation: StorageOperation) -> Option<usize> {
        self.transaction.as_mut().map(|t| t.record(operation))
    }

    fn complete(&mut self, index: Option<usize>) {
        if let (Some(t), Some(i)) = (self.transaction.as_mut(), index) {
            t.complete(i);
        }
    }

    // ----- storage operations -----

    /// Copy `source` into the vault at `destination`, verify, remove `source`.
    ///
    /// # Postconditions
    /// - On success only `destination` holds the tree
    /// - On failure `source` is intact and no partial `destination` remains
    ///
    /// # Errors
    /// - `StorageError::SourceMissing`, `StorageError::DestinationExists`
    /// - `StorageError::Incomplete` if the copy does not match
    /// - `Error::Cancelled` if cancelled between files
    pub fn move_to_vault(&mut self, source: &Path, destination: &Path) -> Result<OperationReport> {
        let op = StorageOperation::MoveToVault {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        };
        self.relocate(op, source, destination)
    }

    /// Copy the vault tree at `source` back to `destination`, verify,
    /// remove `source`. Same guarantees as [`move_to_vault`](Self::move_to_vault).
    pub fn move_from_vault(&mut self, source: &Path, destination: &Path) -> Result<OperationReport> {
        let op = StorageOperation::MoveFromVault {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        };
        self.relocate(op, source, destination)
    }

    fn relocate(&mut self, op: StorageOperation, source: &Path, destination: &Path) -> Result<OperationReport> {
        check_copy(source, destination)?;
        let kind = op.kind();
        let index = self.log(op);

        let report = self.copy_verified(source, destination)?;
        self.complete(index);
        remove_path(source)?;

        info!(
            op = kind,
            source = %source.display(),
            destination = %destination.display(),
            bytes = report.bytes_processed,
            "tree relocated"
        );
        Ok(report)
    }

    /// Copy `source` to a new backup directory.
    ///
    /// Returns the backup path.
    pub fn create_backup(&mut self, source: &Path, label: &str, tag: OperationTag) -> Result<PathBuf> {
        let backup = self.generate_backup_path(label, tag)?;
        check_copy(source, &backup)?;
        let index = self.log(StorageOperation::CreateBackup {
            source: source.to_path_buf(),
            backup: backup.clone(),
        });

        self.copy_verified(source, &backup)?;
        self.complete(index);
        info!(tag = %tag, backup = %backup.display(), "backup created");
        Ok(backup)
    }

    /// Copy a backup out to `destination`, which must not exist.
    pub fn restore_from_backup(&mut self, backup: &Path, destination: &Path) -> Result<OperationReport> {
        check_copy(backup, destination)?;
        let index = self.log(StorageOperation::RestoreBackup {
            backup: backup.to_path_buf(),
            destination: destination.to_path_buf(),
        });

        let report = self.copy_verified(backup, destination)?;
        self.complete(index);
        info!(backup = %backup.display(), destination = %destination.display(), "backup restored");
        Ok(report)
    }

    /// Swap the tree at `staged` in as `target`.
    ///
    /// The old `target` is parked next to it until commit so the swap can
    /// be undone. Outside a transaction it is removed straight away.
    pub fn replace_tree(&mut self, target: &Path, staged: &Path) -> Result<()> {
        if !staged.exists() {
            return Err(StorageError::SourceMissing(staged.to_path_buf()).into());
        }
        let previous = sibling(target, "replaced")?;
        let had_previous = fs::symlink_metadata(target).is_ok();
        let op = StorageOperation::ReplaceTree {
            target: target.to_path_buf(),
            previous: previous.clone(),
            had_previous,
        };
        let index = self.log(op.clone());

        if had_previous {
            fs::rename(target, &previous).map_err(io_err(target))?;
        }
        if let Err(e) = fs::rename(staged, target) {
            if had_previous {
                if let Err(restore) = fs::rename(&previous, target) {
                    error!(path = %target.display(), error = %restore, "failed to restore replaced tree");
                }
            }
            return Err(io_err(target)(e));
        }

        self.complete(index);
        if index.is_none() {
            op.finalize();
        }
        debug!(target = %target.display(), "tree replaced");
        Ok(())
    }

    fn copy_verified(&self, source: &Path, destination: &Path) -> Result<OperationReport> {
        let result = copy_tree(source, destination, &self.progress).and_then(|report| {
            if summarize(source)? != summarize(destination)? {
                return Err(StorageError::Incomplete(destination.to_path_buf()).into());
            }
            Ok(report)
        });

        if result.is_err() {
            if let Err(e) = remove_path(destination) {
                warn!(path = %destination.display(), error = %e, "failed to remove partial copy");
            }
        }
        result
    }

    // ----- backups -----

    /// Backups for `label`, newest first.
    pub fn list_backups(&self, label: &str) -> Result<Vec<BackupInfo>> {
        let dir = self.backups_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_backup_", label);

        let mut backups = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(io_err(&path))?;
            backups.push(BackupInfo {
                path,
                modified: modified.into(),
            });
        }

        backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
        Ok(backups)
    }

    /// Delete all but the `keep_count` most recently modified backups.
    ///
    /// Returns the number removed. A backup that cannot be deleted is
    /// logged and skipped.
    pub fn clean_old_backups(&self, label: &str, keep_count: usize) -> Result<usize> {
        let backups = self.list_backups(label)?;
        let mut removed = 0;

        for stale in backups.iter().skip(keep_count) {
            match remove_path(&stale.path) {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %stale.path.display(), "old backup removed");
                }
                Err(e) => warn!(path = %stale.path.display(), error = %e, "failed to remove old backup"),
            }
        }

        if removed > 0 {
            info!(label, removed, kept = keep_count, "old backups cleaned");
        }
        Ok(removed)
    }

    /// Delete every backup for `label`. Returns the number removed.
    pub fn remove_all_backups(&self, label: &str) -> Result<usize> {
        self.clean_old_backups(label, 0)
    }

    // ----- inspection -----

    /// Whether every entry under `path` is readable.
    pub fn verify_folder_integrity(&self, path: &Path) -> bool {
        verify_tree(path)
    }

    /// Whether anything exists at `path`.
    pub fn path_exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    /// Total size of regular files under `path`.
    pub fn folder_size(&self, path: &Path) -> Result<u64> {
        folder_size(path)
    }

    /// Delete a tree outside the transaction log.
    pub fn purge(&self, path: &Path) -> Result<()> {
        remove_path(path)
    }
}

impl Drop for VaultStorageManager {
    fn drop(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            warn!(profile = %self.profile, "manager dropped with open transaction, rolling back");
            if let Err(e) = rollback(&self.profile, transaction) {
                error!(profile = %self.profile, error = %e, "rollback on drop failed");
            }
        }
    }
}

fn rollback(profile: &ProfileId, transaction: Transaction) -> Result<()> {
    let steps = transaction.records().len();
    let failures = transaction.rollback();
    if failures.is_empty() {
        info!(profile = %profile, steps, "transaction rolled back");
        return Ok(());
    }
    let detail = failures
        .iter()
        .map(|(op, e)| format!("{}: {}", op, e))
        .collect::<Vec<_>>()
        .join("; ");
    Err(Error::Transaction(format!(
        "{} rollback step(s) failed: {}",
        failures.len(),
        detail
    )))
}

fn check_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::InvalidInput(format!("Invalid folder name: {:?}", name))),
    }
}

fn check_copy(source: &Path, destination: &Path) -> Result<()> {
    if fs::symlink_metadata(source).is_err() {
        return Err(StorageError::SourceMissing(source.to_path_buf()).into());
    }
    if fs::symlink_metadata(destination).is_ok() {
        return Err(StorageError::DestinationExists(destination.to_path_buf()).into());
    }
    if destination.starts_with(source) {
        return Err(Error::InvalidInput(format!(
            "{} is inside {}",
            destination.display(),
            source.display()
        )));
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    Ok(())
}

fn sibling(target: &Path, purpose: &str) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("{} has no file name", target.display())))?;
    let mut stamp = Utc::now().timestamp_millis();
    loop {
        let candidate = target.with_file_name(format!(
            ".{}.{}-{}",
            name.to_string_lossy(),
            purpose,
            stamp
        ));
        if fs::symlink_metadata(&candidate).is_err() {
            return Ok(candidate);
        }
        stamp += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CancellationToken;
    use proptest::prelude::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        home: PathBuf,
        manager: VaultStorageManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let layout = StorageLayout::new(dir.path().join("store"), "user").unwrap();
        let manager = VaultStorageManager::new(layout, ProfileId::new("p1").unwrap()).unwrap();
        Fixture {
            _dir: dir,
            home,
            manager,
        }
    }

    fn docs(home: &Path) -> PathBuf {
        let docs = home.join("Docs");
        fs::create_dir_all(docs.join("nested")).unwrap();
        fs::write(docs.join("readme.txt"), b"hello").unwrap();
        fs::write(docs.join("nested/data.bin"), vec![3u8; 512]).unwrap();
        docs
    }

    fn folder() -> FolderId {
        FolderId::new("folder_1").unwrap()
    }

    #[test]
    fn test_generate_vault_path() {
        let f = fixture();
        let path = f.manager.generate_vault_path("Docs", &folder()).unwrap();
        assert_eq!(path, f.manager.vaults_dir().join("Docs_vault_folder_1"));
        assert!(f.manager.generate_vault_path("../x", &folder()).is_err());
    }

    #[test]
    fn test_generate_backup_path_unique() {
        let f = fixture();
        let a = f.manager.generate_backup_path("Docs_folder_1", OperationTag::PreLock).unwrap();
        fs::create_dir_all(&a).unwrap();
        let b = f.manager.generate_backup_path("Docs_folder_1", OperationTag::PreLock).unwrap();

        assert_ne!(a, b);
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("Docs_folder_1_backup_pre-lock_"));
    }

    #[test]
    fn test_transaction_protocol() {
        let mut f = fixture();
        assert!(matches!(f.manager.commit_transaction(), Err(Error::Transaction(_))));
        assert!(matches!(f.manager.rollback_transaction(), Err(Error::Transaction(_))));

        f.manager.begin_transaction().unwrap();
        assert!(f.manager.is_in_transaction());
        assert!(matches!(f.manager.begin_transaction(), Err(Error::Transaction(_))));

        f.manager.commit_transaction().unwrap();
        assert!(!f.manager.is_in_transaction());
    }

    #[test]
    fn test_move_to_vault_and_back() {
        let mut f = fixture();
        let source = docs(&f.home);
        let vault = f.manager.generate_vault_path("Docs", &folder()).unwrap();

        let report = f.manager.move_to_vault(&source, &vault).unwrap();
        assert_eq!(report.bytes_processed, 517);
        assert!(!source.exists());
        assert_eq!(fs::read(vault.join("readme.txt")).unwrap(), b"hello");

        f.manager.move_from_vault(&vault, &source).unwrap();
        assert!(!vault.exists());
        assert_eq!(fs::read(source.join("nested/data.bin")).unwrap(), vec![3u8; 512]);
    }

    #[test]
    fn test_move_refuses_existing_destination() {
        let mut f = fixture();
        let source = docs(&f.home);
        let vault = f.manager.generate_vault_path("Docs", &folder()).unwrap();
        fs::create_dir_all(&vault).unwrap();

        assert!(matches!(
            f.manager.move_to_vault(&source, &vault),
            Err(Error::Storage(StorageError::DestinationExists(_)))
        ));
        assert!(source.join("readme.txt").exists());
    }

    #[test]
    fn test_move_missing_source() {
        let mut f = fixture();
        let vault = f.manager.generate_vault_path("Docs", &folder()).unwrap();
        assert!(matches!(
            f.manager.move_to_vault(&f.home.join("nope"), &vault),
            Err(Error::Storage(StorageError::SourceMissing(_)))
        ));
    }

    #[test]
    fn test_cancelled_move_leaves_source_and_no_partial_copy() {
        let f = fixture();
        let source = docs(&f.home);
        let token = CancellationToken::new();
        token.cancel();
        let mut manager = f
            .manager
            .with_progress(Progress::silent().with_cancellation(token));
        let vault = manager.generate_vault_path("Docs", &folder()).unwrap();

        manager.begin_transaction().unwrap();
        assert!(matches!(manager.move_to_vault(&source, &vault), Err(Error::Cancelled)));
        manager.rollback_transaction().unwrap();

        assert!(source.join("readme.txt").exists());
        assert!(!vault.exists());
    }

    #[test]
    fn test_rollback_restores_original_in_reverse_order() {
        let mut f = fixture();
        let source = docs(&f.home);
        let vault = f.manager.generate_vault_path("Docs", &folder()).unwrap();

        f.manager.begin_transaction().unwrap();
        let backup = f
            .manager
            .create_backup(&source, "Docs_folder_1", OperationTag::PreLock)
            .unwrap();
        f.manager.move_to_vault(&source, &vault).unwrap();

        let kinds: Vec<_> = f
            .manager
            .transaction_operations()
            .iter()
            .map(|r| (r.operation.kind(), r.completed))
            .collect();
        assert_eq!(kinds, vec![("create-backup", true), ("move-to-vault", true)]);

        f.manager.rollback_transaction().unwrap();

        assert_eq!(fs::read(source.join("readme.txt")).unwrap(), b"hello");
        assert!(!vault.exists());
        assert!(!backup.exists());
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let Fixture {
            _dir,
            home,
            mut manager,
        } = fixture();
        let source = docs(&home);
        let vault = manager.generate_vault_path("Docs", &folder()).unwrap();

        manager.begin_transaction().unwrap();
        manager.move_to_vault(&source, &vault).unwrap();
        drop(manager);

        assert!(source.join("readme.txt").exists());
        assert!(!vault.exists());
    }

    #[test]
    fn test_replace_tree_commit_and_rollback() {
        let mut f = fixture();
        let target = docs(&f.home);
        let staged = f.manager.staging_path_for(&target).unwrap();
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("new.txt"), b"new").unwrap();

        f.manager.begin_transaction().unwrap();
        f.manager.replace_tree(&target, &staged).unwrap();
        assert!(target.join("new.txt").exists());
        f.manager.rollback_transaction().unwrap();
        assert!(target.join("readme.txt").exists());
        assert!(!target.join("new.txt").exists());

        let staged = f.manager.staging_path_for(&target).unwrap();
        fs::create_dir_all(&staged).unwrap();
        f.manager.begin_transaction().unwrap();
        f.manager.replace_tree(&target, &staged).unwrap();
        f.manager.commit_transaction().unwrap();
        // Only the target remains next to the original parent.
        assert_eq!(fs::read_dir(&f.home).unwrap().count(), 1);
    }

    #[test]
    fn test_restore_from_backup() {
        let mut f = fixture();
        let source = docs(&f.home);
        let backup = f
            .manager
            .create_backup(&source, "Docs_folder_1", OperationTag::PreUnlock)
            .unwrap();
        let restored = f.home.join("Restored");

        f.manager.begin_transaction().unwrap();
        f.manager.restore_from_backup(&backup, &restored).unwrap();
        assert!(restored.join("readme.txt").exists());
        f.manager.rollback_transaction().unwrap();
        assert!(!restored.exists());
        assert!(backup.exists());
    }

    #[test]
    fn test_verify_folder_integrity() {
        let f = fixture();
        let source = docs(&f.home);
        assert!(f.manager.verify_folder_integrity(&source));
        assert!(!f.manager.verify_folder_integrity(&f.home.join("missing")));
        assert_eq!(f.manager.folder_size(&source).unwrap(), 517);
        assert!(f.manager.path_exists(&source));
    }

    #[test]
    fn test_profiles_never_share_paths() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path(), "user").unwrap();
        let p1 = VaultStorageManager::new(layout.clone(), ProfileId::new("p1").unwrap()).unwrap();
        let p2 = VaultStorageManager::new(layout, ProfileId::new("p2").unwrap()).unwrap();
        let id = folder();

        let v1 = p1.generate_vault_path("Docs", &id).unwrap();
        let v2 = p2.generate_vault_path("Docs", &id).unwrap();
        assert_ne!(v1, v2);
        assert!(!v1.starts_with(p2.vaults_dir()));
        assert!(!p1
            .generate_backup_path("Docs_x", OperationTag::PreLock)
            .unwrap()
            .starts_with(p2.backups_dir()));
    }

    fn make_backups(manager: &VaultStorageManager, label: &str, count: usize) -> Vec<PathBuf> {
        let base = SystemTime::now() - Duration::from_secs(10_000);
        (0..count)
            .map(|i| {
                let path = manager.backups_dir().join(format!("{}_backup_pre-lock_{}", label, i));
                fs::create_dir_all(&path).unwrap();
                let mtime = base + Duration::from_secs(i as u64 * 60);
                fs::File::open(&path).unwrap().set_modified(mtime).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_clean_old_backups_keeps_newest() {
        let f = fixture();
        let created = make_backups(&f.manager, "Docs_folder_1", 5);
        let other = make_backups(&f.manager, "Other_folder_2", 2);

        assert_eq!(f.manager.clean_old_backups("Docs_folder_1", 3).unwrap(), 2);

        assert!(!created[0].exists());
        assert!(!created[1].exists());
        assert!(created[2..].iter().all(|p| p.exists()));
        assert!(other.iter().all(|p| p.exists()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_cleanup_retains_min_of_keep_and_existing(count in 0usize..7, keep in 0usize..5) {
            let f = fixture();
            let created = make_backups(&f.manager, "Docs_folder_1", count);

            let removed = f.manager.clean_old_backups("Docs_folder_1", keep).unwrap();
            let remaining = f.manager.list_backups("Docs_folder_1").unwrap();

            prop_assert_eq!(removed, count.saturating_sub(keep));
            prop_assert_eq!(remaining.len(), keep.min(count));
            let newest: Vec<_> = created.iter().rev().take(keep.min(count)).cloned().collect();
            let kept: Vec<_> = remaining.into_iter().map(|b| b.path).collect();
            prop_assert_eq!(kept, newest);
        }
    }
}
