//! Transaction log of storage operations and their inverses.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::progress::Progress;
use crate::tree::{copy_tree, remove_path, summarize};
use phantomvault_common::{io_err, Result, StorageError};

/// A filesystem step that can be undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOperation {
    /// Original folder copied into the vault, then the original removed.
    MoveToVault {
        /// Original location.
        source: PathBuf,
        /// Vault location.
        destination: PathBuf,
    },
    /// Vault copy moved back to the original location.
    MoveFromVault {
        /// Vault location.
        source: PathBuf,
        /// Original location.
        destination: PathBuf,
    },
    /// Copy of a tree kept as a backup.
    CreateBackup {
        /// Tree that was copied.
        source: PathBuf,
        /// New backup directory.
        backup: PathBuf,
    },
    /// Backup copied out to a new location.
    RestoreBackup {
        /// Backup that was copied.
        backup: PathBuf,
        /// Location the copy was written to.
        destination: PathBuf,
    },
    /// Staged tree renamed onto `target`; the old `target` parked at `previous`.
    ReplaceTree {
        /// Location being replaced.
        target: PathBuf,
        /// Where the old content waits until commit.
        previous: PathBuf,
        /// Whether `target` existed before the replacement.
        had_previous: bool,
    },
}

impl StorageOperation {
    /// Wire name of the operation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageOperation::MoveToVault { .. } => "move-to-vault",
            StorageOperation::MoveFromVault { .. } => "move-from-vault",
            StorageOperation::CreateBackup { .. } => "create-backup",
            StorageOperation::RestoreBackup { .. } => "restore-backup",
            StorageOperation::ReplaceTree { .. } => "replace-tree",
        }
    }

    /// Undo this operation. Safe to call more than once.
    ///
    /// - move: bring the destination back to the source, then drop the destination
    /// - create-backup: delete the backup
    /// - restore-backup: delete the restored copy
    /// - replace-tree: put the parked previous content back
    pub fn undo(&self) -> Result<()> {
        match self {
            StorageOperation::MoveToVault {
                source,
                destination,
            }
            | StorageOperation::MoveFromVault {
                source,
                destination,
            } => undo_move(source, destination),
            StorageOperation::CreateBackup { backup, .. } => remove_path(backup),
            StorageOperation::RestoreBackup { destination, .. } => remove_path(destination),
            StorageOperation::ReplaceTree {
                target,
                previous,
                had_previous,
            } => {
                if previous.exists() {
                    remove_path(target)?;
                    fs::rename(previous, target).map_err(io_err(target))?;
                } else if !had_previous {
                    remove_path(target)?;
                }
                Ok(())
            }
        }
    }

    /// Work left once the transaction commits.
    pub(crate) fn finalize(&self) {
        if let StorageOperation::ReplaceTree { previous, .. } = self {
            if let Err(e) = remove_path(previous) {
                warn!(path = %previous.display(), error = %e, "failed to remove replaced tree");
            }
        }
    }
}

fn undo_move(source: &Path, destination: &Path) -> Result<()> {
    if !destination.exists() {
        return Ok(());
    }
    // The source may be partly deleted; rebuild it from the verified copy.
    remove_path(source)?;
    copy_tree(destination, source, &Progress::silent())?;
    if summarize(destination)? != summarize(source)? {
        return Err(StorageError::Incomplete(source.to_path_buf()).into());
    }
    remove_path(destination)
}

impl fmt::Display for StorageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageOperation::MoveToVault {
                source,
                destination,
            }
            | StorageOperation::MoveFromVault {
                source,
                destination,
            } => write!(f, "{} {} -> {}", self.kind(), source.display(), destination.display()),
            StorageOperation::CreateBackup { source, backup } => {
                write!(f, "{} {} -> {}", self.kind(), source.display(), backup.display())
            }
            StorageOperation::RestoreBackup {
                backup,
                destination,
            } => write!(f, "{} {} -> {}", self.kind(), backup.display(), destination.display()),
            StorageOperation::ReplaceTree { target, .. } => {
                write!(f, "{} {}", self.kind(), target.display())
            }
        }
    }
}

/// An operation and whether it finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    /// The operation.
    pub operation: StorageOperation,
    /// Set only after the operation succeeded.
    pub completed: bool,
}

/// Ordered log of operations in one transaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    started_at: DateTime<Utc>,
    records: Vec<OperationRecord>,
}

impl Transaction {
    /// Start an empty log.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            records: Vec::new(),
        }
    }

    /// When the transaction was opened.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Logged operations in execution order.
    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    /// Append a pending record and return its index.
    pub fn record(&mut self, operation: StorageOperation) -> usize {
        self.records.push(OperationRecord {
            operation,
            completed: false,
        });
        self.records.len() - 1
    }

    /// Mark a record completed.
    pub fn complete(&mut self, index: usize) {
        if let Some(record) = self.records.get_mut(index) {
            record.completed = true;
        }
    }

    /// Undo completed operations newest first.
    ///
    /// Every inverse is attempted; the failures are returned.
    pub fn rollback(self) -> Vec<(StorageOperation, phantomvault_common::Error)> {
        let mut failures = Vec::new();
        for record in self.records.into_iter().rev() {
            if !record.completed {
                debug!(operation = %record.operation, "skipping incomplete operation");
                continue;
            }
            match record.operation.undo() {
                Ok(()) => debug!(operation = %record.operation, "operation undone"),
                Err(e) => {
                    warn!(operation = %record.operation, error = %e, "failed to undo operation");
                    failures.push((record.operation, e));
                }
            }
        }
        failures
    }

    /// Run post-commit cleanup for completed operations.
    pub fn commit(self) {
        for record in self.records.iter().filter(|r| r.completed) {
            record.operation.finalize();
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}
