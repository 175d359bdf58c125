//! Request and result types at the service boundary.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use zeroize::Zeroizing;

use phantomvault_common::{FolderId, ProfileId, Result, UnlockMode};
use phantomvault_storage::{OperationReport, Progress};

/// Proof of knowledge presented with a request.
#[derive(Clone)]
pub enum Credential {
    /// Profile password, or the folder's own password for custom folders.
    Password(Zeroizing<String>),
    /// `XXXX-XXXX-XXXX-XXXX` recovery key.
    RecoveryKey(Zeroizing<String>),
}

impl Credential {
    /// Wrap a password.
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password(Zeroizing::new(password.into()))
    }

    /// Wrap a recovery key.
    pub fn recovery_key(key: impl Into<String>) -> Self {
        Credential::RecoveryKey(Zeroizing::new(key.into()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Credential::Password([REDACTED])"),
            Credential::RecoveryKey(_) => f.write_str("Credential::RecoveryKey([REDACTED])"),
        }
    }
}

/// How a request names its folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderRef {
    /// Registered folder id.
    Id(FolderId),
    /// Original location of the folder.
    Path(PathBuf),
}

impl From<FolderId> for FolderRef {
    fn from(id: FolderId) -> Self {
        FolderRef::Id(id)
    }
}

impl From<PathBuf> for FolderRef {
    fn from(path: PathBuf) -> Self {
        FolderRef::Path(path)
    }
}

impl fmt::Display for FolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FolderRef::Id(id) => write!(f, "{}", id),
            FolderRef::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Lock an unlocked, registered folder.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub profile_id: ProfileId,
    pub folder: FolderRef,
    pub credential: Credential,
    pub progress: Progress,
}

impl LockRequest {
    pub fn new(profile_id: ProfileId, folder: impl Into<FolderRef>, credential: Credential) -> Self {
        Self {
            profile_id,
            folder: folder.into(),
            credential,
            progress: Progress::silent(),
        }
    }

    /// Report progress and honour cancellation through `progress`.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }
}

/// Unlock a locked folder.
#[derive(Debug, Clone)]
pub struct UnlockRequest {
    pub profile_id: ProfileId,
    pub folder: FolderRef,
    pub credential: Credential,
    pub mode: UnlockMode,
    /// Must be set for [`UnlockMode::Permanent`].
    pub confirmed: bool,
    pub progress: Progress,
}

impl UnlockRequest {
    pub fn new(
        profile_id: ProfileId,
        folder: impl Into<FolderRef>,
        credential: Credential,
        mode: UnlockMode,
    ) -> Self {
        Self {
            profile_id,
            folder: folder.into(),
            credential,
            mode,
            confirmed: false,
            progress: Progress::silent(),
        }
    }

    /// Confirm an irreversible permanent unlock.
    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }

    /// Report progress and honour cancellation through `progress`.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }
}

/// Outcome of an operation as handed to external callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processed_paths: Vec<PathBuf>,
    pub bytes_processed: u64,
}

impl From<Result<OperationReport>> for OperationResult {
    fn from(result: Result<OperationReport>) -> Self {
        match result {
            Ok(report) => Self {
                success: true,
                error: None,
                processed_paths: report.processed_paths,
                bytes_processed: report.bytes_processed,
            },
            Err(e) => Self {
                success: false,
                error: Some(e.to_string()),
                processed_paths: Vec::new(),
                bytes_processed: 0,
            },
        }
    }
}

/// Permission to create profiles.
///
/// Only the service hands these out, either while the store is empty or
/// to a caller who proved knowledge of an existing profile password.
#[derive(Debug)]
pub struct AdminGrant {
    _private: (),
}

impl AdminGrant {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// A newly created profile. The recovery key is shown once.
pub struct ProfileCreated {
    pub profile_id: ProfileId,
    pub recovery_key: Zeroizing<String>,
}

impl fmt::Debug for ProfileCreated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileCreated")
            .field("profile_id", &self.profile_id)
            .field("recovery_key", &"[REDACTED]")
            .finish()
    }
}

/// A folder registered and locked for the first time.
pub struct FolderLocked {
    pub folder_id: FolderId,
    pub vault_path: PathBuf,
    /// Present when the folder was given its own password.
    pub custom_recovery_key: Option<Zeroizing<String>>,
    pub report: OperationReport,
}

impl fmt::Debug for FolderLocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderLocked")
            .field("folder_id", &self.folder_id)
            .field("vault_path", &self.vault_path)
            .field("custom_recovery_key", &self.custom_recovery_key.as_ref().map(|_| "[REDACTED]"))
            .field("report", &self.report)
            .finish()
    }
}

/// Folders processed by a re-encryption pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RekeyOutcome {
    pub rekeyed: Vec<FolderId>,
    /// Folders left on the previous key, with the reason.
    pub failures: Vec<(FolderId, String)>,
}

impl RekeyOutcome {
    /// Whether every folder reached the current key.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a password change. The new recovery key is shown once.
pub struct PasswordChanged {
    pub recovery_key: Zeroizing<String>,
    pub rekey: RekeyOutcome,
}

impl fmt::Debug for PasswordChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordChanged")
            .field("recovery_key", &"[REDACTED]")
            .field("rekey", &self.rekey)
            .finish()
    }
}

/// Public view of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub id: ProfileId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub is_active: bool,
    pub key_version: u32,
    pub rekey_pending: bool,
}
