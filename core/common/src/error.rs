//! Common error types for PhantomVault.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Top-level error type for PhantomVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong password or recovery key. Never says which.
    #[error("Invalid credentials")]
    Credential,

    /// Metadata or vault content failed its integrity check.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Filesystem operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transaction protocol misuse (nested or missing transaction).
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A folder was addressed through a profile it does not belong to.
    #[error("Folder {folder} does not belong to profile {profile}")]
    ProfileIsolation {
        /// Authenticated profile.
        profile: String,
        /// Folder that was requested.
        folder: String,
    },

    /// Another transition is already running for this folder.
    #[error("Operation already in progress: {0}")]
    OperationInProgress(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether this error must stop further work on the folder until someone
    /// looks at it by hand.
    pub fn is_fatal_for_folder(&self) -> bool {
        matches!(self, Error::Integrity(_) | Error::Crypto(CryptoError::IntegrityFailure))
    }
}

/// Filesystem failures raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Source path does not exist.
    #[error("source path does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    /// Destination path already exists and will not be overwritten.
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    /// Permission denied.
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// No space left on the device.
    #[error("disk full while writing {}", .0.display())]
    DiskFull(PathBuf),

    /// Copy finished but the destination does not match the source.
    #[error("copy incomplete: {}", .0.display())]
    Incomplete(PathBuf),

    /// Any other I/O failure on a path.
    #[error("{message}: {}", .path.display())]
    Io {
        /// Path the failure relates to.
        path: PathBuf,
        /// Underlying error message.
        message: String,
    },
}

impl StorageError {
    /// Classify an I/O error that happened on `path`.
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => StorageError::SourceMissing(path.to_path_buf()),
            ErrorKind::AlreadyExists => StorageError::DestinationExists(path.to_path_buf()),
            ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_path_buf()),
            ErrorKind::StorageFull => StorageError::DiskFull(path.to_path_buf()),
            _ => StorageError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
        }
    }
}

/// Failures raised by the encryption engine.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Authentication failed: wrong key or corrupted ciphertext.
    #[error("integrity check failed (wrong key or corrupted data)")]
    IntegrityFailure,

    /// Key material has the wrong size.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length in bytes.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// Encoded input does not have the expected shape.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Password-based key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Map an I/O error on `path` into a storage error.
pub fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| Error::Storage(StorageError::from_io(path, e))
}
