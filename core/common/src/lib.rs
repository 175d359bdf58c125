//! Common utilities and types shared across PhantomVault modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod error;
pub mod types;

pub use error::{io_err, CryptoError, Error, Result, StorageError};
pub use types::{FolderId, OperationTag, ProfileId, SensitiveBytes, UnlockMode};
