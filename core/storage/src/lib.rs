//! Storage layer for PhantomVault.
//!
//! Moves folder trees between their original location and a profile's
//! vault, keeps backups, and records every step of a transaction so it can
//! be rolled back.

pub mod fsutil;
pub mod layout;
pub mod manager;
pub mod progress;
pub mod transaction;
pub mod tree;

pub use layout::StorageLayout;
pub use manager::{BackupInfo, VaultStorageManager};
pub use progress::{CancellationToken, OperationReport, Progress, ProgressCallback, ProgressEvent};
pub use transaction::{OperationRecord, StorageOperation, Transaction};
pub use tree::TreeSummary;
