//! Vault engine for PhantomVault.
//!
//! This module provides:
//! - Profile and folder records with integrity-protected persistence
//! - Per-folder encryption of whole directory trees
//! - Authorized lock, unlock, password change and backup restore
//! - An async worker for running transitions off the executor
//!
//! # Architecture
//! [`VaultService`] sits between callers and the storage layer. It checks
//! credentials, drives [`FolderCipher`] and runs every transition as one
//! storage transaction whose last step is the metadata write.

pub mod cipher;
pub mod config;
pub mod inflight;
pub mod records;
pub mod request;
pub mod service;
pub mod store;
pub mod worker;

pub use cipher::{CipherManifest, FolderCipher};
pub use config::ServiceConfig;
pub use inflight::{InFlightGuard, InFlightRegistry};
pub use records::{BackupEntry, FolderRecord, FoldersDocument, PendingRekey, ProfileRecord, ProfilesDocument};
pub use request::{
    AdminGrant, Credential, FolderLocked, FolderRef, LockRequest, OperationResult, PasswordChanged,
    ProfileCreated, ProfileSummary, RekeyOutcome, UnlockRequest,
};
pub use service::VaultService;
pub use store::MetadataStore;
pub use worker::VaultWorker;
