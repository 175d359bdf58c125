//! Cryptographic primitives for PhantomVault.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA256
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Secure key management with automatic zeroization
//! - Chunked streaming encryption for large files
//! - Password hashing and recovery keys
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod credentials;
pub mod engine;
pub mod kdf;
pub mod keys;
pub mod stream;

pub use aead::{decrypt_data, encrypt_data};
pub use credentials::{
    generate_recovery_key, normalize_recovery_key, validate_recovery_key_format, CredentialStore,
};
pub use engine::EncryptionEngine;
pub use kdf::{derive_key, KdfParams};
pub use keys::{random_bytes, Iv, Salt, VaultKey};
pub use stream::{DecryptingStream, EncryptingStream};
