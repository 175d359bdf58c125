//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! The 24-byte XChaCha nonce is built from a 128-bit IV followed by a
//! 64-bit counter. Buffers use a reserved counter value; streamed files use
//! the chunk index, so a single IV never yields the same nonce twice.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    XChaCha20Poly1305,
};

use crate::keys::{Iv, VaultKey, IV_LENGTH};
use phantomvault_common::{CryptoError, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Counter value reserved for whole-buffer encryption.
const BUFFER_COUNTER: u64 = u64::MAX;

/// Build the nonce for `counter` under `iv`.
pub(crate) fn nonce_for(iv: &Iv, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..IV_LENGTH].copy_from_slice(iv.as_bytes());
    nonce[IV_LENGTH..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Seal `msg` with associated data under an explicit counter.
pub(crate) fn seal(key: &VaultKey, iv: &Iv, counter: u64, msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = nonce_for(iv, counter);

    cipher
        .encrypt(GenericArray::from_slice(&nonce), Payload { msg, aad })
        .map_err(|_| CryptoError::InvalidFormat("encryption failed".to_string()).into())
}

/// Open a sealed chunk. Any authentication failure maps to IntegrityFailure.
pub(crate) fn open(key: &VaultKey, iv: &Iv, counter: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::IntegrityFailure.into());
    }

    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let nonce = nonce_for(iv, counter);

    cipher
        .decrypt(GenericArray::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::IntegrityFailure.into())
}

/// Encrypt a byte buffer.
///
/// # Preconditions
/// - `iv` must not have been used with `key` for another buffer
///
/// # Postconditions
/// - Returns ciphertext || tag (plaintext length + TAG_SIZE)
///
/// # Security
/// - Authenticates the ciphertext with Poly1305
pub fn encrypt_data(key: &VaultKey, iv: &Iv, plaintext: &[u8]) -> Result<Vec<u8>> {
    seal(key, iv, BUFFER_COUNTER, plaintext, b"")
}

/// Decrypt a byte buffer produced by [`encrypt_data`].
///
/// # Errors
/// - `CryptoError::IntegrityFailure` on a wrong key, wrong IV or tampered data.
///   Nothing is returned in that case.
pub fn decrypt_data(key: &VaultKey, iv: &Iv, ciphertext: &[u8]) -> Result<Vec<u8>> {
    open(key, iv, BUFFER_COUNTER, ciphertext, b"")
}
