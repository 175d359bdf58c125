//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use rand::{rngs::OsRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use phantomvault_common::{CryptoError, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of initialization vectors in bytes (128-bit).
pub const IV_LENGTH: usize = 16;

/// Default salt length for key derivation (256-bit).
pub const SALT_LENGTH: usize = 32;

/// Smallest salt accepted anywhere (128-bit).
pub const MIN_SALT_LENGTH: usize = 16;

/// Fill a fresh buffer from the operating system CSPRNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Symmetric key used for folder contents and sealed secrets.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    key: [u8; KEY_LENGTH],
}

impl VaultKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Create a key from a slice.
    ///
    /// # Errors
    /// - Returns error if the slice is not KEY_LENGTH bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self { key })
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive an independent subkey bound to `context`.
    ///
    /// Uses blake2b for key derivation.
    pub fn derive_subkey(&self, context: &[u8]) -> VaultKey {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(context);
        hasher.update(b"phantomvault-subkey");

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        VaultKey::from_bytes(derived)
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey([REDACTED])")
    }
}

/// Initialization vector. Never reused with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iv([u8; IV_LENGTH]);

impl Iv {
    /// Generate a random IV.
    pub fn generate() -> Self {
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);
        Self(iv)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; IV_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create from a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let iv: [u8; IV_LENGTH] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidFormat(format!("IV must be {} bytes, got {}", IV_LENGTH, bytes.len()))
        })?;
        Ok(Self(iv))
    }

    /// Get the IV bytes.
    pub fn as_bytes(&self) -> &[u8; IV_LENGTH] {
        &self.0
    }
}

/// Salt for key derivation and password hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Salt(Vec<u8>);

impl Salt {
    /// Generate a random salt of the default length.
    pub fn generate() -> Self {
        Self(random_bytes(SALT_LENGTH))
    }

    /// Generate a random salt of `len` bytes.
    ///
    /// # Errors
    /// - Returns error if `len` is below MIN_SALT_LENGTH
    pub fn generate_with_len(len: usize) -> Result<Self> {
        if len < MIN_SALT_LENGTH {
            return Err(CryptoError::InvalidFormat(format!(
                "salt must be at least {} bytes",
                MIN_SALT_LENGTH
            ))
            .into());
        }
        Ok(Self(random_bytes(len)))
    }

    /// Create from bytes.
    ///
    /// # Errors
    /// - Returns error if shorter than MIN_SALT_LENGTH
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SALT_LENGTH {
            return Err(CryptoError::InvalidFormat(format!(
                "salt must be at least {} bytes, got {}",
                MIN_SALT_LENGTH,
                bytes.len()
            ))
            .into());
        }
        Ok(Self(bytes))
    }

    /// Parse a lowercase or uppercase hex encoding.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|e| CryptoError::InvalidFormat(format!("salt is not hex: {}", e)))?;
        Self::from_bytes(bytes)
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derive_subkey() {
        let master = VaultKey::from_bytes([1u8; KEY_LENGTH]);

        let key1 = master.derive_subkey(b"metadata");
        let key2 = master.derive_subkey(b"metadata");

        // Same input should produce same key
        assert_eq!(key1.as_bytes(), key2.as_bytes());

        // Different input should produce different key
        let key3 = master.derive_subkey(b"other");
        assert_ne!(key1.as_bytes(), key3.as_bytes());
    }

    #[test]
    fn test_key_generate() {
        let key1 = VaultKey::generate();
        let key2 = VaultKey::generate();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_key_from_slice_wrong_length() {
        assert!(VaultKey::from_slice(&[0u8; 16]).is_err());
        assert!(VaultKey::from_slice(&[0u8; KEY_LENGTH]).is_ok());
    }

    #[test]
    fn test_iv_generate_unique() {
        assert_ne!(Iv::generate(), Iv::generate());
    }

    #[test]
    fn test_salt_lengths() {
        assert_eq!(Salt::generate().as_bytes().len(), SALT_LENGTH);
        assert!(Salt::generate_with_len(8).is_err());
        assert_eq!(Salt::generate_with_len(16).unwrap().as_bytes().len(), 16);
    }

    #[test]
    fn test_salt_hex() {
        let salt = Salt::from_bytes(vec![0xABu8; 16]).unwrap();
        let restored = Salt::from_hex(&salt.to_hex()).unwrap();
        assert_eq!(salt, restored);
        assert!(Salt::from_hex("zz").is_err());
        assert!(Salt::from_hex("abcd").is_err());
    }
}
