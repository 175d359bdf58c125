//! Password hashing, recovery keys and password-sealed secrets.
//!
//! Stored encodings are plain strings so they can live in metadata records:
//! - password hash: `saltHex:hashHex`
//! - sealed secret: `saltHex:ivHex:ciphertextHex`
//! - recovery key: `XXXX-XXXX-XXXX-XXXX` (hex groups)

use subtle::ConstantTimeEq;
use tracing::debug;

use crate::aead::{decrypt_data, encrypt_data};
use crate::kdf::{derive_key, pbkdf2_bytes, KdfParams};
use crate::keys::{random_bytes, Iv, Salt, MIN_SALT_LENGTH};
use phantomvault_common::{CryptoError, Error, Result, SensitiveBytes};

/// Length of a password hash digest in bytes.
pub const HASH_LENGTH: usize = 32;

/// Salt length used for password hashes and sealed secrets.
pub const CREDENTIAL_SALT_LENGTH: usize = MIN_SALT_LENGTH;

const RECOVERY_GROUPS: usize = 4;
const RECOVERY_GROUP_LEN: usize = 4;

/// Hashes and verifies credentials with a fixed PBKDF2 cost.
///
/// The iteration count is not part of the stored `salt:hash` encoding, so
/// every hash in a store must be produced and checked with the same params.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    params: KdfParams,
}

impl CredentialStore {
    /// Create a store using the given KDF parameters.
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// KDF parameters in use.
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Hash a password as `saltHex:hashHex`.
    ///
    /// A random 16-byte salt is generated when `salt` is `None`.
    ///
    /// # Errors
    /// - Returns error if the password is empty or the salt is too short
    pub fn hash_password(&self, password: &str, salt: Option<&[u8]>) -> Result<String> {
        if password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }
        let salt = match salt {
            Some(bytes) => Salt::from_bytes(bytes.to_vec())?,
            None => Salt::generate_with_len(CREDENTIAL_SALT_LENGTH)?,
        };

        let mut digest = [0u8; HASH_LENGTH];
        pbkdf2_bytes(password.as_bytes(), salt.as_bytes(), self.params.iterations, &mut digest)?;
        Ok(format!("{}:{}", salt.to_hex(), hex::encode(digest)))
    }

    /// Check a password against a stored `salt:hash` value.
    ///
    /// Malformed stored values never verify.
    ///
    /// # Security
    /// - Digest comparison is constant-time
    pub fn verify_password(&self, password: &str, stored: &str) -> bool {
        let Some((salt_hex, hash_hex)) = stored.split_once(':') else {
            debug!("stored credential has no salt separator");
            return false;
        };
        let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(hash_hex)) else {
            debug!("stored credential is not hex");
            return false;
        };
        if salt.len() < MIN_SALT_LENGTH || expected.len() != HASH_LENGTH || password.is_empty() {
            return false;
        }

        let mut actual = [0u8; HASH_LENGTH];
        if pbkdf2_bytes(password.as_bytes(), &salt, self.params.iterations, &mut actual).is_err() {
            return false;
        }
        actual.ct_eq(expected.as_slice()).into()
    }

    /// Hash a recovery key. The key is normalised to uppercase first.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the key is not in recovery-key format
    pub fn hash_recovery_key(&self, key: &str) -> Result<String> {
        let normalized = normalize_recovery_key(key)
            .ok_or_else(|| Error::InvalidInput("Invalid recovery key format".to_string()))?;
        self.hash_password(&normalized, None)
    }

    /// Check a recovery key against its stored hash.
    pub fn verify_recovery_key(&self, key: &str, stored: &str) -> bool {
        match normalize_recovery_key(key) {
            Some(normalized) => self.verify_password(&normalized, stored),
            None => false,
        }
    }

    /// Seal `secret` under a key derived from `passphrase`.
    ///
    /// Produces `saltHex:ivHex:ciphertextHex` with a fresh salt and IV.
    pub fn seal_secret(&self, secret: &[u8], passphrase: &str) -> Result<String> {
        let salt = Salt::generate_with_len(CREDENTIAL_SALT_LENGTH)?;
        let iv = Iv::generate();
        let key = derive_key(passphrase.as_bytes(), &salt, &self.params)?;
        let ciphertext = encrypt_data(&key, &iv, secret)?;

        Ok(format!(
            "{}:{}:{}",
            salt.to_hex(),
            hex::encode(iv.as_bytes()),
            hex::encode(ciphertext)
        ))
    }

    /// Open a value produced by [`seal_secret`](Self::seal_secret).
    ///
    /// # Errors
    /// - `CryptoError::InvalidFormat` if the encoding is malformed
    /// - `CryptoError::IntegrityFailure` if the passphrase is wrong
    pub fn open_secret(&self, sealed: &str, passphrase: &str) -> Result<SensitiveBytes> {
        let mut parts = sealed.splitn(3, ':');
        let (Some(salt_hex), Some(iv_hex), Some(data_hex)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::InvalidFormat("sealed secret must be salt:iv:data".to_string()).into());
        };

        let salt = Salt::from_hex(salt_hex)?;
        let iv_bytes = hex::decode(iv_hex)
            .map_err(|e| CryptoError::InvalidFormat(format!("iv is not hex: {}", e)))?;
        let iv = Iv::from_slice(&iv_bytes)?;
        let ciphertext = hex::decode(data_hex)
            .map_err(|e| CryptoError::InvalidFormat(format!("data is not hex: {}", e)))?;

        let key = derive_key(passphrase.as_bytes(), &salt, &self.params)?;
        Ok(SensitiveBytes::new(decrypt_data(&key, &iv, &ciphertext)?))
    }
}

/// Generate a recovery key of four uppercase hex groups.
pub fn generate_recovery_key() -> String {
    let hex = hex::encode_upper(random_bytes(RECOVERY_GROUPS * RECOVERY_GROUP_LEN / 2));
    hex.as_bytes()
        .chunks(RECOVERY_GROUP_LEN)
        .map(|group| String::from_utf8_lossy(group).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Whether `key` has the exact `XXXX-XXXX-XXXX-XXXX` hex shape.
pub fn validate_recovery_key_format(key: &str) -> bool {
    let groups: Vec<&str> = key.split('-').collect();
    groups.len() == RECOVERY_GROUPS
        && groups.iter().all(|group| {
            group.len() == RECOVERY_GROUP_LEN && group.bytes().all(|b| b.is_ascii_hexdigit())
        })
}

/// Uppercase form of a well-formed recovery key.
pub fn normalize_recovery_key(key: &str) -> Option<String> {
    let key = key.trim();
    validate_recovery_key_format(key).then(|| key.to_ascii_uppercase())
}
