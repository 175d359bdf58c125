//! Password-based key derivation using PBKDF2-HMAC-SHA256.

use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::keys::{Salt, VaultKey, KEY_LENGTH};
use phantomvault_common::{CryptoError, Error, Result};

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Lowest iteration count accepted when deriving keys.
pub const MIN_ITERATIONS: u32 = 1_000;

/// Parameters for PBKDF2 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Number of PBKDF2 iterations.
    pub iterations: u32,
}

impl KdfParams {
    /// Parameters used for stored credentials and folder keys.
    pub fn standard() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// Cheap parameters for tests and tooling.
    pub fn fast() -> Self {
        Self {
            iterations: MIN_ITERATIONS,
        }
    }

    /// Custom iteration count.
    ///
    /// # Errors
    /// - Returns error if `iterations` is below MIN_ITERATIONS
    pub fn with_iterations(iterations: u32) -> Result<Self> {
        if iterations < MIN_ITERATIONS {
            return Err(Error::InvalidInput(format!(
                "KDF iterations must be at least {}",
                MIN_ITERATIONS
            )));
        }
        Ok(Self { iterations })
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::standard()
    }
}

/// Derive raw bytes of arbitrary length from a password.
pub(crate) fn pbkdf2_bytes(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<()> {
    if iterations == 0 {
        return Err(CryptoError::KeyDerivation("iteration count cannot be zero".to_string()).into());
    }
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, out);
    Ok(())
}

/// Derive a 256-bit key from a password and salt.
///
/// # Preconditions
/// - `password` must not be empty
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - Returns error if password is empty
/// - Returns error if the iteration count is zero
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<VaultKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let mut key_bytes = [0u8; KEY_LENGTH];
    pbkdf2_bytes(password, salt.as_bytes(), params.iterations, &mut key_bytes)?;
    Ok(VaultKey::from_bytes(key_bytes))
}
