//! EncryptionEngine: the single entry point for symmetric operations.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::aead;
use crate::kdf::{derive_key, KdfParams};
use crate::keys::{random_bytes, Iv, Salt, VaultKey};
use crate::stream::{DecryptingStream, EncryptingStream, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use phantomvault_common::{io_err, Error, Result};

/// Key generation, key derivation and buffer/file encryption.
#[derive(Debug, Clone)]
pub struct EncryptionEngine {
    kdf: KdfParams,
    chunk_size: usize,
}

impl Default for EncryptionEngine {
    fn default() -> Self {
        Self {
            kdf: KdfParams::standard(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl EncryptionEngine {
    /// Create an engine.
    ///
    /// # Errors
    /// - Returns error if `chunk_size` is zero or above MAX_CHUNK_SIZE
    pub fn new(kdf: KdfParams, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "chunk size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        Ok(Self { kdf, chunk_size })
    }

    /// Default KDF parameters used by [`derive_key`](Self::derive_key).
    pub fn kdf_params(&self) -> &KdfParams {
        &self.kdf
    }

    /// Chunk size used for file encryption.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Random 256-bit key.
    pub fn generate_key(&self) -> VaultKey {
        VaultKey::generate()
    }

    /// Random 128-bit IV.
    pub fn generate_iv(&self) -> Iv {
        Iv::generate()
    }

    /// Random 256-bit salt.
    pub fn generate_salt(&self) -> Salt {
        Salt::generate()
    }

    /// Random bytes from the OS CSPRNG.
    pub fn random_bytes(&self, len: usize) -> Vec<u8> {
        random_bytes(len)
    }

    /// Derive a key with an explicit iteration count.
    ///
    /// # Errors
    /// - Returns error if password is empty or iterations below the floor
    pub fn derive_key_from_password(&self, password: &[u8], salt: &Salt, iterations: u32) -> Result<VaultKey> {
        derive_key(password, salt, &KdfParams::with_iterations(iterations)?)
    }

    /// Derive a key with the engine's configured parameters.
    pub fn derive_key(&self, password: &[u8], salt: &Salt) -> Result<VaultKey> {
        derive_key(password, salt, &self.kdf)
    }

    /// Encrypt a buffer. See [`aead::encrypt_data`].
    pub fn encrypt_data(&self, key: &VaultKey, iv: &Iv, data: &[u8]) -> Result<Vec<u8>> {
        aead::encrypt_data(key, iv, data)
    }

    /// Decrypt a buffer. See [`aead::decrypt_data`].
    pub fn decrypt_data(&self, key: &VaultKey, iv: &Iv, data: &[u8]) -> Result<Vec<u8>> {
        aead::decrypt_data(key, iv, data)
    }

    /// Encrypt `src` into `dst` with a fresh IV. Returns plaintext bytes.
    ///
    /// # Postconditions
    /// - `dst` either holds the complete ciphertext or is left untouched
    pub fn encrypt_file(&self, key: &VaultKey, src: &Path, dst: &Path) -> Result<u64> {
        let iv = Iv::generate();
        let stream = EncryptingStream::new(key).with_chunk_size(self.chunk_size)?;
        let reader = BufReader::new(File::open(src).map_err(io_err(src))?);

        write_via_temp(dst, |writer| stream.encrypt_stream(&iv, reader, writer))
    }

    /// Decrypt `src` into `dst`. Returns plaintext bytes.
    ///
    /// # Postconditions
    /// - On any failure `dst` is left untouched; no partial plaintext remains
    ///
    /// # Errors
    /// - `CryptoError::IntegrityFailure` for a wrong key or corrupted file
    pub fn decrypt_file(&self, key: &VaultKey, src: &Path, dst: &Path) -> Result<u64> {
        let stream = DecryptingStream::new(key);
        let reader = BufReader::new(File::open(src).map_err(io_err(src))?);

        write_via_temp(dst, |writer| stream.decrypt_stream(reader, writer))
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    path.with_file_name(format!(".{}.{}.partial", name, hex::encode(random_bytes(4))))
}

/// Run `write` against a sibling temp file, then rename it onto `dst`.
fn write_via_temp<F>(dst: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<u64>,
{
    let temp = temp_path_for(dst);
    let file = File::create(&temp).map_err(io_err(&temp))?;
    let mut writer = BufWriter::new(file);

    let outcome = write(&mut writer).and_then(|n| {
        let file = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all().map_err(io_err(&temp))?;
        Ok(n)
    });

    match outcome {
        Ok(n) => {
            fs::rename(&temp, dst).map_err(io_err(dst))?;
            debug!(path = %dst.display(), bytes = n, "stream written");
            Ok(n)
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&temp) {
                warn!(path = %temp.display(), error = %cleanup, "failed to remove partial output");
            }
            Err(e)
        }
    }
}
