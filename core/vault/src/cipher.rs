//! Folder cipher: whole-tree encryption with a key-check manifest.
//!
//! A locked folder is a mirror of the plaintext tree where every regular
//! file `f` is stored as `f.enc` in the chunked stream format. The folder
//! key is derived from a password and a per-tree salt recorded in
//! `.phantom_vault/encryption.json`, together with a small encrypted
//! constant used to tell a wrong password apart from damaged content.
//!
//! Every transform writes into a destination directory that must not
//! exist yet; on failure the destination is removed so the caller only
//! ever sees a complete tree or nothing.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use blake2::{digest::consts::U32, Blake2b, Digest};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use walkdir::WalkDir;

use phantomvault_common::{io_err, CryptoError, Error, Result};
use phantomvault_crypto::{EncryptionEngine, Iv, Salt, VaultKey};
use phantomvault_storage::fsutil::write_private_file_atomic;
use phantomvault_storage::tree::{self, copy_symlink, walk_error};
use phantomvault_storage::{OperationReport, Progress};

/// Directory holding the manifest at the top of an encrypted tree.
pub const MANIFEST_DIR: &str = ".phantom_vault";

/// Manifest file name inside [`MANIFEST_DIR`].
pub const MANIFEST_FILE: &str = "encryption.json";

/// Current manifest format.
pub const MANIFEST_VERSION: u32 = 1;

/// Suffix appended to every encrypted file.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

const KEY_CHECK_PLAINTEXT: &[u8] = b"PHANTOMVAULT_FOLDER_KEY_CHECK_V1";

type Blake2b256 = Blake2b<U32>;

/// Key parameters of an encrypted tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CipherManifest {
    /// Manifest format version.
    pub version: u32,
    /// Profile or folder key version the tree was encrypted under.
    pub key_version: u32,
    /// Hex KDF salt.
    pub salt: String,
    /// PBKDF2 iterations used with `salt`.
    pub iterations: u32,
    /// Hex IV of the key check.
    pub key_check_iv: String,
    /// Hex ciphertext of the key-check constant.
    pub key_check: String,
}

/// Encrypts, decrypts and re-keys folder trees.
#[derive(Debug, Clone, Default)]
pub struct FolderCipher {
    engine: EncryptionEngine,
}

impl FolderCipher {
    /// Create a cipher on top of `engine`.
    pub fn new(engine: EncryptionEngine) -> Self {
        Self { engine }
    }

    /// Underlying engine.
    pub fn engine(&self) -> &EncryptionEngine {
        &self.engine
    }

    /// Location of the manifest inside an encrypted tree.
    pub fn manifest_path(root: &Path) -> PathBuf {
        root.join(MANIFEST_DIR).join(MANIFEST_FILE)
    }

    /// Read and validate the manifest of the tree at `root`.
    ///
    /// # Errors
    /// - `Error::Integrity` if the manifest is missing, malformed or of an
    ///   unknown version
    pub fn read_manifest(root: &Path) -> Result<CipherManifest> {
        let path = Self::manifest_path(root);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Integrity(format!(
                    "encrypted tree has no manifest: {}",
                    root.display()
                )))
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        let manifest: CipherManifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Integrity(format!("malformed manifest {}: {}", path.display(), e)))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::Integrity(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Derive the folder key from `password` and confirm it against the
    /// manifest's key check.
    ///
    /// # Errors
    /// - `Error::Credential` if the password does not open the key check
    /// - `Error::Integrity` if the manifest fields are not valid hex
    pub fn unlock_key(&self, manifest: &CipherManifest, password: &str) -> Result<VaultKey> {
        let salt = Salt::from_hex(&manifest.salt)
            .map_err(|_| Error::Integrity("manifest salt is not valid".to_string()))?;
        let iv = hex::decode(&manifest.key_check_iv)
            .map_err(|_| Error::Integrity("manifest key check IV is not hex".to_string()))
            .and_then(|bytes| {
                Iv::from_slice(&bytes).map_err(|_| Error::Integrity("manifest key check IV has wrong length".to_string()))
            })?;
        let check = hex::decode(&manifest.key_check)
            .map_err(|_| Error::Integrity("manifest key check is not hex".to_string()))?;

        let key = self
            .engine
            .derive_key_from_password(password.as_bytes(), &salt, manifest.iterations)?;
        let opened = self
            .engine
            .decrypt_data(&key, &iv, &check)
            .map_err(|_| Error::Credential)?;
        if !bool::from(opened.as_slice().ct_eq(KEY_CHECK_PLAINTEXT)) {
            return Err(Error::Credential);
        }
        Ok(key)
    }

    /// Whether `password` opens the tree at `root`.
    pub fn check_key(&self, root: &Path, password: &str) -> Result<CipherManifest> {
        let manifest = Self::read_manifest(root)?;
        self.unlock_key(&manifest, password)?;
        Ok(manifest)
    }

    /// Encrypt the plaintext tree `src` into `dst` under a key derived from
    /// `password`.
    ///
    /// # Preconditions
    /// - `dst` does not exist
    /// - `src` has no top-level [`MANIFEST_DIR`]
    pub fn encrypt_tree(
        &self,
        src: &Path,
        dst: &Path,
        password: &str,
        key_version: u32,
        progress: &Progress,
    ) -> Result<OperationReport> {
        if src.join(MANIFEST_DIR).exists() {
            return Err(Error::InvalidInput(format!(
                "{} already contains {}",
                src.display(),
                MANIFEST_DIR
            )));
        }
        let (key, manifest) = self.new_key(password, key_version)?;

        let report = build_into(dst, || {
            let report = transform_files(src, dst, progress, "encrypt", |file, target| {
                let target = with_suffix(target);
                self.engine.encrypt_file(&key, file, &target)
            })?;
            write_manifest(dst, &manifest)?;
            Ok(report)
        })?;

        debug!(src = %src.display(), dst = %dst.display(), files = report.processed_paths.len(), "tree encrypted");
        Ok(report)
    }

    /// Decrypt the encrypted tree `src` into `dst`.
    ///
    /// # Errors
    /// - `Error::Credential` if `password` fails the key check
    /// - `Error::Integrity` if any file fails authentication
    pub fn decrypt_tree(&self, src: &Path, dst: &Path, password: &str, progress: &Progress) -> Result<OperationReport> {
        let manifest = Self::read_manifest(src)?;
        let key = self.unlock_key(&manifest, password)?;

        let report = build_into(dst, || {
            transform_files(src, dst, progress, "decrypt", |file, target| {
                let target = strip_suffix(target)?;
                self.engine
                    .decrypt_file(&key, file, &target)
                    .map_err(|e| content_error(file, e))
            })
        })?;

        debug!(src = %src.display(), dst = %dst.display(), files = report.processed_paths.len(), "tree decrypted");
        Ok(report)
    }

    /// Re-encrypt the tree `src` into `dst` under `new_password`.
    ///
    /// Each file is decrypted to a scratch file inside `dst` and encrypted
    /// again straight away, so at most one plaintext file exists at a time.
    pub fn rekey_tree(
        &self,
        src: &Path,
        dst: &Path,
        old_password: &str,
        new_password: &str,
        key_version: u32,
        progress: &Progress,
    ) -> Result<OperationReport> {
        let manifest = Self::read_manifest(src)?;
        let old_key = self.unlock_key(&manifest, old_password)?;
        let (new_key, new_manifest) = self.new_key(new_password, key_version)?;

        let report = build_into(dst, || {
            let report = transform_files(src, dst, progress, "rekey", |file, target| {
                let scratch = scratch_path(target);
                let result = self
                    .engine
                    .decrypt_file(&old_key, file, &scratch)
                    .map_err(|e| content_error(file, e))
                    .and_then(|_| self.engine.encrypt_file(&new_key, &scratch, target));
                if let Err(e) = tree::remove_path(&scratch) {
                    warn!(path = %scratch.display(), error = %e, "failed to remove rekey scratch file");
                }
                result
            })?;
            write_manifest(dst, &new_manifest)?;
            Ok(report)
        })?;

        debug!(src = %src.display(), dst = %dst.display(), key_version, "tree re-keyed");
        Ok(report)
    }

    /// BLAKE2b-256 digest over the tree at `root`, hex encoded.
    ///
    /// Covers every entry's relative path and kind, file lengths and
    /// contents, and symlink targets, in sorted order.
    pub fn digest(root: &Path) -> Result<String> {
        let mut hasher = Blake2b256::new();
        let mut buffer = vec![0u8; 64 * 1024];

        for entry in WalkDir::new(root).follow_links(false).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(walk_error)?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| Error::InvalidInput(format!("{} escaped digest root", entry.path().display())))?;
            let name = relative.to_string_lossy();
            let file_type = entry.file_type();

            if file_type.is_dir() {
                hasher.update(b"D");
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).map_err(io_err(entry.path()))?;
                hasher.update(b"L");
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
                hasher.update(target.to_string_lossy().as_bytes());
                hasher.update([0u8]);
            } else {
                let len = entry.metadata().map_err(walk_error)?.len();
                hasher.update(b"F");
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
                hasher.update(len.to_le_bytes());
                let mut file = File::open(entry.path()).map_err(io_err(entry.path()))?;
                loop {
                    let n = file.read(&mut buffer).map_err(io_err(entry.path()))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                }
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Compare the digest of `root` with `expected` in constant time.
    ///
    /// # Errors
    /// - `Error::Integrity` on mismatch
    pub fn verify_digest(root: &Path, expected: &str) -> Result<()> {
        let actual = Self::digest(root)?;
        if bool::from(actual.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(Error::Integrity(format!(
                "vault contents changed: {}",
                root.display()
            )))
        }
    }

    fn new_key(&self, password: &str, key_version: u32) -> Result<(VaultKey, CipherManifest)> {
        let salt = self.engine.generate_salt();
        let iterations = self.engine.kdf_params().iterations;
        let key = self.engine.derive_key(password.as_bytes(), &salt)?;
        let iv = self.engine.generate_iv();
        let check = self.engine.encrypt_data(&key, &iv, KEY_CHECK_PLAINTEXT)?;

        let manifest = CipherManifest {
            version: MANIFEST_VERSION,
            key_version,
            salt: salt.to_hex(),
            iterations,
            key_check_iv: hex::encode(iv.as_bytes()),
            key_check: hex::encode(check),
        };
        Ok((key, manifest))
    }
}

/// Create `dst`, run `build`, and remove `dst` again if it fails.
fn build_into<T>(dst: &Path, build: impl FnOnce() -> Result<T>) -> Result<T> {
    fs::create_dir(dst).map_err(io_err(dst))?;
    match build() {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(cleanup) = tree::remove_path(dst) {
                warn!(path = %dst.display(), error = %cleanup, "failed to remove partial output");
            }
            Err(e)
        }
    }
}

/// Mirror the structure of `src` into `dst`, handing each regular file to
/// `transform` along with its mirrored target path. The top-level manifest
/// directory of `src` is skipped.
fn transform_files<F>(
    src: &Path,
    dst: &Path,
    progress: &Progress,
    stage: &'static str,
    mut transform: F,
) -> Result<OperationReport>
where
    F: FnMut(&Path, &Path) -> Result<u64>,
{
    let total = tree::summarize(src)?.bytes;
    let mut report = OperationReport::default();
    let walker = WalkDir::new(src)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == MANIFEST_DIR));

    for entry in walker {
        progress.check_cancelled()?;
        let entry = entry.map_err(walk_error)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| Error::InvalidInput(format!("{} escaped tree root", entry.path().display())))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(io_err(&target))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            let bytes = transform(entry.path(), &target)?;
            report.record(relative, bytes);
            progress.report(stage, entry.path(), report.bytes_processed, total);
        }
    }
    Ok(report)
}

fn write_manifest(root: &Path, manifest: &CipherManifest) -> Result<()> {
    let dir = root.join(MANIFEST_DIR);
    fs::create_dir(&dir).map_err(io_err(&dir))?;
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| Error::Serialization(e.to_string()))?;
    write_private_file_atomic(&dir.join(MANIFEST_FILE), &json)
}

fn with_suffix(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(ENCRYPTED_SUFFIX);
    path.with_file_name(name)
}

fn strip_suffix(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match name.strip_suffix(ENCRYPTED_SUFFIX) {
        Some(stem) if !stem.is_empty() => Ok(path.with_file_name(stem)),
        _ => Err(Error::Integrity(format!(
            "unexpected file in encrypted tree: {}",
            path.display()
        ))),
    }
}

fn scratch_path(target: &Path) -> PathBuf {
    let name = target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    target.with_file_name(format!(".{}.rekey", name))
}

/// Chunk failures after a good key check mean damaged content.
fn content_error(path: &Path, err: Error) -> Error {
    match err {
        Error::Crypto(CryptoError::IntegrityFailure) | Error::Crypto(CryptoError::InvalidFormat(_)) => {
            Error::Integrity(format!("encrypted file failed authentication: {}", path.display()))
        }
        other => other,
    }
}
