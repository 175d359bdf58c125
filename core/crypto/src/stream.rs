//! Streaming encryption for large files.
//!
//! Data is processed in fixed-size chunks so memory use does not depend on
//! input size. Each chunk is independently authenticated and bound to its
//! position; the last chunk carries a final flag so truncation is detected.
//!
//! # Format
//! - Header: magic `PVE1` (4) + version (1) + chunk_size u32 LE (4) + IV (16)
//! - Chunks: ciphertext length u32 LE (4) + ciphertext with tag
//!
//! The final chunk is always shorter than `chunk_size`; when the plaintext
//! length is an exact multiple an empty final chunk is written.

use std::io::{ErrorKind, Read, Write};

use crate::aead::{open, seal, TAG_SIZE};
use crate::keys::{Iv, VaultKey, IV_LENGTH};
use phantomvault_common::{CryptoError, Error, Result};

/// Default chunk size for streaming encryption (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk size a stream may declare (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Stream magic bytes.
pub const STREAM_MAGIC: &[u8; 4] = b"PVE1";

/// Stream encryption version.
pub const STREAM_VERSION: u8 = 1;

/// Header size: magic (4) + version (1) + chunk_size (4) + iv (16).
pub const HEADER_SIZE: usize = 4 + 1 + 4 + IV_LENGTH;

fn header_bytes(chunk_size: u32, iv: &Iv) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(STREAM_MAGIC);
    header[4] = STREAM_VERSION;
    header[5..9].copy_from_slice(&chunk_size.to_le_bytes());
    header[9..].copy_from_slice(iv.as_bytes());
    header
}

fn chunk_aad(header: &[u8; HEADER_SIZE], is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(HEADER_SIZE + 1);
    aad.extend_from_slice(header);
    aad.push(u8::from(is_final));
    aad
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypting stream that processes data in chunks.
pub struct EncryptingStream<'a> {
    key: &'a VaultKey,
    chunk_size: usize,
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream.
    pub fn new(key: &'a VaultKey) -> Self {
        Self {
            key,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set custom chunk size.
    ///
    /// # Errors
    /// - Returns error if size is zero or above MAX_CHUNK_SIZE
    pub fn with_chunk_size(mut self, size: usize) -> Result<Self> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "chunk size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        self.chunk_size = size;
        Ok(self)
    }

    /// Encrypt data from reader and write to writer under a fresh `iv`.
    ///
    /// Returns the number of plaintext bytes consumed.
    ///
    /// # Errors
    /// - I/O errors from reader/writer
    pub fn encrypt_stream<R: Read, W: Write>(&self, iv: &Iv, mut reader: R, mut writer: W) -> Result<u64> {
        let header = header_bytes(self.chunk_size as u32, iv);
        writer.write_all(&header)?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_bytes = 0u64;
        let mut index = 0u64;

        loop {
            let bytes_read = read_full(&mut reader, &mut buffer)?;
            let is_final = bytes_read < self.chunk_size;

            let encrypted = seal(self.key, iv, index, &buffer[..bytes_read], &chunk_aad(&header, is_final))?;
            writer.write_all(&(encrypted.len() as u32).to_le_bytes())?;
            writer.write_all(&encrypted)?;

            total_bytes += bytes_read as u64;
            index += 1;

            if is_final {
                break;
            }
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Decrypting stream that processes encrypted chunks.
pub struct DecryptingStream<'a> {
    key: &'a VaultKey,
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream.
    pub fn new(key: &'a VaultKey) -> Self {
        Self { key }
    }

    /// Decrypt data from reader and write to writer.
    ///
    /// Returns the number of plaintext bytes produced. The writer may have
    /// received earlier chunks when a later one fails, so callers write to
    /// a scratch destination and discard it on error.
    ///
    /// # Errors
    /// - `CryptoError::InvalidFormat` for a bad header
    /// - `CryptoError::IntegrityFailure` for a wrong key, tampering or truncation
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut header = [0u8; HEADER_SIZE];
        if read_full(&mut reader, &mut header)? != HEADER_SIZE {
            return Err(CryptoError::InvalidFormat("stream header truncated".to_string()).into());
        }
        if &header[..4] != STREAM_MAGIC {
            return Err(CryptoError::InvalidFormat("not an encrypted stream".to_string()).into());
        }
        if header[4] != STREAM_VERSION {
            return Err(CryptoError::InvalidFormat(format!(
                "Unsupported stream version: {}",
                header[4]
            ))
            .into());
        }

        let chunk_size = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(CryptoError::InvalidFormat(format!("invalid chunk size {}", chunk_size)).into());
        }
        let iv = Iv::from_slice(&header[9..])?;

        let max_encrypted = chunk_size + TAG_SIZE;
        let mut encrypted = vec![0u8; max_encrypted];
        let mut total_bytes = 0u64;
        let mut index = 0u64;

        loop {
            let mut len_bytes = [0u8; 4];
            if read_full(&mut reader, &mut len_bytes)? != 4 {
                // Stream ended before the final chunk.
                return Err(CryptoError::IntegrityFailure.into());
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if !(TAG_SIZE..=max_encrypted).contains(&len) {
                return Err(CryptoError::IntegrityFailure.into());
            }
            if read_full(&mut reader, &mut encrypted[..len])? != len {
                return Err(CryptoError::IntegrityFailure.into());
            }

            let is_final = len - TAG_SIZE < chunk_size;
            let plaintext = open(self.key, &iv, index, &encrypted[..len], &chunk_aad(&header, is_final))?;
            writer.write_all(&plaintext)?;
            total_bytes += plaintext.len() as u64;
            index += 1;

            if is_final {
                break;
            }
        }

        let mut trailing = [0u8; 1];
        if read_full(&mut reader, &mut trailing)? != 0 {
            return Err(CryptoError::IntegrityFailure.into());
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Encrypt a complete byte slice using streaming encryption.
pub fn encrypt_bytes(key: &VaultKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    EncryptingStream::new(key).encrypt_stream(&Iv::generate(), data, &mut output)?;
    Ok(output)
}

/// Decrypt a complete byte slice that was encrypted with streaming encryption.
pub fn decrypt_bytes(key: &VaultKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    DecryptingStream::new(key).decrypt_stream(data, &mut output)?;
    Ok(output)
}
