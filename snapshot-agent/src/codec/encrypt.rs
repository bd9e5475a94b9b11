//! AES-256-GCM file encryption in authenticated segments.
//!
//! Layout of an encrypted file:
//!
//! | bytes            | content                                   |
//! |------------------|-------------------------------------------|
//! | 8                | magic `SNAPENC1`                          |
//! | 7                | random nonce prefix                       |
//! | n × (1 MiB + 16) | STREAM segments (32-bit BE counter)       |
//!
//! The final segment carries the "last block" flag in its nonce, so a file
//! truncated at a segment boundary fails authentication just like a file
//! with flipped bits.
//!
//! There is no key escrow. Losing the configured key makes every encrypted
//! backup permanently unrecoverable.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::{KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{create_output, read_full, PartialFile, BLOCK_SIZE};
use crate::{BackupError, Result};

/// Suffix appended to encrypted files
pub const ENCRYPTED_SUFFIX: &str = "enc";

const MAGIC: &[u8; 8] = b"SNAPENC1";
const KEY_SIZE: usize = 32;
const NONCE_PREFIX_SIZE: usize = 7;
const TAG_SIZE: usize = 16;

/// A 256-bit symmetric key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a fresh random key. The caller is responsible for persisting it.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key as stored in configuration.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| BackupError::Config(format!("Invalid encryption key encoding: {}", e)))?;

        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            return Err(BackupError::Config(format!(
                "Invalid encryption key size: expected {} bytes, got {}",
                KEY_SIZE, len
            )));
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| BackupError::Config(format!("Failed to create cipher: {}", e)))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Encrypt `src` into `dst`.
pub fn encrypt(src: &Path, dst: &Path, key: &EncryptionKey) -> Result<PathBuf> {
    let cipher = key.cipher()?;
    let mut reader = BufReader::new(File::open(src).map_err(|e| BackupError::at(src, e))?);

    let output = create_output(dst)?;
    let guard = PartialFile::new(dst);
    let mut writer = BufWriter::new(output);

    let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
    OsRng.fill_bytes(&mut nonce_prefix);
    writer
        .write_all(MAGIC)
        .and_then(|_| writer.write_all(&nonce_prefix))
        .map_err(|e| BackupError::at(dst, e))?;

    let mut encryptor = EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce_prefix));
    let seal_failed = |_: aes_gcm::aead::Error| {
        BackupError::Integrity(format!("Encryption failed for {}", src.display()))
    };

    let mut current = read_block(&mut reader, BLOCK_SIZE, src)?;
    let last = loop {
        let next = read_block(&mut reader, BLOCK_SIZE, src)?;
        if next.is_empty() {
            break current;
        }
        let sealed = encryptor.encrypt_next(current.as_slice()).map_err(seal_failed)?;
        writer.write_all(&sealed).map_err(|e| BackupError::at(dst, e))?;
        current = next;
    };
    let sealed = encryptor.encrypt_last(last.as_slice()).map_err(seal_failed)?;
    writer.write_all(&sealed).map_err(|e| BackupError::at(dst, e))?;

    writer.flush().map_err(|e| BackupError::at(dst, e))?;
    drop(writer);
    guard.commit();

    Ok(dst.to_path_buf())
}

/// Decrypt a file produced by [`encrypt`].
///
/// A wrong key, a modified byte, a foreign file or a truncated file all fail
/// with [`BackupError::Authentication`]; nothing is left at `dst`.
pub fn decrypt(src: &Path, dst: &Path, key: &EncryptionKey) -> Result<PathBuf> {
    let cipher = key.cipher()?;
    let mut reader = BufReader::new(File::open(src).map_err(|e| BackupError::at(src, e))?);

    let mut header = [0u8; MAGIC.len() + NONCE_PREFIX_SIZE];
    let n = read_full(&mut reader, &mut header).map_err(|e| BackupError::at(src, e))?;
    if n < header.len() || &header[..MAGIC.len()] != MAGIC {
        return Err(BackupError::Authentication(format!(
            "{} is not an encrypted backup file",
            src.display()
        )));
    }
    let nonce_prefix = &header[MAGIC.len()..];

    let output = create_output(dst)?;
    let guard = PartialFile::new(dst);
    let mut writer = BufWriter::new(output);

    let mut decryptor = DecryptorBE32::from_aead(cipher, GenericArray::from_slice(nonce_prefix));
    let open_failed = |_: aes_gcm::aead::Error| {
        BackupError::Authentication(format!(
            "Decryption failed for {}: invalid key or corrupted data",
            src.display()
        ))
    };

    let segment = BLOCK_SIZE + TAG_SIZE;
    let mut current = read_block(&mut reader, segment, src)?;
    let last = loop {
        let next = read_block(&mut reader, segment, src)?;
        if next.is_empty() {
            break current;
        }
        let plain = decryptor.decrypt_next(current.as_slice()).map_err(open_failed)?;
        writer.write_all(&plain).map_err(|e| BackupError::at(dst, e))?;
        current = next;
    };
    let plain = decryptor.decrypt_last(last.as_slice()).map_err(open_failed)?;
    writer.write_all(&plain).map_err(|e| BackupError::at(dst, e))?;

    writer.flush().map_err(|e| BackupError::at(dst, e))?;
    drop(writer);
    guard.commit();

    Ok(dst.to_path_buf())
}

fn read_block<R: Read>(reader: &mut R, size: usize, path: &Path) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let n = read_full(reader, &mut buf).map_err(|e| BackupError::at(path, e))?;
    buf.truncate(n);
    Ok(buf)
}
