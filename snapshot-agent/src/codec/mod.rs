//! At-rest transforms applied to archived items: compression, then encryption.
//!
//! The order is fixed. Encrypted output is high-entropy, so compressing after
//! encrypting would gain nothing. Reversal runs in the opposite order.

pub mod compress;
pub mod encrypt;

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fs::walker::walk_directory;
use crate::{BackupError, Result};
use compress::COMPRESSED_SUFFIX;
use encrypt::{EncryptionKey, ENCRYPTED_SUFFIX};

/// Streaming block size shared by the codecs (1 MiB)
pub const BLOCK_SIZE: usize = 1024 * 1024;

/// Which transforms to apply (or undo) on archived items.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    /// gzip level 1-9, `None` disables compression
    pub compression_level: Option<u32>,

    /// `None` disables encryption
    pub encryption_key: Option<EncryptionKey>,
}

impl Pipeline {
    /// Pipeline able to undo what a backup recorded as applied.
    pub fn for_restore(
        compressed: bool,
        encrypted: bool,
        key: Option<&EncryptionKey>,
    ) -> Result<Self> {
        let encryption_key = if encrypted {
            Some(key.cloned().ok_or_else(|| {
                BackupError::Config(
                    "backup is encrypted but no encryption key is configured".to_string(),
                )
            })?)
        } else {
            None
        };

        Ok(Self {
            // Level is irrelevant for decompression
            compression_level: compressed.then_some(6),
            encryption_key,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.compression_level.is_none() && self.encryption_key.is_none()
    }

    /// Transform an archived item in place. Files get the codec suffixes
    /// appended, directories keep their name and have every file inside
    /// transformed. Returns the item's new path.
    pub fn process_item(&self, item: &Path) -> Result<PathBuf> {
        if self.is_identity() {
            return Ok(item.to_path_buf());
        }

        if item.is_dir() {
            for file in walk_directory(item)
                .map_err(|e| BackupError::at(item, e))?
            {
                self.process_file(&file.path)?;
            }
            Ok(item.to_path_buf())
        } else {
            self.process_file(item)
        }
    }

    /// Undo [`Pipeline::process_item`] in place. Returns the restored path.
    pub fn reverse_item(&self, item: &Path) -> Result<PathBuf> {
        if self.is_identity() {
            return Ok(item.to_path_buf());
        }

        if item.is_dir() {
            for file in walk_directory(item)
                .map_err(|e| BackupError::at(item, e))?
            {
                self.reverse_file(&file.path)?;
            }
            Ok(item.to_path_buf())
        } else {
            self.reverse_file(item)
        }
    }

    fn process_file(&self, path: &Path) -> Result<PathBuf> {
        let mut current = path.to_path_buf();

        if let Some(level) = self.compression_level {
            let next = with_suffix(&current, COMPRESSED_SUFFIX);
            compress::compress(&current, &next, level)?;
            fs::remove_file(&current).map_err(|e| BackupError::at(&current, e))?;
            current = next;
        }

        if let Some(key) = &self.encryption_key {
            let next = with_suffix(&current, ENCRYPTED_SUFFIX);
            encrypt::encrypt(&current, &next, key)?;
            fs::remove_file(&current).map_err(|e| BackupError::at(&current, e))?;
            current = next;
        }

        debug!(from = %path.display(), to = %current.display(), "Processed file");
        Ok(current)
    }

    fn reverse_file(&self, path: &Path) -> Result<PathBuf> {
        let mut current = path.to_path_buf();

        if let Some(key) = &self.encryption_key {
            let next = strip_suffix(&current, ENCRYPTED_SUFFIX)?;
            encrypt::decrypt(&current, &next, key)?;
            fs::remove_file(&current).map_err(|e| BackupError::at(&current, e))?;
            current = next;
        }

        if self.compression_level.is_some() {
            let next = strip_suffix(&current, COMPRESSED_SUFFIX)?;
            compress::decompress(&current, &next)?;
            fs::remove_file(&current).map_err(|e| BackupError::at(&current, e))?;
            current = next;
        }

        Ok(current)
    }
}

/// `data/lpm.db` + `gz` → `data/lpm.db.gz`
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// `data/lpm.db.gz` - `gz` → `data/lpm.db`; anything else is an integrity error.
pub fn strip_suffix(path: &Path, suffix: &str) -> Result<PathBuf> {
    let stripped = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(suffix))
        .and_then(|n| n.strip_suffix('.'))
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            BackupError::Integrity(format!(
                "expected a .{} file, found {}",
                suffix,
                path.display()
            ))
        })?;
    Ok(path.with_file_name(stripped))
}

/// Open a new output file. An existing file at `path` is never truncated:
/// a transform whose output name is already taken (`report` next to
/// `report.gz`) fails instead of overwriting the other file.
pub(crate) fn create_output(path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                BackupError::Integrity(format!(
                    "output {} already exists, refusing to overwrite it",
                    path.display()
                ))
            } else {
                BackupError::at(path, e)
            }
        })
}

/// Read until `buf` is full or the reader is exhausted.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Removes a half-written output file unless committed.
pub(crate) struct PartialFile<'a> {
    path: &'a Path,
    committed: bool,
}

impl<'a> PartialFile<'a> {
    pub(crate) fn new(path: &'a Path) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        if !self.committed && self.path.exists() {
            if let Err(e) = fs::remove_file(self.path) {
                tracing::warn!(path = %self.path.display(), "Failed to remove partial output: {}", e);
            }
        }
    }
}
