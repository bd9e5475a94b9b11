//! Streaming gzip (DEFLATE) compression of single files.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{create_output, PartialFile, BLOCK_SIZE};
use crate::{BackupError, Result};

/// Suffix appended to compressed files
pub const COMPRESSED_SUFFIX: &str = "gz";

/// Compress `src` into `dst` at `level` (1 = fastest, 9 = smallest).
pub fn compress(src: &Path, dst: &Path, level: u32) -> Result<PathBuf> {
    if !(1..=9).contains(&level) {
        return Err(BackupError::Config(format!(
            "compression level must be between 1 and 9, got {}",
            level
        )));
    }

    let mut input = File::open(src).map_err(|e| BackupError::at(src, e))?;
    let output = create_output(dst)?;
    let guard = PartialFile::new(dst);
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::new(level));

    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = input.read(&mut buf).map_err(|e| BackupError::at(src, e))?;
        if n == 0 {
            break;
        }
        encoder
            .write_all(&buf[..n])
            .map_err(|e| BackupError::at(dst, e))?;
    }

    let mut writer = encoder.finish().map_err(|e| BackupError::at(dst, e))?;
    writer.flush().map_err(|e| BackupError::at(dst, e))?;
    drop(writer);
    guard.commit();

    let original_size = fs::metadata(src).map(|m| m.len()).unwrap_or(0);
    let compressed_size = fs::metadata(dst).map(|m| m.len()).unwrap_or(0);
    info!(
        file = %src.display(),
        level,
        "Compressed: {:.1}% reduction",
        reduction_percent(original_size, compressed_size)
    );

    Ok(dst.to_path_buf())
}

/// Decompress a file produced by [`compress`].
///
/// A truncated or malformed stream is reported as an integrity error and the
/// partial output is removed.
pub fn decompress(src: &Path, dst: &Path) -> Result<PathBuf> {
    let input = File::open(src).map_err(|e| BackupError::at(src, e))?;
    let compressed_len = input.metadata().map_err(|e| BackupError::at(src, e))?.len();
    if compressed_len == 0 {
        return Err(BackupError::Integrity(format!(
            "empty compressed stream: {}",
            src.display()
        )));
    }

    let output = create_output(dst)?;
    let guard = PartialFile::new(dst);
    let mut writer = BufWriter::new(output);
    let mut decoder = GzDecoder::new(BufReader::new(input));

    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = decoder.read(&mut buf).map_err(|e| {
            BackupError::Integrity(format!("corrupt compressed stream {}: {}", src.display(), e))
        })?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| BackupError::at(dst, e))?;
    }

    writer.flush().map_err(|e| BackupError::at(dst, e))?;
    drop(writer);
    guard.commit();

    Ok(dst.to_path_buf())
}

fn reduction_percent(original: u64, compressed: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (1.0 - compressed as f64 / original as f64) * 100.0
}
