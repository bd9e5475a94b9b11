//! Streaming SHA-256 checksums.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::{BackupError, Result};

/// Read block size for hashing (64KB)
const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 of a file as lowercase hex, reading it in fixed-size
/// blocks so memory use does not depend on file size.
pub fn checksum_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| BackupError::at(path, e))?;
    checksum_reader(file).map_err(|e| BackupError::at(path, e))
}

/// Compute the SHA-256 of everything `reader` yields.
pub fn checksum_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_checksum_known_vector() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(b"abc")?;
        file.flush()?;

        assert_eq!(
            checksum_file(file.path())?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn test_checksum_empty_file() -> Result<()> {
        let file = NamedTempFile::new()?;
        assert_eq!(
            checksum_file(file.path())?,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        Ok(())
    }

    #[test]
    fn test_checksum_spans_blocks() -> Result<()> {
        let data = vec![7u8; HASH_BLOCK_SIZE * 3 + 17];
        let mut file = NamedTempFile::new()?;
        file.write_all(&data)?;
        file.flush()?;

        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(checksum_file(file.path())?, expected);
        Ok(())
    }

    #[test]
    fn test_checksum_missing_file() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let err = checksum_file(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
        Ok(())
    }
}
