//! Recursive copy and removal of files and directory trees.

use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{BackupError, Result};

/// Copy a file or a whole directory tree to `dst`, preserving structure.
///
/// Returns the number of file bytes copied. Entries that are neither regular
/// files nor directories (sockets, dangling links) are skipped with a warning.
pub fn copy_path(src: &Path, dst: &Path) -> Result<u64> {
    let metadata = fs::metadata(src).map_err(|e| BackupError::at(src, e))?;

    if metadata.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::at(parent, e))?;
        }
        return fs::copy(src, dst).map_err(|e| BackupError::at(src, e));
    }

    if !metadata.is_dir() {
        return Err(BackupError::at(
            src,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "neither a regular file nor a directory",
            ),
        ));
    }

    let mut copied = 0u64;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| BackupError::at(src, e.into()))?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| BackupError::at(&target, e))?;
        } else if file_type.is_file() {
            copied += fs::copy(entry.path(), &target).map_err(|e| BackupError::at(entry.path(), e))?;
        } else {
            warn!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }

    debug!(src = %src.display(), dst = %dst.display(), bytes = copied, "Copied tree");
    Ok(copied)
}

/// Remove a file or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BackupError::at(path, e)),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| BackupError::at(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_directory_tree() -> Result<()> {
        let temp = TempDir::new()?;
        let src = temp.path().join("resources");
        fs::create_dir_all(src.join("nested/deeper"))?;
        fs::write(src.join("a.txt"), b"0123456789")?;
        fs::write(src.join("nested/deeper/b.txt"), b"01234")?;
        fs::create_dir_all(src.join("empty"))?;

        let dst = temp.path().join("copy");
        let copied = copy_path(&src, &dst)?;

        assert_eq!(copied, 15);
        assert_eq!(fs::read(dst.join("a.txt"))?, b"0123456789");
        assert_eq!(fs::read(dst.join("nested/deeper/b.txt"))?, b"01234");
        assert!(dst.join("empty").is_dir());
        Ok(())
    }

    #[test]
    fn test_copy_single_file_creates_parents() -> Result<()> {
        let temp = TempDir::new()?;
        let src = temp.path().join("lpm.db");
        fs::write(&src, b"db")?;

        let dst = temp.path().join("x/y/lpm.db");
        assert_eq!(copy_path(&src, &dst)?, 2);
        assert_eq!(fs::read(&dst)?, b"db");
        Ok(())
    }

    #[test]
    fn test_copy_missing_source_fails() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        let result = copy_path(&temp.path().join("missing"), &temp.path().join("out"));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_remove_path() -> Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("dir");
        fs::create_dir_all(dir.join("sub"))?;
        fs::write(dir.join("sub/f"), b"x")?;

        remove_path(&dir)?;
        assert!(!dir.exists());

        // Already gone
        remove_path(&dir)?;
        Ok(())
    }
}
