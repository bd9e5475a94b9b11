//! Directory traversal for archiving and manifest generation.
//!
//! Only regular files are reported. Symlinks are never followed, so a link
//! pointing outside the data root cannot pull foreign files into an archive.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
        })
    }

    /// Relative path with `/` separators, as stored in manifests.
    pub fn relative_key(&self) -> String {
        relative_key(&self.relative_path)
    }
}

/// Normalize a relative path to a `/`-separated string.
pub fn relative_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk a directory tree and collect every regular file, sorted by path.
///
/// Walking a single file yields that file with an empty relative path.
pub fn walk_directory(root: &Path) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;

        if !entry.file_type().is_file() {
            continue;
        }

        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories_sorted() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("b.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/a.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path())?;
        let keys: Vec<String> = files.iter().map(|f| f.relative_key()).collect();
        assert_eq!(keys, vec!["b.txt", "subdir/a.txt"]);

        Ok(())
    }

    #[test]
    fn test_walk_single_file() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("lpm.db");
        fs::write(&file, b"sqlite")?;

        let files = walk_directory(&file)?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 6);
        assert_eq!(files[0].relative_key(), "");

        Ok(())
    }
}
