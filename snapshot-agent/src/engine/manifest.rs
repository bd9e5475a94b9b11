//! Integrity manifests: per-file size and SHA-256 for an archive directory.
//!
//! The manifest is built over the archive as it sits on disk (after
//! compression/encryption), so verification detects at-rest corruption
//! without needing any key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};
use tracing::{error, info};

use crate::fs::checksum::checksum_file;
use crate::fs::walker::walk_directory;
use crate::{BackupError, Result};

use super::store::{METADATA_FILE, METADATA_TMP_FILE};

/// Serialized inside `backup_metadata.json` as `integrity_manifest`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub files: Vec<ManifestEntry>,
    pub total_files: usize,
    pub total_size: u64,
}

/// One regular file of the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the archive directory, `/`-separated
    pub path: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MismatchKind {
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch { expected: String, actual: String },
    Unreadable { reason: String },
}

/// A manifest entry that did not match the archive contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub path: String,
    #[serde(flatten)]
    pub kind: MismatchKind,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MismatchKind::Missing => write!(f, "{}: missing", self.path),
            MismatchKind::SizeMismatch { expected, actual } => write!(
                f,
                "{}: size mismatch (expected {}, found {})",
                self.path, expected, actual
            ),
            MismatchKind::ChecksumMismatch { expected, actual } => write!(
                f,
                "{}: checksum mismatch (expected {}, found {})",
                self.path, expected, actual
            ),
            MismatchKind::Unreadable { reason } => write!(f, "{}: unreadable ({})", self.path, reason),
        }
    }
}

/// Outcome of checking every manifest entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub checked_files: usize,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl IntegrityManifest {
    /// Checksum every regular file under `root`. The metadata file itself is
    /// not part of the manifest.
    pub fn build(root: &Path) -> Result<Self> {
        let files = walk_directory(root).map_err(|e| BackupError::at(root, e))?;

        let mut manifest = IntegrityManifest::default();
        for file in files {
            let path = file.relative_key();
            if path == METADATA_FILE || path == METADATA_TMP_FILE {
                continue;
            }

            let checksum = checksum_file(&file.path)?;
            manifest.total_files += 1;
            manifest.total_size += file.size;
            manifest.files.push(ManifestEntry {
                path,
                size: file.size,
                checksum,
            });
        }

        Ok(manifest)
    }

    /// Re-check every entry against `root`.
    ///
    /// Does not stop at the first problem: the report lists every missing,
    /// resized, altered or unreadable file. Never writes to disk.
    pub fn verify(&self, root: &Path) -> VerificationReport {
        let mut report = VerificationReport::default();

        for entry in &self.files {
            report.checked_files += 1;
            if let Some(kind) = check_entry(root, entry) {
                let mismatch = Mismatch {
                    path: entry.path.clone(),
                    kind,
                };
                error!(root = %root.display(), "Integrity check failed: {}", mismatch);
                report.mismatches.push(mismatch);
            }
        }

        if report.is_valid() {
            info!(root = %root.display(), files = report.checked_files, "Integrity verified");
        }
        report
    }
}

fn check_entry(root: &Path, entry: &ManifestEntry) -> Option<MismatchKind> {
    if !is_safe_relative(&entry.path) {
        return Some(MismatchKind::Unreadable {
            reason: "path escapes the archive directory".to_string(),
        });
    }

    let path = root.join(&entry.path);
    let metadata = match std::fs::metadata(&path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Some(MismatchKind::Missing),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Some(MismatchKind::Missing),
        Err(e) => {
            return Some(MismatchKind::Unreadable {
                reason: e.to_string(),
            })
        }
    };

    if metadata.len() != entry.size {
        return Some(MismatchKind::SizeMismatch {
            expected: entry.size,
            actual: metadata.len(),
        });
    }

    match checksum_file(&path) {
        Ok(actual) if actual == entry.checksum => None,
        Ok(actual) => Some(MismatchKind::ChecksumMismatch {
            expected: entry.checksum.clone(),
            actual,
        }),
        Err(e) => Some(MismatchKind::Unreadable {
            reason: e.to_string(),
        }),
    }
}

/// True for non-empty relative paths without `..`, roots or prefixes.
pub(crate) fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_tree() -> std::io::Result<TempDir> {
        let temp = TempDir::new()?;
        fs::create_dir_all(temp.path().join("resources/docs"))?;
        fs::write(temp.path().join("resources/docs/a.md"), vec![b'a'; 10])?;
        fs::write(temp.path().join("resources/b.md"), vec![b'b'; 20])?;
        fs::write(temp.path().join("lpm.db"), vec![b'c'; 30])?;
        Ok(temp)
    }

    #[test]
    fn test_build_totals_and_order() -> Result<()> {
        let temp = sample_tree()?;
        fs::write(temp.path().join(METADATA_FILE), b"{}")?;

        let manifest = IntegrityManifest::build(temp.path())?;
        assert_eq!(manifest.total_files, 3);
        assert_eq!(manifest.total_size, 60);

        let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["lpm.db", "resources/b.md", "resources/docs/a.md"]);

        for entry in &manifest.files {
            assert_eq!(entry.checksum, checksum_file(&temp.path().join(&entry.path))?);
        }
        Ok(())
    }

    #[test]
    fn test_verify_is_repeatable() -> Result<()> {
        let temp = sample_tree()?;
        let manifest = IntegrityManifest::build(temp.path())?;

        let first = manifest.verify(temp.path());
        let second = manifest.verify(temp.path());
        assert!(first.is_valid());
        assert_eq!(first, second);
        assert_eq!(first.checked_files, 3);
        Ok(())
    }

    #[test]
    fn test_verify_reports_every_mismatch() -> Result<()> {
        let temp = sample_tree()?;
        let manifest = IntegrityManifest::build(temp.path())?;

        // Same size, one byte flipped
        let mut bytes = fs::read(temp.path().join("lpm.db"))?;
        bytes[5] = b'X';
        fs::write(temp.path().join("lpm.db"), &bytes)?;
        // Truncated
        fs::write(temp.path().join("resources/b.md"), b"short")?;
        // Gone
        fs::remove_file(temp.path().join("resources/docs/a.md"))?;

        let report = manifest.verify(temp.path());
        assert!(!report.is_valid());
        assert_eq!(report.checked_files, 3);
        assert_eq!(report.mismatches.len(), 3);

        assert_eq!(report.mismatches[0].path, "lpm.db");
        assert!(matches!(report.mismatches[0].kind, MismatchKind::ChecksumMismatch { .. }));
        assert_eq!(
            report.mismatches[1].kind,
            MismatchKind::SizeMismatch { expected: 20, actual: 5 }
        );
        assert_eq!(report.mismatches[2].kind, MismatchKind::Missing);
        Ok(())
    }

    #[test]
    fn test_verify_rejects_escaping_paths() -> Result<()> {
        let temp = sample_tree()?;
        let manifest = IntegrityManifest {
            files: vec![ManifestEntry {
                path: "../outside".to_string(),
                size: 1,
                checksum: String::new(),
            }],
            total_files: 1,
            total_size: 1,
        };

        let report = manifest.verify(temp.path());
        assert!(matches!(report.mismatches[0].kind, MismatchKind::Unreadable { .. }));
        Ok(())
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative("data/sqlite"));
        assert!(is_safe_relative("resources"));
        assert!(!is_safe_relative(""));
        assert!(!is_safe_relative("/etc/passwd"));
        assert!(!is_safe_relative("data/../../etc"));
    }
}
