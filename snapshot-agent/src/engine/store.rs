//! On-disk catalog of archive directories.
//!
//! Each backup lives in its own directory under the backup root, named
//! `<%Y%m%d_%H%M%S>_<first 8 chars of id>`. The `backup_metadata.json` file
//! inside is the commit marker: a directory without a readable, valid
//! metadata file is an incomplete archive and is never listed.

use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::record::BackupRecord;
use crate::fs::copy::remove_path;
use crate::{BackupError, Result};

/// Commit marker written last into every archive directory
pub const METADATA_FILE: &str = "backup_metadata.json";

/// Metadata is written here first, then renamed into place
pub const METADATA_TMP_FILE: &str = "backup_metadata.json.tmp";

const STAGING_DIR: &str = ".staging";
const ID_PREFIX_LEN: usize = 8;

/// A committed backup and the directory holding it.
#[derive(Debug, Clone)]
pub struct StoredBackup {
    pub record: BackupRecord,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    /// Open (creating if needed) the backup root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| BackupError::at(&root, e))?;
        debug!(root = %root.display(), "Backup store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic folder name for a backup.
    pub fn archive_dir_name(created_at: &DateTime<Utc>, id: &str) -> String {
        format!(
            "{}_{}",
            created_at.format("%Y%m%d_%H%M%S"),
            id_prefix(id)
        )
    }

    /// Create the (empty) archive directory for a new backup. Fails if it
    /// already exists rather than writing into someone else's archive.
    pub fn allocate(&self, created_at: &DateTime<Utc>, id: &str) -> Result<PathBuf> {
        let dir = self.root.join(Self::archive_dir_name(created_at, id));
        fs::create_dir(&dir).map_err(|e| BackupError::at(&dir, e))?;
        Ok(dir)
    }

    /// Write the commit marker. Goes through a temporary file and a rename so
    /// readers never see a half-written metadata file.
    pub fn write_metadata(&self, dir: &Path, record: &BackupRecord) -> Result<()> {
        let tmp = dir.join(METADATA_TMP_FILE);
        let target = dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp).map_err(|e| BackupError::at(&tmp, e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| BackupError::at(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &target).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            BackupError::at(&target, e)
        })
    }

    /// Read and validate the metadata of one archive directory.
    pub fn read_metadata(dir: &Path) -> Result<BackupRecord> {
        let path = dir.join(METADATA_FILE);
        let content = fs::read(&path).map_err(|e| BackupError::at(&path, e))?;
        let record: BackupRecord = serde_json::from_slice(&content)?;
        if record.id.is_empty() {
            return Err(BackupError::Integrity(format!(
                "metadata without id: {}",
                path.display()
            )));
        }
        Ok(record)
    }

    /// All committed backups, newest first.
    pub fn list(&self) -> Result<Vec<StoredBackup>> {
        let mut backups: Vec<StoredBackup> = self
            .archive_dirs()?
            .into_iter()
            .filter_map(|dir| self.load(dir))
            .collect();

        backups.sort_by(|a, b| b.record.created_at.cmp(&a.record.created_at));
        debug!(count = backups.len(), "Listed backups");
        Ok(backups)
    }

    /// Find a backup by its full id.
    ///
    /// Candidates are narrowed by the id prefix in the folder name, then the
    /// full id in the metadata decides, so two ids sharing a prefix cannot be
    /// confused.
    pub fn locate(&self, id: &str) -> Result<StoredBackup> {
        if id.len() < ID_PREFIX_LEN {
            return Err(BackupError::NotFound(id.to_string()));
        }
        let suffix = format!("_{}", id_prefix(id));

        self.archive_dirs()?
            .into_iter()
            .filter(|dir| {
                dir.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&suffix))
            })
            .filter_map(|dir| self.load(dir))
            .find(|stored| stored.record.id == id)
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    /// Remove a backup's archive directory wholesale.
    pub fn delete(&self, id: &str) -> Result<BackupRecord> {
        let stored = self.locate(id)?;
        remove_path(&stored.dir)?;
        info!(backup_id = %id, dir = %stored.dir.display(), "Deleted backup");
        Ok(stored.record)
    }

    /// Fresh scratch directory for restore staging, on the same volume as the
    /// archives. Never listed as a backup.
    pub fn staging_dir(&self, label: &str) -> Result<PathBuf> {
        let dir = self.root.join(STAGING_DIR).join(label);
        remove_path(&dir)?;
        fs::create_dir_all(&dir).map_err(|e| BackupError::at(&dir, e))?;
        Ok(dir)
    }

    fn archive_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(root = %self.root.display(), "Backup root does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(BackupError::at(&self.root, e)),
        };

        Ok(entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| e.path())
            .collect())
    }

    fn load(&self, dir: PathBuf) -> Option<StoredBackup> {
        if !dir.join(METADATA_FILE).is_file() {
            debug!(dir = %dir.display(), "Skipping directory without metadata");
            return None;
        }

        match Self::read_metadata(&dir) {
            Ok(record) => Some(StoredBackup { record, dir }),
            Err(e) => {
                warn!(dir = %dir.display(), "Skipping backup with invalid metadata: {}", e);
                None
            }
        }
    }
}

fn id_prefix(id: &str) -> &str {
    id.get(..ID_PREFIX_LEN).unwrap_or(id)
}
