//! Backup engine - snapshot creation and restore.
//!
//! Creation runs `Pending → Copying → Processing → Manifesting → Committed`.
//! Any failure after the archive directory is allocated moves to `Failed`
//! and deletes the directory, so no partial archive survives.
//!
//! Restore runs `Locating → Verifying → Replacing → Done`. Integrity and
//! decryption problems are detected before live data is touched. Replacing
//! is destructive and not atomic across items: a crash part-way through can
//! leave some sources restored and others not.

pub mod manifest;
pub mod record;
pub mod store;

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::Pipeline;
use crate::fs::copy::{copy_path, remove_path};
use crate::fs::walker::relative_key;
use crate::utils::format_bytes;
use crate::{BackupError, Config, Result};
use manifest::{is_safe_relative, IntegrityManifest, VerificationReport};
use record::{BackupRecord, CreateRequest, DEFAULT_DESCRIPTION};
use store::{BackupStore, METADATA_FILE, METADATA_TMP_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePhase {
    Pending,
    Copying,
    Processing,
    Manifesting,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Locating,
    Verifying,
    Replacing,
    Done,
    Failed,
}

impl fmt::Display for CreatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What to back up and how.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Root the source paths are relative to
    pub data_root: PathBuf,

    /// Directories or files to capture, relative to `data_root`
    pub sources: Vec<PathBuf>,

    pub pipeline: Pipeline,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Verify the archive against its manifest before touching live data
    pub verify_integrity: bool,

    /// Restore under this root instead of the configured data root
    pub target_root: Option<PathBuf>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            verify_integrity: true,
            target_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub backup_id: String,
    pub restored_items: Vec<String>,
    /// Items whose archived copy was missing
    pub skipped_items: Vec<String>,
    /// Items whose live path was removed but could not be replaced
    pub failed_items: Vec<String>,
    pub timestamp: String,
    pub description: String,
    pub message: String,
}

impl RestoreResult {
    pub fn is_complete(&self) -> bool {
        self.skipped_items.is_empty() && self.failed_items.is_empty()
    }
}

/// The slice of the engine that the automatic loop and retention drive.
pub trait BackupTarget: Send + Sync + 'static {
    fn create_backup(&self, request: CreateRequest, cancel: &CancellationToken) -> Result<BackupRecord>;

    fn list_backups(&self) -> Result<Vec<BackupRecord>>;

    fn delete_backup(&self, id: &str) -> Result<BackupRecord>;
}

/// Creates, lists, verifies, restores and deletes backups.
#[derive(Debug, Clone)]
pub struct BackupEngine {
    store: BackupStore,
    settings: EngineSettings,
}

impl BackupEngine {
    pub fn new(store: BackupStore, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    /// Engine over the configured backup root and sources.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = BackupStore::open(&config.backup.root_dir)?;
        Ok(Self::new(store, config.settings_for_engine()?))
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Snapshot all configured sources into a new archive.
    pub fn create(&self, request: CreateRequest) -> Result<BackupRecord> {
        self.create_cancellable(request, &CancellationToken::new())
    }

    /// Like [`BackupEngine::create`], checking `cancel` between work units.
    /// A cancelled create is cleaned up and returns [`BackupError::Cancelled`].
    pub fn create_cancellable(
        &self,
        request: CreateRequest,
        cancel: &CancellationToken,
    ) -> Result<BackupRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let archive_dir = self.store.allocate(&created_at, &id)?;
        info!(backup_id = %id, dir = %archive_dir.display(), "Creating backup");

        let mut phase = CreatePhase::Pending;
        match self.populate(&id, created_at, request, &archive_dir, cancel, &mut phase) {
            Ok(record) => {
                info!(
                    backup_id = %id,
                    items = record.source_items.len(),
                    size = %format_bytes(record.size_bytes),
                    "Backup committed"
                );
                Ok(record)
            }
            Err(e) => {
                error!(backup_id = %id, failed_in = %phase, "Backup failed: {}", e);
                phase = CreatePhase::Failed;
                debug!(backup_id = %id, phase = %phase, "Cleaning up partial archive");
                if let Err(cleanup) = remove_path(&archive_dir) {
                    error!(dir = %archive_dir.display(), "Failed to remove partial archive: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        id: &str,
        created_at: chrono::DateTime<Utc>,
        request: CreateRequest,
        archive_dir: &Path,
        cancel: &CancellationToken,
        phase: &mut CreatePhase,
    ) -> Result<BackupRecord> {
        *phase = CreatePhase::Copying;
        debug!(backup_id = %id, phase = %phase, "Create phase");

        let mut source_items = Vec::new();
        let mut archived_names = Vec::new();
        let mut size_bytes = 0u64;

        for source in &self.settings.sources {
            check_cancel(cancel)?;

            let src = self.settings.data_root.join(source);
            if !src.exists() {
                warn!(source = %src.display(), "Source path does not exist, skipping");
                continue;
            }

            let name = archive_name(source)?;
            if name == METADATA_FILE || name == METADATA_TMP_FILE {
                return Err(BackupError::Config(format!(
                    "source {} collides with the reserved name {}",
                    source.display(),
                    name
                )));
            }

            let dest = archive_dir.join(&name);
            match copy_path(&src, &dest) {
                Ok(bytes) => {
                    info!(source = %src.display(), size = %format_bytes(bytes), "Copied source");
                    size_bytes += bytes;
                    source_items.push(relative_key(source));
                    archived_names.push(name);
                }
                Err(e) => {
                    error!(source = %src.display(), "Failed to copy source, skipping: {}", e);
                    remove_path(&dest)?;
                }
            }
        }

        *phase = CreatePhase::Processing;
        debug!(backup_id = %id, phase = %phase, "Create phase");

        let mut processed_items = Vec::with_capacity(archived_names.len());
        for name in &archived_names {
            check_cancel(cancel)?;
            let processed = self.settings.pipeline.process_item(&archive_dir.join(name))?;
            let relative = processed.strip_prefix(archive_dir).unwrap_or(&processed);
            processed_items.push(relative_key(relative));
        }

        *phase = CreatePhase::Manifesting;
        debug!(backup_id = %id, phase = %phase, "Create phase");
        check_cancel(cancel)?;
        let integrity_manifest = IntegrityManifest::build(archive_dir)?;

        let folder_name = archive_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let record = BackupRecord {
            id: id.to_string(),
            name: request.name.unwrap_or(folder_name),
            created_at,
            description: request
                .description
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            tags: request.tags,
            size_bytes,
            source_items,
            processed_items,
            compression_enabled: self.settings.pipeline.compression_level.is_some(),
            encryption_enabled: self.settings.pipeline.encryption_key.is_some(),
            integrity_manifest,
        };

        self.store.write_metadata(archive_dir, &record)?;
        *phase = CreatePhase::Committed;
        debug!(backup_id = %id, phase = %phase, "Create phase");

        Ok(record)
    }

    /// Committed backups, newest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.store.list()?.into_iter().map(|b| b.record).collect())
    }

    /// Check an archive against its embedded manifest.
    pub fn verify_backup_integrity(&self, id: &str) -> Result<VerificationReport> {
        let stored = self.store.locate(id)?;
        Ok(stored.record.integrity_manifest.verify(&stored.dir))
    }

    /// Replace live data with the contents of a backup.
    pub fn restore(&self, id: &str, options: RestoreOptions) -> Result<RestoreResult> {
        let mut phase = RestorePhase::Locating;
        let result = self.run_restore(id, &options, &mut phase);
        match &result {
            Ok(r) => info!(backup_id = %id, restored = r.restored_items.len(), "{}", r.message),
            Err(e) => error!(backup_id = %id, failed_in = %phase, "Restore failed: {}", e),
        }
        result
    }

    fn run_restore(
        &self,
        id: &str,
        options: &RestoreOptions,
        phase: &mut RestorePhase,
    ) -> Result<RestoreResult> {
        debug!(backup_id = %id, phase = %phase, "Restore phase");
        let stored = self.store.locate(id)?;
        let record = &stored.record;
        info!(backup_id = %id, dir = %stored.dir.display(), "Found backup to restore");

        if record.source_items.len() != record.processed_items.len() {
            return Err(BackupError::Integrity(format!(
                "metadata lists {} items but {} processed items",
                record.source_items.len(),
                record.processed_items.len()
            )));
        }

        if options.verify_integrity {
            *phase = RestorePhase::Verifying;
            debug!(backup_id = %id, phase = %phase, "Restore phase");
            let report = record.integrity_manifest.verify(&stored.dir);
            if !report.is_valid() {
                return Err(BackupError::VerificationFailed {
                    backup_id: id.to_string(),
                    mismatches: report.mismatches,
                });
            }
        }

        let pipeline = Pipeline::for_restore(
            record.compression_enabled,
            record.encryption_enabled,
            self.settings.pipeline.encryption_key.as_ref(),
        )?;
        let target_root = options
            .target_root
            .clone()
            .unwrap_or_else(|| self.settings.data_root.clone());

        *phase = RestorePhase::Replacing;
        debug!(backup_id = %id, phase = %phase, "Restore phase");

        let staging = self.store.staging_dir(id)?;
        let outcome = self.stage_and_replace(&stored.dir, record, &pipeline, &staging, &target_root);
        if let Err(e) = remove_path(&staging) {
            warn!(dir = %staging.display(), "Failed to remove restore staging area: {}", e);
        }
        let (restored_items, skipped_items, failed_items) = outcome?;

        *phase = RestorePhase::Done;
        debug!(backup_id = %id, phase = %phase, "Restore phase");

        let message = if failed_items.is_empty() && skipped_items.is_empty() {
            format!("Successfully restored backup {}", id)
        } else {
            format!(
                "Partially restored backup {}: {} restored, {} skipped, {} failed",
                id,
                restored_items.len(),
                skipped_items.len(),
                failed_items.len()
            )
        };

        Ok(RestoreResult {
            backup_id: id.to_string(),
            restored_items,
            skipped_items,
            failed_items,
            timestamp: record.created_at.to_rfc3339(),
            description: record.description.clone(),
            message,
        })
    }

    /// Undo the transforms of every item into `staging` first, so a bad key or
    /// corrupt stream aborts before any live path is removed, then swap the
    /// staged items into place one by one.
    fn stage_and_replace(
        &self,
        archive_dir: &Path,
        record: &BackupRecord,
        pipeline: &Pipeline,
        staging: &Path,
        target_root: &Path,
    ) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
        let mut staged = Vec::new();
        let mut skipped = Vec::new();

        for (index, (item, processed)) in record
            .source_items
            .iter()
            .zip(&record.processed_items)
            .enumerate()
        {
            if !is_safe_relative(item) || !is_safe_relative(processed) {
                return Err(BackupError::Integrity(format!(
                    "refusing to restore unsafe path {}",
                    item
                )));
            }

            let archived = archive_dir.join(processed);
            if !archived.exists() {
                warn!(item = %item, path = %archived.display(), "Item missing from backup, skipping");
                skipped.push(item.clone());
                continue;
            }

            let file_name = Path::new(processed)
                .file_name()
                .ok_or_else(|| BackupError::Integrity(format!("invalid processed item {}", processed)))?;
            let slot = staging.join(index.to_string()).join(file_name);
            copy_path(&archived, &slot)?;
            let ready = pipeline.reverse_item(&slot)?;
            staged.push((item.clone(), ready));
        }

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for (item, ready) in staged {
            let live = target_root.join(&item);
            match replace_live(&ready, &live) {
                Ok(()) => {
                    info!(item = %item, target = %live.display(), "Restored item");
                    restored.push(item);
                }
                Err(e) => {
                    error!(item = %item, target = %live.display(), "Failed to restore item: {}", e);
                    failed.push(item);
                }
            }
        }

        Ok((restored, skipped, failed))
    }

    /// Remove a backup. Fails with `NotFound` for unknown ids.
    pub fn delete(&self, id: &str) -> Result<BackupRecord> {
        self.store.delete(id)
    }
}

impl BackupTarget for BackupEngine {
    fn create_backup(&self, request: CreateRequest, cancel: &CancellationToken) -> Result<BackupRecord> {
        self.create_cancellable(request, cancel)
    }

    fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.list()
    }

    fn delete_backup(&self, id: &str) -> Result<BackupRecord> {
        self.delete(id)
    }
}

/// Remove the live path entirely, then copy the restored item in. If the
/// copy fails the live path is left absent, never half old and half new.
fn replace_live(ready: &Path, live: &Path) -> Result<()> {
    if let Some(parent) = live.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BackupError::at(parent, e))?;
    }

    remove_path(live)?;
    if let Err(e) = copy_path(ready, live) {
        let _ = remove_path(live);
        return Err(e);
    }
    Ok(())
}

/// Top-level name an item gets inside the archive.
fn archive_name(source: &Path) -> Result<String> {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BackupError::Config(format!("invalid source path {}", source.display())))
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled);
    }
    Ok(())
}
