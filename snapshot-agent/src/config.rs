//! Configuration management for the snapshot agent.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`SNAPSHOT_` prefix, `__` between nested keys, e.g.
//! `SNAPSHOT_AUTO_BACKUP__INTERVAL_MINUTES=15`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::encrypt::EncryptionKey;
use crate::codec::Pipeline;
use crate::engine::EngineSettings;
use crate::retention::{RetentionBudget, GIB};
use crate::scheduler::{Backoff, SchedulerSettings};
use crate::{BackupError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root the backup sources are relative to
    pub data_root: PathBuf,
    pub backup: BackupConfig,
    pub auto_backup: AutoBackupConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Where archive directories are created
    pub root_dir: PathBuf,

    /// Files or directories to protect, relative to `data_root`
    pub sources: Vec<PathBuf>,

    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,

    /// DEFLATE level (1-9)
    pub level: u32,
}

/// Encrypted backups can only be restored with the key they were created
/// with. Losing the key loses every encrypted backup.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,

    /// Base64 of a 32-byte key (`snapshot-agent keygen`)
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBackupConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    /// Newest automatic backups that are never evicted
    pub min_keep: usize,
    pub max_count: usize,
    pub max_total_size_gb: f64,
    /// Attempts per cycle, including the first
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_root: PathBuf::from("/var/lib/snapshot-agent/data"),
            backup: BackupConfig::default(),
            auto_backup: AutoBackupConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            root_dir: PathBuf::from("/var/lib/snapshot-agent/backups"),
            // document store, relational database, vector index
            sources: vec![
                PathBuf::from("resources"),
                PathBuf::from("data/sqlite"),
                PathBuf::from("data/chroma_db"),
            ],
            compression: CompressionConfig::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: true,
            level: 6,
        }
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for AutoBackupConfig {
    fn default() -> Self {
        AutoBackupConfig {
            enabled: true,
            interval_minutes: 30,
            min_keep: 1,
            max_count: 5,
            max_total_size_gb: 10.0,
            max_retries: 3,
            retry_base_delay_secs: 60,
            retry_max_delay_secs: 900,
            max_consecutive_failures: 3,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `SNAPSHOT_*` environment
    /// overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("SNAPSHOT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("backup.sources"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, without environment overrides
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let compression = &self.backup.compression;
        if compression.enabled && !(1..=9).contains(&compression.level) {
            return Err(BackupError::Config(format!(
                "compression level must be between 1 and 9, got {}",
                compression.level
            )));
        }

        self.encryption_key()?;
        self.retention_budget()?;

        let auto = &self.auto_backup;
        if auto.interval_minutes == 0 {
            return Err(BackupError::Config("interval_minutes must be at least 1".to_string()));
        }
        if auto.max_retries == 0 {
            return Err(BackupError::Config("max_retries must be at least 1".to_string()));
        }
        if auto.max_consecutive_failures == 0 {
            return Err(BackupError::Config(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if !auto.max_total_size_gb.is_finite() || auto.max_total_size_gb < 0.0 {
            return Err(BackupError::Config(
                "max_total_size_gb must be a non-negative number".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for source in &self.backup.sources {
            if source.is_absolute() || source.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                return Err(BackupError::Config(format!(
                    "source {} must be relative to data_root",
                    source.display()
                )));
            }
            let Some(name) = source.file_name() else {
                return Err(BackupError::Config(format!("invalid source path {}", source.display())));
            };
            if !names.insert(name.to_os_string()) {
                return Err(BackupError::Config(format!(
                    "sources share the archive name {}",
                    name.to_string_lossy()
                )));
            }
        }

        Ok(())
    }

    /// The configured key, if encryption is enabled.
    pub fn encryption_key(&self) -> Result<Option<EncryptionKey>> {
        let encryption = &self.backup.encryption;
        match (encryption.enabled, encryption.key.as_deref()) {
            (false, _) => Ok(None),
            (true, Some(key)) if !key.trim().is_empty() => EncryptionKey::from_base64(key.trim()).map(Some),
            (true, _) => Err(BackupError::Config(
                "encryption is enabled but no encryption key is configured".to_string(),
            )),
        }
    }

    pub fn settings_for_engine(&self) -> Result<EngineSettings> {
        let compression = &self.backup.compression;
        Ok(EngineSettings {
            data_root: self.data_root.clone(),
            sources: self.backup.sources.clone(),
            pipeline: Pipeline {
                compression_level: compression.enabled.then_some(compression.level),
                encryption_key: self.encryption_key()?,
            },
        })
    }

    pub fn retention_budget(&self) -> Result<RetentionBudget> {
        let auto = &self.auto_backup;
        let max_bytes = (auto.max_total_size_gb.max(0.0) * GIB as f64) as u64;
        RetentionBudget::new(auto.min_keep, auto.max_count, max_bytes)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let auto = &self.auto_backup;
        SchedulerSettings {
            enabled: auto.enabled,
            interval: Duration::from_secs(auto.interval_minutes * 60),
            max_retries: auto.max_retries,
            backoff: Backoff::new(
                Duration::from_secs(auto.retry_base_delay_secs),
                Duration::from_secs(auto.retry_max_delay_secs),
            ),
            max_consecutive_failures: auto.max_consecutive_failures,
        }
    }
}
