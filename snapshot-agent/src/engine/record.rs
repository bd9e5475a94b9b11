//! Backup records as persisted in `backup_metadata.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::manifest::IntegrityManifest;

/// Tag marking backups created by the automatic loop; only these are subject
/// to retention.
pub const AUTO_TAG: &str = "auto";
pub const TRAINING_TAG: &str = "training";
pub const PRE_TRAINING_TAG: &str = "pre-training";

pub const DEFAULT_DESCRIPTION: &str = "Manual backup";

/// One immutable snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Creation time, ISO-8601
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Bytes copied from the sources, before compression/encryption
    #[serde(default)]
    pub size_bytes: u64,

    /// Source paths relative to the data root, in capture order
    #[serde(rename = "items", default)]
    pub source_items: Vec<String>,

    /// Paths inside the archive after transforms, parallel to `source_items`
    #[serde(default)]
    pub processed_items: Vec<String>,

    #[serde(default)]
    pub compression_enabled: bool,

    #[serde(default)]
    pub encryption_enabled: bool,

    pub integrity_manifest: IntegrityManifest,
}

impl BackupRecord {
    pub fn is_automatic(&self) -> bool {
        self.tags.iter().any(|t| t == AUTO_TAG)
    }
}

/// Parameters of a `create` call.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Defaults to "Manual backup"
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// Defaults to the archive folder name
    pub name: Option<String>,
}

impl CreateRequest {
    pub fn manual(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    /// Request for an automatic backup, optionally labelled with the job it
    /// protects.
    pub fn automatic(description: String, kind_tag: &str, label: Option<&str>) -> Self {
        let mut tags = vec![AUTO_TAG.to_string(), kind_tag.to_string()];
        if let Some(label) = label {
            tags.push(label.to_string());
        }
        Self {
            description: Some(description),
            tags,
            name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_field_names() {
        let json = r#"{
            "id": "3f2b6c1e-0000-4000-8000-000000000000",
            "name": "20250521_170000_3f2b6c1e",
            "timestamp": "2025-05-21T17:00:00Z",
            "description": "Manual backup",
            "tags": ["auto", "training"],
            "size_bytes": 60,
            "items": ["resources", "data/sqlite"],
            "processed_items": ["resources", "sqlite"],
            "compression_enabled": true,
            "encryption_enabled": false,
            "integrity_manifest": {"files": [], "total_files": 0, "total_size": 0}
        }"#;

        let record: BackupRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.source_items, vec!["resources", "data/sqlite"]);
        assert!(record.is_automatic());
        assert!(record.compression_enabled);

        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("timestamp").is_some());
        assert!(value.get("items").is_some());
        assert!(value.get("created_at").is_none());
    }

    #[test]
    fn test_missing_required_fields_rejected() {
        let json = r#"{"name": "x", "integrity_manifest": {"files": [], "total_files": 0, "total_size": 0}}"#;
        assert!(serde_json::from_str::<BackupRecord>(json).is_err());
    }

    #[test]
    fn test_automatic_request_tags() {
        let req = CreateRequest::automatic("desc".into(), TRAINING_TAG, Some("qwen-0.5b"));
        assert_eq!(req.tags, vec!["auto", "training", "qwen-0.5b"]);
        assert!(CreateRequest::manual("x").tags.is_empty());
    }
}
