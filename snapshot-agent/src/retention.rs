//! Count and size budgets for automatic backups.
//!
//! Only records tagged `auto` are considered; manual backups are never
//! evicted here.

use tracing::{debug, error, info};

use crate::engine::record::BackupRecord;
use crate::engine::BackupTarget;
use crate::utils::format_bytes;
use crate::{BackupError, Result};

/// Bytes in one GiB, the unit of `max_total_size_gb`.
pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionBudget {
    min_keep: usize,
    max_count: usize,
    max_total_size_bytes: u64,
}

impl RetentionBudget {
    pub fn new(min_keep: usize, max_count: usize, max_total_size_bytes: u64) -> Result<Self> {
        if max_count == 0 {
            return Err(BackupError::Config("max_count must be at least 1".to_string()));
        }
        if min_keep > max_count {
            return Err(BackupError::Config(format!(
                "min_keep ({}) cannot exceed max_count ({})",
                min_keep, max_count
            )));
        }
        Ok(Self {
            min_keep,
            max_count,
            max_total_size_bytes,
        })
    }

    pub fn min_keep(&self) -> usize {
        self.min_keep
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn max_total_size_bytes(&self) -> u64 {
        self.max_total_size_bytes
    }
}

/// Ids to keep and to evict, both newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep: Vec<String>,
    pub evict: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    budget: RetentionBudget,
}

impl RetentionPolicy {
    pub fn new(budget: RetentionBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &RetentionBudget {
        &self.budget
    }

    /// Decide which automatic backups survive.
    ///
    /// The newest `min_keep` are always kept and do not count against the
    /// size budget. Older records are then kept newest first while the size
    /// of these additional records stays within `max_total_size_bytes` and
    /// the total kept stays within `max_count`. The first record that does
    /// not fit ends the run: everything older is evicted.
    pub fn plan(&self, records: &[BackupRecord]) -> RetentionPlan {
        let mut automatic: Vec<&BackupRecord> = records.iter().filter(|r| r.is_automatic()).collect();
        automatic.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut plan = RetentionPlan::default();
        let mut extra_size = 0u64;
        let mut full = false;

        for (index, record) in automatic.into_iter().enumerate() {
            if index < self.budget.min_keep {
                plan.keep.push(record.id.clone());
                continue;
            }

            if !full
                && plan.keep.len() < self.budget.max_count
                && extra_size.saturating_add(record.size_bytes) <= self.budget.max_total_size_bytes
            {
                extra_size += record.size_bytes;
                plan.keep.push(record.id.clone());
            } else {
                full = true;
                plan.evict.push(record.id.clone());
            }
        }

        plan
    }

    /// Apply [`RetentionPolicy::plan`] to the target. A failed delete is
    /// logged and the remaining evictions still run. Returns the ids
    /// actually deleted.
    pub fn enforce<T: BackupTarget + ?Sized>(&self, target: &T) -> Result<Vec<String>> {
        let records = target.list_backups()?;
        let plan = self.plan(&records);
        debug!(keep = plan.keep.len(), evict = plan.evict.len(), "Retention plan");

        let mut deleted = Vec::with_capacity(plan.evict.len());
        for id in plan.evict {
            match target.delete_backup(&id) {
                Ok(record) => {
                    info!(
                        backup_id = %id,
                        size = %format_bytes(record.size_bytes),
                        "Evicted old automatic backup"
                    );
                    deleted.push(id);
                }
                Err(e) => error!(backup_id = %id, "Failed to evict backup: {}", e),
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::manifest::IntegrityManifest;
    use crate::engine::record::AUTO_TAG;
    use chrono::{Duration, TimeZone, Utc};

    fn record(index: i64, size_bytes: u64, automatic: bool) -> BackupRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        BackupRecord {
            id: format!("backup-{index}"),
            name: String::new(),
            created_at: base + Duration::minutes(30 * index),
            description: String::new(),
            tags: if automatic { vec![AUTO_TAG.to_string()] } else { Vec::new() },
            size_bytes,
            source_items: Vec::new(),
            processed_items: Vec::new(),
            compression_enabled: false,
            encryption_enabled: false,
            integrity_manifest: IntegrityManifest::default(),
        }
    }

    fn eight_auto_backups() -> Vec<BackupRecord> {
        (0..8).map(|i| record(i, 2 * GIB, true)).collect()
    }

    #[test]
    fn test_budget_rejects_min_keep_above_max_count() {
        assert!(RetentionBudget::new(6, 5, GIB).is_err());
        assert!(RetentionBudget::new(0, 0, GIB).is_err());
        assert!(RetentionBudget::new(5, 5, GIB).is_ok());
    }

    #[test]
    fn test_count_limit_keeps_five_newest() {
        let policy = RetentionPolicy::new(RetentionBudget::new(1, 5, 10 * GIB).unwrap());
        let plan = policy.plan(&eight_auto_backups());

        assert_eq!(plan.keep, vec!["backup-7", "backup-6", "backup-5", "backup-4", "backup-3"]);
        assert_eq!(plan.evict, vec!["backup-2", "backup-1", "backup-0"]);
    }

    #[test]
    fn test_size_limit_keeps_min_keep_plus_what_fits() {
        let policy = RetentionPolicy::new(RetentionBudget::new(1, 5, 3 * GIB).unwrap());
        let plan = policy.plan(&eight_auto_backups());

        assert_eq!(plan.keep, vec!["backup-7", "backup-6"]);
        assert_eq!(plan.evict.len(), 6);
    }

    #[test]
    fn test_min_keep_survives_zero_budget() {
        let policy = RetentionPolicy::new(RetentionBudget::new(2, 5, 0).unwrap());
        let plan = policy.plan(&eight_auto_backups());
        assert_eq!(plan.keep, vec!["backup-7", "backup-6"]);
    }

    #[test]
    fn test_manual_backups_are_never_evicted() {
        let mut records = eight_auto_backups();
        records.push(record(100, 50 * GIB, false));
        records.push(record(-5, 50 * GIB, false));

        let policy = RetentionPolicy::new(RetentionBudget::new(1, 2, GIB).unwrap());
        let plan = policy.plan(&records);

        assert!(!plan.keep.iter().chain(&plan.evict).any(|id| id == "backup-100" || id == "backup--5"));
        assert_eq!(plan.keep.len() + plan.evict.len(), 8);
    }
}
