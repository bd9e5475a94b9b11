//! Automatic backups: one before a long-running job starts, then
//! periodically while it runs.
//!
//! The periodic loop is a single tokio task. Each attempt runs the blocking
//! engine call on the blocking pool. Failed attempts are retried with
//! [`Backoff`]; a cycle whose attempts all fail counts as a consecutive
//! failure, and too many in a row halt the loop for good.

pub mod backoff;

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::record::{BackupRecord, CreateRequest, PRE_TRAINING_TAG, TRAINING_TAG};
use crate::engine::BackupTarget;
use crate::retention::RetentionPolicy;
use crate::{BackupError, Result};
pub use backoff::Backoff;

/// How long `stop_periodic` waits for the loop to exit.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval: Duration,
    /// Attempts per cycle, including the first
    pub max_retries: u32,
    pub backoff: Backoff,
    pub max_consecutive_failures: u32,
}

/// Snapshot of the loop's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerState {
    pub enabled: bool,
    pub interval: Duration,
    pub consecutive_failures: u32,
    pub last_backup_time: Option<DateTime<Utc>>,
    /// Set once per run, by `stop_periodic` or by the failure breaker
    pub stop_requested: bool,
    /// Set when the breaker tripped
    pub halted: bool,
    pub running: bool,
}

struct LoopHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct AutoBackupScheduler<T: BackupTarget> {
    target: Arc<T>,
    retention: RetentionPolicy,
    settings: SchedulerSettings,
    state: Arc<Mutex<SchedulerState>>,
    handle: Mutex<Option<LoopHandle>>,
    shutdown: CancellationToken,
}

impl<T: BackupTarget> AutoBackupScheduler<T> {
    pub fn new(target: Arc<T>, retention: RetentionPolicy, settings: SchedulerSettings) -> Self {
        let state = SchedulerState {
            enabled: settings.enabled,
            interval: settings.interval,
            consecutive_failures: 0,
            last_backup_time: None,
            stop_requested: false,
            halted: false,
            running: false,
        };
        Self {
            target,
            retention,
            settings,
            state: Arc::new(Mutex::new(state)),
            handle: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie the scheduler to a process-wide shutdown token. Cancelling it stops
    /// the periodic loop and any backup it is creating at the next work unit.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn state(&self) -> SchedulerState {
        lock(&self.state).clone()
    }

    /// Take one backup before a long-running job starts. Blocks until the
    /// backup is committed. Returns `None` when automatic backups are
    /// disabled.
    pub fn create_pre_training_backup(&self, label: Option<&str>) -> Result<Option<BackupRecord>> {
        if !self.settings.enabled {
            info!("Auto backup is disabled, skipping pre-training backup");
            return Ok(None);
        }

        let description = describe("Pre-training automatic backup", label);
        info!("Creating pre-training backup: {}", description);
        let request = CreateRequest::automatic(description, PRE_TRAINING_TAG, label);
        let record = self.target.create_backup(request, &self.shutdown)?;

        lock(&self.state).last_backup_time = Some(record.created_at);
        enforce_retention(self.target.as_ref(), &self.retention);
        Ok(Some(record))
    }

    /// Start the periodic loop, stopping any loop that is already running.
    /// Returns once the new loop is spawned.
    pub async fn start_periodic(&self, label: Option<String>) {
        if !self.settings.enabled {
            info!("Auto backup is disabled, not starting periodic backups");
            return;
        }

        self.stop_periodic().await;

        {
            let mut state = lock(&self.state);
            state.stop_requested = false;
            state.halted = false;
            state.consecutive_failures = 0;
            state.running = true;
        }

        let cancel = self.shutdown.child_token();
        let worker = Worker {
            target: self.target.clone(),
            retention: self.retention.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            cancel: cancel.clone(),
            label,
        };
        let join = tokio::spawn(worker.run());
        *lock(&self.handle) = Some(LoopHandle { cancel, join });

        info!(
            interval_secs = self.settings.interval.as_secs(),
            "Started periodic backup loop"
        );
    }

    /// Signal the loop to stop and wait up to [`STOP_TIMEOUT`] for it to
    /// exit. Returns false if the loop was still busy when the wait ran out;
    /// it exits at its next cancellation check.
    pub async fn stop_periodic(&self) -> bool {
        let Some(handle) = lock(&self.handle).take() else {
            return true;
        };

        lock(&self.state).stop_requested = true;
        handle.cancel.cancel();

        match tokio::time::timeout(STOP_TIMEOUT, handle.join).await {
            Ok(Ok(())) => {
                info!("Stopped periodic backup loop");
                true
            }
            Ok(Err(e)) => {
                error!("Periodic backup loop panicked: {}", e);
                lock(&self.state).running = false;
                true
            }
            Err(_) => {
                warn!(
                    timeout_secs = STOP_TIMEOUT.as_secs(),
                    "Periodic backup loop did not stop in time"
                );
                false
            }
        }
    }
}

struct Worker<T: BackupTarget> {
    target: Arc<T>,
    retention: RetentionPolicy,
    settings: SchedulerSettings,
    state: Arc<Mutex<SchedulerState>>,
    cancel: CancellationToken,
    label: Option<String>,
}

enum CycleOutcome {
    Committed(BackupRecord),
    Failed(BackupError),
    Cancelled,
}

impl<T: BackupTarget> Worker<T> {
    async fn run(self) {
        loop {
            // The interval runs from the end of the previous cycle
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }

            match self.cycle().await {
                CycleOutcome::Committed(record) => {
                    {
                        let mut state = lock(&self.state);
                        state.consecutive_failures = 0;
                        state.last_backup_time = Some(record.created_at);
                    }
                    let target = self.target.clone();
                    let retention = self.retention.clone();
                    let evicted = tokio::task::spawn_blocking(move || {
                        enforce_retention(target.as_ref(), &retention)
                    })
                    .await;
                    if let Err(e) = evicted {
                        error!("Retention task failed: {}", e);
                    }
                }
                CycleOutcome::Failed(e) => {
                    let failures = {
                        let mut state = lock(&self.state);
                        state.consecutive_failures += 1;
                        state.consecutive_failures
                    };
                    error!(
                        consecutive_failures = failures,
                        "All {} backup attempts failed: {}", self.settings.max_retries, e
                    );

                    if failures >= self.settings.max_consecutive_failures {
                        error!(
                            severity = "critical",
                            consecutive_failures = failures,
                            "Automatic backups halted after repeated failures; data is no longer being protected"
                        );
                        let mut state = lock(&self.state);
                        state.stop_requested = true;
                        state.halted = true;
                        break;
                    }
                }
                CycleOutcome::Cancelled => break,
            }
        }

        {
            let mut state = lock(&self.state);
            state.running = false;
            if self.cancel.is_cancelled() {
                state.stop_requested = true;
            }
        }
        debug!("Periodic backup loop exited");
    }

    async fn cycle(&self) -> CycleOutcome {
        let description = describe("Training in-progress automatic backup", self.label.as_deref());
        info!("Creating periodic backup: {}", description);
        let request = CreateRequest::automatic(description, TRAINING_TAG, self.label.as_deref());

        let attempts = self.settings.max_retries.max(1);
        let mut last_error = BackupError::Cancelled;

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return CycleOutcome::Cancelled;
            }

            let target = self.target.clone();
            let request = request.clone();
            let cancel = self.cancel.clone();
            let result = tokio::task::spawn_blocking(move || target.create_backup(request, &cancel))
                .await
                .unwrap_or_else(|e| Err(BackupError::Integrity(format!("backup task panicked: {e}"))));

            match result {
                Ok(record) => {
                    info!(backup_id = %record.id, attempt, "Periodic backup created");
                    return CycleOutcome::Committed(record);
                }
                Err(BackupError::Cancelled) => return CycleOutcome::Cancelled,
                Err(e) => {
                    if attempt < attempts {
                        let delay = self.settings.backoff.delay(attempt);
                        warn!(
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "Backup attempt failed: {}", e
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return CycleOutcome::Cancelled,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    last_error = e;
                }
            }
        }

        CycleOutcome::Failed(last_error)
    }
}

fn enforce_retention<T: BackupTarget + ?Sized>(target: &T, retention: &RetentionPolicy) {
    if let Err(e) = retention.enforce(target) {
        error!("Error cleaning up old automatic backups: {}", e);
    }
}

fn describe(prefix: &str, label: Option<&str>) -> String {
    match label {
        Some(label) => format!("{} for {}", prefix, label),
        None => prefix.to_string(),
    }
}

/// State is plain bookkeeping; a panic while holding the lock leaves it
/// usable.
fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::manifest::IntegrityManifest;
    use crate::retention::RetentionBudget;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Fails a configurable number of times, then succeeds.
    #[derive(Default)]
    struct FakeTarget {
        fail_first: usize,
        attempts: AtomicUsize,
        records: Mutex<Vec<BackupRecord>>,
    }

    impl FakeTarget {
        fn failing(fail_first: usize) -> Self {
            Self {
                fail_first,
                ..Default::default()
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl BackupTarget for FakeTarget {
        fn create_backup(&self, request: CreateRequest, _cancel: &CancellationToken) -> Result<BackupRecord> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(BackupError::Integrity("disk on fire".to_string()));
            }
            let record = BackupRecord {
                id: format!("backup-{attempt}"),
                name: String::new(),
                created_at: Utc::now() + chrono::Duration::seconds(attempt as i64),
                description: request.description.unwrap_or_default(),
                tags: request.tags,
                size_bytes: 1,
                source_items: Vec::new(),
                processed_items: Vec::new(),
                compression_enabled: false,
                encryption_enabled: false,
                integrity_manifest: IntegrityManifest::default(),
            };
            lock(&self.records).push(record.clone());
            Ok(record)
        }

        fn list_backups(&self) -> Result<Vec<BackupRecord>> {
            Ok(lock(&self.records).clone())
        }

        fn delete_backup(&self, id: &str) -> Result<BackupRecord> {
            let mut records = lock(&self.records);
            let index = records
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
            Ok(records.remove(index))
        }
    }

    fn settings(max_retries: u32, max_consecutive_failures: u32) -> SchedulerSettings {
        SchedulerSettings {
            enabled: true,
            interval: Duration::from_millis(10),
            max_retries,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            max_consecutive_failures,
        }
    }

    fn retention(max_count: usize) -> RetentionPolicy {
        RetentionPolicy::new(RetentionBudget::new(1, max_count, u64::MAX).unwrap())
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_halts_after_consecutive_failures() {
        let target = Arc::new(FakeTarget::failing(usize::MAX));
        let scheduler = AutoBackupScheduler::new(target.clone(), retention(5), settings(1, 3));

        scheduler.start_periodic(None).await;
        wait_until(|| !scheduler.state().running).await;

        let state = scheduler.state();
        assert!(state.stop_requested);
        assert!(state.halted);
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(target.attempts(), 3);

        // No further attempts once halted
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.attempts(), 3);
    }

    #[tokio::test]
    async fn test_retries_within_a_cycle() {
        let target = Arc::new(FakeTarget::failing(2));
        let scheduler = AutoBackupScheduler::new(target.clone(), retention(5), settings(3, 3));

        scheduler.start_periodic(Some("model-a".to_string())).await;
        wait_until(|| scheduler.state().last_backup_time.is_some()).await;
        assert!(scheduler.stop_periodic().await);

        let state = scheduler.state();
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.halted);
        assert!(!state.running);

        let records = target.list_backups().unwrap();
        assert!(!records.is_empty());
        assert_eq!(records[0].description, "Training in-progress automatic backup for model-a");
        assert_eq!(records[0].tags, vec!["auto", "training", "model-a"]);
    }

    #[tokio::test]
    async fn test_retention_runs_after_success() {
        let target = Arc::new(FakeTarget::default());
        let scheduler = AutoBackupScheduler::new(target.clone(), retention(2), settings(1, 3));

        scheduler.start_periodic(None).await;
        wait_until(|| target.attempts() >= 4).await;
        scheduler.stop_periodic().await;

        assert!(target.list_backups().unwrap().len() <= 2);
    }

    #[tokio::test]
    async fn test_restart_replaces_running_loop() {
        let target = Arc::new(FakeTarget::default());
        let scheduler = AutoBackupScheduler::new(target.clone(), retention(5), settings(1, 3));

        scheduler.start_periodic(None).await;
        scheduler.start_periodic(None).await;
        assert!(scheduler.state().running);
        assert!(scheduler.stop_periodic().await);
        assert!(!scheduler.state().running);
        assert!(scheduler.state().stop_requested);
    }

    #[tokio::test]
    async fn test_stop_is_prompt_during_long_interval() {
        let target = Arc::new(FakeTarget::default());
        let mut slow = settings(1, 3);
        slow.interval = Duration::from_secs(3600);
        let scheduler = AutoBackupScheduler::new(target.clone(), retention(5), slow);

        scheduler.start_periodic(None).await;
        let started = Instant::now();
        assert!(scheduler.stop_periodic().await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(target.attempts(), 0);
        assert!(!scheduler.state().running);
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_loop() {
        let target = Arc::new(FakeTarget::default());
        let shutdown = CancellationToken::new();
        let mut slow = settings(1, 3);
        slow.interval = Duration::from_secs(3600);
        let scheduler =
            AutoBackupScheduler::new(target.clone(), retention(5), slow).with_shutdown(shutdown.clone());

        scheduler.start_periodic(None).await;
        shutdown.cancel();
        wait_until(|| !scheduler.state().running).await;
        assert_eq!(target.attempts(), 0);
        assert!(scheduler.state().stop_requested);
    }

    #[test]
    fn test_pre_training_backup() {
        let target = Arc::new(FakeTarget::default());
        let scheduler = AutoBackupScheduler::new(target.clone(), retention(5), settings(1, 3));

        let record = scheduler.create_pre_training_backup(Some("model-a")).unwrap().unwrap();
        assert_eq!(record.description, "Pre-training automatic backup for model-a");
        assert_eq!(record.tags, vec!["auto", "pre-training", "model-a"]);
        assert_eq!(scheduler.state().last_backup_time, Some(record.created_at));

        let mut disabled = settings(1, 3);
        disabled.enabled = false;
        let scheduler = AutoBackupScheduler::new(target.clone(), retention(5), disabled);
        assert!(scheduler.create_pre_training_backup(None).unwrap().is_none());
        assert_eq!(target.attempts(), 1);
    }
}
