//! Retention manager for cleaning up old data.
//!
//! Cleanup runs once a day at a configured local wall-clock time, or on demand.
//! Every run is appended to a bounded history persisted next to the data.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::{write_atomic, ResultStore, StorageStats, StoreError};

/// Runs kept in the cleanup history.
pub const MAX_CLEANUP_HISTORY: usize = 100;

const CLEANUP_TIME_FORMAT: &str = "%H:%M";
const RETRY_AFTER_BAD_SCHEDULE: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("invalid retention policy: {0}")]
    InvalidPolicy(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to persist cleanup history to {path}: {source}")]
    History {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode cleanup history: {0}")]
    HistoryFormat(#[from] serde_json::Error),
}

/// How long data is kept and when cleanup runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub raw_data_days: u32,
    pub aggregated_data_days: u32,
    pub config_backup_days: u32,
    pub auto_cleanup_enabled: bool,
    /// Local time of day, `HH:MM`.
    pub cleanup_time: String,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            raw_data_days: 90,
            aggregated_data_days: 365,
            config_backup_days: 30,
            auto_cleanup_enabled: true,
            cleanup_time: "02:00".to_string(),
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), RetentionError> {
        check_range("raw data retention", self.raw_data_days, 7, 365)?;
        check_range("aggregated data retention", self.aggregated_data_days, 7, 730)?;
        check_range("config backup retention", self.config_backup_days, 1, 365)?;
        if self.aggregated_data_days < self.raw_data_days {
            return Err(RetentionError::InvalidPolicy(format!(
                "aggregated data retention ({} days) must be at least raw data retention ({} days)",
                self.aggregated_data_days, self.raw_data_days
            )));
        }
        self.cleanup_time_of_day()?;
        Ok(())
    }

    pub fn cleanup_time_of_day(&self) -> Result<NaiveTime, RetentionError> {
        NaiveTime::parse_from_str(&self.cleanup_time, CLEANUP_TIME_FORMAT).map_err(|_| {
            RetentionError::InvalidPolicy(format!(
                "invalid cleanup time format {:?}, expected HH:MM",
                self.cleanup_time
            ))
        })
    }

    /// The next cleanup instant: today at the cleanup time if still ahead, else tomorrow.
    pub fn next_cleanup_after(&self, now: DateTime<Local>) -> Result<DateTime<Local>, RetentionError> {
        let at = self.cleanup_time_of_day()?;
        let today = local_instant(now.date_naive(), at);
        if today > now {
            return Ok(today);
        }
        let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
        Ok(local_instant(tomorrow, at))
    }
}

fn check_range(what: &str, value: u32, min: u32, max: u32) -> Result<(), RetentionError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(RetentionError::InvalidPolicy(format!(
            "{} must be between {} and {} days, got {}",
            what, min, max, value
        )))
    }
}

/// Resolve a local wall-clock time, stepping past a DST gap if needed.
fn local_instant(date: NaiveDate, at: NaiveTime) -> DateTime<Local> {
    let naive = date.and_time(at);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| Local.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
        .unwrap_or_else(|| Local.from_utc_datetime(&naive))
}

/// What one cleanup run did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub files_deleted: usize,
    pub space_freed: u64,
    pub error_count: usize,
    pub errors: Vec<String>,
}

/// One entry of the persisted cleanup history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOperation {
    pub timestamp: DateTime<Utc>,
    pub files_deleted: usize,
    pub space_freed: u64,
    /// Milliseconds.
    pub duration: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl From<&CleanupReport> for CleanupOperation {
    fn from(report: &CleanupReport) -> Self {
        let error_message = match report.errors.first() {
            Some(first) => format!("{} errors occurred (first: {})", report.error_count, first),
            None => String::new(),
        };
        Self {
            timestamp: report.start_time,
            files_deleted: report.files_deleted,
            space_freed: report.space_freed,
            duration: (report.end_time - report.start_time).num_milliseconds(),
            success: report.error_count == 0,
            error_message,
        }
    }
}

struct RetentionState {
    policy: RetentionPolicy,
    history: Vec<CleanupOperation>,
}

/// State shared between the manager and its background loop.
struct Shared {
    store: Arc<ResultStore>,
    history_path: PathBuf,
    state: Mutex<RetentionState>,
}

impl Shared {
    fn policy(&self) -> RetentionPolicy {
        match self.state.lock() {
            Ok(state) => state.policy.clone(),
            Err(poisoned) => poisoned.into_inner().policy.clone(),
        }
    }

    fn run_cleanup(&self) -> CleanupReport {
        // Copy the policy out so no lock is held while the store works.
        let policy = self.policy();
        let start_time = Utc::now();
        info!(
            "Cleanup started (raw data {} days, config backups {} days)",
            policy.raw_data_days, policy.config_backup_days
        );

        let mut report = CleanupReport {
            start_time,
            end_time: start_time,
            files_deleted: 0,
            space_freed: 0,
            error_count: 0,
            errors: Vec::new(),
        };

        match self.store.cleanup_old_files(policy.raw_data_days) {
            Ok(outcome) => {
                report.files_deleted += outcome.files_deleted;
                report.space_freed += outcome.bytes_freed;
                report.errors.extend(outcome.errors);
            }
            Err(e) => report.errors.push(format!("raw data cleanup failed: {}", e)),
        }
        // Aggregations are computed on demand, so aggregated_data_days has nothing on disk to prune.
        match self.store.prune_config_backups(policy.config_backup_days) {
            Ok(outcome) => {
                report.files_deleted += outcome.files_deleted;
                report.space_freed += outcome.bytes_freed;
                report.errors.extend(outcome.errors);
            }
            Err(e) => report.errors.push(format!("config backup cleanup failed: {}", e)),
        }

        report.error_count = report.errors.len();
        report.end_time = Utc::now();
        if report.error_count > 0 {
            warn!(
                "Cleanup finished with {} error(s): {} file(s), {} bytes freed",
                report.error_count, report.files_deleted, report.space_freed
            );
        } else {
            info!(
                "Cleanup finished: {} file(s), {} bytes freed",
                report.files_deleted, report.space_freed
            );
        }
        report
    }

    fn record(&self, report: &CleanupReport) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.history.push(CleanupOperation::from(report));
        let excess = state.history.len().saturating_sub(MAX_CLEANUP_HISTORY);
        state.history.drain(..excess);

        if let Err(e) = save_history(&self.history_path, &state.history) {
            error!("Failed to save cleanup history: {}", e);
        }
    }

    fn cleanup_and_record(&self) -> CleanupReport {
        let report = self.run_cleanup();
        self.record(&report);
        report
    }
}

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    shared: Arc<Shared>,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl RetentionManager {
    /// Create a manager. A missing or unreadable history starts empty.
    pub fn new(
        store: Arc<ResultStore>,
        history_path: impl Into<PathBuf>,
        policy: RetentionPolicy,
    ) -> Result<Self, RetentionError> {
        policy.validate()?;
        let history_path = history_path.into();
        let history = load_history(&history_path);
        debug!("Loaded {} cleanup history entries", history.len());

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                history_path,
                state: Mutex::new(RetentionState { policy, history }),
            }),
            stop: Mutex::new(None),
        })
    }

    /// Start the daily cleanup loop. Does nothing if disabled or already running.
    pub fn start(&self) {
        let policy = self.shared.policy();
        if !policy.auto_cleanup_enabled {
            info!("Automatic cleanup disabled");
            return;
        }

        let mut stop = self.lock_stop();
        if stop.is_some() {
            return;
        }
        let (tx, rx) = broadcast::channel(1);
        *stop = Some(tx);
        drop(stop);

        info!("Cleanup scheduler started (daily at {})", policy.cleanup_time);
        tokio::spawn(run_cleanup_loop(self.shared.clone(), rx));
    }

    /// Stop the cleanup loop.
    pub fn stop(&self) {
        if let Some(tx) = self.lock_stop().take() {
            let _ = tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_stop().is_some()
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.shared.policy()
    }

    /// Replace the policy. The loop restarts when the enable flag or the time changes.
    pub fn update_policy(&self, policy: RetentionPolicy) -> Result<(), RetentionError> {
        policy.validate()?;

        let reschedule = {
            let mut state = match self.shared.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let changed = state.policy.auto_cleanup_enabled != policy.auto_cleanup_enabled
                || state.policy.cleanup_time != policy.cleanup_time;
            state.policy = policy;
            changed
        };

        info!("Retention policy updated");
        if reschedule {
            self.stop();
            self.start();
        }
        Ok(())
    }

    /// Run a cleanup now, on the calling thread.
    pub fn trigger_manual_cleanup(&self) -> CleanupReport {
        info!("Manual cleanup triggered");
        self.shared.cleanup_and_record()
    }

    pub fn storage_stats(&self) -> Result<StorageStats, RetentionError> {
        Ok(self.shared.store.storage_stats()?)
    }

    pub fn cleanup_history(&self) -> Vec<CleanupOperation> {
        match self.shared.state.lock() {
            Ok(state) => state.history.clone(),
            Err(poisoned) => poisoned.into_inner().history.clone(),
        }
    }

    /// Stop the loop and flush the history.
    pub fn close(&self) -> Result<(), RetentionError> {
        self.stop();
        let history = self.cleanup_history();
        save_history(&self.shared.history_path, &history)
    }

    fn lock_stop(&self) -> std::sync::MutexGuard<'_, Option<broadcast::Sender<()>>> {
        match self.stop.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_cleanup_loop(shared: Arc<Shared>, mut stop: broadcast::Receiver<()>) {
    loop {
        let now = Local::now();
        let wait = match shared.policy().next_cleanup_after(now) {
            Ok(next) => {
                debug!("Next cleanup at {}", next);
                (next - now).to_std().unwrap_or_default()
            }
            Err(e) => {
                error!("Cannot schedule cleanup: {}", e);
                RETRY_AFTER_BAD_SCHEDULE
            }
        };

        tokio::select! {
            _ = stop.recv() => {
                info!("Cleanup scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {
                let worker = shared.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || worker.cleanup_and_record()).await {
                    error!("Scheduled cleanup panicked: {}", e);
                }
            }
        }
    }
}

fn load_history(path: &Path) -> Vec<CleanupOperation> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Cannot read cleanup history {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(history) => history,
        Err(e) => {
            warn!("Ignoring unreadable cleanup history {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn save_history(path: &Path, history: &[CleanupOperation]) -> Result<(), RetentionError> {
    let bytes = serde_json::to_vec_pretty(history)?;
    write_atomic(path, &bytes).map_err(|source| RetentionError::History {
        path: path.to_path_buf(),
        source,
    })
}
