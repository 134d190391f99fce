//! Day-partitioned JSON result store.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::*;
use super::write_atomic;
use crate::probe::TestResult;

const CONFIG_DIR: &str = "config";
const CONFIG_BACKUP_DIR: &str = "backups";
const CONFIG_FILE: &str = "configuration.json";
const CONFIG_BACKUP_PREFIX: &str = "configuration-";
const CONFIG_BACKUP_STAMP: &str = "%Y%m%dT%H%M%S";

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("data file {path} failed integrity check: {reason}")]
    Integrity { path: PathBuf, reason: String },
    #[error("no configuration snapshot at {0}")]
    ConfigNotFound(PathBuf),
    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn integrity(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::Integrity {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Thread-safe result store.
///
/// Clones share the same lock, so every clone serializes with the others.
#[derive(Clone, Debug)]
pub struct ResultStore {
    data_dir: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl ResultStore {
    /// Open a store rooted at `data_dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).map_err(|e| StoreError::io(&data_dir, e))?;
        info!("Result store opened at {}", data_dir.display());
        Ok(Self {
            data_dir,
            lock: Arc::new(RwLock::new(())),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir.join(partition_file_name(date))
    }

    pub(crate) fn read_guard(&self) -> Result<RwLockReadGuard<'_, ()>, StoreError> {
        self.lock.read().map_err(|_| StoreError::LockPoisoned)
    }

    pub(crate) fn write_guard(&self) -> Result<RwLockWriteGuard<'_, ()>, StoreError> {
        self.lock.write().map_err(|_| StoreError::LockPoisoned)
    }

    // --- Test results ---

    /// Append a result to the partition of its UTC day.
    pub fn store_test_result(&self, result: &TestResult) -> Result<(), StoreError> {
        let _guard = self.write_guard()?;

        let date = result.timestamp.date_naive();
        let path = self.partition_path(date);
        let mut file = load_daily_file(&path, date)?;
        file.push(result.clone());
        save_daily_file(&path, &file)?;

        debug!(
            "Stored {} result for {} ({} in {})",
            result.status,
            result.endpoint_id,
            file.metadata.result_count,
            path.display()
        );
        Ok(())
    }

    /// Results of one day. A day without a partition is empty, not an error.
    pub fn get_results(&self, date: NaiveDate) -> Result<Vec<TestResult>, StoreError> {
        let _guard = self.read_guard()?;
        Ok(load_daily_file(&self.partition_path(date), date)?.results)
    }

    /// Results with `start <= timestamp <= end`.
    ///
    /// A day that cannot be read is logged and skipped.
    pub fn get_results_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TestResult>, StoreError> {
        if end < start {
            return Ok(Vec::new());
        }
        let _guard = self.read_guard()?;

        let mut results = Vec::new();
        for day in self.partition_dates(start.date_naive(), end.date_naive())? {
            match load_daily_file(&self.partition_path(day), day) {
                Ok(file) => results.extend(
                    file.results
                        .into_iter()
                        .filter(|r| r.timestamp >= start && r.timestamp <= end),
                ),
                Err(e) => warn!("Skipping unreadable partition for {}: {}", day, e),
            }
        }
        Ok(results)
    }

    /// Dates of the partitions on disk within `first..=last`, oldest first.
    fn partition_dates(&self, first: NaiveDate, last: NaiveDate) -> Result<Vec<NaiveDate>, StoreError> {
        let entries = fs::read_dir(&self.data_dir).map_err(|e| StoreError::io(&self.data_dir, e))?;
        let mut dates: Vec<NaiveDate> = entries
            .filter_map(|e| e.ok())
            .filter_map(|entry| parse_partition_file_name(&entry.file_name().to_string_lossy()))
            .filter(|date| (first..=last).contains(date))
            .collect();
        dates.sort_unstable();
        Ok(dates)
    }

    // --- Configuration snapshots ---

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    fn config_backup_dir(&self) -> PathBuf {
        self.data_dir.join(CONFIG_DIR).join(CONFIG_BACKUP_DIR)
    }

    /// Save a configuration snapshot, backing up the previous one first.
    pub fn save_configuration<T: Serialize>(&self, config: &T) -> Result<(), StoreError> {
        let _guard = self.write_guard()?;

        let path = self.config_path();
        let bytes = serde_json::to_vec_pretty(config).map_err(|source| StoreError::Serialize {
            path: path.clone(),
            source,
        })?;

        let config_dir = self.data_dir.join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).map_err(|e| StoreError::io(&config_dir, e))?;

        if path.exists() {
            let backup_dir = self.config_backup_dir();
            fs::create_dir_all(&backup_dir).map_err(|e| StoreError::io(&backup_dir, e))?;
            let backup = unique_backup_path(&backup_dir, Utc::now());
            fs::copy(&path, &backup).map_err(|e| StoreError::io(&backup, e))?;
            debug!("Backed up configuration to {}", backup.display());
        }

        write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;
        info!("Saved configuration snapshot to {}", path.display());
        Ok(())
    }

    pub fn load_configuration<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let _guard = self.read_guard()?;

        let path = self.config_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::ConfigNotFound(path));
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::integrity(&path, e.to_string()))
    }

    /// Delete configuration backups older than `retention_days`.
    pub fn prune_config_backups(&self, retention_days: u32) -> Result<PurgeOutcome, StoreError> {
        let _guard = self.write_guard()?;

        let dir = self.config_backup_dir();
        let mut outcome = PurgeOutcome::default();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(outcome),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let cutoff = Utc::now().naive_utc() - chrono::Duration::days(i64::from(retention_days));
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(taken) = parse_backup_stamp(&name) else {
                continue;
            };
            if taken >= cutoff {
                continue;
            }
            remove_counted(&entry.path(), &mut outcome);
        }

        if outcome.files_deleted > 0 {
            info!(
                "Pruned {} configuration backup(s) older than {} days",
                outcome.files_deleted, retention_days
            );
        }
        Ok(outcome)
    }

    // --- Retention ---

    /// Delete partitions older than `retention_days`. Today and yesterday always survive.
    pub fn cleanup_old_files(&self, retention_days: u32) -> Result<PurgeOutcome, StoreError> {
        let cutoff = cleanup_cutoff(Utc::now().date_naive(), retention_days);
        let _guard = self.write_guard()?;

        let entries = fs::read_dir(&self.data_dir).map_err(|e| StoreError::io(&self.data_dir, e))?;
        let mut outcome = PurgeOutcome::default();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(date) = parse_partition_file_name(&name) else {
                continue;
            };
            if date < cutoff {
                remove_counted(&path, &mut outcome);
            }
        }

        info!(
            "Cleanup removed {} partition(s) before {} ({} bytes, {} error(s))",
            outcome.files_deleted,
            cutoff,
            outcome.bytes_freed,
            outcome.errors.len()
        );
        Ok(outcome)
    }

    /// Count partitions and their size. Other files in the directory are ignored.
    pub fn storage_stats(&self) -> Result<StorageStats, StoreError> {
        let _guard = self.read_guard()?;

        let entries = fs::read_dir(&self.data_dir).map_err(|e| StoreError::io(&self.data_dir, e))?;
        let mut stats = StorageStats {
            total_files: 0,
            total_size_bytes: 0,
            oldest_data_date: None,
            newest_data_date: None,
            days_of_data: 0,
            data_directory: self.data_dir.clone(),
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(date) = parse_partition_file_name(&name) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            stats.total_files += 1;
            stats.total_size_bytes += meta.len();
            stats.oldest_data_date = Some(stats.oldest_data_date.map_or(date, |d| d.min(date)));
            stats.newest_data_date = Some(stats.newest_data_date.map_or(date, |d| d.max(date)));
        }

        if let (Some(oldest), Some(newest)) = (stats.oldest_data_date, stats.newest_data_date) {
            stats.days_of_data = (newest - oldest).num_days() + 1;
        }
        Ok(stats)
    }
}

/// Partitions dated before the returned day are eligible for deletion.
pub fn cleanup_cutoff(today: NaiveDate, retention_days: u32) -> NaiveDate {
    let yesterday = today.pred_opt().unwrap_or(today);
    today
        .checked_sub_days(Days::new(u64::from(retention_days)))
        .unwrap_or(NaiveDate::MIN)
        .min(yesterday)
}

fn remove_counted(path: &Path, outcome: &mut PurgeOutcome) {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    match fs::remove_file(path) {
        Ok(()) => {
            outcome.files_deleted += 1;
            outcome.bytes_freed += size;
            debug!("Deleted {}", path.display());
        }
        Err(e) => {
            warn!("Failed to delete {}: {}", path.display(), e);
            outcome.errors.push(format!("{}: {}", path.display(), e));
        }
    }
}

fn unique_backup_path(dir: &Path, now: DateTime<Utc>) -> PathBuf {
    let stamp = now.format(CONFIG_BACKUP_STAMP).to_string();
    let mut candidate = dir.join(format!("{}{}.json", CONFIG_BACKUP_PREFIX, stamp));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}{}-{}.json", CONFIG_BACKUP_PREFIX, stamp, n));
        n += 1;
    }
    candidate
}

fn parse_backup_stamp(name: &str) -> Option<NaiveDateTime> {
    let rest = name.strip_prefix(CONFIG_BACKUP_PREFIX)?.strip_suffix(".json")?;
    let stamp = rest.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, CONFIG_BACKUP_STAMP).ok()
}

/// Read a partition. A missing file yields an empty partition for `date`.
pub(crate) fn load_daily_file(path: &Path, date: NaiveDate) -> Result<DailyDataFile, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DailyDataFile::new(date)),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| StoreError::integrity(path, format!("malformed JSON: {}", e)))
}

pub(crate) fn save_daily_file(path: &Path, file: &DailyDataFile) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(file).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeError, Protocol, TestStatus};
    use chrono::TimeZone;
    use std::time::Duration;

    fn sample(endpoint: &str, ts: DateTime<Utc>, latency_ms: u64) -> TestResult {
        TestResult::success(ts, endpoint, Protocol::Tcp, Duration::from_millis(latency_ms), 0)
    }

    fn temp_store() -> (tempfile::TempDir, ResultStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("data")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_sequential_writes_are_counted() {
        let (_dir, store) = temp_store();
        let ts = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();

        for i in 0..5 {
            store
                .store_test_result(&sample("r-e", ts + chrono::Duration::seconds(i), 10))
                .unwrap();
        }

        let date = ts.date_naive();
        let results = store.get_results(date).unwrap();
        assert_eq!(results.len(), 5);

        let file = load_daily_file(&store.partition_path(date), date).unwrap();
        assert_eq!(file.metadata.result_count, 5);
        assert_eq!(file.date, date);
    }

    #[test]
    fn test_partition_follows_utc_day() {
        let (_dir, store) = temp_store();
        let late = Utc.with_ymd_and_hms(2025, 10, 5, 23, 59, 59).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 10, 6, 0, 0, 1).unwrap();
        store.store_test_result(&sample("r-e", late, 1)).unwrap();
        store.store_test_result(&sample("r-e", early, 1)).unwrap();

        assert!(store.data_dir().join("2025-10-05.json").exists());
        assert!(store.data_dir().join("2025-10-06.json").exists());
    }

    #[test]
    fn test_missing_day_is_empty() {
        let (_dir, store) = temp_store();
        let results = store.get_results(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_failed_results_persist_error_text() {
        let (_dir, store) = temp_store();
        let ts = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        let failed = TestResult::from_error(ts, "r-e", Protocol::Tcp, &ProbeError::Network("connection refused".into()));
        store.store_test_result(&failed).unwrap();

        let back = store.get_results(ts.date_naive()).unwrap();
        assert_eq!(back[0].status, TestStatus::Failed);
        assert_eq!(back[0].error, "connection refused");
    }

    #[test]
    fn test_range_is_inclusive_and_skips_corrupt_days() {
        let (_dir, store) = temp_store();
        let day1 = Utc.with_ymd_and_hms(2025, 10, 1, 10, 0, 0).unwrap();
        let day3 = Utc.with_ymd_and_hms(2025, 10, 3, 10, 0, 0).unwrap();
        store.store_test_result(&sample("r-e", day1, 1)).unwrap();
        store.store_test_result(&sample("r-e", day3, 3)).unwrap();
        fs::write(store.data_dir().join("2025-10-02.json"), b"{not json").unwrap();

        let all = store.get_results_range(day1, day3).unwrap();
        assert_eq!(all.len(), 2);

        let after_first = store
            .get_results_range(day1 + chrono::Duration::seconds(1), day3)
            .unwrap();
        assert_eq!(after_first.len(), 1);

        assert!(store.get_results_range(day3, day1).unwrap().is_empty());
    }

    #[test]
    fn test_range_reads_only_existing_partitions() {
        let (_dir, store) = temp_store();
        let ts = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        store.store_test_result(&sample("r-e", ts, 1)).unwrap();
        fs::write(store.data_dir().join("notes.json"), b"{}").unwrap();

        let start = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        let began = std::time::Instant::now();
        let results = store.get_results_range(start, end).unwrap();
        assert_eq!(results.len(), 1);
        assert!(began.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_corrupt_partition_rejects_append() {
        let (_dir, store) = temp_store();
        let ts = Utc.with_ymd_and_hms(2025, 10, 2, 10, 0, 0).unwrap();
        let path = store.partition_path(ts.date_naive());
        fs::write(&path, b"{not json").unwrap();

        let err = store.store_test_result(&sample("r-e", ts, 1)).unwrap_err();
        assert!(matches!(err, StoreError::Integrity { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"{not json");
    }

    #[test]
    fn test_concurrent_writes_lose_nothing() {
        let (_dir, store) = temp_store();
        let ts = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();

        std::thread::scope(|scope| {
            for worker in 0..10 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..10 {
                        let r = sample(&format!("r-e{}", worker), ts + chrono::Duration::milliseconds(i), 5);
                        store.store_test_result(&r).unwrap();
                    }
                });
            }
        });

        let date = ts.date_naive();
        assert_eq!(store.get_results(date).unwrap().len(), 100);
        let file = load_daily_file(&store.partition_path(date), date).unwrap();
        assert_eq!(file.metadata.result_count, 100);

        let temp_files = fs::read_dir(store.data_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .count();
        assert_eq!(temp_files, 0);
    }

    #[test]
    fn test_cleanup_cutoff_protects_recent_days() {
        let today = NaiveDate::from_ymd_opt(2025, 10, 19).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2025, 10, 18).unwrap();
        assert_eq!(cleanup_cutoff(today, 0), yesterday);
        assert_eq!(cleanup_cutoff(today, 1), yesterday);
        assert_eq!(cleanup_cutoff(today, 7), NaiveDate::from_ymd_opt(2025, 10, 12).unwrap());
    }

    #[test]
    fn test_cleanup_old_files() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        let today = now.date_naive();
        store.store_test_result(&sample("r-e", now, 1)).unwrap();

        let old = today - Days::new(10);
        let recent = today - Days::new(3);
        fs::write(store.partition_path(old), b"{}").unwrap();
        fs::write(store.partition_path(recent), b"{}").unwrap();
        fs::write(store.data_dir().join("notes.json"), b"{}").unwrap();

        let outcome = store.cleanup_old_files(7).unwrap();
        assert_eq!(outcome.files_deleted, 1);
        assert_eq!(outcome.bytes_freed, 2);
        assert!(outcome.errors.is_empty());
        assert!(!store.partition_path(old).exists());
        assert!(store.partition_path(recent).exists());
        assert!(store.partition_path(today).exists());
        assert!(store.data_dir().join("notes.json").exists());

        // Zero retention still keeps today.
        store.cleanup_old_files(0).unwrap();
        assert!(store.partition_path(today).exists());
    }

    #[test]
    fn test_storage_stats() {
        let (_dir, store) = temp_store();
        let empty = store.storage_stats().unwrap();
        assert_eq!(empty.total_files, 0);
        assert_eq!(empty.oldest_data_date, None);
        assert_eq!(empty.days_of_data, 0);

        store
            .store_test_result(&sample("r-e", Utc.with_ymd_and_hms(2025, 10, 1, 1, 0, 0).unwrap(), 1))
            .unwrap();
        store
            .store_test_result(&sample("r-e", Utc.with_ymd_and_hms(2025, 10, 3, 1, 0, 0).unwrap(), 1))
            .unwrap();
        fs::write(store.data_dir().join("cleanup_history.json"), b"[]").unwrap();

        let stats = store.storage_stats().unwrap();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.days_of_data, 3);
        assert_eq!(stats.oldest_data_date, NaiveDate::from_ymd_opt(2025, 10, 1));
        assert_eq!(stats.newest_data_date, NaiveDate::from_ymd_opt(2025, 10, 3));
        assert!(stats.total_size_bytes > 0);
    }

    #[test]
    fn test_configuration_snapshot_and_backup() {
        let (_dir, store) = temp_store();
        assert!(matches!(
            store.load_configuration::<serde_json::Value>(),
            Err(StoreError::ConfigNotFound(_))
        ));

        store.save_configuration(&serde_json::json!({"v": 1})).unwrap();
        store.save_configuration(&serde_json::json!({"v": 2})).unwrap();

        let loaded: serde_json::Value = store.load_configuration().unwrap();
        assert_eq!(loaded["v"], 2);

        let backups: Vec<_> = fs::read_dir(store.config_backup_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(backups.len(), 1);
        let name = backups[0].file_name().to_string_lossy().into_owned();
        assert!(parse_backup_stamp(&name).is_some());

        // Fresh backups survive, zero-day retention removes them.
        assert_eq!(store.prune_config_backups(30).unwrap().files_deleted, 0);
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(store.prune_config_backups(0).unwrap().files_deleted, 1);
    }
}
