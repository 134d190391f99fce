//! Storage model types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::probe::TestResult;

/// Format version written into every day partition.
pub const DATA_FILE_VERSION: &str = "1.0.0";

const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";

/// One UTC day of test results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDataFile {
    pub date: NaiveDate,
    pub results: Vec<TestResult>,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub result_count: usize,
}

impl DailyDataFile {
    pub fn new(date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            date,
            results: Vec::new(),
            metadata: FileMetadata {
                version: DATA_FILE_VERSION.to_string(),
                created_at: now,
                last_modified: now,
                result_count: 0,
            },
        }
    }

    /// Append a result and keep the metadata in step.
    pub fn push(&mut self, result: TestResult) {
        self.results.push(result);
        self.metadata.last_modified = Utc::now();
        self.metadata.result_count = self.results.len();
    }
}

/// File name of the partition for `date`.
pub fn partition_file_name(date: NaiveDate) -> String {
    format!("{}.json", date.format(PARTITION_DATE_FORMAT))
}

/// Date of a partition file, or `None` for any other name.
pub fn parse_partition_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".json")?;
    if stem.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(stem, PARTITION_DATE_FORMAT).ok()
}

/// Summary of the partitions on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_files: usize,
    pub total_size_bytes: u64,
    pub oldest_data_date: Option<NaiveDate>,
    pub newest_data_date: Option<NaiveDate>,
    /// Inclusive span between oldest and newest partition.
    pub days_of_data: i64,
    pub data_directory: PathBuf,
}

/// What a purge removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeOutcome {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

/// What recovering a damaged partition salvaged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub date: NaiveDate,
    pub recovered_results: usize,
    pub discarded_entries: usize,
    pub backup_path: PathBuf,
}
