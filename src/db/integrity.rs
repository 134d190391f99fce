//! Partition validation and recovery.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::models::*;
use super::store::{save_daily_file, ResultStore, StoreError};
use crate::probe::TestResult;

impl ResultStore {
    /// Check that a partition is well formed and its metadata agrees with its contents.
    pub fn validate_data_file(&self, path: &Path) -> Result<(), StoreError> {
        let _guard = self.read_guard()?;
        let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
        check_document(path, &bytes)
    }

    /// Rewrite a damaged partition from whatever results still parse.
    ///
    /// The original bytes are copied aside first and kept.
    pub fn recover_data_file(&self, path: &Path) -> Result<RecoveryReport, StoreError> {
        let _guard = self.write_guard()?;
        let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;

        let backup_path = backup_path_for(path, Utc::now());
        fs::copy(path, &backup_path).map_err(|e| StoreError::io(&backup_path, e))?;
        info!("Backed up {} to {}", path.display(), backup_path.display());

        let salvage = match serde_json::from_slice::<Value>(&bytes) {
            Ok(doc) => salvage_document(&doc),
            Err(_) => salvage_truncated(&bytes),
        };

        let file_date = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_partition_file_name);
        let date = salvage
            .date
            .or(file_date)
            .ok_or_else(|| StoreError::integrity(path, "cannot determine partition date"))?;

        let mut file = DailyDataFile::new(date);
        if let Some(created_at) = salvage.created_at {
            file.metadata.created_at = created_at;
        }
        file.metadata.result_count = salvage.results.len();
        file.results = salvage.results;
        save_daily_file(path, &file)?;

        if salvage.discarded > 0 {
            warn!(
                "Recovered {} result(s) in {}, discarded {} unreadable entries",
                file.results.len(),
                path.display(),
                salvage.discarded
            );
        } else {
            info!("Recovered {} result(s) in {}", file.results.len(), path.display());
        }

        Ok(RecoveryReport {
            date,
            recovered_results: file.results.len(),
            discarded_entries: salvage.discarded,
            backup_path,
        })
    }
}

fn check_document(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let doc: Value = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::integrity(path, format!("malformed JSON: {}", e)))?;

    let date = doc
        .get("date")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::integrity(path, "missing date"))?;
    if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
        return Err(StoreError::integrity(path, format!("invalid date {:?}", date)));
    }

    let metadata = doc
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or_else(|| StoreError::integrity(path, "missing metadata"))?;
    match metadata.get("version").and_then(Value::as_str) {
        Some(v) if !v.is_empty() => {}
        _ => return Err(StoreError::integrity(path, "missing metadata version")),
    }

    let results = doc
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::integrity(path, "missing results array"))?;

    let declared = metadata.get("resultCount").and_then(Value::as_u64);
    if declared != Some(results.len() as u64) {
        return Err(StoreError::integrity(
            path,
            format!(
                "result count mismatch: metadata says {}, file holds {}",
                declared.map_or_else(|| "nothing".to_string(), |n| n.to_string()),
                results.len()
            ),
        ));
    }

    for (i, entry) in results.iter().enumerate() {
        if let Err(e) = serde_json::from_value::<TestResult>(entry.clone()) {
            return Err(StoreError::integrity(path, format!("unreadable result at index {}: {}", i, e)));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Salvage {
    date: Option<chrono::NaiveDate>,
    created_at: Option<DateTime<Utc>>,
    results: Vec<TestResult>,
    discarded: usize,
}

/// Salvage from a document that still parses as JSON.
fn salvage_document(doc: &Value) -> Salvage {
    let mut salvage = Salvage {
        date: doc
            .get("date")
            .and_then(Value::as_str)
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
        created_at: doc
            .pointer("/metadata/createdAt")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        ..Salvage::default()
    };

    if let Some(entries) = doc.get("results").and_then(Value::as_array) {
        for entry in entries {
            match serde_json::from_value::<TestResult>(entry.clone()) {
                Ok(result) => salvage.results.push(result),
                Err(_) => salvage.discarded += 1,
            }
        }
    }
    salvage
}

/// Salvage from a truncated document by reading the results array element by element.
fn salvage_truncated(bytes: &[u8]) -> Salvage {
    let mut salvage = Salvage::default();

    let Some(key) = find(bytes, b"\"results\"") else {
        return salvage;
    };
    let Some(open) = bytes[key..].iter().position(|b| *b == b'[') else {
        return salvage;
    };
    let mut rest = &bytes[key + open + 1..];

    loop {
        let skip = rest
            .iter()
            .take_while(|b| b.is_ascii_whitespace() || **b == b',')
            .count();
        rest = &rest[skip..];
        if rest.first().map_or(true, |b| *b == b']') {
            break;
        }

        let mut stream = serde_json::Deserializer::from_slice(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(entry)) => {
                let consumed = stream.byte_offset();
                match serde_json::from_value::<TestResult>(entry) {
                    Ok(result) => salvage.results.push(result),
                    Err(_) => salvage.discarded += 1,
                }
                rest = &rest[consumed..];
            }
            // Cut off mid-element: everything before it is kept.
            Some(Err(_)) => {
                salvage.discarded += 1;
                break;
            }
            None => break,
        }
    }
    salvage
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn backup_path_for(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "partition".to_string());
    path.with_file_name(format!("{}.corrupt-{}.bak", name, now.format("%Y%m%dT%H%M%S%.3f")))
}
