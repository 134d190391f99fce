//! Background export of stored results to CSV or JSON files.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::config::MonitorConfig;
use crate::db::ResultStore;
use crate::probe::{CancelHandle, Cancellation, TestResult};
use crate::scheduler::{AggregatedResult, Aggregator};

const MAX_EXPORT_HISTORY: usize = 100;

/// Share of progress reserved for finalization.
const FINALIZE_SHARE: f64 = 0.1;

pub const COLUMN_TIMESTAMP: &str = "timestamp";
pub const COLUMN_ENDPOINT_ID: &str = "endpoint_id";
pub const COLUMN_REGION: &str = "region";
pub const COLUMN_PROTOCOL: &str = "protocol";
pub const COLUMN_STATUS: &str = "status";
pub const COLUMN_LATENCY: &str = "latency_ms";
pub const COLUMN_ERROR: &str = "error";

pub const ALL_COLUMNS: [&str; 7] = [
    COLUMN_TIMESTAMP,
    COLUMN_ENDPOINT_ID,
    COLUMN_REGION,
    COLUMN_PROTOCOL,
    COLUMN_STATUS,
    COLUMN_LATENCY,
    COLUMN_ERROR,
];

pub const DEFAULT_COLUMNS: [&str; 5] = [
    COLUMN_TIMESTAMP,
    COLUMN_ENDPOINT_ID,
    COLUMN_PROTOCOL,
    COLUMN_STATUS,
    COLUMN_LATENCY,
];

const AGGREGATE_COLUMNS: [&str; 11] = [
    "start_time",
    "end_time",
    "endpoint_id",
    "region",
    "test_count",
    "success_count",
    "avg_latency_ms",
    "min_latency_ms",
    "max_latency_ms",
    "std_dev_latency_ms",
    "availability_pct",
];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("invalid export request: {0}")]
    InvalidRequest(String),
    #[error("export job not found: {0}")]
    NotFound(String),
    #[error("cannot cancel job in status {0}")]
    NotCancellable(ExportState),
    #[error("export cancelled")]
    Cancelled,
    #[error("export I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("export serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExportState {
    pub fn is_active(&self) -> bool {
        matches!(self, ExportState::Pending | ExportState::Running)
    }
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportState::Pending => "pending",
            ExportState::Running => "running",
            ExportState::Completed => "completed",
            ExportState::Failed => "failed",
            ExportState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What to export. Empty endpoint and region lists select everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    /// CSV only. Empty means [`DEFAULT_COLUMNS`].
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub include_raw: bool,
    #[serde(default, rename = "includeAgg")]
    pub include_aggregated: bool,
}

impl ExportRequest {
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.start_date > self.end_date {
            return Err(ExportError::InvalidRequest(
                "start date must be before or equal to end date".to_string(),
            ));
        }
        if !self.include_raw && !self.include_aggregated {
            return Err(ExportError::InvalidRequest(
                "must include at least one of: raw data or aggregated data".to_string(),
            ));
        }
        if self.format == ExportFormat::Csv {
            if let Some(bad) = self.columns.iter().find(|c| !ALL_COLUMNS.contains(&c.as_str())) {
                return Err(ExportError::InvalidRequest(format!("invalid CSV column: {}", bad)));
            }
        }
        Ok(())
    }

    fn csv_columns(&self) -> Vec<&str> {
        if self.columns.is_empty() {
            DEFAULT_COLUMNS.to_vec()
        } else {
            self.columns.iter().map(String::as_str).collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: String,
    pub request: ExportRequest,
    pub status: ExportState,
    /// 0.0 to 1.0
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatus {
    pub job: ExportJob,
    pub current_phase: &'static str,
}

fn current_phase(job: &ExportJob) -> &'static str {
    match job.status {
        ExportState::Pending => "Waiting to start",
        ExportState::Running if job.progress < 0.1 => "Initializing export",
        ExportState::Running if job.progress < 0.5 => "Reading data",
        ExportState::Running if job.progress < 0.9 => "Writing export file",
        ExportState::Running => "Finalizing",
        ExportState::Completed => "Completed successfully",
        ExportState::Failed => "Failed",
        ExportState::Cancelled => "Cancelled",
    }
}

struct ActiveJob {
    job: ExportJob,
    cancel: CancelHandle,
}

#[derive(Default)]
struct Jobs {
    active: HashMap<String, ActiveJob>,
    history: VecDeque<ExportJob>,
}

type SharedJobs = Arc<Mutex<Jobs>>;

fn lock_jobs(jobs: &Mutex<Jobs>) -> MutexGuard<'_, Jobs> {
    match jobs.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Runs export jobs in the background and keeps their history.
pub struct ExportManager {
    store: Arc<ResultStore>,
    aggregator: Arc<Aggregator>,
    export_dir: PathBuf,
    jobs: SharedJobs,
}

impl ExportManager {
    pub fn new(
        store: Arc<ResultStore>,
        aggregator: Arc<Aggregator>,
        export_dir: impl Into<PathBuf>,
    ) -> Result<Self, ExportError> {
        let export_dir = export_dir.into();
        fs::create_dir_all(&export_dir)?;
        Ok(Self {
            store,
            aggregator,
            export_dir,
            jobs: Arc::new(Mutex::new(Jobs::default())),
        })
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Validate the request and start a background job. `config` maps endpoints to regions.
    pub fn create_export(
        &self,
        request: ExportRequest,
        config: Arc<MonitorConfig>,
    ) -> Result<ExportJob, ExportError> {
        request.validate()?;

        let job = ExportJob {
            id: new_job_id(Utc::now()),
            request,
            status: ExportState::Pending,
            progress: 0.0,
            start_time: Utc::now(),
            end_time: None,
            file_path: None,
            file_size: 0,
            error: String::new(),
        };
        let (handle, cancel) = Cancellation::pair();
        lock_jobs(&self.jobs).active.insert(
            job.id.clone(),
            ActiveJob {
                job: job.clone(),
                cancel: handle,
            },
        );

        info!(
            "Export job {} created ({}, compressed: {})",
            job.id,
            job.request.format.extension(),
            job.request.compressed
        );

        let worker = Worker {
            id: job.id.clone(),
            request: job.request.clone(),
            config,
            store: Arc::clone(&self.store),
            aggregator: Arc::clone(&self.aggregator),
            export_dir: self.export_dir.clone(),
            jobs: Arc::clone(&self.jobs),
            cancel,
        };
        tokio::task::spawn_blocking(move || worker.run());

        Ok(job)
    }

    pub fn get_export_status(&self, id: &str) -> Result<ExportStatus, ExportError> {
        let jobs = lock_jobs(&self.jobs);
        let job = jobs
            .active
            .get(id)
            .map(|a| &a.job)
            .or_else(|| jobs.history.iter().find(|j| j.id == id))
            .ok_or_else(|| ExportError::NotFound(id.to_string()))?;
        Ok(ExportStatus {
            job: job.clone(),
            current_phase: current_phase(job),
        })
    }

    /// Cancel a pending or running job. Its partial output is removed.
    pub fn cancel_export(&self, id: &str) -> Result<(), ExportError> {
        let mut jobs = lock_jobs(&self.jobs);
        if let Some(active) = jobs.active.get_mut(id) {
            if !active.job.status.is_active() {
                return Err(ExportError::NotCancellable(active.job.status));
            }
            active.cancel.cancel();
            active.job.status = ExportState::Cancelled;
            active.job.end_time = Some(Utc::now());
            info!("Export job {} cancelled", id);
            return Ok(());
        }
        match jobs.history.iter().find(|j| j.id == id) {
            Some(job) => Err(ExportError::NotCancellable(job.status)),
            None => Err(ExportError::NotFound(id.to_string())),
        }
    }

    /// Finished jobs, oldest first.
    pub fn export_history(&self) -> Vec<ExportJob> {
        lock_jobs(&self.jobs).history.iter().cloned().collect()
    }

    pub fn active_jobs(&self) -> Vec<ExportJob> {
        lock_jobs(&self.jobs)
            .active
            .values()
            .map(|a| a.job.clone())
            .collect()
    }

    /// Cancel every active job.
    pub fn close(&self) {
        let jobs = lock_jobs(&self.jobs);
        for active in jobs.active.values() {
            active.cancel.cancel();
        }
        info!("Export manager closed");
    }
}

fn new_job_id(now: DateTime<Utc>) -> String {
    format!("export-{}-{:08x}", now.format("%Y%m%d%H%M%S"), rand::random::<u32>())
}

/// State moved onto the blocking pool for one job.
struct Worker {
    id: String,
    request: ExportRequest,
    config: Arc<MonitorConfig>,
    store: Arc<ResultStore>,
    aggregator: Arc<Aggregator>,
    export_dir: PathBuf,
    jobs: SharedJobs,
    cancel: Cancellation,
}

impl Worker {
    fn run(self) {
        self.update(|job| {
            if job.status == ExportState::Pending {
                job.status = ExportState::Running;
            }
        });

        let outcome = self.export();
        let mut jobs = lock_jobs(&self.jobs);
        let Some(active) = jobs.active.remove(&self.id) else {
            return;
        };
        let mut job = active.job;
        job.end_time.get_or_insert_with(Utc::now);

        match outcome {
            Ok((path, _)) if job.status == ExportState::Cancelled => {
                remove_partial(&path);
                info!("Export job {} stopped after cancellation", job.id);
            }
            Ok((path, size)) => {
                info!("Export job {} completed: {} ({} bytes)", job.id, path.display(), size);
                job.status = ExportState::Completed;
                job.progress = 1.0;
                job.file_path = Some(path);
                job.file_size = size;
            }
            Err(ExportError::Cancelled) => {
                info!("Export job {} stopped after cancellation", job.id);
                job.status = ExportState::Cancelled;
            }
            Err(e) => {
                warn!("Export job {} failed: {}", job.id, e);
                job.status = ExportState::Failed;
                job.error = e.to_string();
            }
        }

        jobs.history.push_back(job);
        while jobs.history.len() > MAX_EXPORT_HISTORY {
            jobs.history.pop_front();
        }
    }

    fn update(&self, f: impl FnOnce(&mut ExportJob)) {
        if let Some(active) = lock_jobs(&self.jobs).active.get_mut(&self.id) {
            f(&mut active.job);
        }
    }

    fn set_progress(&self, done: usize, total: usize) {
        let fraction = if total == 0 { 1.0 } else { done as f64 / total as f64 };
        self.update(|job| job.progress = fraction * (1.0 - FINALIZE_SHARE));
    }

    fn check_cancelled(&self) -> Result<(), ExportError> {
        if self.cancel.is_cancelled() {
            Err(ExportError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Write the export and return its final path and size.
    fn export(&self) -> Result<(PathBuf, u64), ExportError> {
        let base = &self.id;
        let plain = self
            .export_dir
            .join(format!("{}.{}", base, self.request.format.extension()));

        let written = match self.request.format {
            ExportFormat::Csv => self.write_csv(&plain),
            ExportFormat::Json => self.write_json(&plain),
        }
        .and_then(|()| self.check_cancelled());
        if let Err(e) = written {
            remove_partial(&plain);
            return Err(e);
        }

        let path = if self.request.compressed {
            let archive = self.export_dir.join(format!("{}.zip", base));
            if let Err(e) = compress(&plain, &archive) {
                remove_partial(&archive);
                remove_partial(&plain);
                return Err(e);
            }
            fs::remove_file(&plain)?;
            archive
        } else {
            plain
        };

        if self.cancel.is_cancelled() {
            remove_partial(&path);
            return Err(ExportError::Cancelled);
        }
        let size = fs::metadata(&path)?.len();
        Ok((path, size))
    }

    fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut day = self.request.start_date.date_naive();
        let last = self.request.end_date.date_naive();
        while day <= last {
            days.push(day);
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        days
    }

    /// Selected configured endpoints as (region, endpoint id).
    fn selected_endpoints(&self) -> Vec<(String, String)> {
        self.config
            .endpoints()
            .map(|(region, e)| (region.to_string(), e.id(region)))
            .filter(|(region, id)| self.endpoint_selected(id) && self.region_selected(Some(region)))
            .collect()
    }

    fn endpoint_selected(&self, endpoint_id: &str) -> bool {
        self.request.endpoints.is_empty() || self.request.endpoints.iter().any(|e| e == endpoint_id)
    }

    fn region_selected(&self, region: Option<&str>) -> bool {
        if self.request.regions.is_empty() {
            return true;
        }
        region.is_some_and(|r| self.request.regions.iter().any(|want| want == r))
    }

    fn includes(&self, result: &TestResult) -> bool {
        result.timestamp >= self.request.start_date
            && result.timestamp <= self.request.end_date
            && self.endpoint_selected(&result.endpoint_id)
            && self.region_selected(self.config.region_of(&result.endpoint_id))
    }

    fn total_steps(&self, days: usize, endpoints: usize) -> usize {
        let raw = if self.request.include_raw { days } else { 0 };
        let agg = if self.request.include_aggregated { endpoints } else { 0 };
        raw + agg
    }

    /// Visit selected raw results day by day.
    fn for_each_raw(
        &self,
        total: usize,
        done: &mut usize,
        mut visit: impl FnMut(&TestResult) -> Result<(), ExportError>,
    ) -> Result<(), ExportError> {
        for day in self.days() {
            self.check_cancelled()?;
            match self.store.get_results(day) {
                Ok(results) => {
                    for result in results.iter().filter(|r| self.includes(r)) {
                        visit(result)?;
                    }
                }
                Err(e) => warn!("Export {}: skipping {}: {}", self.id, day, e),
            }
            *done += 1;
            self.set_progress(*done, total);
        }
        Ok(())
    }

    /// Hourly aggregations with at least one test, per selected endpoint.
    fn for_each_aggregate(
        &self,
        endpoints: &[(String, String)],
        total: usize,
        done: &mut usize,
        mut visit: impl FnMut(&AggregatedResult) -> Result<(), ExportError>,
    ) -> Result<(), ExportError> {
        for (region, endpoint_id) in endpoints {
            self.check_cancelled()?;
            let series = self.aggregator.hourly_series(
                endpoint_id,
                region,
                self.request.start_date,
                self.request.end_date,
            );
            for agg in series.iter().filter(|a| a.test_count > 0) {
                visit(agg)?;
            }
            *done += 1;
            self.set_progress(*done, total);
        }
        Ok(())
    }

    fn write_csv(&self, path: &Path) -> Result<(), ExportError> {
        let columns = self.request.csv_columns();
        let endpoints = self.selected_endpoints();
        let total = self.total_steps(self.days().len(), endpoints.len());
        let mut done = 0;
        let mut out = BufWriter::new(File::create(path)?);
        let mut rows = 0usize;

        if self.request.include_raw {
            write_csv_row(&mut out, columns.iter().copied())?;
            self.for_each_raw(total, &mut done, |result| {
                let region = self.config.region_of(&result.endpoint_id).unwrap_or("");
                let cells: Vec<String> = columns
                    .iter()
                    .map(|c| column_value(result, region, c))
                    .collect();
                rows += 1;
                write_csv_row(&mut out, cells.iter().map(String::as_str))
                    .map_err(ExportError::from)
            })?;
        }

        if self.request.include_aggregated {
            if self.request.include_raw {
                writeln!(out)?;
            }
            write_csv_row(&mut out, AGGREGATE_COLUMNS.iter().copied())?;
            self.for_each_aggregate(&endpoints, total, &mut done, |agg| {
                let cells = aggregate_row(agg);
                rows += 1;
                write_csv_row(&mut out, cells.iter().map(String::as_str))
                    .map_err(ExportError::from)
            })?;
        }

        out.flush()?;
        debug!("Export {}: wrote {} CSV row(s)", self.id, rows);
        Ok(())
    }

    fn write_json(&self, path: &Path) -> Result<(), ExportError> {
        let endpoints = self.selected_endpoints();
        let total = self.total_steps(self.days().len(), endpoints.len());
        let mut done = 0;

        let mut raw_data = Vec::new();
        if self.request.include_raw {
            self.for_each_raw(total, &mut done, |result| {
                raw_data.push(result.clone());
                Ok(())
            })?;
        }
        let mut aggregated_data = Vec::new();
        if self.request.include_aggregated {
            self.for_each_aggregate(&endpoints, total, &mut done, |agg| {
                aggregated_data.push(agg.clone());
                Ok(())
            })?;
        }

        let data = ExportData {
            export_info: ExportInfo {
                export_id: self.id.clone(),
                export_date: Utc::now(),
                start_date: self.request.start_date.date_naive(),
                end_date: self.request.end_date.date_naive(),
                format: ExportFormat::Json,
                record_count: raw_data.len(),
            },
            raw_data,
            aggregated_data,
            metadata: ExportFilters {
                endpoints: self.request.endpoints.clone(),
                regions: self.request.regions.clone(),
                include_raw: self.request.include_raw,
                include_aggregated: self.request.include_aggregated,
            },
        };

        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, &data)?;
        out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportData {
    export_info: ExportInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    raw_data: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    aggregated_data: Vec<AggregatedResult>,
    metadata: ExportFilters,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportInfo {
    export_id: String,
    export_date: DateTime<Utc>,
    start_date: NaiveDate,
    end_date: NaiveDate,
    format: ExportFormat,
    record_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportFilters {
    endpoints: Vec<String>,
    regions: Vec<String>,
    include_raw: bool,
    #[serde(rename = "includeAgg")]
    include_aggregated: bool,
}

fn column_value(result: &TestResult, region: &str, column: &str) -> String {
    match column {
        COLUMN_TIMESTAMP => result.timestamp.to_rfc3339(),
        COLUMN_ENDPOINT_ID => result.endpoint_id.clone(),
        COLUMN_REGION => region.to_string(),
        COLUMN_PROTOCOL => result.protocol.to_string(),
        COLUMN_STATUS => result.status.to_string(),
        COLUMN_LATENCY => format!("{:.2}", result.latency_ms()),
        COLUMN_ERROR => result.error.clone(),
        _ => String::new(),
    }
}

fn aggregate_row(agg: &AggregatedResult) -> Vec<String> {
    vec![
        agg.start_time.to_rfc3339(),
        agg.end_time.to_rfc3339(),
        agg.endpoint_id.clone(),
        agg.region_name.clone(),
        agg.test_count.to_string(),
        agg.success_count.to_string(),
        format!("{:.2}", agg.avg_latency_ms),
        format!("{:.2}", agg.min_latency_ms),
        format!("{:.2}", agg.max_latency_ms),
        format!("{:.2}", agg.std_dev_latency_ms),
        format!("{:.2}", agg.availability_pct),
    ]
}

fn write_csv_row<'a>(out: &mut impl Write, cells: impl Iterator<Item = &'a str>) -> io::Result<()> {
    let line: Vec<String> = cells.map(csv_field).collect();
    writeln!(out, "{}", line.join(","))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn compress(plain: &Path, archive: &Path) -> Result<(), ExportError> {
    let entry = plain
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());

    let mut zip = ZipWriter::new(File::create(archive)?);
    let options: FileOptions<'_, ()> = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    zip.start_file(entry, options)?;
    io::copy(&mut File::open(plain)?, &mut zip)?;
    zip.finish()?;
    Ok(())
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed partial export {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial export {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, Region, Settings, Thresholds};
    use crate::probe::{ProbeError, Protocol};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::time::Duration;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 5, h, m, 0).unwrap()
    }

    fn monitor_config() -> Arc<MonitorConfig> {
        let endpoint = |name: &str| Endpoint {
            name: name.to_string(),
            protocol: Protocol::Tcp,
            address: "example.com:443".to_string(),
            timeout: 2000,
            options: None,
        };
        let thresholds = Thresholds {
            latency_ms: 100,
            availability_percent: 99.0,
        };
        let mut regions = BTreeMap::new();
        regions.insert(
            "EU".to_string(),
            Region {
                endpoints: vec![endpoint("web"), endpoint("api")],
                thresholds: thresholds.clone(),
            },
        );
        regions.insert(
            "US".to_string(),
            Region {
                endpoints: vec![endpoint("web")],
                thresholds,
            },
        );
        Arc::new(MonitorConfig {
            regions,
            settings: Settings {
                test_interval_minutes: 5,
                data_retention_days: 30,
                notifications_enabled: false,
            },
        })
    }

    fn setup() -> (tempfile::TempDir, Arc<ResultStore>, ExportManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ResultStore::new(dir.path().join("data")).unwrap());
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&store)));
        let manager = ExportManager::new(Arc::clone(&store), aggregator, dir.path().join("exports")).unwrap();

        let results = [
            TestResult::success(ts(8, 0), "EU-web", Protocol::Tcp, Duration::from_micros(12_500), 0),
            TestResult::success(ts(8, 5), "EU-api", Protocol::Tcp, Duration::from_millis(20), 0),
            TestResult::from_error(
                ts(8, 10),
                "US-web",
                Protocol::Tcp,
                &ProbeError::Network("connection refused, port closed".to_string()),
            ),
        ];
        for r in &results {
            store.store_test_result(r).unwrap();
        }
        (dir, store, manager)
    }

    fn request(format: ExportFormat) -> ExportRequest {
        ExportRequest {
            format,
            start_date: ts(0, 0),
            end_date: ts(23, 59),
            endpoints: Vec::new(),
            regions: Vec::new(),
            columns: Vec::new(),
            compressed: false,
            include_raw: true,
            include_aggregated: false,
        }
    }

    async fn wait_finished(manager: &ExportManager, id: &str) -> ExportJob {
        for _ in 0..200 {
            let status = manager.get_export_status(id).unwrap();
            if !status.job.status.is_active() && status.job.end_time.is_some() {
                if manager.active_jobs().iter().all(|j| j.id != id) {
                    return status.job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("export {} did not finish", id);
    }

    #[test]
    fn test_request_validation() {
        let mut r = request(ExportFormat::Csv);
        r.start_date = ts(10, 0);
        r.end_date = ts(9, 0);
        assert!(r.validate().is_err());

        let mut r = request(ExportFormat::Csv);
        r.include_raw = false;
        assert!(r.validate().is_err());

        let mut r = request(ExportFormat::Csv);
        r.columns = vec!["timestamp".to_string(), "bogus".to_string()];
        assert!(r.validate().is_err());

        let mut r = request(ExportFormat::Json);
        r.columns = vec!["bogus".to_string()];
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_request_json_shape() {
        let r: ExportRequest = serde_json::from_str(
            r#"{"format":"csv","startDate":"2025-10-05T00:00:00Z","endDate":"2025-10-06T00:00:00Z","includeAgg":true}"#,
        )
        .unwrap();
        assert_eq!(r.format, ExportFormat::Csv);
        assert!(r.include_aggregated);
        assert!(!r.include_raw);
        assert!(serde_json::from_str::<ExportRequest>(r#"{"format":"xml"}"#).is_err());
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn test_csv_export_with_filters() {
        let (_dir, _store, manager) = setup();
        let mut r = request(ExportFormat::Csv);
        r.regions = vec!["EU".to_string()];
        r.columns = vec![
            COLUMN_ENDPOINT_ID.to_string(),
            COLUMN_REGION.to_string(),
            COLUMN_LATENCY.to_string(),
        ];

        let job = manager.create_export(r, monitor_config()).unwrap();
        assert_eq!(job.status, ExportState::Pending);
        let job = wait_finished(&manager, &job.id).await;
        assert_eq!(job.status, ExportState::Completed, "{}", job.error);
        assert_eq!(job.progress, 1.0);

        let path = job.file_path.unwrap();
        let body = fs::read_to_string(&path).unwrap();
        assert_eq!(job.file_size, body.len() as u64);
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines, vec!["endpoint_id,region,latency_ms", "EU-web,EU,12.50", "EU-api,EU,20.00"]);
    }

    #[tokio::test]
    async fn test_csv_quotes_errors_and_appends_aggregates() {
        let (_dir, _store, manager) = setup();
        let mut r = request(ExportFormat::Csv);
        r.endpoints = vec!["US-web".to_string()];
        r.columns = vec![COLUMN_STATUS.to_string(), COLUMN_ERROR.to_string()];
        r.include_aggregated = true;

        let job = manager.create_export(r, monitor_config()).unwrap();
        let job = wait_finished(&manager, &job.id).await;
        assert_eq!(job.status, ExportState::Completed, "{}", job.error);

        let body = fs::read_to_string(job.file_path.unwrap()).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines[0], "status,error");
        assert_eq!(lines[1], "failed,\"connection refused, port closed\"");
        assert_eq!(lines[2], "");
        assert!(lines[3].starts_with("start_time,end_time,endpoint_id"));
        assert_eq!(lines.len(), 5);
        assert!(lines[4].contains("US-web,US,1,0"));
    }

    #[tokio::test]
    async fn test_compressed_json_export() {
        let (_dir, _store, manager) = setup();
        let mut r = request(ExportFormat::Json);
        r.compressed = true;
        r.include_aggregated = true;

        let job = manager.create_export(r, monitor_config()).unwrap();
        let job = wait_finished(&manager, &job.id).await;
        assert_eq!(job.status, ExportState::Completed, "{}", job.error);

        let path = job.file_path.unwrap();
        assert_eq!(path.extension().unwrap(), "zip");
        assert!(!path.with_extension("json").exists());

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        let mut body = String::new();
        archive.by_index(0).unwrap().read_to_string(&mut body).unwrap();

        let data: ExportData = serde_json::from_str(&body).unwrap();
        assert_eq!(data.export_info.record_count, 3);
        assert_eq!(data.raw_data.len(), 3);
        assert_eq!(data.aggregated_data.len(), 3);
        assert!(data.metadata.include_aggregated);
    }

    #[tokio::test]
    async fn test_cancel_and_history() {
        let (_dir, _store, manager) = setup();
        assert!(matches!(manager.cancel_export("nope"), Err(ExportError::NotFound(_))));
        assert!(matches!(manager.get_export_status("nope"), Err(ExportError::NotFound(_))));

        let mut r = request(ExportFormat::Csv);
        r.start_date = ts(0, 0) - chrono::Duration::days(3650);
        let job = manager.create_export(r, monitor_config()).unwrap();

        let cancelled = manager.cancel_export(&job.id);
        let finished = wait_finished(&manager, &job.id).await;
        match cancelled {
            Ok(()) => {
                assert_eq!(finished.status, ExportState::Cancelled);
                assert!(finished.file_path.is_none());
                let leftovers = fs::read_dir(manager.export_dir()).unwrap().count();
                assert_eq!(leftovers, 0);
            }
            Err(ExportError::NotCancellable(state)) => assert_eq!(state, ExportState::Completed),
            Err(e) => panic!("unexpected error: {}", e),
        }

        assert!(matches!(manager.cancel_export(&job.id), Err(ExportError::NotCancellable(_))));
        let history = manager.export_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, job.id);
        assert_eq!(
            manager.get_export_status(&job.id).unwrap().current_phase,
            current_phase(&history[0])
        );
    }

    #[test]
    fn test_phase_names() {
        let mut job = ExportJob {
            id: "x".to_string(),
            request: request(ExportFormat::Csv),
            status: ExportState::Running,
            progress: 0.3,
            start_time: ts(0, 0),
            end_time: None,
            file_path: None,
            file_size: 0,
            error: String::new(),
        };
        assert_eq!(current_phase(&job), "Reading data");
        job.progress = 0.95;
        assert_eq!(current_phase(&job), "Finalizing");
        job.status = ExportState::Failed;
        assert_eq!(current_phase(&job), "Failed");
    }
}
