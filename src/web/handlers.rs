//! HTTP request handlers.

use super::AppState;
use crate::config::{ConfigError, MonitorConfig};
use crate::db::StoreError;
use crate::export::{ExportError, ExportJob, ExportRequest};
use crate::scheduler::{Period, RetentionError, RetentionPolicy, SchedulerError, SchedulerStatus};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

const MAX_AGGREGATION_HOURS: u32 = 24 * 30;
const MAX_RESULTS_SPAN_DAYS: i64 = 366;

// ============================================================================
// Errors
// ============================================================================

/// An error rendered as `{"error": "..."}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request failed: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::UnknownRegion(_) | SchedulerError::UnknownEndpoint { .. } => {
                ApiError::not_found(e.to_string())
            }
            SchedulerError::Config(e) => e.into(),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Invalid(_) | ConfigError::Parse(_) => ApiError::bad_request(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConfigNotFound(_) => ApiError::not_found(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<RetentionError> for ApiError {
    fn from(e: RetentionError) -> Self {
        match e {
            RetentionError::InvalidPolicy(_) => ApiError::bad_request(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        match e {
            ExportError::InvalidRequest(_) | ExportError::NotCancellable(_) => {
                ApiError::bad_request(e.to_string())
            }
            ExportError::NotFound(_) => ApiError::not_found(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

/// Run store-bound work on the blocking pool.
async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(ApiError::internal(format!("background task failed: {}", e))),
    }
}

// ============================================================================
// API: Monitoring
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub monitoring: SchedulerStatus,
    pub auto_cleanup_running: bool,
}

fn status_response(state: &AppState) -> Json<StatusResponse> {
    Json(StatusResponse {
        monitoring: state.scheduler.status(),
        auto_cleanup_running: state.retention.is_running(),
    })
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    status_response(&state)
}

pub async fn handle_start_monitoring(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.start();
    status_response(&state)
}

pub async fn handle_stop_monitoring(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.stop().await;
    status_response(&state)
}

// ============================================================================
// API: Configuration
// ============================================================================

pub async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.config_snapshot().as_ref().clone())
}

/// Replace the monitoring configuration, persist it and snapshot it into the store.
pub async fn handle_update_config(
    State(state): State<AppState>,
    Json(config): Json<MonitorConfig>,
) -> Result<Json<MonitorConfig>, ApiError> {
    state.scheduler.update_config(config.clone())?;

    let path = state.config.config_path.clone();
    let store = Arc::clone(&state.store);
    let saved = config.clone();
    blocking(move || {
        saved.save(&path)?;
        store.save_configuration(&saved)?;
        Ok::<_, ApiError>(())
    })
    .await?;

    Ok(Json(config))
}

// ============================================================================
// API: Manual tests
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TestQuery {
    #[serde(default)]
    pub detailed: bool,
}

pub async fn handle_test_endpoint(
    State(state): State<AppState>,
    Path((region, endpoint)): Path<(String, String)>,
    Query(query): Query<TestQuery>,
) -> Result<Response, ApiError> {
    let response = if query.detailed {
        Json(state.scheduler.run_endpoint_test_detailed(&region, &endpoint).await?).into_response()
    } else {
        Json(state.scheduler.run_endpoint_test(&region, &endpoint).await?).into_response()
    };
    Ok(response)
}

pub async fn handle_test_region(
    State(state): State<AppState>,
    Path(region): Path<String>,
    Query(query): Query<TestQuery>,
) -> Result<Response, ApiError> {
    let response = if query.detailed {
        Json(state.scheduler.run_region_tests_detailed(&region).await?).into_response()
    } else {
        Json(state.scheduler.run_region_tests(&region).await?).into_response()
    };
    Ok(response)
}

pub async fn handle_test_all(
    State(state): State<AppState>,
    Query(query): Query<TestQuery>,
) -> impl IntoResponse {
    if query.detailed {
        Json(state.scheduler.run_all_tests_detailed().await).into_response()
    } else {
        Json(state.scheduler.run_all_tests().await).into_response()
    }
}

// ============================================================================
// API: Results
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// Parse an RFC3339 instant or a bare date. A bare end date covers the whole day.
fn parse_bound(value: &str, is_end: bool) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid date or time: {}", value)))?;
    let time = if is_end {
        NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN)
    } else {
        NaiveTime::MIN
    };
    Ok(date.and_time(time).and_utc())
}

pub async fn handle_get_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> Result<Response, ApiError> {
    let store = Arc::clone(&state.store);

    if let Some(date) = query.date {
        let results = blocking(move || store.get_results(date)).await?;
        return Ok(Json(results).into_response());
    }

    let (Some(start), Some(end)) = (query.start.as_deref(), query.end.as_deref()) else {
        return Err(ApiError::bad_request("either date or both start and end are required"));
    };
    let start = parse_bound(start, false)?;
    let end = parse_bound(end, true)?;
    if start > end {
        return Err(ApiError::bad_request("start must not be after end"));
    }
    if (end.date_naive() - start.date_naive()).num_days() >= MAX_RESULTS_SPAN_DAYS {
        return Err(ApiError::bad_request(format!(
            "range must not span more than {} days",
            MAX_RESULTS_SPAN_DAYS
        )));
    }
    let results = blocking(move || store.get_results_range(start, end)).await?;
    Ok(Json(results).into_response())
}

// ============================================================================
// API: Aggregations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AggregationQuery {
    pub endpoint: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub hours: Option<u32>,
}

pub async fn handle_get_aggregations(
    State(state): State<AppState>,
    Query(query): Query<AggregationQuery>,
) -> Result<Response, ApiError> {
    let period = match query.period.as_deref() {
        Some(p) => p.parse::<Period>().map_err(ApiError::bad_request)?,
        None => Period::Hourly,
    };
    let hours = query.hours.unwrap_or(24);
    if !(1..=MAX_AGGREGATION_HOURS).contains(&hours) {
        return Err(ApiError::bad_request(format!(
            "hours must be between 1 and {}",
            MAX_AGGREGATION_HOURS
        )));
    }

    let region = match query.region {
        Some(region) => region,
        None => state
            .scheduler
            .config_snapshot()
            .region_of(&query.endpoint)
            .map(str::to_string)
            .unwrap_or_default(),
    };

    let aggregator = Arc::clone(&state.aggregator);
    let endpoint = query.endpoint;
    let series = blocking(move || {
        Ok::<_, ApiError>(aggregator.recent(&endpoint, &region, period, hours))
    })
    .await?;
    Ok(Json(series).into_response())
}

// ============================================================================
// API: Retention
// ============================================================================

pub async fn handle_get_retention_policy(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.retention.policy())
}

pub async fn handle_update_retention_policy(
    State(state): State<AppState>,
    Json(policy): Json<RetentionPolicy>,
) -> Result<Json<RetentionPolicy>, ApiError> {
    state.retention.update_policy(policy)?;
    Ok(Json(state.retention.policy()))
}

pub async fn handle_manual_cleanup(State(state): State<AppState>) -> Result<Response, ApiError> {
    let retention = Arc::clone(&state.retention);
    let report = blocking(move || Ok::<_, ApiError>(retention.trigger_manual_cleanup())).await?;
    Ok(Json(report).into_response())
}

pub async fn handle_cleanup_history(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.retention.cleanup_history())
}

pub async fn handle_storage_stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let retention = Arc::clone(&state.retention);
    let stats = blocking(move || retention.storage_stats()).await?;
    Ok(Json(stats).into_response())
}

pub async fn handle_validate_partition(
    State(state): State<AppState>,
    Path(date): Path<NaiveDate>,
) -> Result<Response, ApiError> {
    let store = Arc::clone(&state.store);
    let path = store.partition_path(date);
    if !path.exists() {
        return Err(ApiError::not_found(format!("no data for {}", date)));
    }
    let verdict = blocking(move || Ok::<_, ApiError>(store.validate_data_file(&path))).await?;
    let body = match verdict {
        Ok(()) => json!({ "date": date, "valid": true }),
        Err(e) => json!({ "date": date, "valid": false, "reason": e.to_string() }),
    };
    Ok(Json(body).into_response())
}

pub async fn handle_recover_partition(
    State(state): State<AppState>,
    Path(date): Path<NaiveDate>,
) -> Result<Response, ApiError> {
    let store = Arc::clone(&state.store);
    let path = store.partition_path(date);
    if !path.exists() {
        return Err(ApiError::not_found(format!("no data for {}", date)));
    }
    let report = blocking(move || store.recover_data_file(&path)).await?;
    state.aggregator.clear_cache();
    Ok(Json(report).into_response())
}

// ============================================================================
// API: Exports
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ExportList {
    pub active: Vec<ExportJob>,
    pub history: Vec<ExportJob>,
}

pub async fn handle_create_export(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Result<Response, ApiError> {
    let job = state
        .exports
        .create_export(request, state.scheduler.config_snapshot())?;
    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}

pub async fn handle_list_exports(State(state): State<AppState>) -> impl IntoResponse {
    Json(ExportList {
        active: state.exports.active_jobs(),
        history: state.exports.export_history(),
    })
}

pub async fn handle_get_export(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.exports.get_export_status(&id)?).into_response())
}

pub async fn handle_cancel_export(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.exports.cancel_export(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
