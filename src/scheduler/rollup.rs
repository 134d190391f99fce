//! Rollup of raw test results into hourly and daily statistics.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::db::ResultStore;
use crate::probe::TestResult;

const HOUR_SECONDS: i64 = 3600;
const DAY_SECONDS: i64 = 86_400;

/// Aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hourly,
    Daily,
}

impl Period {
    pub fn seconds(&self) -> i64 {
        match self {
            Period::Hourly => HOUR_SECONDS,
            Period::Daily => DAY_SECONDS,
        }
    }

    /// Start of the window containing `dt`.
    pub fn window_start(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        truncate_to_window(dt, self.seconds())
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Hourly => f.write_str("hourly"),
            Period::Daily => f.write_str("daily"),
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" | "hour" => Ok(Period::Hourly),
            "daily" | "day" => Ok(Period::Daily),
            other => Err(format!("unknown period: {}", other)),
        }
    }
}

/// Statistics for one endpoint over one window. Latencies are in milliseconds
/// and cover successful tests only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub period: Period,
    #[serde(rename = "endpointID")]
    pub endpoint_id: String,
    pub region_name: String,
    pub test_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub std_dev_latency_ms: f64,
    pub availability_pct: f64,
}

/// Counts and latency moments of a set of results.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub test_count: usize,
    pub success_count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Population standard deviation.
    pub std_dev_ms: f64,
}

impl LatencyStats {
    pub fn failure_count(&self) -> usize {
        self.test_count - self.success_count
    }

    pub fn availability_pct(&self) -> f64 {
        if self.test_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.test_count as f64 * 100.0
    }
}

/// Summarize results. Latency moments come from successes only.
pub fn summarize<'a>(results: impl IntoIterator<Item = &'a TestResult>) -> LatencyStats {
    let mut stats = LatencyStats::default();
    let mut latencies = Vec::new();

    for r in results {
        stats.test_count += 1;
        if r.is_success() {
            latencies.push(r.latency_ms());
        }
    }
    stats.success_count = latencies.len();
    if latencies.is_empty() {
        return stats;
    }

    let n = latencies.len() as f64;
    let mean = latencies.iter().sum::<f64>() / n;
    let variance = latencies.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;

    stats.avg_ms = mean;
    stats.min_ms = latencies.iter().copied().fold(f64::INFINITY, f64::min);
    stats.max_ms = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    stats.std_dev_ms = variance.sqrt();
    stats
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    endpoint_id: String,
    period: Period,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Computes and caches per-endpoint aggregations from the result store.
pub struct Aggregator {
    store: Arc<ResultStore>,
    cache: RwLock<HashMap<CacheKey, AggregatedResult>>,
}

impl Aggregator {
    pub fn new(store: Arc<ResultStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The hour containing `at`.
    pub fn aggregate_hourly(&self, endpoint_id: &str, region: &str, at: DateTime<Utc>) -> AggregatedResult {
        let start = Period::Hourly.window_start(at);
        self.aggregate_range(endpoint_id, region, start, start + ChronoDuration::hours(1), Period::Hourly)
    }

    /// The UTC day containing `at`.
    pub fn aggregate_daily(&self, endpoint_id: &str, region: &str, at: DateTime<Utc>) -> AggregatedResult {
        let start = Period::Daily.window_start(at);
        self.aggregate_range(endpoint_id, region, start, start + ChronoDuration::days(1), Period::Daily)
    }

    /// Aggregate results with `start <= timestamp < end`.
    ///
    /// An empty window yields zeroed statistics, not an error.
    pub fn aggregate_range(
        &self,
        endpoint_id: &str,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: Period,
    ) -> AggregatedResult {
        let key = CacheKey {
            endpoint_id: endpoint_id.to_string(),
            period,
            start,
            end,
        };
        // Statistics depend only on the key; the region label is per caller.
        if let Some(mut hit) = self.read_cache(|cache| cache.get(&key).cloned()) {
            hit.region_name = region.to_string();
            return hit;
        }

        let results = self.fetch(endpoint_id, start, end);
        let stats = summarize(&results);
        let aggregated = AggregatedResult {
            start_time: start,
            end_time: end,
            period,
            endpoint_id: endpoint_id.to_string(),
            region_name: region.to_string(),
            test_count: stats.test_count,
            success_count: stats.success_count,
            failure_count: stats.failure_count(),
            avg_latency_ms: stats.avg_ms,
            min_latency_ms: stats.min_ms,
            max_latency_ms: stats.max_ms,
            std_dev_latency_ms: stats.std_dev_ms,
            availability_pct: stats.availability_pct(),
        };

        self.write_cache(|cache| {
            cache.insert(key, aggregated.clone());
        });
        aggregated
    }

    /// One hourly aggregation per hour from the hour of `start` through the hour of `end`.
    pub fn hourly_series(
        &self,
        endpoint_id: &str,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<AggregatedResult> {
        self.series(endpoint_id, region, start, end, Period::Hourly)
    }

    /// One daily aggregation per UTC day from the day of `start` through the day of `end`.
    pub fn daily_series(
        &self,
        endpoint_id: &str,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<AggregatedResult> {
        self.series(endpoint_id, region, start, end, Period::Daily)
    }

    /// Aggregations covering the last `hours` hours.
    pub fn recent(&self, endpoint_id: &str, region: &str, period: Period, hours: u32) -> Vec<AggregatedResult> {
        let end = Utc::now();
        let start = end - ChronoDuration::hours(i64::from(hours));
        self.series(endpoint_id, region, start, end, period)
    }

    fn series(
        &self,
        endpoint_id: &str,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: Period,
    ) -> Vec<AggregatedResult> {
        let step = ChronoDuration::seconds(period.seconds());
        let mut out = Vec::new();
        let mut bucket = period.window_start(start);
        while bucket <= end {
            out.push(self.aggregate_range(endpoint_id, region, bucket, bucket + step, period));
            bucket += step;
        }
        out
    }

    pub fn clear_cache(&self) {
        self.write_cache(|cache| cache.clear());
        debug!("Aggregation cache cleared");
    }

    /// Drop every cached aggregation of exactly this endpoint.
    pub fn invalidate_endpoint(&self, endpoint_id: &str) {
        self.write_cache(|cache| cache.retain(|key, _| key.endpoint_id != endpoint_id));
    }

    pub fn cached_entries(&self) -> usize {
        self.read_cache(|cache| cache.len())
    }

    /// Results of one endpoint in `[start, end)`, read day by day.
    fn fetch(&self, endpoint_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TestResult> {
        let mut results = Vec::new();
        if end <= start {
            return results;
        }

        let mut day = start.date_naive();
        // `end` is exclusive, so a window ending at midnight does not touch the next day.
        let last = (end - ChronoDuration::nanoseconds(1)).date_naive();
        while day <= last {
            match self.store.get_results(day) {
                Ok(day_results) => results.extend(day_results.into_iter().filter(|r| {
                    r.endpoint_id == endpoint_id && r.timestamp >= start && r.timestamp < end
                })),
                Err(e) => warn!("Aggregator: skipping {} for {}: {}", day, endpoint_id, e),
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        results
    }

    fn read_cache<T>(&self, f: impl FnOnce(&HashMap<CacheKey, AggregatedResult>) -> T) -> T {
        match self.cache.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_cache<T>(&self, f: impl FnOnce(&mut HashMap<CacheKey, AggregatedResult>) -> T) -> T {
        match self.cache.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Truncate a timestamp to the start of its window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeError, Protocol};
    use chrono::TimeZone;
    use std::time::Duration;

    fn success(endpoint: &str, ts: DateTime<Utc>, ms: u64) -> TestResult {
        TestResult::success(ts, endpoint, Protocol::Http, Duration::from_millis(ms), 0)
    }

    fn failure(endpoint: &str, ts: DateTime<Utc>) -> TestResult {
        TestResult::from_error(ts, endpoint, Protocol::Http, &ProbeError::Network("boom".into()))
    }

    fn setup() -> (tempfile::TempDir, Arc<ResultStore>, Aggregator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ResultStore::new(dir.path()).unwrap());
        let aggregator = Aggregator::new(store.clone());
        (dir, store, aggregator)
    }

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(truncate_to_window(dt, 60), Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap());
        assert_eq!(truncate_to_window(dt, HOUR_SECONDS), Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert_eq!(truncate_to_window(dt, DAY_SECONDS), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_summarize_statistics() {
        let ts = Utc.with_ymd_and_hms(2025, 10, 5, 10, 0, 0).unwrap();
        let results: Vec<_> = [10, 20, 30, 40, 50].iter().map(|ms| success("e", ts, *ms)).collect();
        let stats = summarize(&results);

        assert_eq!(stats.test_count, 5);
        assert_eq!(stats.success_count, 5);
        assert!((stats.avg_ms - 30.0).abs() < 1e-9);
        assert!((stats.min_ms - 10.0).abs() < 1e-9);
        assert!((stats.max_ms - 50.0).abs() < 1e-9);
        assert!((stats.std_dev_ms - 200f64.sqrt()).abs() < 1e-6);
        assert!((stats.availability_pct() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_failures_do_not_skew_latency() {
        let ts = Utc.with_ymd_and_hms(2025, 10, 5, 10, 0, 0).unwrap();
        let results = vec![success("e", ts, 10), success("e", ts, 30), failure("e", ts), failure("e", ts)];
        let stats = summarize(&results);

        assert_eq!(stats.failure_count(), 2);
        assert!((stats.avg_ms - 20.0).abs() < 1e-9);
        assert!((stats.min_ms - 10.0).abs() < 1e-9);
        assert!((stats.availability_pct() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_is_zeroed() {
        let (_dir, _store, aggregator) = setup();
        let at = Utc.with_ymd_and_hms(2025, 10, 5, 10, 30, 0).unwrap();
        let agg = aggregator.aggregate_hourly("nobody", "EU", at);

        assert_eq!(agg.test_count, 0);
        assert_eq!(agg.avg_latency_ms, 0.0);
        assert_eq!(agg.availability_pct, 0.0);
        assert_eq!(agg.start_time, Utc.with_ymd_and_hms(2025, 10, 5, 10, 0, 0).unwrap());
        assert_eq!(agg.end_time, Utc.with_ymd_and_hms(2025, 10, 5, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_hourly_window_filters_endpoint_and_time() {
        let (_dir, store, aggregator) = setup();
        let base = Utc.with_ymd_and_hms(2025, 10, 5, 10, 0, 0).unwrap();
        for (i, ms) in [10u64, 20, 30, 40, 50].iter().enumerate() {
            store
                .store_test_result(&success("EU-web", base + ChronoDuration::minutes(i as i64 * 10), *ms))
                .unwrap();
        }
        // Other endpoint, and the next hour's first instant.
        store.store_test_result(&success("EU-web2", base, 999)).unwrap();
        store
            .store_test_result(&success("EU-web", base + ChronoDuration::hours(1), 999))
            .unwrap();

        let agg = aggregator.aggregate_hourly("EU-web", "EU", base + ChronoDuration::minutes(5));
        assert_eq!(agg.test_count, 5);
        assert!((agg.avg_latency_ms - 30.0).abs() < 1e-9);
        assert!((agg.max_latency_ms - 50.0).abs() < 1e-9);
        assert!((agg.availability_pct - 100.0).abs() < 1e-9);
        assert_eq!(agg.region_name, "EU");
    }

    #[test]
    fn test_daily_window_spans_one_utc_day() {
        let (_dir, store, aggregator) = setup();
        let day = Utc.with_ymd_and_hms(2025, 10, 5, 0, 0, 0).unwrap();
        store.store_test_result(&success("e", day, 10)).unwrap();
        store
            .store_test_result(&success("e", day + ChronoDuration::hours(23), 20))
            .unwrap();
        store.store_test_result(&success("e", day + ChronoDuration::days(1), 30)).unwrap();

        let agg = aggregator.aggregate_daily("e", "r", day + ChronoDuration::hours(12));
        assert_eq!(agg.test_count, 2);
        assert_eq!(agg.period, Period::Daily);
    }

    #[test]
    fn test_cached_window_reports_callers_region() {
        let (_dir, store, aggregator) = setup();
        let base = Utc.with_ymd_and_hms(2025, 10, 5, 10, 0, 0).unwrap();
        store.store_test_result(&success("EU-web", base, 10)).unwrap();

        assert_eq!(aggregator.aggregate_hourly("EU-web", "EU", base).region_name, "EU");
        let again = aggregator.aggregate_hourly("EU-web", "Europe", base);
        assert_eq!(again.region_name, "Europe");
        assert_eq!(again.test_count, 1);
        assert_eq!(aggregator.cached_entries(), 1);
    }

    #[test]
    fn test_cache_and_invalidation() {
        let (_dir, store, aggregator) = setup();
        let base = Utc.with_ymd_and_hms(2025, 10, 5, 10, 0, 0).unwrap();
        store.store_test_result(&success("EU-web", base, 10)).unwrap();

        assert_eq!(aggregator.aggregate_hourly("EU-web", "EU", base).test_count, 1);
        aggregator.aggregate_hourly("EU-web2", "EU", base);
        assert_eq!(aggregator.cached_entries(), 2);

        store.store_test_result(&success("EU-web", base, 20)).unwrap();
        // Still the cached value until invalidated.
        assert_eq!(aggregator.aggregate_hourly("EU-web", "EU", base).test_count, 1);

        aggregator.invalidate_endpoint("EU-web");
        assert_eq!(aggregator.cached_entries(), 1);
        assert_eq!(aggregator.aggregate_hourly("EU-web", "EU", base).test_count, 2);

        aggregator.clear_cache();
        assert_eq!(aggregator.cached_entries(), 0);
    }

    #[test]
    fn test_series_includes_end_bucket() {
        let (_dir, _store, aggregator) = setup();
        let start = Utc.with_ymd_and_hms(2025, 10, 5, 10, 15, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 10, 5, 13, 0, 0).unwrap();

        let hourly = aggregator.hourly_series("e", "r", start, end);
        assert_eq!(hourly.len(), 4);
        assert_eq!(hourly[0].start_time, Utc.with_ymd_and_hms(2025, 10, 5, 10, 0, 0).unwrap());
        assert_eq!(hourly[3].start_time, end);

        let daily = aggregator.daily_series("e", "r", start, start + ChronoDuration::days(2));
        assert_eq!(daily.len(), 3);
    }

    #[test]
    fn test_period_parsing() {
        assert_eq!("hourly".parse::<Period>().unwrap(), Period::Hourly);
        assert_eq!("DAILY".parse::<Period>().unwrap(), Period::Daily);
        assert!("weekly".parse::<Period>().is_err());
        assert_eq!(serde_json::to_value(Period::Hourly).unwrap(), "hourly");
    }
}
