//! Scheduler module for running tests on an interval and on demand.

mod retention;
mod rollup;

pub use retention::*;
pub use rollup::*;

use crate::config::{ConfigError, Endpoint, MonitorConfig};
use crate::db::ResultStore;
use crate::probe::{run_test, CancelHandle, Cancellation, DetailedTestResult, TestConfig, TestResult, Tester};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default ceiling on concurrently running tests.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("unknown region: {0}")]
    UnknownRegion(String),
    #[error("unknown endpoint {endpoint} in region {region}")]
    UnknownEndpoint { region: String, endpoint: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Snapshot of the scheduler for the status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_seconds: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub active_tests: usize,
    pub completed_tests: u64,
    pub endpoint_count: usize,
}

/// Anything carrying a [`TestResult`] that gets persisted.
trait Recorded: Send + 'static {
    fn result(&self) -> &TestResult;
}

impl Recorded for TestResult {
    fn result(&self) -> &TestResult {
        self
    }
}

impl Recorded for DetailedTestResult {
    fn result(&self) -> &TestResult {
        &self.result
    }
}

async fn basic(cancel: Cancellation, config: TestConfig) -> TestResult {
    run_test(&cancel, &config).await
}

async fn detailed(cancel: Cancellation, config: TestConfig) -> DetailedTestResult {
    Tester::for_protocol(config.protocol())
        .execute_detailed(&cancel, &config)
        .await
}

/// Counts a running test until dropped, including when its task is aborted.
struct ActiveTest<'a>(&'a AtomicUsize);

impl<'a> ActiveTest<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveTest<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared between the scheduler handle and its run loop.
struct Engine {
    store: Arc<ResultStore>,
    aggregator: Option<Arc<Aggregator>>,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    completed: AtomicU64,
    runs: Mutex<RunTimes>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunTimes {
    last: Option<DateTime<Utc>>,
    next: Option<DateTime<Utc>>,
}

impl Engine {
    fn runs(&self) -> MutexGuard<'_, RunTimes> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn schedule_next(&self, after: Duration) {
        self.runs().next = chrono::Duration::from_std(after).ok().map(|d| Utc::now() + d);
    }

    /// Run one test under the endpoint's id, then persist the result.
    async fn run_one<T, F, Fut>(&self, cancel: Cancellation, region: &str, endpoint: &Endpoint, job: F) -> T
    where
        T: Recorded,
        F: FnOnce(Cancellation, TestConfig) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut config = endpoint.test_config();
        config.name = endpoint.id(region);

        let active = ActiveTest::enter(&self.active);
        let outcome = job(cancel, config).await;
        drop(active);
        self.completed.fetch_add(1, Ordering::SeqCst);

        self.record(outcome.result()).await;
        outcome
    }

    async fn record(&self, result: &TestResult) {
        debug!(
            "Test {} finished: {} in {:.2}ms",
            result.endpoint_id,
            result.status,
            result.latency_ms()
        );

        let store = Arc::clone(&self.store);
        let owned = result.clone();
        match tokio::task::spawn_blocking(move || store.store_test_result(&owned)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to store result for {}: {}", result.endpoint_id, e),
            Err(e) => error!("Store task for {} failed: {}", result.endpoint_id, e),
        }

        if let Some(aggregator) = &self.aggregator {
            aggregator.invalidate_endpoint(&result.endpoint_id);
        }
    }

    /// Launch one task per target under the concurrency ceiling.
    ///
    /// No new tests start once `cancel` fires; running ones unwind through their own token.
    async fn fan_out<T, F, Fut>(
        self: &Arc<Self>,
        cancel: &Cancellation,
        targets: Vec<(String, Endpoint)>,
        job: F,
    ) -> Vec<T>
    where
        T: Recorded,
        F: Fn(Cancellation, TestConfig) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for (region, endpoint) in targets {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Batch cancelled, not launching remaining tests");
                    break;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let engine = Arc::clone(self);
            let cancel = cancel.clone();
            let job = job.clone();
            set.spawn(async move {
                let _permit = permit;
                engine.run_one(cancel, &region, &endpoint, job).await
            });
        }

        let mut outcomes = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Test task failed: {}", e),
            }
        }
        outcomes
    }

    async fn run_batch(self: &Arc<Self>, cancel: &Cancellation, config: &MonitorConfig) {
        let targets = all_targets(config);
        self.runs().last = Some(Utc::now());
        info!("Running scheduled tests for {} endpoint(s)", targets.len());

        let results = self.fan_out(cancel, targets, basic).await;
        let ok = results.iter().filter(|r| r.is_success()).count();
        info!("Scheduled run finished: {}/{} succeeded", ok, results.len());
    }
}

fn all_targets(config: &MonitorConfig) -> Vec<(String, Endpoint)> {
    config
        .endpoints()
        .map(|(region, endpoint)| (region.to_string(), endpoint.clone()))
        .collect()
}

struct RunHandle {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

/// Runs every configured endpoint on the configured interval.
pub struct Scheduler {
    engine: Arc<Engine>,
    config_tx: watch::Sender<Arc<MonitorConfig>>,
    run: Mutex<Option<RunHandle>>,
}

impl Scheduler {
    /// Create a stopped scheduler. Stored results invalidate `aggregator`'s cache when given.
    pub fn new(
        store: Arc<ResultStore>,
        config: MonitorConfig,
        max_concurrent: usize,
        aggregator: Option<Arc<Aggregator>>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let (config_tx, _) = watch::channel(Arc::new(config));

        Ok(Self {
            engine: Arc::new(Engine {
                store,
                aggregator,
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                runs: Mutex::new(RunTimes::default()),
            }),
            config_tx,
            run: Mutex::new(None),
        })
    }

    /// Start the run loop. A batch runs immediately. Does nothing if already running.
    pub fn start(&self) {
        let mut run = self.lock_run();
        if run.is_some() {
            debug!("Scheduler already running");
            return;
        }

        let (handle, cancel) = Cancellation::pair();
        let config_rx = self.config_tx.subscribe();
        let task = tokio::spawn(run_loop(Arc::clone(&self.engine), cancel, config_rx));
        *run = Some(RunHandle {
            cancel: handle,
            task,
        });

        let config = self.config_snapshot();
        info!(
            "Scheduler started: {} endpoint(s) every {} minute(s)",
            config.endpoint_count(),
            config.settings.test_interval_minutes
        );
    }

    /// Stop the run loop and cancel in-flight tests. Does nothing if stopped.
    pub async fn stop(&self) {
        let Some(mut handle) = self.lock_run().take() else {
            return;
        };

        handle.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle.task).await.is_err() {
            warn!("Scheduler did not stop within {:?}, aborting", STOP_TIMEOUT);
            handle.task.abort();
        }
        self.engine.runs().next = None;
        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lock_run().is_some()
    }

    pub fn status(&self) -> SchedulerStatus {
        let config = self.config_snapshot();
        let running = self.is_running();
        let runs = *self.engine.runs();

        SchedulerStatus {
            running,
            interval_seconds: config.test_interval().as_secs(),
            last_run: runs.last,
            next_run: if running { runs.next } else { None },
            active_tests: self.engine.active.load(Ordering::SeqCst),
            completed_tests: self.engine.completed.load(Ordering::SeqCst),
            endpoint_count: config.endpoint_count(),
        }
    }

    pub fn config_snapshot(&self) -> Arc<MonitorConfig> {
        Arc::clone(&self.config_tx.borrow())
    }

    /// Replace the configuration. A running loop picks it up on its next batch and
    /// restarts its ticker only if the interval changed.
    pub fn update_config(&self, config: MonitorConfig) -> Result<(), SchedulerError> {
        config.validate()?;
        info!(
            "Configuration updated: {} endpoint(s), interval {} minute(s)",
            config.endpoint_count(),
            config.settings.test_interval_minutes
        );
        self.config_tx.send_replace(Arc::new(config));
        Ok(())
    }

    pub async fn run_endpoint_test(&self, region: &str, endpoint: &str) -> Result<TestResult, SchedulerError> {
        let (region, endpoint) = self.lookup_endpoint(region, endpoint)?;
        let _permit = self.engine.semaphore.acquire().await.ok();
        Ok(self
            .engine
            .run_one(Cancellation::never(), &region, &endpoint, basic)
            .await)
    }

    pub async fn run_endpoint_test_detailed(
        &self,
        region: &str,
        endpoint: &str,
    ) -> Result<DetailedTestResult, SchedulerError> {
        let (region, endpoint) = self.lookup_endpoint(region, endpoint)?;
        let _permit = self.engine.semaphore.acquire().await.ok();
        Ok(self
            .engine
            .run_one(Cancellation::never(), &region, &endpoint, detailed)
            .await)
    }

    pub async fn run_region_tests(&self, region: &str) -> Result<Vec<TestResult>, SchedulerError> {
        let targets = self.region_targets(region)?;
        info!("Running manual tests for region {}", region);
        Ok(self.engine.fan_out(&Cancellation::never(), targets, basic).await)
    }

    pub async fn run_region_tests_detailed(&self, region: &str) -> Result<Vec<DetailedTestResult>, SchedulerError> {
        let targets = self.region_targets(region)?;
        info!("Running detailed manual tests for region {}", region);
        Ok(self.engine.fan_out(&Cancellation::never(), targets, detailed).await)
    }

    pub async fn run_all_tests(&self) -> Vec<TestResult> {
        let targets = all_targets(&self.config_snapshot());
        info!("Running manual tests for {} endpoint(s)", targets.len());
        self.engine.fan_out(&Cancellation::never(), targets, basic).await
    }

    pub async fn run_all_tests_detailed(&self) -> Vec<DetailedTestResult> {
        let targets = all_targets(&self.config_snapshot());
        info!("Running detailed manual tests for {} endpoint(s)", targets.len());
        self.engine.fan_out(&Cancellation::never(), targets, detailed).await
    }

    fn lookup_endpoint(&self, region: &str, endpoint: &str) -> Result<(String, Endpoint), SchedulerError> {
        let config = self.config_snapshot();
        let found = config
            .regions
            .get(region)
            .ok_or_else(|| SchedulerError::UnknownRegion(region.to_string()))?
            .endpoints
            .iter()
            .find(|e| e.name == endpoint)
            .ok_or_else(|| SchedulerError::UnknownEndpoint {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            })?;
        Ok((region.to_string(), found.clone()))
    }

    fn region_targets(&self, region: &str) -> Result<Vec<(String, Endpoint)>, SchedulerError> {
        let config = self.config_snapshot();
        let found = config
            .regions
            .get(region)
            .ok_or_else(|| SchedulerError::UnknownRegion(region.to_string()))?;
        Ok(found
            .endpoints
            .iter()
            .map(|e| (region.to_string(), e.clone()))
            .collect())
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<RunHandle>> {
        match self.run.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_loop(
    engine: Arc<Engine>,
    cancel: Cancellation,
    mut config_rx: watch::Receiver<Arc<MonitorConfig>>,
) {
    let mut period = config_rx.borrow_and_update().test_interval();
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = config_rx.borrow_and_update().test_interval();
                if next != period {
                    info!("Test interval changed from {:?} to {:?}", period, next);
                    period = next;
                    ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    engine.schedule_next(period);
                }
            }
            _ = ticker.tick() => {
                let config = Arc::clone(&config_rx.borrow());
                engine.run_batch(&cancel, &config).await;
                engine.schedule_next(period);
            }
        }
    }
    debug!("Scheduler loop exited");
}
