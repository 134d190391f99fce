//! Detailed execution: per-phase timings and a trail of intermediate steps.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{run_probe, Cancellation, Measurement, ProbeError, Protocol, TestConfig, TestResult};

/// Phases a tester can time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DnsLookup,
    Connection,
    FirstByte,
    Transfer,
}

/// Optional per-phase durations. A phase a protocol has no notion of stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    #[serde(
        rename = "dnsLookupTimeMs",
        with = "super::optional_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dns_lookup: Option<Duration>,
    #[serde(
        rename = "connectionTimeMs",
        with = "super::optional_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection: Option<Duration>,
    #[serde(
        rename = "firstByteTimeMs",
        with = "super::optional_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub first_byte: Option<Duration>,
    #[serde(
        rename = "transferTimeMs",
        with = "super::optional_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub transfer: Option<Duration>,
}

impl PhaseTimings {
    fn set(&mut self, phase: Phase, d: Duration) {
        let slot = match phase {
            Phase::DnsLookup => &mut self.dns_lookup,
            Phase::Connection => &mut self.connection,
            Phase::FirstByte => &mut self.first_byte,
            Phase::Transfer => &mut self.transfer,
        };
        *slot = Some(d);
    }
}

/// A [`TestResult`] plus execution diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedTestResult {
    #[serde(flatten)]
    pub result: TestResult,
    #[serde(rename = "executionTimeMs", with = "super::latency_ms")]
    pub execution_time: Duration,
    #[serde(flatten)]
    pub timings: PhaseTimings,
    #[serde(rename = "intermediateSteps", default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Default)]
struct TraceLog {
    timings: PhaseTimings,
    steps: Vec<String>,
}

/// Recorder handed to a tester. The disabled form drops everything.
#[derive(Debug, Clone, Default)]
pub(crate) struct Trace {
    log: Option<Arc<Mutex<TraceLog>>>,
}

impl Trace {
    pub fn disabled() -> Self {
        Self::default()
    }

    fn enabled() -> Self {
        Self {
            log: Some(Arc::new(Mutex::new(TraceLog::default()))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.log.is_some()
    }

    pub fn step(&self, msg: impl Into<String>) {
        if let Some(log) = &self.log {
            if let Ok(mut log) = log.lock() {
                log.steps.push(msg.into());
            }
        }
    }

    pub fn phase(&self, phase: Phase, d: Duration) {
        if let Some(log) = &self.log {
            if let Ok(mut log) = log.lock() {
                log.timings.set(phase, d);
            }
        }
    }

    fn take(&self) -> (PhaseTimings, Vec<String>) {
        match &self.log {
            Some(log) => match log.lock() {
                Ok(mut log) => {
                    let log = std::mem::take(&mut *log);
                    (log.timings, log.steps)
                }
                Err(_) => Default::default(),
            },
            None => Default::default(),
        }
    }
}

/// Detailed counterpart of [`run_probe`]: same outcome, plus timings and steps.
pub(crate) async fn run_detailed<F, Fut>(
    protocol: Protocol,
    validation: Result<(), ProbeError>,
    cancel: &Cancellation,
    config: &TestConfig,
    probe: F,
) -> DetailedTestResult
where
    F: FnOnce(Trace) -> Fut,
    Fut: Future<Output = Result<Measurement, ProbeError>>,
{
    let started = Instant::now();
    let trace = Trace::enabled();
    match &validation {
        Ok(()) => trace.step(format!("validated {} configuration for {}", protocol, config.address)),
        Err(e) => trace.step(format!("configuration rejected: {}", e)),
    }

    let probe_trace = trace.clone();
    let result = run_probe(protocol, validation, cancel, config, move || probe(probe_trace)).await;

    trace.step(match result.status {
        super::TestStatus::Success => format!("completed in {:.3} ms", result.latency_ms()),
        status => format!("finished with status {}: {}", status, result.error),
    });
    let (timings, steps) = trace.take();

    DetailedTestResult {
        result,
        execution_time: started.elapsed(),
        timings,
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::TestStatus;

    #[tokio::test]
    async fn test_detailed_records_phases_and_steps() {
        let config = TestConfig::new("ep", "example.com:80", Duration::from_secs(1), Protocol::Tcp);
        let detailed = run_detailed(Protocol::Tcp, Ok(()), &Cancellation::never(), &config, |trace| async move {
            trace.phase(Phase::DnsLookup, Duration::from_millis(2));
            trace.step("connected");
            Ok(Measurement::new(Duration::from_millis(5), 0))
        })
        .await;

        assert_eq!(detailed.result.status, TestStatus::Success);
        assert_eq!(detailed.timings.dns_lookup, Some(Duration::from_millis(2)));
        assert_eq!(detailed.timings.connection, None);
        assert!(detailed.steps.iter().any(|s| s == "connected"));
        assert!(detailed.steps.len() >= 3);

        let json = serde_json::to_value(&detailed).unwrap();
        assert_eq!(json["dnsLookupTimeMs"], 2.0);
        assert_eq!(json["status"], "success");
        assert!(json.get("connectionTimeMs").is_none());
    }

    #[tokio::test]
    async fn test_detailed_keeps_validation_error() {
        let config = TestConfig::new("ep", "", Duration::from_secs(1), Protocol::Tcp);
        let detailed = run_detailed(
            Protocol::Tcp,
            Err(ProbeError::invalid("address is required")),
            &Cancellation::never(),
            &config,
            |_| async { Ok(Measurement::new(Duration::ZERO, 0)) },
        )
        .await;
        assert_eq!(detailed.result.status, TestStatus::Error);
        assert!(detailed.steps[0].contains("rejected"));
    }

    #[test]
    fn test_disabled_trace_records_nothing() {
        let trace = Trace::disabled();
        trace.step("ignored");
        trace.phase(Phase::Connection, Duration::from_millis(1));
        assert!(!trace.is_enabled());
        let (timings, steps) = trace.take();
        assert_eq!(timings, PhaseTimings::default());
        assert!(steps.is_empty());
    }
}
