//! Probe module for network monitoring.
//!
//! Supports ICMP, TCP, UDP and HTTP probes. Every tester implements the
//! [`NetworkTest`] capability and is dispatched through [`Tester`].

mod detailed;
mod http;
mod icmp;
mod tcp;
mod udp;

pub use detailed::*;
pub use http::*;
pub use icmp::*;
pub use tcp::*;
pub use udp::*;

pub(crate) use detailed::{run_detailed, Trace};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Probe error types.
///
/// Each variant maps onto exactly one [`TestStatus`], see [`ProbeError::status`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("{0}")]
    Validation(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe cancelled before completion")]
    Cancelled,
    #[error("{0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    pub fn status(&self) -> TestStatus {
        match self {
            ProbeError::Validation(_) => TestStatus::Error,
            ProbeError::Timeout(_) | ProbeError::Cancelled => TestStatus::Timeout,
            ProbeError::Network(_) | ProbeError::Command(_) => TestStatus::Failed,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ProbeError::Validation(msg.into())
    }
}

/// Transport protocol of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Icmp => "ICMP",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ICMP" | "PING" => Ok(Protocol::Icmp),
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "HTTP" | "HTTPS" => Ok(Protocol::Http),
            other => Err(ProbeError::invalid(format!("unknown protocol: {}", other))),
        }
    }
}

/// Outcome classification of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Success,
    Failed,
    Timeout,
    Error,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Success => "success",
            TestStatus::Failed => "failed",
            TestStatus::Timeout => "timeout",
            TestStatus::Error => "error",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-specific options. The variant decides the protocol of a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "UPPERCASE")]
pub enum ProbeOptions {
    Icmp(IcmpOptions),
    Tcp(TcpOptions),
    Udp(UdpOptions),
    Http(HttpOptions),
}

impl ProbeOptions {
    pub fn default_for(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Icmp => ProbeOptions::Icmp(IcmpOptions::default()),
            Protocol::Tcp => ProbeOptions::Tcp(TcpOptions::default()),
            Protocol::Udp => ProbeOptions::Udp(UdpOptions::default()),
            Protocol::Http => ProbeOptions::Http(HttpOptions::default()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ProbeOptions::Icmp(_) => Protocol::Icmp,
            ProbeOptions::Tcp(_) => Protocol::Tcp,
            ProbeOptions::Udp(_) => Protocol::Udp,
            ProbeOptions::Http(_) => Protocol::Http,
        }
    }

    pub fn icmp(&self) -> Option<&IcmpOptions> {
        match self {
            ProbeOptions::Icmp(o) => Some(o),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<&TcpOptions> {
        match self {
            ProbeOptions::Tcp(o) => Some(o),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpOptions> {
        match self {
            ProbeOptions::Udp(o) => Some(o),
            _ => None,
        }
    }

    pub fn http(&self) -> Option<&HttpOptions> {
        match self {
            ProbeOptions::Http(o) => Some(o),
            _ => None,
        }
    }
}

/// Parameters of one test execution. Built per call, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig {
    pub name: String,
    pub address: String,
    pub timeout: Duration,
    pub options: ProbeOptions,
}

impl TestConfig {
    /// Create a config with the protocol's default options.
    pub fn new(name: &str, address: &str, timeout: Duration, protocol: Protocol) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            timeout,
            options: ProbeOptions::default_for(protocol),
        }
    }

    pub fn with_options(mut self, options: ProbeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.options.protocol()
    }
}

/// The outcome of a single test. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub timestamp: DateTime<Utc>,
    pub endpoint_id: String,
    pub protocol: Protocol,
    /// Only meaningful when `status` is success.
    #[serde(rename = "latencyInMs", with = "latency_ms")]
    pub latency: Duration,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(rename = "responseSize", default, skip_serializing_if = "is_zero")]
    pub response_size: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl TestResult {
    pub fn success(
        timestamp: DateTime<Utc>,
        endpoint_id: &str,
        protocol: Protocol,
        latency: Duration,
        response_size: u64,
    ) -> Self {
        Self {
            timestamp,
            endpoint_id: endpoint_id.to_string(),
            protocol,
            latency,
            status: TestStatus::Success,
            error: String::new(),
            response_size,
        }
    }

    /// Build a non-success result. The error text is never empty.
    pub fn from_error(
        timestamp: DateTime<Utc>,
        endpoint_id: &str,
        protocol: Protocol,
        err: &ProbeError,
    ) -> Self {
        let mut error = err.to_string();
        if error.is_empty() {
            error = format!("{} probe {}", protocol, err.status());
        }
        Self {
            timestamp,
            endpoint_id: endpoint_id.to_string(),
            protocol,
            latency: Duration::ZERO,
            status: err.status(),
            error,
            response_size: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Success
    }

    /// Latency in fractional milliseconds.
    pub fn latency_ms(&self) -> f64 {
        duration_to_ms(self.latency)
    }
}

pub(crate) fn duration_to_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

pub(crate) fn ms_to_duration(ms: f64) -> Option<Duration> {
    if ms.is_finite() && ms >= 0.0 {
        Some(Duration::from_nanos((ms * 1_000_000.0).round() as u64))
    } else {
        None
    }
}

/// Serde adapter storing a [`Duration`] as fractional milliseconds.
pub(crate) mod latency_ms {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(super::duration_to_ms(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        super::ms_to_duration(ms).ok_or_else(|| D::Error::custom("latency must be a non-negative number"))
    }
}

/// Same as [`latency_ms`] for optional durations.
pub(crate) mod optional_ms {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&super::duration_to_ms(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(ms) => super::ms_to_duration(ms)
                .map(Some)
                .ok_or_else(|| D::Error::custom("duration must be a non-negative number")),
            None => Ok(None),
        }
    }
}

/// Sending half of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half of a cancellation signal, cheap to clone into every test.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn pair() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancellation { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Cancellation { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires. Pends forever if the handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What a successful protocol attempt measured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Measurement {
    pub latency: Duration,
    pub response_size: u64,
}

impl Measurement {
    pub fn new(latency: Duration, response_size: u64) -> Self {
        Self {
            latency,
            response_size,
        }
    }
}

/// The capability shared by every protocol tester.
pub trait NetworkTest: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Check a config without touching the network.
    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError>;

    /// Run the test. Failures are reported through the result's status and error.
    fn execute(
        &self,
        cancel: &Cancellation,
        config: &TestConfig,
    ) -> impl Future<Output = TestResult> + Send;

    /// Run the test and record phase timings and intermediate steps.
    fn execute_detailed(
        &self,
        cancel: &Cancellation,
        config: &TestConfig,
    ) -> impl Future<Output = DetailedTestResult> + Send;
}

/// Enum dispatch over the four testers.
#[derive(Debug, Clone, Copy)]
pub enum Tester {
    Icmp(IcmpTest),
    Tcp(TcpTest),
    Udp(UdpTest),
    Http(HttpTest),
}

impl Tester {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Icmp => Tester::Icmp(IcmpTest),
            Protocol::Tcp => Tester::Tcp(TcpTest),
            Protocol::Udp => Tester::Udp(UdpTest),
            Protocol::Http => Tester::Http(HttpTest),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Tester::Icmp(t) => t.protocol(),
            Tester::Tcp(t) => t.protocol(),
            Tester::Udp(t) => t.protocol(),
            Tester::Http(t) => t.protocol(),
        }
    }

    pub fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        match self {
            Tester::Icmp(t) => t.validate(config),
            Tester::Tcp(t) => t.validate(config),
            Tester::Udp(t) => t.validate(config),
            Tester::Http(t) => t.validate(config),
        }
    }

    pub async fn execute(&self, cancel: &Cancellation, config: &TestConfig) -> TestResult {
        match self {
            Tester::Icmp(t) => t.execute(cancel, config).await,
            Tester::Tcp(t) => t.execute(cancel, config).await,
            Tester::Udp(t) => t.execute(cancel, config).await,
            Tester::Http(t) => t.execute(cancel, config).await,
        }
    }

    pub async fn execute_detailed(
        &self,
        cancel: &Cancellation,
        config: &TestConfig,
    ) -> DetailedTestResult {
        match self {
            Tester::Icmp(t) => t.execute_detailed(cancel, config).await,
            Tester::Tcp(t) => t.execute_detailed(cancel, config).await,
            Tester::Udp(t) => t.execute_detailed(cancel, config).await,
            Tester::Http(t) => t.execute_detailed(cancel, config).await,
        }
    }
}

/// Run a test with the tester matching the config's protocol.
pub async fn run_test(cancel: &Cancellation, config: &TestConfig) -> TestResult {
    Tester::for_protocol(config.protocol())
        .execute(cancel, config)
        .await
}

/// Checks shared by all testers: address, timeout and option kind.
pub(crate) fn validate_common(config: &TestConfig, protocol: Protocol) -> Result<(), ProbeError> {
    if config.address.trim().is_empty() {
        return Err(ProbeError::invalid(format!(
            "address is required for {} test",
            protocol
        )));
    }
    if config.timeout.is_zero() {
        return Err(ProbeError::invalid("timeout must be greater than zero"));
    }
    if config.options.protocol() != protocol {
        return Err(ProbeError::invalid(format!(
            "invalid config type for {} test: got {} options",
            protocol,
            config.options.protocol()
        )));
    }
    Ok(())
}

/// Split `host:port` (or `[v6]:port`) and check the port range.
pub(crate) fn split_host_port(address: &str) -> Result<(&str, u16), ProbeError> {
    let malformed =
        |why: &str| ProbeError::invalid(format!("invalid address format (expected host:port): {}", why));

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| malformed("missing ']'"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| malformed("missing port"))?;
        (host, port)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| malformed("missing port"))?;
        if host.contains(':') {
            return Err(malformed("too many colons"));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(ProbeError::invalid("host cannot be empty"));
    }
    let port: u32 = port
        .parse()
        .map_err(|_| ProbeError::invalid(format!("invalid port number: {:?}", port)))?;
    if !(1..=65535).contains(&port) {
        return Err(ProbeError::invalid(format!(
            "port must be between 1 and 65535, got {}",
            port
        )));
    }
    Ok((host, port as u16))
}

/// Resolve a host and port to the first socket address.
pub(crate) async fn resolve_socket_addr(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Network(format!("failed to resolve address {}: {}", host, e)))?
        .next()
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}

/// Validate, then race the protocol attempt against the deadline and the cancellation signal.
pub(crate) async fn run_probe<F, Fut>(
    protocol: Protocol,
    validation: Result<(), ProbeError>,
    cancel: &Cancellation,
    config: &TestConfig,
    probe: F,
) -> TestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Measurement, ProbeError>>,
{
    let timestamp = Utc::now();
    if let Err(e) = validation {
        return TestResult::from_error(timestamp, &config.name, protocol, &e);
    }

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        res = tokio::time::timeout(config.timeout, probe()) => match res {
            Ok(r) => r,
            Err(_) => Err(ProbeError::Timeout(config.timeout)),
        },
    };

    match outcome {
        Ok(m) => TestResult::success(timestamp, &config.name, protocol, m.latency, m.response_size),
        Err(e) => {
            tracing::debug!("{} probe for {} ended with {}: {}", protocol, config.name, e.status(), e);
            TestResult::from_error(timestamp, &config.name, protocol, &e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:80").unwrap(), ("example.com", 80));
        assert_eq!(split_host_port("[::1]:8443").unwrap(), ("::1", 8443));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("example.com:0").is_err());
        assert!(split_host_port("example.com:70000").is_err());
        assert!(split_host_port("example.com:http").is_err());
        assert!(split_host_port("::1:80").is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProbeError::invalid("x").status(), TestStatus::Error);
        assert_eq!(ProbeError::Timeout(Duration::from_secs(1)).status(), TestStatus::Timeout);
        assert_eq!(ProbeError::Cancelled.status(), TestStatus::Timeout);
        assert_eq!(ProbeError::Network("refused".into()).status(), TestStatus::Failed);
    }

    #[test]
    fn test_failed_result_has_error_text() {
        let ts = Utc::now();
        let result = TestResult::from_error(ts, "ep", Protocol::Tcp, &ProbeError::Network(String::new()));
        assert_eq!(result.status, TestStatus::Failed);
        assert!(!result.error.is_empty());
    }

    #[test]
    fn test_result_json_round_trip() {
        let original = TestResult::success(
            Utc.with_ymd_and_hms(2025, 10, 5, 14, 31, 15).unwrap(),
            "EU-West-Cloudflare DNS",
            Protocol::Icmp,
            Duration::from_micros(35_500),
            0,
        );

        let json = serde_json::to_value(&original).unwrap();
        assert_eq!(json["latencyInMs"], 35.5);
        assert!(json.get("latency").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["protocol"], "ICMP");
        assert_eq!(json["status"], "success");

        let decoded: TestResult = serde_json::from_value(json).unwrap();
        let diff = decoded.latency.abs_diff(original.latency);
        assert!(diff < Duration::from_micros(1));
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_fractional_latency_precision() {
        let latency = Duration::from_nanos(12_345_678);
        let ms = duration_to_ms(latency);
        let back = ms_to_duration(ms).unwrap();
        assert!(back.abs_diff(latency) < Duration::from_micros(1));
        assert!(ms_to_duration(-1.0).is_none());
        assert!(ms_to_duration(f64::NAN).is_none());
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("icmp".parse::<Protocol>().unwrap(), Protocol::Icmp);
        assert_eq!("HTTPS".parse::<Protocol>().unwrap(), Protocol::Http);
        assert!("dns".parse::<Protocol>().is_err());
        assert_eq!(Tester::for_protocol(Protocol::Udp).protocol(), Protocol::Udp);
    }

    #[test]
    fn test_options_wrong_protocol_rejected() {
        let config = TestConfig::new("x", "example.com:80", Duration::from_secs(1), Protocol::Tcp)
            .with_options(ProbeOptions::default_for(Protocol::Udp));
        let err = Tester::for_protocol(Protocol::Tcp).validate(&config).unwrap_err();
        assert_eq!(err.status(), TestStatus::Error);
    }

    #[tokio::test]
    async fn test_cancellation_signal() {
        let (handle, token) = Cancellation::pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should resolve once fired");

        let never = Cancellation::never();
        let waited = tokio::time::timeout(Duration::from_millis(50), never.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_run_probe_cancel_wins_over_slow_io() {
        let (handle, token) = Cancellation::pair();
        let config = TestConfig::new("slow", "example.com:80", Duration::from_secs(10), Protocol::Tcp);
        handle.cancel();

        let started = std::time::Instant::now();
        let result = run_probe(Protocol::Tcp, Ok(()), &token, &config, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Measurement::new(Duration::from_millis(1), 0))
        })
        .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.status, TestStatus::Timeout);
        assert!(!result.error.is_empty());
    }

    #[tokio::test]
    async fn test_run_probe_deadline() {
        let config = TestConfig::new("slow", "example.com:80", Duration::from_millis(50), Protocol::Tcp);
        let result = run_probe(Protocol::Tcp, Ok(()), &Cancellation::never(), &config, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Measurement::new(Duration::from_millis(1), 0))
        })
        .await;
        assert_eq!(result.status, TestStatus::Timeout);
        assert_eq!(result.endpoint_id, "slow");
    }
}
