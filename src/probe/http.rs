//! HTTP tester.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{redirect, Method, Url};
use serde::{Deserialize, Serialize};

use super::{
    run_detailed, run_probe, validate_common, Cancellation, DetailedTestResult, Measurement,
    NetworkTest, Phase, ProbeError, Protocol, TestConfig, TestResult, Trace,
};

const USER_AGENT: &str = "NetMonitor/1.0";
const MAX_REDIRECTS: usize = 10;
const SUPPORTED_METHODS: [&str; 4] = ["GET", "HEAD", "POST", "PUT"];

/// HTTP request options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub follow_redirects: bool,
    pub validate_tls: bool,
    /// When set the response status must match exactly, otherwise any 2xx passes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: String::new(),
            follow_redirects: true,
            validate_tls: true,
            expected_status: None,
        }
    }
}

impl HttpOptions {
    fn method(&self) -> Result<Method, ProbeError> {
        let name = if self.method.trim().is_empty() {
            "GET".to_string()
        } else {
            self.method.trim().to_ascii_uppercase()
        };
        if !SUPPORTED_METHODS.contains(&name.as_str()) {
            return Err(ProbeError::invalid(format!("unsupported HTTP method: {}", name)));
        }
        Method::from_bytes(name.as_bytes())
            .map_err(|e| ProbeError::invalid(format!("invalid HTTP method {}: {}", name, e)))
    }
}

/// Prefix bare hosts with `http://` and parse.
fn target_url(address: &str) -> Result<Url, ProbeError> {
    let raw = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    let url = Url::parse(&raw).map_err(|e| ProbeError::invalid(format!("invalid URL {}: {}", raw, e)))?;
    if url.host_str().is_none() {
        return Err(ProbeError::invalid(format!("invalid URL {}: missing host", raw)));
    }
    Ok(url)
}

/// HTTP tester. Latency covers the request through the end of the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTest;

impl HttpTest {
    async fn probe(&self, config: &TestConfig, trace: Trace) -> Result<Measurement, ProbeError> {
        let opts = config.options.http().cloned().unwrap_or_default();
        let url = target_url(&config.address)?;
        let method = opts.method()?;

        if trace.is_enabled() {
            if let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) {
                let lookup = Instant::now();
                if let Ok(mut addrs) = tokio::net::lookup_host((host, port)).await {
                    trace.phase(Phase::DnsLookup, lookup.elapsed());
                    if let Some(addr) = addrs.next() {
                        trace.step(format!("resolved {} to {}", host, addr.ip()));
                        // Separate plain connect; reqwest does not expose its own stages.
                        let connect = Instant::now();
                        if let Ok(Ok(_stream)) =
                            tokio::time::timeout(config.timeout, tokio::net::TcpStream::connect(addr)).await
                        {
                            trace.phase(Phase::Connection, connect.elapsed());
                            trace.step(format!("connected to {}", addr));
                        }
                    }
                }
            }
        }

        let policy = if opts.follow_redirects {
            redirect::Policy::limited(MAX_REDIRECTS)
        } else {
            redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(policy)
            .danger_accept_invalid_certs(!opts.validate_tls)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProbeError::Network(format!("failed to build HTTP client: {}", e)))?;

        let mut request = client.request(method.clone(), url.clone());
        for (name, value) in &opts.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !opts.body.is_empty() {
            request = request.body(opts.body.clone());
        }

        let start = Instant::now();
        trace.step(format!("sending {} {}", method, url));
        let response = request
            .send()
            .await
            .map_err(|e| classify_request_error(e, config.timeout))?;
        let first_byte = start.elapsed();
        trace.phase(Phase::FirstByte, first_byte);

        let status = response.status();
        trace.step(format!("received status {}", status.as_u16()));

        // Read the full body to measure complete transfer time
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_request_error(e, config.timeout))?;
        let latency = start.elapsed();
        trace.phase(Phase::Transfer, latency - first_byte);
        trace.step(format!("read {} body bytes", body.len()));

        match opts.expected_status {
            Some(expected) if status.as_u16() != expected => {
                return Err(ProbeError::Network(format!(
                    "expected status {}, got {}",
                    expected,
                    status.as_u16()
                )));
            }
            None if !status.is_success() => {
                return Err(ProbeError::Network(format!(
                    "unexpected status code: {}",
                    status.as_u16()
                )));
            }
            _ => {}
        }

        Ok(Measurement::new(latency, body.len() as u64))
    }
}

impl NetworkTest for HttpTest {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        validate_common(config, Protocol::Http)?;
        target_url(&config.address)?;
        let Some(opts) = config.options.http() else {
            return Ok(());
        };
        opts.method()?;
        if let Some(code) = opts.expected_status {
            if !(100..=599).contains(&code) {
                return Err(ProbeError::invalid(format!(
                    "expected status must be between 100 and 599, got {}",
                    code
                )));
            }
        }
        for (name, value) in &opts.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ProbeError::invalid(format!("invalid header name: {}", name)))?;
            HeaderValue::from_str(value)
                .map_err(|_| ProbeError::invalid(format!("invalid value for header {}", name)))?;
        }
        Ok(())
    }

    async fn execute(&self, cancel: &Cancellation, config: &TestConfig) -> TestResult {
        run_probe(self.protocol(), self.validate(config), cancel, config, || {
            self.probe(config, Trace::disabled())
        })
        .await
    }

    async fn execute_detailed(&self, cancel: &Cancellation, config: &TestConfig) -> DetailedTestResult {
        run_detailed(self.protocol(), self.validate(config), cancel, config, |trace| {
            self.probe(config, trace)
        })
        .await
    }
}

fn classify_request_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else if e.is_connect() {
        ProbeError::Network(format!("connection failed: {}", e))
    } else if e.is_redirect() {
        ProbeError::Network(format!("too many redirects: {}", e))
    } else {
        ProbeError::Network(format!("request failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeOptions, TestStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection.
    async fn canned_server(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}/", addr)
    }

    fn http_config(address: &str, opts: HttpOptions) -> TestConfig {
        TestConfig::new("http", address, Duration::from_secs(2), Protocol::Http)
            .with_options(ProbeOptions::Http(opts))
    }

    const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
    const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot found";

    #[test]
    fn test_validate() {
        let tester = HttpTest;
        assert!(tester.validate(&http_config("example.com", HttpOptions::default())).is_ok());
        assert!(tester
            .validate(&http_config("https://example.com/health", HttpOptions::default()))
            .is_ok());
        assert!(tester.validate(&http_config("", HttpOptions::default())).is_err());
        assert!(tester.validate(&http_config("http://", HttpOptions::default())).is_err());

        let delete = HttpOptions { method: "DELETE".to_string(), ..HttpOptions::default() };
        assert!(tester.validate(&http_config("example.com", delete)).is_err());

        let lower = HttpOptions { method: "head".to_string(), ..HttpOptions::default() };
        assert!(tester.validate(&http_config("example.com", lower)).is_ok());

        let bad_status = HttpOptions { expected_status: Some(42), ..HttpOptions::default() };
        assert!(tester.validate(&http_config("example.com", bad_status)).is_err());
    }

    #[tokio::test]
    async fn test_ok_response() {
        let url = canned_server(OK).await;
        let result = HttpTest
            .execute(&Cancellation::never(), &http_config(&url, HttpOptions::default()))
            .await;
        assert_eq!(result.status, TestStatus::Success);
        assert_eq!(result.response_size, 5);
        assert!(result.latency > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_not_found_fails_without_expected_status() {
        let url = canned_server(NOT_FOUND).await;
        let result = HttpTest
            .execute(&Cancellation::never(), &http_config(&url, HttpOptions::default()))
            .await;
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.error.contains("404"));
    }

    #[tokio::test]
    async fn test_not_found_passes_when_expected() {
        let url = canned_server(NOT_FOUND).await;
        let opts = HttpOptions { expected_status: Some(404), ..HttpOptions::default() };
        let result = HttpTest.execute(&Cancellation::never(), &http_config(&url, opts)).await;
        assert_eq!(result.status, TestStatus::Success);
        assert_eq!(result.response_size, 9);
    }

    #[tokio::test]
    async fn test_detailed_reports_transfer_phases() {
        let url = canned_server(OK).await;
        let detailed = HttpTest
            .execute_detailed(&Cancellation::never(), &http_config(&url, HttpOptions::default()))
            .await;
        assert_eq!(detailed.result.status, TestStatus::Success);
        assert!(detailed.timings.dns_lookup.is_some());
        assert!(detailed.timings.connection.is_some());
        assert!(detailed.timings.first_byte.is_some());
        assert!(detailed.timings.transfer.is_some());
        assert!(detailed.steps.iter().any(|s| s.starts_with("connected to")));
        assert!(detailed.execution_time >= detailed.result.latency);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = http_config(&format!("http://{}/", addr), HttpOptions::default());
        config.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let result = HttpTest.execute(&Cancellation::never(), &config).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, TestStatus::Timeout);
    }
}
