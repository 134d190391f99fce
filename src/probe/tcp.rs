//! TCP connect tester.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{
    resolve_socket_addr, run_detailed, run_probe, split_host_port, validate_common, Cancellation,
    DetailedTestResult, Measurement, NetworkTest, Phase, ProbeError, Protocol, TestConfig,
    TestResult, Trace,
};

const READ_BUFFER_SIZE: usize = 4096;

/// TCP options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpOptions {
    /// When set, must equal the port in the address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub send_data: String,
    pub expect_response: bool,
    /// Substring the response must contain.
    pub expected_data: String,
}

/// TCP connect tester. Latency is the connection time, or the time to the
/// response when one is expected.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTest;

impl TcpTest {
    async fn probe(&self, config: &TestConfig, trace: Trace) -> Result<Measurement, ProbeError> {
        let opts = config.options.tcp().cloned().unwrap_or_default();
        let (host, port) = split_host_port(&config.address)?;

        let attempt = Instant::now();
        let addr = resolve_socket_addr(host, port).await?;
        let resolved = attempt.elapsed();
        trace.phase(Phase::DnsLookup, resolved);
        trace.step(format!("resolved {} to {}", host, addr));

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| classify_connect_error(e, config.timeout))?;
        let connected = attempt.elapsed();
        trace.phase(Phase::Connection, connected - resolved);
        trace.step(format!("connected to {}", addr));

        if opts.send_data.is_empty() {
            return Ok(Measurement::new(connected, 0));
        }

        stream
            .write_all(opts.send_data.as_bytes())
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send data: {}", e)))?;
        trace.step(format!("sent {} bytes", opts.send_data.len()));

        if !opts.expect_response {
            return Ok(Measurement::new(connected, 0));
        }

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to read response: {}", e)))?;
        if n == 0 {
            return Err(ProbeError::Network(
                "connection closed before a response was received".to_string(),
            ));
        }
        let latency = attempt.elapsed();
        trace.phase(Phase::FirstByte, latency - connected);
        trace.step(format!("received {} bytes", n));

        if !opts.expected_data.is_empty() {
            let response = String::from_utf8_lossy(&buf[..n]);
            if !response.contains(&opts.expected_data) {
                return Err(ProbeError::Network(format!(
                    "expected data '{}' not found in response",
                    opts.expected_data
                )));
            }
        }

        Ok(Measurement::new(latency, n as u64))
    }
}

impl NetworkTest for TcpTest {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        validate_common(config, Protocol::Tcp)?;
        let (_, port) = split_host_port(&config.address)?;
        if let Some(opts) = config.options.tcp() {
            check_port_option(opts.port, port)?;
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

/// An explicit port option must agree with the address.
pub(crate) fn check_port_option(option: Option<u16>, address_port: u16) -> Result<(), ProbeError> {
    match option {
        Some(0) | None => Ok(()),
        Some(p) if p == address_port => Ok(()),
        Some(p) => Err(ProbeError::invalid(format!(
            "port mismatch: address has {}, options have {}",
            address_port, p
        ))),
    }
}

fn classify_connect_error(e: std::io::Error, timeout: Duration) -> ProbeError {
    match e.kind() {
        ErrorKind::ConnectionRefused => ProbeError::Network("connection refused".to_string()),
        ErrorKind::TimedOut => ProbeError::Timeout(timeout),
        ErrorKind::NetworkUnreachable | ErrorKind::HostUnreachable => {
            ProbeError::Network(format!("network unreachable: {}", e))
        }
        _ => ProbeError::Network(format!("connection failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeOptions, TestStatus};
    use tokio::net::TcpListener;

    fn tcp_config(address: &str, timeout: Duration, opts: TcpOptions) -> TestConfig {
        TestConfig::new("tcp", address, timeout, Protocol::Tcp).with_options(ProbeOptions::Tcp(opts))
    }

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if let Ok(n) = socket.read(&mut buf).await {
                        let mut reply = b"ECHO ".to_vec();
                        reply.extend_from_slice(&buf[..n]);
                        let _ = socket.write_all(&reply).await;
                    }
                });
            }
        });
        addr.to_string()
    }

    #[test]
    fn test_validate() {
        let tester = TcpTest;
        let ok = tcp_config("example.com:443", Duration::from_secs(1), TcpOptions::default());
        assert!(tester.validate(&ok).is_ok());

        for bad in ["", "example.com", "example.com:0", "example.com:65536"] {
            let config = tcp_config(bad, Duration::from_secs(1), TcpOptions::default());
            assert!(tester.validate(&config).is_err(), "{} should be rejected", bad);
        }

        let zero_timeout = tcp_config("example.com:443", Duration::ZERO, TcpOptions::default());
        assert!(tester.validate(&zero_timeout).is_err());

        let mismatch = TcpOptions { port: Some(80), ..TcpOptions::default() };
        assert!(tester.validate(&tcp_config("example.com:443", Duration::from_secs(1), mismatch)).is_err());

        let matching = TcpOptions { port: Some(443), ..TcpOptions::default() };
        assert!(tester.validate(&tcp_config("example.com:443", Duration::from_secs(1), matching)).is_ok());
    }

    #[tokio::test]
    async fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let config = tcp_config(&addr, Duration::from_secs(2), TcpOptions::default());
        let result = TcpTest.execute(&Cancellation::never(), &config).await;

        assert_eq!(result.status, TestStatus::Success);
        assert!(result.error.is_empty());
        assert!(result.latency > Duration::ZERO);
        assert_eq!(result.protocol, Protocol::Tcp);
    }

    #[tokio::test]
    async fn test_connection_refused_is_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = tcp_config(&addr, Duration::from_secs(2), TcpOptions::default());
        let result = TcpTest.execute(&Cancellation::never(), &config).await;

        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.error.contains("refused"));
    }

    #[tokio::test]
    async fn test_expected_response() {
        let addr = echo_server().await;

        let matching = TcpOptions {
            send_data: "hello".to_string(),
            expect_response: true,
            expected_data: "ECHO hello".to_string(),
            ..TcpOptions::default()
        };
        let result = TcpTest
            .execute(&Cancellation::never(), &tcp_config(&addr, Duration::from_secs(2), matching))
            .await;
        assert_eq!(result.status, TestStatus::Success);
        assert_eq!(result.response_size, 10);

        let missing = TcpOptions {
            send_data: "hello".to_string(),
            expect_response: true,
            expected_data: "goodbye".to_string(),
            ..TcpOptions::default()
        };
        let result = TcpTest
            .execute(&Cancellation::never(), &tcp_config(&addr, Duration::from_secs(2), missing))
            .await;
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.error.contains("goodbye"));
    }

    #[tokio::test]
    async fn test_unroutable_address_respects_deadline() {
        let config = tcp_config("192.0.2.1:80", Duration::from_millis(200), TcpOptions::default());
        let started = Instant::now();
        let result = TcpTest.execute(&Cancellation::never(), &config).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(result.status, TestStatus::Timeout | TestStatus::Failed));
    }

    #[tokio::test]
    async fn test_cancellation_stops_pending_read() {
        // Accepts but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let opts = TcpOptions {
            send_data: "ping".to_string(),
            expect_response: true,
            ..TcpOptions::default()
        };
        let config = tcp_config(&addr, Duration::from_secs(30), opts);
        let (handle, token) = Cancellation::pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let detailed = TcpTest.execute_detailed(&token, &config).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(detailed.result.status, TestStatus::Timeout);
        assert!(detailed.timings.connection.is_some());
    }
}
