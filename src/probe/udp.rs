//! UDP tester.
//!
//! UDP has no handshake, so a probe that does not wait for a reply only proves
//! the datagram left this host. Enable `wait_response` for a real reachability
//! check against services that answer.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use super::tcp::check_port_option;
use super::{
    resolve_socket_addr, run_detailed, run_probe, split_host_port, validate_common, Cancellation,
    DetailedTestResult, Measurement, NetworkTest, Phase, ProbeError, Protocol, TestConfig,
    TestResult, Trace,
};

const DEFAULT_PAYLOAD: &[u8] = b"PROBE";
const DEFAULT_RESPONSE_SIZE: usize = 1024;
const MAX_RESPONSE_SIZE: usize = 65535;

/// UDP options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Empty sends a fixed probe payload.
    pub send_data: String,
    pub wait_response: bool,
    /// Receive buffer size, 0 means 1024.
    pub response_size: usize,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            port: None,
            send_data: String::new(),
            wait_response: false,
            response_size: DEFAULT_RESPONSE_SIZE,
        }
    }
}

/// UDP datagram tester.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTest;

impl UdpTest {
    async fn probe(&self, config: &TestConfig, trace: Trace) -> Result<Measurement, ProbeError> {
        let opts = config.options.udp().cloned().unwrap_or_default();
        let (host, port) = split_host_port(&config.address)?;

        let attempt = Instant::now();
        let addr = resolve_socket_addr(host, port).await?;
        trace.phase(Phase::DnsLookup, attempt.elapsed());

        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

        let payload = if opts.send_data.is_empty() {
            DEFAULT_PAYLOAD
        } else {
            opts.send_data.as_bytes()
        };
        socket
            .send(payload)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send UDP packet: {}", e)))?;
        let sent = attempt.elapsed();
        trace.step(format!("sent {} bytes to {}", payload.len(), addr));

        if !opts.wait_response {
            trace.step("not waiting for a response");
            return Ok(Measurement::new(sent, 0));
        }

        let size = if opts.response_size == 0 {
            DEFAULT_RESPONSE_SIZE
        } else {
            opts.response_size
        };
        let mut buf = vec![0u8; size];
        match socket.recv(&mut buf).await {
            Ok(n) => {
                let latency = attempt.elapsed();
                trace.phase(Phase::FirstByte, latency - sent);
                trace.step(format!("received {} bytes", n));
                Ok(Measurement::new(latency, n as u64))
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                Err(ProbeError::Network("port unreachable".to_string()))
            }
            Err(e) => Err(ProbeError::Network(format!("failed to read response: {}", e))),
        }
    }
}

impl NetworkTest for UdpTest {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        validate_common(config, Protocol::Udp)?;
        let (_, port) = split_host_port(&config.address)?;
        if let Some(opts) = config.options.udp() {
            check_port_option(opts.port, port)?;
            if opts.response_size > MAX_RESPONSE_SIZE {
                return Err(ProbeError::invalid(format!(
                    "response size must be at most {}, got {}",
                    MAX_RESPONSE_SIZE, opts.response_size
                )));
            }
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
