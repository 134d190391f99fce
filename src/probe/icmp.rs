//! ICMP echo tester with native sockets and a `ping` command fallback.
//!
//! Native probes run on blocking sockets inside `spawn_blocking` so round trips
//! are timed without scheduler jitter. Hosts without ICMP socket permission fall
//! back to the system `ping` binary.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};
use tokio::process::Command;

use super::{
    run_detailed, run_probe, validate_common, Cancellation, DetailedTestResult, Measurement,
    NetworkTest, Phase, ProbeError, Protocol, TestConfig, TestResult, Trace,
};

/// Upper bound on echo requests per test.
pub const MAX_ICMP_COUNT: u32 = 100;
/// Largest payload that fits an IPv4 datagram.
pub const MAX_ICMP_PACKET_SIZE: usize = 65507;
const ICMP_HEADER_LEN: usize = 8;

/// ICMP echo options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpOptions {
    /// Echo requests to send, 0 means 1.
    pub count: u32,
    /// Payload bytes after the 8-byte ICMP header.
    pub packet_size: usize,
    /// 0 keeps the OS default.
    pub ttl: u32,
}

impl Default for IcmpOptions {
    fn default() -> Self {
        Self {
            count: 1,
            packet_size: 56,
            ttl: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

/// RAW sockets see the IP header and every reply; DGRAM sockets get the ICMP
/// message only and the kernel rewrites the identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SocketKind {
    Raw,
    Dgram,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(socket2::Protocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP tester: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP tester: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }
    tracing::info!("ICMP tester: native ICMP unavailable, using ping command fallback");
    IcmpCapability::CommandOnly
}

/// ICMP echo tester.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpTest;

impl IcmpTest {
    async fn probe(&self, config: &TestConfig, trace: Trace) -> Result<Measurement, ProbeError> {
        let opts = config.options.icmp().cloned().unwrap_or_default();
        let count = opts.count.max(1);
        let deadline = Instant::now() + config.timeout;

        let lookup = Instant::now();
        let ip = resolve_ip(&config.address).await?;
        trace.phase(Phase::DnsLookup, lookup.elapsed());
        trace.step(format!("resolved {} to {}", config.address, ip));

        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
        if capability == IcmpCapability::Native {
            trace.step(format!("sending {} echo request(s) over native socket", count));
            let native_opts = opts.clone();
            let timeout = config.timeout;
            let result = tokio::task::spawn_blocking(move || {
                run_blocking_ping(ip, &native_opts, count, deadline, timeout)
            })
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

            match result {
                Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                    tracing::warn!(
                        "Native ping failed with permission error for {}, falling back to command: {}",
                        config.address,
                        msg
                    );
                }
                other => return other,
            }
        }

        trace.step("running system ping command");
        let remaining = deadline.saturating_duration_since(Instant::now());
        run_ping_command(&ip.to_string(), count, &opts, remaining.max(Duration::from_millis(1))).await
    }
}

impl NetworkTest for IcmpTest {
    fn protocol(&self) -> Protocol {
        Protocol::Icmp
    }

    fn validate(&self, config: &TestConfig) -> Result<(), ProbeError> {
        validate_common(config, Protocol::Icmp)?;
        let Some(opts) = config.options.icmp() else {
            return Ok(());
        };
        if opts.count > MAX_ICMP_COUNT {
            return Err(ProbeError::invalid(format!(
                "count must be between 0 and {}, got {}",
                MAX_ICMP_COUNT, opts.count
            )));
        }
        if opts.packet_size > MAX_ICMP_PACKET_SIZE {
            return Err(ProbeError::invalid(format!(
                "packet size must be between 0 and {}, got {}",
                MAX_ICMP_PACKET_SIZE, opts.packet_size
            )));
        }
        if opts.ttl > 255 {
            return Err(ProbeError::invalid(format!(
                "TTL must be between 0 and 255, got {}",
                opts.ttl
            )));
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

fn is_permission_error(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("permission") || msg.contains("operation not permitted")
}

/// Resolve a hostname (or bracket-free IP literal) to an IP address.
async fn resolve_ip(address: &str) -> Result<IpAddr, ProbeError> {
    let host = address.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("failed to resolve address {}: {}", host, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}

fn open_icmp_socket(ip: IpAddr) -> Result<(Socket, SocketKind), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, socket2::Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, socket2::Protocol::ICMPV6),
    };

    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, SocketKind::Raw));
    }
    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, SocketKind::Dgram))
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProbeError::Network(format!("permission denied creating ICMP socket: {}", e))
            } else {
                ProbeError::Network(format!("failed to create ICMP socket: {}", e))
            }
        })
}

/// Send `count` echo requests and average the round trips of the replies.
fn run_blocking_ping(
    ip: IpAddr,
    opts: &IcmpOptions,
    count: u32,
    deadline: Instant,
    timeout: Duration,
) -> Result<Measurement, ProbeError> {
    let (socket, kind) = open_icmp_socket(ip)?;

    if opts.ttl > 0 {
        let ttl = opts.ttl.min(255);
        match ip {
            IpAddr::V4(_) => socket.set_ttl(ttl),
            IpAddr::V6(_) => socket.set_unicast_hops_v6(ttl),
        }
        .map_err(|e| ProbeError::Network(format!("failed to set TTL: {}", e)))?;
    }

    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let mut buf = vec![0u8; (opts.packet_size + 128).max(1500)];
    let mut rtts = Vec::with_capacity(count as usize);
    let mut received_bytes = 0u64;

    for sent in 0..count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        // Split what is left evenly so one lost reply cannot starve the rest.
        let budget = remaining / (count - sent);

        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let packet = match ip {
            IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence, opts.packet_size),
            IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence, opts.packet_size),
        };

        socket
            .set_write_timeout(Some(budget.max(Duration::from_millis(1))))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

        let start = Instant::now();
        socket.send(&packet).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProbeError::Network(format!("permission denied: {}", e))
            } else {
                ProbeError::Network(format!("failed to send: {}", e))
            }
        })?;

        match await_echo_reply(&socket, &mut buf, ip, kind, identifier, sequence, start, budget) {
            Ok((rtt, len)) => {
                rtts.push(rtt);
                received_bytes += len as u64;
            }
            Err(ProbeError::Timeout(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    if rtts.is_empty() {
        return Err(ProbeError::Timeout(timeout));
    }
    let total: Duration = rtts.iter().sum();
    Ok(Measurement::new(total / rtts.len() as u32, received_bytes))
}

#[allow(clippy::too_many_arguments)]
fn await_echo_reply(
    socket: &Socket,
    buf: &mut [u8],
    ip: IpAddr,
    kind: SocketKind,
    identifier: u16,
    sequence: u16,
    start: Instant,
    wait: Duration,
) -> Result<(Duration, usize), ProbeError> {
    let until = start + wait;
    let mut reader: &Socket = socket;

    loop {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(wait));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

        let len = match reader.read(buf) {
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(ProbeError::Timeout(wait));
            }
            Err(e) => return Err(ProbeError::Network(format!("failed to receive: {}", e))),
        };
        let elapsed = start.elapsed();

        if let Some(reply) = parse_echo_reply(&buf[..len], ip, kind) {
            let id_matches = kind == SocketKind::Dgram || reply.identifier == identifier;
            if id_matches && reply.sequence == sequence {
                return Ok((elapsed, len));
            }
        }
        // Someone else's packet, keep waiting.
    }
}

#[derive(Debug, PartialEq)]
struct EchoReply {
    identifier: u16,
    sequence: u16,
}

/// Decode an echo reply, skipping the IPv4 header when one is present.
fn parse_echo_reply(buf: &[u8], ip: IpAddr, kind: SocketKind) -> Option<EchoReply> {
    let (offset, reply_type) = match ip {
        IpAddr::V4(_) if buf.first().map(|b| b >> 4) == Some(4) => {
            if buf.len() < 20 {
                return None;
            }
            let ihl = usize::from(buf[0] & 0x0f) * 4;
            let source = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
            if kind == SocketKind::Raw && IpAddr::V4(source) != ip {
                return None;
            }
            (ihl, 0)
        }
        IpAddr::V4(_) => (0, 0),
        IpAddr::V6(_) => (0, 129),
    };

    let icmp = buf.get(offset..offset + ICMP_HEADER_LEN)?;
    if icmp[0] != reply_type {
        return None;
    }
    Some(EchoReply {
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

fn echo_request(kind: u8, identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + payload_size];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    if payload_size >= 8 {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        packet[8..16].copy_from_slice(&timestamp.to_be_bytes());
    }
    packet
}

/// ICMP Echo Request (type 8, code 0) with checksum.
fn build_icmp_echo_request(identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = echo_request(8, identifier, sequence, payload_size);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// ICMPv6 Echo Request (type 128). The kernel fills in the checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    echo_request(128, identifier, sequence, payload_size)
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Run the system `ping` binary. Killed if the caller stops waiting.
async fn run_ping_command(
    address: &str,
    count: u32,
    opts: &IcmpOptions,
    timeout: Duration,
) -> Result<Measurement, ProbeError> {
    let mut cmd = Command::new("ping");
    cmd.arg("-n")
        .args(["-c", &count.to_string()])
        .args(["-s", &opts.packet_size.to_string()]);

    if cfg!(target_os = "macos") {
        cmd.args(["-W", &timeout.as_millis().max(1).to_string()]);
        if opts.ttl > 0 {
            cmd.args(["-m", &opts.ttl.to_string()]);
        }
    } else {
        cmd.args(["-W", &timeout.as_secs().max(1).to_string()]);
        if opts.ttl > 0 {
            cmd.args(["-t", &opts.ttl.to_string()]);
        }
    }

    let output = cmd
        .arg(address)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}{}", stdout, stderr)));
    }

    let latency = parse_ping_output(&stdout)?;
    Ok(Measurement::new(latency, 0))
}

fn capture_ms(re: &Regex, output: &str, group: usize) -> Option<Duration> {
    let ms: f64 = re.captures(output)?.get(group)?.as_str().parse().ok()?;
    super::ms_to_duration(ms)
}

/// Parse `ping` output, preferring the summary average over a single reply time.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    // macOS: "round-trip min/avg/max/stddev = a/b/c/d ms"
    static BSD_SUMMARY: OnceLock<Regex> = OnceLock::new();
    // Linux: "rtt min/avg/max/mdev = a/b/c/d ms"
    static LINUX_SUMMARY: OnceLock<Regex> = OnceLock::new();
    // Per reply: "time=12.3 ms"
    static REPLY_TIME: OnceLock<Regex> = OnceLock::new();

    let bsd = BSD_SUMMARY.get_or_init(|| {
        Regex::new(r"round-trip\s+min/avg/max/stddev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .expect("valid regex")
    });
    let linux = LINUX_SUMMARY.get_or_init(|| {
        Regex::new(r"rtt\s+min/avg/max/mdev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)").expect("valid regex")
    });
    let reply = REPLY_TIME.get_or_init(|| Regex::new(r"time[=<]([0-9.]+)\s*ms").expect("valid regex"));

    capture_ms(bsd, output, 2)
        .or_else(|| capture_ms(linux, output, 2))
        .or_else(|| capture_ms(reply, output, 1))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
