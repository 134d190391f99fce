//! Configuration module for NetMonitor.
//!
//! Process settings come from environment variables with sensible defaults.
//! The monitoring configuration (regions, endpoints, thresholds) is a JSON file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::write_atomic;
use crate::probe::{ProbeOptions, Protocol, TestConfig};

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Directory holding day partitions and snapshots (default: "data")
    pub data_dir: PathBuf,
    /// Monitoring configuration file (default: "config.json")
    pub config_path: PathBuf,
    /// Directory for export output (default: "exports")
    pub export_dir: PathBuf,
    /// Concurrent tests per batch (default: 10)
    pub max_concurrent: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: PathBuf::from("data"),
            config_path: PathBuf::from("config.json"),
            export_dir: PathBuf::from("exports"),
            max_concurrent: 10,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETMONITOR_HTTP_PORT`: HTTP port (default: 8080)
    /// - `NETMONITOR_DATA_DIR`: data directory (default: "data")
    /// - `NETMONITOR_CONFIG_PATH`: monitoring config file (default: "config.json")
    /// - `NETMONITOR_EXPORT_DIR`: export directory (default: "exports")
    /// - `NETMONITOR_MAX_CONCURRENT`: concurrent tests (default: 10)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = lookup("NETMONITOR_HTTP_PORT").and_then(|v| v.parse().ok()) {
            cfg.http_port = port;
        }
        if let Some(dir) = lookup("NETMONITOR_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("NETMONITOR_CONFIG_PATH") {
            cfg.config_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("NETMONITOR_EXPORT_DIR") {
            cfg.export_dir = PathBuf::from(dir);
        }
        if let Some(n) = lookup("NETMONITOR_MAX_CONCURRENT").and_then(|v| v.parse::<usize>().ok()) {
            if n > 0 {
                cfg.max_concurrent = n;
            }
        }

        cfg
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub regions: BTreeMap<String, Region>,
    pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub endpoints: Vec<Endpoint>,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    pub address: String,
    /// Milliseconds.
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ProbeOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub latency_ms: u64,
    pub availability_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub test_interval_minutes: u64,
    pub data_retention_days: u32,
    #[serde(default)]
    pub notifications_enabled: bool,
}

impl Endpoint {
    /// Endpoint id as stored with results: `<region>-<name>`.
    pub fn id(&self, region: &str) -> String {
        format!("{}-{}", region, self.name)
    }

    /// Test parameters for this endpoint. Missing options take protocol defaults.
    pub fn test_config(&self) -> TestConfig {
        let config = TestConfig::new(
            &self.name,
            &self.address,
            Duration::from_millis(self.timeout),
            self.protocol,
        );
        match &self.options {
            Some(options) => config.with_options(options.clone()),
            None => config,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let mut regions = BTreeMap::new();
        regions.insert(
            "Default".to_string(),
            Region {
                endpoints: vec![Endpoint {
                    name: "Google DNS".to_string(),
                    protocol: Protocol::Icmp,
                    address: "8.8.8.8".to_string(),
                    timeout: 5000,
                    options: None,
                }],
                thresholds: Thresholds {
                    latency_ms: 100,
                    availability_percent: 99.0,
                },
            },
        );
        Self {
            regions,
            settings: Settings {
                test_interval_minutes: 5,
                data_retention_days: 90,
                notifications_enabled: false,
            },
        }
    }
}

impl MonitorConfig {
    /// Load and validate. A missing file is replaced with the default configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = Self::default();
                match config.save(path) {
                    Ok(()) => info!("Wrote default configuration to {}", path.display()),
                    Err(e) => warn!("Using default configuration, could not save it: {}", e),
                }
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        info!(
            "Loaded configuration from {} ({} region(s), {} endpoint(s))",
            path.display(),
            config.regions.len(),
            config.endpoint_count()
        );
        Ok(config)
    }

    /// Validate and write atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let bytes = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_atomic(path, &bytes).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.settings;
        if !(1..=1440).contains(&s.test_interval_minutes) {
            return Err(invalid(format!(
                "test interval must be between 1 and 1440 minutes, got {}",
                s.test_interval_minutes
            )));
        }
        if !(1..=365).contains(&s.data_retention_days) {
            return Err(invalid(format!(
                "data retention must be between 1 and 365 days, got {}",
                s.data_retention_days
            )));
        }
        if self.regions.is_empty() {
            return Err(invalid("at least one region must be configured"));
        }

        for (region_name, region) in &self.regions {
            if region.endpoints.is_empty() {
                return Err(invalid(format!("region {} has no endpoints", region_name)));
            }
            if !(1..=10_000).contains(&region.thresholds.latency_ms) {
                return Err(invalid(format!(
                    "region {}: latency threshold must be between 1 and 10000 ms",
                    region_name
                )));
            }
            if !(50.0..=100.0).contains(&region.thresholds.availability_percent) {
                return Err(invalid(format!(
                    "region {}: availability threshold must be between 50 and 100",
                    region_name
                )));
            }

            let mut names = HashSet::new();
            for endpoint in &region.endpoints {
                validate_endpoint(region_name, endpoint)?;
                if !names.insert(endpoint.name.as_str()) {
                    return Err(invalid(format!(
                        "region {}: duplicate endpoint name {}",
                        region_name, endpoint.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn test_interval(&self) -> Duration {
        Duration::from_secs(self.settings.test_interval_minutes * 60)
    }

    /// Every endpoint with its region name.
    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &Endpoint)> {
        self.regions
            .iter()
            .flat_map(|(name, region)| region.endpoints.iter().map(move |e| (name.as_str(), e)))
    }

    pub fn endpoint_count(&self) -> usize {
        self.regions.values().map(|r| r.endpoints.len()).sum()
    }

    pub fn find_endpoint(&self, region: &str, name: &str) -> Option<&Endpoint> {
        self.regions.get(region)?.endpoints.iter().find(|e| e.name == name)
    }

    /// Region of a stored endpoint id.
    pub fn region_of(&self, endpoint_id: &str) -> Option<&str> {
        self.endpoints()
            .find(|(region, e)| e.id(region) == endpoint_id)
            .map(|(region, _)| region)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn validate_endpoint(region: &str, endpoint: &Endpoint) -> Result<(), ConfigError> {
    if endpoint.name.trim().is_empty() {
        return Err(invalid(format!("region {}: endpoint name is required", region)));
    }
    if endpoint.name.chars().count() > 100 {
        return Err(invalid(format!(
            "region {}: endpoint name {} is longer than 100 characters",
            region, endpoint.name
        )));
    }
    if endpoint.address.trim().is_empty() {
        return Err(invalid(format!("endpoint {}: address is required", endpoint.name)));
    }
    if !(1000..=60_000).contains(&endpoint.timeout) {
        return Err(invalid(format!(
            "endpoint {}: timeout must be between 1000 and 60000 ms, got {}",
            endpoint.name, endpoint.timeout
        )));
    }
    if let Some(options) = &endpoint.options {
        if options.protocol() != endpoint.protocol {
            return Err(invalid(format!(
                "endpoint {}: {} options on a {} endpoint",
                endpoint.name,
                options.protocol(),
                endpoint.protocol
            )));
        }
    }
    Ok(())
}
