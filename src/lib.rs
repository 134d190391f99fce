//! NetMonitor - network endpoint monitoring.
//!
//! Probes ICMP, TCP, UDP and HTTP endpoints on a schedule, keeps results in
//! day-partitioned JSON files, and serves aggregations, retention and exports
//! over a JSON API.

pub mod config;
pub mod db;
pub mod export;
pub mod probe;
pub mod scheduler;
pub mod web;
