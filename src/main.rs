//! NetMonitor - Network Monitoring Application

use netmonitor::config::{AppConfig, MonitorConfig};
use netmonitor::db::ResultStore;
use netmonitor::export::ExportManager;
use netmonitor::scheduler::{Aggregator, RetentionManager, RetentionPolicy, Scheduler};
use netmonitor::web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HISTORY_FILE: &str = "cleanup_history.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netmonitor=info".parse()?))
        .init();

    // Load configuration
    let cfg = AppConfig::load();
    tracing::info!("Starting NetMonitor on port {}...", cfg.http_port);
    tracing::info!("Using data directory {}", cfg.data_dir.display());

    let monitor = MonitorConfig::load(&cfg.config_path)?;

    // Initialize storage
    let store = Arc::new(ResultStore::new(&cfg.data_dir)?);
    store.save_configuration(&monitor)?;
    tracing::info!("Result store initialized");

    let aggregator = Arc::new(Aggregator::new(store.clone()));

    // Retention follows the configured data retention, within policy bounds
    let raw_data_days = monitor.settings.data_retention_days.clamp(7, 365);
    let policy = RetentionPolicy {
        raw_data_days,
        aggregated_data_days: RetentionPolicy::default().aggregated_data_days.max(raw_data_days),
        ..RetentionPolicy::default()
    };
    let retention = Arc::new(RetentionManager::new(
        store.clone(),
        cfg.data_dir.join(HISTORY_FILE),
        policy,
    )?);
    retention.start();

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        monitor,
        cfg.max_concurrent,
        Some(aggregator.clone()),
    )?);
    scheduler.start();

    let exports = Arc::new(ExportManager::new(store.clone(), aggregator.clone(), &cfg.export_dir)?);

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        store,
        scheduler: scheduler.clone(),
        aggregator,
        retention: retention.clone(),
        exports: exports.clone(),
    });
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Shutting down...");
    exports.close();
    scheduler.stop().await;
    retention.close()?;

    Ok(())
}
