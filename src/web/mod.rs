//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::AppConfig;
use crate::db::ResultStore;
use crate::export::ExportManager;
use crate::scheduler::{Aggregator, RetentionManager, Scheduler};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<ResultStore>,
    pub scheduler: Arc<Scheduler>,
    pub aggregator: Arc<Aggregator>,
    pub retention: Arc<RetentionManager>,
    pub exports: Arc<ExportManager>,
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Monitoring
        .route("/api/status", get(handlers::handle_status))
        .route("/api/monitoring/start", post(handlers::handle_start_monitoring))
        .route("/api/monitoring/stop", post(handlers::handle_stop_monitoring))
        .route(
            "/api/config",
            get(handlers::handle_get_config).put(handlers::handle_update_config),
        )
        // Manual tests
        .route("/api/tests", post(handlers::handle_test_all))
        .route("/api/tests/{region}", post(handlers::handle_test_region))
        .route("/api/tests/{region}/{endpoint}", post(handlers::handle_test_endpoint))
        // Data
        .route("/api/results", get(handlers::handle_get_results))
        .route("/api/aggregations", get(handlers::handle_get_aggregations))
        // Retention and storage
        .route(
            "/api/retention/policy",
            get(handlers::handle_get_retention_policy).put(handlers::handle_update_retention_policy),
        )
        .route("/api/retention/cleanup", post(handlers::handle_manual_cleanup))
        .route("/api/retention/history", get(handlers::handle_cleanup_history))
        .route("/api/storage/stats", get(handlers::handle_storage_stats))
        .route(
            "/api/storage/partitions/{date}/validate",
            post(handlers::handle_validate_partition),
        )
        .route(
            "/api/storage/partitions/{date}/recover",
            post(handlers::handle_recover_partition),
        )
        // Exports
        .route(
            "/api/exports",
            get(handlers::handle_list_exports).post(handlers::handle_create_export),
        )
        .route(
            "/api/exports/{id}",
            get(handlers::handle_get_export).delete(handlers::handle_cancel_export),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Web server for NetMonitor.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = router(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
