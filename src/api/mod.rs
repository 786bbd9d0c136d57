//! HTTP surface
//!
//! Two routers over the same shared state:
//! - control (`api.control_addr`): builds, history, cache, config, shutdown
//! - dashboard (`api.dashboard_addr`): health, status and the event stream

pub mod routes;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::bundler::{ArtifactCache, BundlerManager};
use crate::config::Config;
use crate::error::BuildNetError;
use crate::ledger::Ledger;
use crate::scheduler::{EventBus, HealthMonitor, Scheduler};
use crate::state::SharedBackend;
use crate::watcher::Preparer;

/// Handler state shared by both routers
pub struct ApiState {
    pub config: Config,
    pub backend: SharedBackend,
    pub scheduler: Arc<Scheduler>,
    pub bundler: Arc<BundlerManager>,
    pub preparer: Arc<Preparer>,
    /// Node-local build output cache, shared with embedded workers
    pub artifacts: Option<Arc<ArtifactCache>>,
    pub health: Arc<HealthMonitor>,
    pub ledger: Arc<Ledger>,
    pub events: EventBus,
    pub shutdown: watch::Sender<bool>,
    pub started_at: Instant,
}

pub type SharedState = Arc<ApiState>;

impl IntoResponse for BuildNetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn control_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/stats", get(routes::stats))
        // Builds
        .route("/build", post(routes::build_all))
        .route("/build/:package", post(routes::build_package))
        .route("/builds", get(routes::list_builds))
        .route("/builds/:id", get(routes::get_build))
        .route("/builds/:id/cancel", post(routes::cancel_build))
        // Preparation and artifact caches
        .route("/cache/stats", get(routes::cache_stats))
        .route("/cache/clear", post(routes::cache_clear))
        .route("/config", get(routes::config))
        .route("/ledger/verify", get(routes::verify_ledger))
        .route("/shutdown", post(routes::shutdown))
        .route("/events", get(routes::events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn dashboard_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/events", get(routes::events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
