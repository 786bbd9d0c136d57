//! HTTP handlers

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

use super::SharedState;
use crate::bundler::{AdapterStats, ArtifactStats, BundlerStatus};
use crate::error::{BuildError, BuildNetError, Result};
use crate::ledger::VerificationReport;
use crate::model::{
    ActorIdentity, BuildMode, BuildOptions, BuildRecord, BuildRequest, BuildResult, PackageResult,
    ResourceStatus, WorkerState,
};
use crate::scheduler::SchedulerStats;
use crate::state::{keys, StateBackendExt};
use crate::watcher::CacheStats;

/// Slack on top of the scheduler's own build deadline
const WAIT_MARGIN: Duration = Duration::from_secs(5);

pub async fn health() -> impl IntoResponse {
    "OK"
}

// === Status ===

#[derive(Serialize)]
pub struct NodeHealth {
    pub worker_id: String,
    pub status: ResourceStatus,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub hostname: String,
    pub version: String,
    pub uptime_secs: u64,
    pub backend: String,
    pub ledger_trusted: bool,
    pub bundler: BundlerStatus,
    pub active_builds: Vec<BuildRecord>,
    pub nodes: Vec<NodeHealth>,
    pub workers: Vec<WorkerState>,
}

/// GET /status
pub async fn status(State(state): State<SharedState>) -> Result<Json<StatusResponse>> {
    let mut workers = Vec::new();
    for key in state.backend.keys(keys::WORKERS).await? {
        if let Some(worker) = state.backend.get_json::<WorkerState>(&key).await? {
            workers.push(worker);
        }
    }
    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    Ok(Json(StatusResponse {
        node_id: state.config.node.id.clone(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        backend: state.backend.name().to_string(),
        ledger_trusted: state.ledger.is_trusted(),
        bundler: state.bundler.status().await,
        active_builds: state.scheduler.active_builds().await,
        nodes: state
            .health
            .snapshot()
            .into_iter()
            .map(|(worker_id, status)| NodeHealth { worker_id, status })
            .collect(),
        workers,
    }))
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub scheduler: SchedulerStats,
    pub bundlers: HashMap<String, AdapterStats>,
    pub cache: CacheStatsResponse,
}

/// GET /stats
pub async fn stats(State(state): State<SharedState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        scheduler: state.scheduler.stats(),
        bundlers: state.bundler.stats(),
        cache: cache_snapshot(&state),
    })
}

// === Builds ===

#[derive(Debug, Default, Deserialize)]
pub struct BuildBody {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub mode: Option<BuildMode>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Serialize)]
pub struct BuildResponse {
    pub request_id: String,
    pub success: bool,
    pub results: Vec<PackageResult>,
    pub errors: Vec<BuildError>,
    pub total_duration_ms: u64,
}

impl From<BuildResult> for BuildResponse {
    fn from(result: BuildResult) -> Self {
        Self {
            request_id: result.request_id,
            success: result.success,
            results: result.results,
            errors: result.errors,
            total_duration_ms: result.total_duration_ms,
        }
    }
}

async fn run_build(
    state: &SharedState,
    targets: Vec<String>,
    body: BuildBody,
) -> Result<Json<BuildResponse>> {
    let options = BuildOptions {
        force: body.force,
        mode: body.mode.unwrap_or_default(),
        timeout_secs: None,
    };
    let request = BuildRequest::new(ActorIdentity::user("http"), targets, options)
        .with_priority(body.priority);
    let request_id = request.request_id.clone();

    info!(request_id = %request_id, targets = ?request.targets, "Build requested");
    state.scheduler.submit(request).await?;

    let bound = Duration::from_secs(state.config.scheduler.build_timeout_secs) + WAIT_MARGIN;
    let result = state.scheduler.wait(&request_id, bound).await?;
    Ok(Json(result.into()))
}

/// POST /build - build every configured package
pub async fn build_all(
    State(state): State<SharedState>,
    body: Option<Json<BuildBody>>,
) -> Result<Json<BuildResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    run_build(&state, Vec::new(), body).await
}

/// POST /build/:package - build one package and its dependencies
pub async fn build_package(
    State(state): State<SharedState>,
    Path(package): Path<String>,
    body: Option<Json<BuildBody>>,
) -> Result<Json<BuildResponse>> {
    if state.config.package(&package).is_none() {
        return Err(BuildNetError::NotFound(format!("package {}", package)));
    }
    let body = body.map(|Json(b)| b).unwrap_or_default();
    run_build(&state, vec![package], body).await
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// GET /builds
pub async fn list_builds(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BuildRecord>>> {
    let limit = query
        .limit
        .unwrap_or(state.config.scheduler.history_limit)
        .min(state.config.scheduler.history_limit.max(1));
    Ok(Json(state.scheduler.list_builds(limit).await?))
}

/// GET /builds/:id
pub async fn get_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BuildRecord>> {
    state
        .scheduler
        .get_build(&id)
        .await?
        .map(Json)
        .ok_or_else(|| BuildNetError::NotFound(format!("build {}", id)))
}

/// POST /builds/:id/cancel
pub async fn cancel_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BuildResponse>> {
    let result = state.scheduler.cancel(&id).await?;
    Ok(Json(result.into()))
}

// === Caches ===

#[derive(Serialize)]
pub struct CacheStatsResponse {
    pub preparation: CacheStats,
    /// Absent when this node runs without an artifact cache
    pub artifacts: Option<ArtifactStats>,
}

fn cache_snapshot(state: &SharedState) -> CacheStatsResponse {
    CacheStatsResponse {
        preparation: state.preparer.stats(),
        artifacts: state.artifacts.as_ref().map(|cache| cache.stats()),
    }
}

/// GET /cache/stats
pub async fn cache_stats(State(state): State<SharedState>) -> Result<Json<CacheStatsResponse>> {
    let snapshot = tokio::task::spawn_blocking(move || cache_snapshot(&state))
        .await
        .map_err(|e| BuildNetError::Internal(e.to_string()))?;
    Ok(Json(snapshot))
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearQuery {
    /// Trim artifacts to this size instead of removing them all
    pub max_size_mb: Option<u64>,
}

#[derive(Serialize)]
pub struct ClearResponse {
    pub cleared: usize,
    pub artifacts_removed: usize,
}

/// POST /cache/clear[?max_size_mb=N]
pub async fn cache_clear(
    State(state): State<SharedState>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<ClearResponse>> {
    let cleared = match query.max_size_mb {
        // size-bounded cleaning leaves the in-memory preparation cache alone
        Some(_) => 0,
        None => state.preparer.clear(),
    };
    let artifacts_removed = match state.artifacts.clone() {
        Some(cache) => tokio::task::spawn_blocking(move || match query.max_size_mb {
            Some(mb) => cache.clean(mb * 1024 * 1024),
            None => cache.clear(),
        })
        .await
        .map_err(|e| BuildNetError::Internal(e.to_string()))??,
        None => 0,
    };
    info!(cleared, artifacts_removed, "Caches cleaned");
    Ok(Json(ClearResponse {
        cleared,
        artifacts_removed,
    }))
}

// === Config, ledger, shutdown ===

/// GET /config - connection strings are redacted
pub async fn config(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let mut config = state.config.clone();
    if config.backend.mongo_uri.is_some() {
        config.backend.mongo_uri = Some("<redacted>".to_string());
    }
    Json(serde_json::to_value(&config).unwrap_or_default())
}

/// GET /ledger/verify
pub async fn verify_ledger(State(state): State<SharedState>) -> Result<Json<VerificationReport>> {
    Ok(Json(state.scheduler.verify_ledger().await?))
}

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub shutting_down: bool,
}

/// POST /shutdown
pub async fn shutdown(State(state): State<SharedState>) -> Json<ShutdownResponse> {
    info!("Shutdown requested over HTTP");
    state.shutdown.send_replace(true);
    Json(ShutdownResponse { shutting_down: true })
}

// === Event stream ===

/// GET /events - server-sent `{event_type, package, message, timestamp}`
pub async fn events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|item| async move {
        match item {
            Ok(envelope) => Event::default()
                .event(envelope.event_type)
                .json_data(&envelope)
                .ok()
                .map(Ok),
            Err(lagged) => {
                debug!(error = %lagged, "Event subscriber lagged");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
