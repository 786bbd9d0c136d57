//! Scheduler / controller
//!
//! Owns the aggregate lifecycle of every build request:
//!
//! ```text
//!   submit ──► queued ──(first claim or outcome)──► running ──┬─► completed
//!                 │                                           ├─► failed
//!                 └──────────────── cancel ───────────────────┴─► cancelled
//! ```
//!
//! Requests are decomposed into one [`MicroBundle`] per package. A bundle is
//! published at `work:{id}:spec` once all of its dependencies succeeded;
//! workers race for it with an atomic claim. Outcomes arrive over gossip and
//! are also polled from `work:{id}:result`, so handling is idempotent: an
//! outcome is applied only if it matches the bundle's live attempt.
//!
//! Only the controller that submitted a request holds its unit state. On
//! start, `recover` fails `builds:*` records left non-terminal by a previous
//! controller; every poll withdraws specs whose request is not active here.

pub mod assign;
pub mod events;
pub mod graph;
pub mod health;

pub use assign::WorkerCapacity;
pub use events::{BuildEvent, EventBus, EventEnvelope};
pub use graph::{DependencyGraph, GraphError};
pub use health::{HealthMonitor, HealthReport};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SchedulerConfig};
use crate::error::{BuildError, BuildNetError, Result};
use crate::ledger::{Ledger, LedgerTransaction, VerificationReport};
use crate::model::{
    ActorIdentity, BuildOptions, BuildRecord, BuildRequest, BuildResult, BuildStatus, MicroBundle,
    PackageResult, UnitOutcome, UnitResultStatus, WorkItem, WorkerState,
};
use crate::state::{keys, with_backoff, RetryPolicy, SharedBackend, StateBackendExt};
use crate::watcher::{ChangeBatch, ImpactTier, Preparer};
use crate::worker::gossip::{self, GossipMessage, GossipType, WorkClaimedNotice};
use crate::worker::stats::ema;

/// Priority added to bundles on the critical path
const CRITICAL_PATH_BOOST: i32 = 100;

pub const CONTROLLER_RESTARTED: &str = "CONTROLLER_RESTARTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitPhase {
    /// Dependencies not finished yet
    Waiting,
    Published,
    Succeeded,
    Failed,
    Withdrawn,
}

struct UnitState {
    bundle: MicroBundle,
    attempt: u32,
    phase: UnitPhase,
    preferred_worker: Option<String>,
    last: Option<UnitOutcome>,
}

struct ActiveBuild {
    record: BuildRecord,
    /// Bundle ids in dependency order
    order: Vec<String>,
    units: HashMap<String, UnitState>,
    started: Instant,
    deadline: Duration,
    done: watch::Sender<Option<BuildResult>>,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// What `recover` cleaned up after a previous controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub failed_builds: usize,
    pub withdrawn_specs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub active_builds: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub ledger_trusted: bool,
    /// Measured per-package duration estimates, milliseconds
    pub estimates: BTreeMap<String, u64>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    verify_interval: Duration,
    ema_alpha: f64,
    graph: DependencyGraph,
    backend: SharedBackend,
    ledger: Arc<Ledger>,
    events: EventBus,
    retry: RetryPolicy,
    actor: ActorIdentity,
    active: DashMap<String, Arc<Mutex<ActiveBuild>>>,
    estimates: DashMap<String, f64>,
    counters: Counters,
}

impl Scheduler {
    pub fn new(config: &Config, backend: SharedBackend, ledger: Arc<Ledger>, events: EventBus) -> Self {
        Self {
            config: config.scheduler.clone(),
            verify_interval: Duration::from_secs(config.ledger.verify_interval_secs),
            ema_alpha: config.worker.ema_alpha,
            graph: DependencyGraph::from_packages(&config.packages),
            backend,
            ledger,
            events,
            retry: RetryPolicy::from_config(&config.backend),
            actor: ActorIdentity::service("scheduler"),
            active: DashMap::new(),
            estimates: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ========================================================================
    // Decomposition
    // ========================================================================

    /// Measured estimate if any unit of this package has completed, else the configured one
    pub fn estimate_for(&self, package: &str) -> u64 {
        if let Some(measured) = self.estimates.get(package) {
            return measured.round() as u64;
        }
        self.graph
            .package(package)
            .map(|p| p.estimated_time_ms)
            .unwrap_or(0)
    }

    /// Empty targets means every configured package
    fn resolve_targets(&self, request: &BuildRequest) -> Vec<String> {
        if request.targets.is_empty() {
            self.graph.names().cloned().collect()
        } else {
            request.targets.clone()
        }
    }

    /// One bundle per package in the targets' dependency closure, dependencies first
    pub fn decompose(&self, request: &BuildRequest) -> Result<Vec<MicroBundle>> {
        let targets = self.resolve_targets(request);
        let closure = self
            .graph
            .with_dependencies(&targets)
            .map_err(|e| BuildNetError::BadRequest(e.to_string()))?;
        let order = self
            .graph
            .topological_subset(&closure)
            .map_err(|e| BuildNetError::BadRequest(e.to_string()))?;
        let (critical, critical_ms) = self
            .graph
            .critical_path(&closure, |name| self.estimate_for(name))
            .map_err(|e| BuildNetError::BadRequest(e.to_string()))?;
        let critical: HashSet<&str> = critical.iter().map(String::as_str).collect();

        let prefix: String = request
            .request_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();
        let bundle_id = |package: &str| format!("{}-{}", prefix, sanitize(package));

        let mut bundles = Vec::with_capacity(order.len());
        for name in &order {
            let pkg = self
                .graph
                .package(name)
                .ok_or_else(|| BuildNetError::Internal(format!("package {} vanished", name)))?;
            let boost = if critical.contains(name.as_str()) {
                CRITICAL_PATH_BOOST
            } else {
                0
            };
            bundles.push(MicroBundle {
                id: bundle_id(name.as_str()),
                package: name.clone(),
                entry: pkg.entry.clone(),
                dependencies: pkg
                    .dependencies
                    .iter()
                    .filter(|d| closure.contains(*d))
                    .map(|d| bundle_id(d.as_str()))
                    .collect(),
                estimated_size: pkg.estimated_size_kb,
                estimated_time: self.estimate_for(name),
                priority: pkg.priority + request.priority + boost,
            });
        }

        debug!(
            request_id = %request.request_id,
            bundles = bundles.len(),
            critical_path_ms = critical_ms,
            "Request decomposed"
        );
        Ok(bundles)
    }

    async fn live_workers(&self) -> Result<Vec<WorkerState>> {
        let mut workers = Vec::new();
        for key in self.backend.keys(keys::WORKERS).await? {
            if let Some(state) = self.backend.get_json::<WorkerState>(&key).await? {
                workers.push(state);
            }
        }
        Ok(workers)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    pub async fn submit(&self, request: BuildRequest) -> Result<BuildRecord> {
        let bundles = self.decompose(&request)?;

        let capacity: Vec<WorkerCapacity> = match self.live_workers().await {
            Ok(workers) => workers.iter().filter_map(WorkerCapacity::from_state).collect(),
            Err(e) => {
                warn!(error = %e, "Cannot read worker states; publishing without hints");
                Vec::new()
            }
        };
        let assignments = assign::plan(&bundles, &capacity);
        let preferred: HashMap<String, String> = assignments
            .iter()
            .map(|a| (a.bundle.clone(), a.worker_id.clone()))
            .collect();

        let record = BuildRecord {
            request: request.clone(),
            status: BuildStatus::Queued,
            bundles: bundles.len(),
            started_at: None,
            finished_at: None,
            result: None,
        };
        let bundle_count = bundles.len();
        let estimated_ms = assign::makespan(&assignments);

        let deadline = Duration::from_secs(
            request
                .options
                .timeout_secs
                .unwrap_or(self.config.build_timeout_secs),
        );
        let (done, _) = watch::channel(None);
        let order = bundles.iter().map(|b| b.id.clone()).collect();
        let units = bundles
            .into_iter()
            .map(|bundle| {
                let preferred_worker = preferred.get(&bundle.id).cloned();
                (
                    bundle.id.clone(),
                    UnitState {
                        bundle,
                        attempt: 1,
                        phase: UnitPhase::Waiting,
                        preferred_worker,
                        last: None,
                    },
                )
            })
            .collect();

        let build = Arc::new(Mutex::new(ActiveBuild {
            record: record.clone(),
            order,
            units,
            started: Instant::now(),
            deadline,
            done,
        }));
        // Registered before the record is visible so recovery never mistakes it for a leftover
        let mut build_guard = build.lock().await;
        self.active
            .insert(request.request_id.clone(), Arc::clone(&build));
        if let Err(e) = self.persist(&record).await {
            self.active.remove(&request.request_id);
            return Err(e);
        }
        self.record_transition(&request.request_id, None, BuildStatus::Queued)
            .await;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        info!(
            request_id = %request.request_id,
            targets = ?request.targets,
            bundles = bundle_count,
            estimated_ms,
            "Build queued"
        );
        self.events.publish(BuildEvent::BuildQueued {
            request_id: request.request_id.clone(),
            targets: request.targets.clone(),
            bundles: bundle_count,
        });

        let build = &mut *build_guard;
        if build.units.is_empty() {
            self.finalize(build, BuildStatus::Completed, Vec::new())
                .await?;
        } else {
            self.publish_ready(build).await?;
        }
        Ok(build.record.clone())
    }

    /// Publish every waiting unit whose dependencies have all succeeded
    async fn publish_ready(&self, build: &mut ActiveBuild) -> Result<usize> {
        let succeeded: HashSet<String> = build
            .units
            .iter()
            .filter(|(_, u)| u.phase == UnitPhase::Succeeded)
            .map(|(id, _)| id.clone())
            .collect();
        let ready: Vec<String> = build
            .order
            .iter()
            .filter(|id| {
                build.units.get(*id).is_some_and(|u| {
                    u.phase == UnitPhase::Waiting
                        && u.bundle.dependencies.iter().all(|d| succeeded.contains(d))
                })
            })
            .cloned()
            .collect();

        let request_id = build.record.request.request_id.clone();
        let options = build.record.request.options.clone();
        for id in &ready {
            if let Some(unit) = build.units.get_mut(id) {
                self.publish_unit(&request_id, &options, unit).await?;
            }
        }
        Ok(ready.len())
    }

    async fn publish_unit(
        &self,
        request_id: &str,
        options: &BuildOptions,
        unit: &mut UnitState,
    ) -> Result<()> {
        let item = WorkItem {
            request_id: request_id.to_string(),
            bundle: unit.bundle.clone(),
            attempt: unit.attempt,
            preferred_worker: unit.preferred_worker.clone(),
            options: options.clone(),
            published_at: Utc::now(),
        };
        let key = keys::work_spec(&unit.bundle.id);
        let backend = &self.backend;
        with_backoff(&self.retry, "publish work", || {
            backend.set_json(&key, &item, None)
        })
        .await?;
        unit.phase = UnitPhase::Published;
        debug!(bundle_id = %unit.bundle.id, attempt = unit.attempt, "Work published");
        Ok(())
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    fn active_build(&self, request_id: &str) -> Option<Arc<Mutex<ActiveBuild>>> {
        self.active.get(request_id).map(|e| Arc::clone(e.value()))
    }

    /// Apply a unit outcome. Returns false for duplicates and stale attempts.
    pub async fn handle_outcome(&self, outcome: UnitOutcome) -> Result<bool> {
        let Some(build) = self.active_build(&outcome.request_id) else {
            debug!(request_id = %outcome.request_id, "Outcome for unknown or finished request");
            return Ok(false);
        };
        let mut build = build.lock().await;
        if build.record.status.is_terminal() {
            return Ok(false);
        }
        let live = build
            .units
            .get(&outcome.bundle_id)
            .is_some_and(|u| u.phase == UnitPhase::Published && u.attempt == outcome.attempt);
        if !live {
            debug!(
                bundle_id = %outcome.bundle_id,
                attempt = outcome.attempt,
                "Ignoring stale outcome"
            );
            return Ok(false);
        }

        self.mark_running(&mut build).await?;
        self.backend
            .delete(&keys::work_result(&outcome.bundle_id))
            .await?;

        let request_id = build.record.request.request_id.clone();
        let options = build.record.request.options.clone();
        let max_attempts = self.config.max_attempts;
        let Some(unit) = build.units.get_mut(&outcome.bundle_id) else {
            return Ok(false);
        };
        unit.last = Some(outcome.clone());

        if outcome.success {
            unit.phase = UnitPhase::Succeeded;
            self.backend
                .delete(&keys::work_spec(&outcome.bundle_id))
                .await?;
            self.update_estimate(&outcome.package, outcome.duration_ms);
            self.events.publish(BuildEvent::UnitCompleted {
                request_id: request_id.clone(),
                bundle_id: outcome.bundle_id.clone(),
                package: outcome.package.clone(),
                worker_id: outcome.worker_id.clone(),
                duration_ms: outcome.duration_ms,
            });

            if build.units.values().all(|u| u.phase == UnitPhase::Succeeded) {
                self.finalize(&mut build, BuildStatus::Completed, Vec::new())
                    .await?;
            } else {
                self.publish_ready(&mut build).await?;
            }
            return Ok(true);
        }

        self.events.publish(BuildEvent::UnitFailed {
            request_id: request_id.clone(),
            bundle_id: outcome.bundle_id.clone(),
            package: outcome.package.clone(),
            worker_id: outcome.worker_id.clone(),
            errors: outcome.errors.clone(),
        });

        if unit.attempt < max_attempts {
            unit.attempt += 1;
            warn!(
                request_id = %request_id,
                package = %outcome.package,
                attempt = unit.attempt,
                max_attempts,
                "Unit failed, requeueing"
            );
            self.events.publish(BuildEvent::UnitRetried {
                request_id: request_id.clone(),
                bundle_id: outcome.bundle_id.clone(),
                package: outcome.package.clone(),
                attempt: unit.attempt,
            });
            self.publish_unit(&request_id, &options, unit).await?;
        } else {
            unit.phase = UnitPhase::Failed;
            warn!(
                request_id = %request_id,
                package = %outcome.package,
                attempts = unit.attempt,
                "Unit exhausted its retry budget"
            );
            self.finalize(&mut build, BuildStatus::Failed, Vec::new())
                .await?;
        }
        Ok(true)
    }

    async fn on_claimed(&self, notice: WorkClaimedNotice) -> Result<()> {
        self.events.publish(BuildEvent::UnitClaimed {
            request_id: notice.request_id.clone(),
            bundle_id: notice.bundle_id,
            package: notice.package,
            worker_id: notice.worker_id,
            attempt: notice.attempt,
        });
        if let Some(build) = self.active_build(&notice.request_id) {
            let mut build = build.lock().await;
            if !build.record.status.is_terminal() {
                self.mark_running(&mut build).await?;
            }
        }
        Ok(())
    }

    async fn mark_running(&self, build: &mut ActiveBuild) -> Result<()> {
        if build.record.status != BuildStatus::Queued {
            return Ok(());
        }
        build.record.status = BuildStatus::Running;
        build.record.started_at = Some(Utc::now());
        self.persist(&build.record).await?;
        let request_id = build.record.request.request_id.clone();
        self.record_transition(&request_id, Some(BuildStatus::Queued), BuildStatus::Running)
            .await;
        info!(request_id = %request_id, "Build started");
        self.events.publish(BuildEvent::BuildStarted { request_id });
        Ok(())
    }

    fn update_estimate(&self, package: &str, duration_ms: u64) {
        let previous = self.estimate_for(package) as f64;
        let next = if self.estimates.contains_key(package) {
            ema(self.ema_alpha, previous, duration_ms as f64)
        } else {
            duration_ms as f64
        };
        self.estimates.insert(package.to_string(), next);
    }

    /// Withdraw outstanding work, aggregate the result and notify waiters
    async fn finalize(
        &self,
        build: &mut ActiveBuild,
        status: BuildStatus,
        mut errors: Vec<BuildError>,
    ) -> Result<BuildResult> {
        for id in build.order.clone() {
            let Some(unit) = build.units.get_mut(&id) else {
                continue;
            };
            match unit.phase {
                UnitPhase::Published => {
                    // claimed units run out on their own; their results are discarded
                    self.backend.delete(&keys::work_spec(&id)).await?;
                    self.backend.delete(&keys::work_result(&id)).await?;
                    unit.phase = UnitPhase::Withdrawn;
                }
                UnitPhase::Waiting => unit.phase = UnitPhase::Withdrawn,
                _ => {}
            }
        }

        let mut results = Vec::with_capacity(build.order.len());
        for id in &build.order {
            let Some(unit) = build.units.get(id) else {
                continue;
            };
            let unit_status = match unit.phase {
                UnitPhase::Succeeded => UnitResultStatus::Success,
                UnitPhase::Failed => UnitResultStatus::Failed,
                _ => UnitResultStatus::Skipped,
            };
            let last = unit.last.as_ref();
            if unit.phase == UnitPhase::Failed {
                match last {
                    Some(outcome) if !outcome.errors.is_empty() => {
                        errors.extend(outcome.errors.iter().cloned())
                    }
                    _ => errors.push(BuildError::new(
                        "UNIT_FAILED",
                        format!("{} failed after {} attempt(s)", unit.bundle.package, unit.attempt),
                    )),
                }
            }
            results.push(PackageResult {
                package: unit.bundle.package.clone(),
                status: unit_status,
                duration_ms: last.map(|o| o.duration_ms).unwrap_or(0),
                attempts: if last.is_some() { unit.attempt } else { 0 },
                worker_id: last.map(|o| o.worker_id.clone()),
                output_hash: last.and_then(|o| o.output_hash.clone()),
                errors: last
                    .filter(|o| !o.success)
                    .map(|o| o.errors.clone())
                    .unwrap_or_default(),
                cached: last.and_then(|o| o.cached),
            });
        }

        let request_id = build.record.request.request_id.clone();
        let total_duration_ms = build.started.elapsed().as_millis() as u64;
        let result = BuildResult {
            request_id: request_id.clone(),
            status,
            success: status == BuildStatus::Completed,
            results,
            errors,
            total_duration_ms,
            finished_at: Utc::now(),
        };

        let previous = build.record.status;
        build.record.status = status;
        build.record.finished_at = Some(result.finished_at);
        build.record.result = Some(result.clone());
        self.persist(&build.record).await?;
        self.record_transition(&request_id, Some(previous), status)
            .await;

        match status {
            BuildStatus::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(request_id = %request_id, duration_ms = total_duration_ms, "Build completed");
                self.events.publish(BuildEvent::BuildCompleted {
                    request_id: request_id.clone(),
                    duration_ms: total_duration_ms,
                });
            }
            BuildStatus::Cancelled => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                info!(request_id = %request_id, "Build cancelled");
                self.events.publish(BuildEvent::BuildCancelled {
                    request_id: request_id.clone(),
                });
            }
            _ => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %request_id, errors = result.errors.len(), "Build failed");
                self.events.publish(BuildEvent::BuildFailed {
                    request_id: request_id.clone(),
                    errors: result.errors.clone(),
                });
            }
        }

        build.done.send_replace(Some(result.clone()));
        self.active.remove(&request_id);
        Ok(result)
    }

    // ========================================================================
    // Queries and control
    // ========================================================================

    /// Cooperative: unclaimed work is withdrawn, claimed units run out
    pub async fn cancel(&self, request_id: &str) -> Result<BuildResult> {
        if let Some(build) = self.active_build(request_id) {
            let mut build = build.lock().await;
            if let Some(result) = build.record.result.clone() {
                return Ok(result);
            }
            return self
                .finalize(&mut build, BuildStatus::Cancelled, Vec::new())
                .await;
        }
        match self.get_build(request_id).await? {
            Some(BuildRecord {
                result: Some(result),
                ..
            }) => Ok(result),
            Some(_) => Err(BuildNetError::BadRequest(format!(
                "build {} is not owned by this controller",
                request_id
            ))),
            None => Err(BuildNetError::NotFound(format!("build {}", request_id))),
        }
    }

    /// Resolve when the request reaches a terminal state
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Result<BuildResult> {
        if let Some(build) = self.active_build(request_id) {
            let mut rx = build.lock().await.done.subscribe();
            let waited = tokio::time::timeout(timeout, async {
                rx.wait_for(|r| r.is_some()).await.map(|r| r.clone())
            })
            .await;
            return match waited {
                Ok(Ok(result)) => result.ok_or_else(|| {
                    BuildNetError::Internal(format!("build {} finished without a result", request_id))
                }),
                Ok(Err(_)) => self.finished_result(request_id).await,
                Err(_) => Err(BuildNetError::Internal(format!(
                    "timed out after {}s waiting for build {}",
                    timeout.as_secs(),
                    request_id
                ))),
            };
        }
        self.finished_result(request_id).await
    }

    async fn finished_result(&self, request_id: &str) -> Result<BuildResult> {
        self.get_build(request_id)
            .await?
            .and_then(|r| r.result)
            .ok_or_else(|| BuildNetError::NotFound(format!("build {}", request_id)))
    }

    pub async fn get_build(&self, request_id: &str) -> Result<Option<BuildRecord>> {
        if let Some(build) = self.active_build(request_id) {
            return Ok(Some(build.lock().await.record.clone()));
        }
        Ok(self.backend.get_json(&keys::build(request_id)).await?)
    }

    /// Newest first
    pub async fn list_builds(&self, limit: usize) -> Result<Vec<BuildRecord>> {
        let mut records: Vec<BuildRecord> = Vec::new();
        for key in self.backend.keys(keys::BUILDS).await? {
            if let Some(record) = self.backend.get_json::<BuildRecord>(&key).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.request.created_at.cmp(&a.request.created_at));
        records.truncate(limit);
        Ok(records)
    }

    pub async fn active_builds(&self) -> Vec<BuildRecord> {
        let builds: Vec<_> = self.active.iter().map(|e| Arc::clone(e.value())).collect();
        let mut records = Vec::with_capacity(builds.len());
        for build in builds {
            records.push(build.lock().await.record.clone());
        }
        records
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            active_builds: self.active.len(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            ledger_trusted: self.ledger.is_trusted(),
            estimates: self
                .estimates
                .iter()
                .map(|e| (e.key().clone(), e.value().round() as u64))
                .collect(),
        }
    }

    /// Turn a debounced change batch into a build of the affected packages
    pub async fn handle_changes(
        &self,
        batch: &ChangeBatch,
        preparer: &Preparer,
    ) -> Result<Option<BuildRecord>> {
        if batch.impact == ImpactTier::Ignored {
            debug!(paths = batch.paths.len(), "Ignoring change batch");
            return Ok(None);
        }
        let affected = preparer.affected_for_batch(batch);
        self.events.publish(BuildEvent::ChangesDetected {
            impact: batch.impact,
            paths: batch.paths.clone(),
            affected: affected.clone(),
        });
        if affected.is_empty() {
            return Ok(None);
        }
        let request = BuildRequest::new(ActorIdentity::system(), affected, BuildOptions::default());
        self.submit(request).await.map(Some)
    }

    // ========================================================================
    // Background work
    // ========================================================================

    /// One sweep: pending results, claim detection, request deadlines
    pub async fn poll(&self) -> Result<()> {
        for key in self.backend.keys(keys::WORK_RESULTS).await? {
            let Some(outcome) = self.backend.get_json::<UnitOutcome>(&key).await? else {
                continue;
            };
            if !self.handle_outcome(outcome).await? {
                self.backend.delete(&key).await?;
            }
        }
        self.withdraw_orphaned_work().await?;

        let builds: Vec<_> = self.active.iter().map(|e| Arc::clone(e.value())).collect();
        for build in builds {
            let mut build = build.lock().await;
            if build.record.status.is_terminal() {
                continue;
            }
            if build.started.elapsed() > build.deadline {
                let message = format!("build exceeded {}s", build.deadline.as_secs());
                self.finalize(
                    &mut build,
                    BuildStatus::Failed,
                    vec![BuildError::new("TIMEOUT", message)],
                )
                .await?;
                continue;
            }
            if build.record.status == BuildStatus::Queued {
                let published: Vec<String> = build
                    .units
                    .iter()
                    .filter(|(_, u)| u.phase == UnitPhase::Published)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in published {
                    if self.backend.get(&keys::work_claimed(&id)).await?.is_some() {
                        self.mark_running(&mut build).await?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete specs (and their stale results) whose request is not active here
    pub async fn withdraw_orphaned_work(&self) -> Result<usize> {
        let mut withdrawn = 0;
        for key in self.backend.keys(keys::WORK_SPECS).await? {
            let Some(bundle_id) = keys::bundle_id_of(&key, "spec") else {
                continue;
            };
            let Some(item) = self.backend.get_json::<WorkItem>(&key).await? else {
                continue;
            };
            if self.active.contains_key(&item.request_id) {
                continue;
            }
            self.backend.delete(&key).await?;
            self.backend.delete(&keys::work_result(bundle_id)).await?;
            withdrawn += 1;
            debug!(
                request_id = %item.request_id,
                bundle_id = %bundle_id,
                "Withdrew work of an inactive request"
            );
        }
        if withdrawn > 0 {
            info!(withdrawn, "Orphaned work withdrawn");
        }
        Ok(withdrawn)
    }

    /// Fail builds a previous controller left queued or running, then withdraw their work
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for key in self.backend.keys(keys::BUILDS).await? {
            let Some(mut record) = self.backend.get_json::<BuildRecord>(&key).await? else {
                continue;
            };
            let request_id = record.request.request_id.clone();
            if record.status.is_terminal() || self.active.contains_key(&request_id) {
                continue;
            }

            let finished_at = Utc::now();
            let since = record.started_at.unwrap_or(record.request.created_at);
            let errors = vec![BuildError::new(
                CONTROLLER_RESTARTED,
                "controller restarted before the build finished",
            )];
            let previous = record.status;
            record.status = BuildStatus::Failed;
            record.finished_at = Some(finished_at);
            record.result = Some(BuildResult {
                request_id: request_id.clone(),
                status: BuildStatus::Failed,
                success: false,
                results: Vec::new(),
                errors: errors.clone(),
                total_duration_ms: (finished_at - since).num_milliseconds().max(0) as u64,
                finished_at,
            });
            self.persist(&record).await?;
            self.record_transition(&request_id, Some(previous), BuildStatus::Failed)
                .await;
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %request_id, was = %previous, "Build from a previous controller marked failed");
            self.events.publish(BuildEvent::BuildFailed { request_id, errors });
            report.failed_builds += 1;
        }
        report.withdrawn_specs = self.withdraw_orphaned_work().await?;
        Ok(report)
    }

    pub async fn handle_gossip(&self, message: GossipMessage) -> Result<()> {
        if message.is_expired_at(Utc::now()) {
            return Ok(());
        }
        match message.message_type {
            GossipType::WorkCompleted | GossipType::WorkFailed => {
                let outcome: UnitOutcome = message.payload_as()?;
                self.handle_outcome(outcome).await?;
            }
            GossipType::WorkClaimed => {
                let notice: WorkClaimedNotice = message.payload_as()?;
                self.on_claimed(notice).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Delete finished records past retention; suspended while the ledger is untrusted
    pub async fn run_retention(&self) -> Result<usize> {
        if !self.ledger.is_trusted() {
            warn!("Ledger integrity unverified, retention suspended");
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.retention_secs as i64);

        let mut finished: Vec<(DateTime<Utc>, String)> = Vec::new();
        for key in self.backend.keys(keys::BUILDS).await? {
            if let Some(record) = self.backend.get_json::<BuildRecord>(&key).await? {
                if let (true, Some(at)) = (record.status.is_terminal(), record.finished_at) {
                    finished.push((at, key));
                }
            }
        }
        finished.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (idx, (at, key)) in finished.iter().enumerate() {
            if idx >= self.config.history_limit || *at < cutoff {
                if self.backend.delete(key).await? {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "Build history pruned");
        }
        Ok(removed)
    }

    /// Audit the ledger; a broken chain is announced and drops trust
    pub async fn verify_ledger(&self) -> Result<VerificationReport> {
        let report = self.ledger.verify().await?;
        if !report.is_valid() {
            self.events.publish(BuildEvent::LedgerIntegrityFailed {
                errors: report.errors.len(),
                first: report.errors.first().cloned(),
            });
        }
        Ok(report)
    }

    /// Gossip, polling, retention and ledger audit until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let types = [
            GossipType::WorkClaimed,
            GossipType::WorkCompleted,
            GossipType::WorkFailed,
        ];
        let mut gossip = match gossip::subscribe(self.backend.as_ref(), &types).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Gossip unavailable, relying on polling");
                stream::pending::<GossipMessage>().boxed()
            }
        };

        let mut poll = tokio::time::interval(Duration::from_millis(
            self.config.result_poll_interval_ms.max(10),
        ));
        let mut retention = tokio::time::interval(Duration::from_secs(
            self.config.retention_interval_secs.max(1),
        ));
        let verify_enabled = !self.verify_interval.is_zero();
        let mut verify = tokio::time::interval(self.verify_interval.max(Duration::from_secs(1)));

        match self.recover().await {
            Ok(report) if report != RecoveryReport::default() => info!(
                failed_builds = report.failed_builds,
                withdrawn_specs = report.withdrawn_specs,
                "Recovered state from a previous controller"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Startup recovery failed; polling will withdraw orphaned work"),
        }

        info!("Scheduler running");
        loop {
            tokio::select! {
                Some(message) = gossip.next() => {
                    if let Err(e) = self.handle_gossip(message).await {
                        warn!(error = %e, "Gossip handling failed");
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!(error = %e, "Result poll failed");
                    }
                }
                _ = retention.tick() => {
                    if let Err(e) = self.run_retention().await {
                        warn!(error = %e, "Retention pass failed");
                    }
                }
                _ = verify.tick(), if verify_enabled => {
                    if let Err(e) = self.verify_ledger().await {
                        error!(error = %e, "Ledger verification could not run");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Scheduler stopped");
    }

    /// Feed watcher batches into builds until the channel closes
    pub async fn consume_changes(
        self: Arc<Self>,
        preparer: Arc<Preparer>,
        mut rx: mpsc::Receiver<ChangeBatch>,
    ) {
        while let Some(batch) = rx.recv().await {
            match self.handle_changes(&batch, &preparer).await {
                Ok(Some(record)) => debug!(request_id = %record.request.request_id, "Change build submitted"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Could not schedule change build"),
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    async fn persist(&self, record: &BuildRecord) -> Result<()> {
        let key = keys::build(&record.request.request_id);
        let backend = &self.backend;
        with_backoff(&self.retry, "persist build", || {
            backend.set_json(&key, record, None)
        })
        .await?;
        Ok(())
    }

    async fn record_transition(&self, request_id: &str, from: Option<BuildStatus>, to: BuildStatus) {
        let tx = LedgerTransaction::build_state_changed(self.actor.clone(), request_id, from, to);
        if let Err(e) = self.ledger.record(tx).await {
            error!(request_id, error = %e, "Failed to record build transition");
        }
    }
}

/// Bundle ids end up inside backend keys
fn sanitize(package: &str) -> String {
    package
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageConfig;
    use crate::state::MemoryBackend;
    use std::path::PathBuf;

    fn pkg(name: &str, deps: &[&str], time: u64) -> PackageConfig {
        PackageConfig {
            name: name.into(),
            path: PathBuf::from(format!("packages/{}", name)),
            entry: "src/index.ts".into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            estimated_size_kb: 10,
            estimated_time_ms: time,
            priority: 0,
            output_dir: "dist".into(),
        }
    }

    fn scheduler(max_attempts: u32) -> (SharedBackend, Scheduler) {
        let mut config = Config::default();
        config.scheduler.max_attempts = max_attempts;
        config.packages = vec![
            pkg("shared", &[], 100),
            pkg("ui", &["shared"], 200),
            pkg("app", &["ui"], 300),
            pkg("docs", &[], 50),
        ];
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let ledger = Arc::new(Ledger::new(
            backend.clone(),
            &config.ledger,
            RetryPolicy::default(),
        ));
        let scheduler = Scheduler::new(&config, backend.clone(), ledger, EventBus::default());
        (backend, scheduler)
    }

    fn request(targets: &[&str]) -> BuildRequest {
        BuildRequest::new(
            ActorIdentity::user("tester"),
            targets.iter().map(|t| t.to_string()).collect(),
            BuildOptions::default(),
        )
    }

    fn outcome(item: &WorkItem, success: bool) -> UnitOutcome {
        UnitOutcome {
            request_id: item.request_id.clone(),
            bundle_id: item.bundle.id.clone(),
            package: item.bundle.package.clone(),
            attempt: item.attempt,
            worker_id: "w1".into(),
            success,
            duration_ms: 40,
            output_hash: None,
            errors: if success {
                vec![]
            } else {
                vec![BuildError::new("BUILD_FAILED", "boom").at("src/index.ts", Some(1), Some(1))]
            },
            cached: None,
            finished_at: Utc::now(),
        }
    }

    async fn specs(backend: &SharedBackend) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for key in backend.keys(keys::WORK_SPECS).await.unwrap() {
            items.push(backend.get_json::<WorkItem>(&key).await.unwrap().unwrap());
        }
        items
    }

    #[test]
    fn test_decompose_closure_and_critical_path() {
        let (_, scheduler) = scheduler(3);
        let req = request(&["app"]);
        let bundles = scheduler.decompose(&req).unwrap();
        let packages: Vec<_> = bundles.iter().map(|b| b.package.as_str()).collect();
        assert_eq!(packages, vec!["shared", "ui", "app"]);
        assert!(bundles.iter().all(|b| b.priority == CRITICAL_PATH_BOOST));
        assert_eq!(bundles[1].dependencies, vec![bundles[0].id.clone()]);
        assert!(bundles.iter().all(|b| !b.id.contains(':')));
    }

    #[test]
    fn test_decompose_unknown_target() {
        let (_, scheduler) = scheduler(3);
        let err = scheduler.decompose(&request(&["nope"])).unwrap_err();
        assert!(matches!(err, BuildNetError::BadRequest(_)));
    }

    #[test]
    fn test_estimates_seeded_from_measurements() {
        let (_, scheduler) = scheduler(3);
        assert_eq!(scheduler.estimate_for("ui"), 200);
        scheduler.update_estimate("ui", 1000);
        assert_eq!(scheduler.estimate_for("ui"), 1000);
        scheduler.update_estimate("ui", 0);
        assert_eq!(scheduler.estimate_for("ui"), 800);
    }

    #[tokio::test]
    async fn test_dependencies_published_in_order() {
        let (backend, scheduler) = scheduler(3);
        let record = scheduler.submit(request(&["app"])).await.unwrap();
        assert_eq!(record.status, BuildStatus::Queued);

        let first = specs(&backend).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].bundle.package, "shared");

        assert!(scheduler.handle_outcome(outcome(&first[0], true)).await.unwrap());
        // duplicate delivery is a no-op
        assert!(!scheduler.handle_outcome(outcome(&first[0], true)).await.unwrap());

        let second = specs(&backend).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].bundle.package, "ui");
        let running = scheduler
            .get_build(&record.request.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.status, BuildStatus::Running);

        scheduler.handle_outcome(outcome(&second[0], true)).await.unwrap();
        let third = specs(&backend).await;
        scheduler.handle_outcome(outcome(&third[0], true)).await.unwrap();

        let result = scheduler
            .wait(&record.request.request_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.results.len(), 3);
        assert!(specs(&backend).await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_budget_then_failure() {
        let (backend, scheduler) = scheduler(2);
        let record = scheduler.submit(request(&["docs"])).await.unwrap();

        let first = specs(&backend).await;
        assert_eq!(first[0].attempt, 1);
        scheduler.handle_outcome(outcome(&first[0], false)).await.unwrap();

        let retried = specs(&backend).await;
        assert_eq!(retried[0].attempt, 2);
        // the old attempt's outcome is stale now
        assert!(!scheduler.handle_outcome(outcome(&first[0], false)).await.unwrap());

        scheduler.handle_outcome(outcome(&retried[0], false)).await.unwrap();
        let result = scheduler
            .wait(&record.request.request_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.errors[0].file.as_deref(), Some("src/index.ts"));
        assert_eq!(result.results[0].attempts, 2);
        assert!(specs(&backend).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_withdraws_work() {
        let (backend, scheduler) = scheduler(3);
        let record = scheduler.submit(request(&["app", "docs"])).await.unwrap();
        assert_eq!(specs(&backend).await.len(), 2);

        let result = scheduler.cancel(&record.request.request_id).await.unwrap();
        assert_eq!(result.status, BuildStatus::Cancelled);
        assert!(specs(&backend).await.is_empty());
        assert!(result
            .results
            .iter()
            .all(|r| r.status == UnitResultStatus::Skipped));

        // cancelling again returns the same terminal result
        let again = scheduler.cancel(&record.request.request_id).await.unwrap();
        assert_eq!(again.status, BuildStatus::Cancelled);
        assert!(scheduler.cancel("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_poll_picks_up_written_results() {
        let (backend, scheduler) = scheduler(3);
        let record = scheduler.submit(request(&["docs"])).await.unwrap();
        let item = specs(&backend).await.remove(0);
        backend
            .set_json(&keys::work_result(&item.bundle.id), &outcome(&item, true), None)
            .await
            .unwrap();

        scheduler.poll().await.unwrap();
        let result = scheduler
            .wait(&record.request.request_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.success);
        assert!(backend.keys(keys::WORK_RESULTS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restarted_controller_fails_leftover_builds() {
        let (backend, first) = scheduler(3);
        let record = first.submit(request(&["docs"])).await.unwrap();
        let id = record.request.request_id.clone();
        assert_eq!(specs(&backend).await.len(), 1);
        drop(first);

        let ledger = Arc::new(Ledger::new(
            backend.clone(),
            &Config::default().ledger,
            RetryPolicy::default(),
        ));
        let second = Scheduler::new(&Config::default(), backend.clone(), ledger, EventBus::default());
        let report = second.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                failed_builds: 1,
                withdrawn_specs: 1
            }
        );
        assert!(specs(&backend).await.is_empty());

        let stored = second.get_build(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Failed);
        let result = stored.result.unwrap();
        assert_eq!(result.errors[0].code, CONTROLLER_RESTARTED);
        // queued then failed, each a debit and a credit
        let entries = second.ledger.entries_for("build_request", &id).await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(second.verify_ledger().await.unwrap().is_valid());

        // nothing left to do the second time
        assert_eq!(second.recover().await.unwrap(), RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_poll_withdraws_work_of_inactive_requests() {
        let (backend, scheduler) = scheduler(3);
        let live = scheduler.submit(request(&["docs"])).await.unwrap();

        let mut stray = specs(&backend).await.remove(0);
        stray.request_id = "gone".into();
        stray.bundle.id = "gone-docs".into();
        backend
            .set_json(&keys::work_spec("gone-docs"), &stray, None)
            .await
            .unwrap();
        backend
            .set_json(&keys::work_result("gone-docs"), &outcome(&stray, true), None)
            .await
            .unwrap();

        scheduler.poll().await.unwrap();
        let left = specs(&backend).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].request_id, live.request.request_id);
        assert!(backend.get(&keys::work_result("gone-docs")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transitions_are_on_the_ledger() {
        let (backend, scheduler) = scheduler(3);
        let record = scheduler.submit(request(&["docs"])).await.unwrap();
        let item = specs(&backend).await.remove(0);
        scheduler.handle_outcome(outcome(&item, true)).await.unwrap();

        let entries = scheduler
            .ledger
            .entries_for("build_request", &record.request.request_id)
            .await
            .unwrap();
        // queued, running, completed; one debit and one credit each
        assert_eq!(entries.len(), 6);
        assert!(scheduler.verify_ledger().await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_retention_suspended_when_untrusted() {
        let (backend, scheduler) = scheduler(3);
        let record = scheduler.submit(request(&["docs"])).await.unwrap();
        scheduler.cancel(&record.request.request_id).await.unwrap();

        // tamper with the first ledger entry
        let key = keys::ledger_entry(1);
        let mut raw: serde_json::Value =
            serde_json::from_str(&backend.get(&key).await.unwrap().unwrap()).unwrap();
        raw["reason"] = serde_json::json!("rewritten");
        backend.set(&key, &raw.to_string(), None).await.unwrap();

        let mut rx = scheduler.events().subscribe();
        assert!(!scheduler.verify_ledger().await.unwrap().is_valid());
        assert_eq!(rx.recv().await.unwrap().event_type, "ledger_integrity_failed");
        assert_eq!(scheduler.run_retention().await.unwrap(), 0);
    }
}
