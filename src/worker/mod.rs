//! Worker agent
//!
//! ```text
//!   start()
//!     ├─ register        resources:{id}, ledger, RESOURCE_ADDED
//!     ├─ heartbeat loop  workers:{id} (short TTL)
//!     ├─ gossip loop     WORKER_STATE out, peers' state in
//!     └─ claim loop      work:*:spec ──setIfNotExists──► work:{id}:claimed
//!                             │ won
//!                             ▼
//!                        bundler.build ──► work:{id}:result, delete claim,
//!                                          release slot, WORK_COMPLETED/FAILED
//! ```
//!
//! Losing a claim race is the normal case and only logged at debug.
//!
//! Every heartbeat tick also renews the TTL of the claims this worker still
//! owns, so a unit may run longer than `claim_ttl_secs`. A claim is renewed
//! and released only while the stored record names this worker and attempt.

pub mod gossip;
pub mod slots;
pub mod stats;

use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bundler::diagnostics::TIMEOUT;
use crate::bundler::{ArtifactCache, BuildContext, BuildFailure, BuildOutput, BundlerManager};
use crate::config::{Config, PackageConfig, WorkerConfig};
use crate::error::{BuildError, BuildNetError, Result};
use crate::ledger::{Ledger, LedgerTransaction};
use crate::model::{
    CacheTier, ClaimRecord, Resource, ResourceStatus, UnitOutcome, WorkItem, WorkerState,
    WorkerStatus,
};
use crate::state::{keys, with_backoff, RetryPolicy, SharedBackend, StateBackendExt};

use gossip::{GossipMessage, GossipType, PeerTable, SeenMessages, WorkClaimedNotice};
use slots::Slots;
use stats::PerformanceStats;

const SEEN_MESSAGES: usize = 4096;

/// A claimed unit that is still running here
#[derive(Debug, Clone)]
struct InFlight {
    package: String,
    attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop claiming, let in-flight units finish, then deregister
    Graceful,
    /// Deregister within the configured bound and leave
    Forced,
}

pub struct WorkerAgent {
    id: String,
    config: WorkerConfig,
    claim_ttl: Duration,
    project_root: PathBuf,
    packages: HashMap<String, PackageConfig>,
    backend: SharedBackend,
    ledger: Arc<Ledger>,
    bundler: Arc<BundlerManager>,
    artifacts: Option<Arc<ArtifactCache>>,
    retry: RetryPolicy,
    slots: Slots,
    stats: Mutex<PerformanceStats>,
    peers: PeerTable,
    seen: Mutex<SeenMessages>,
    /// bundle id → running unit
    in_flight: DashMap<String, InFlight>,
    /// Serializes claim renewal against release
    claim_guard: Mutex<()>,
    draining: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerAgent {
    pub fn new(
        id: impl Into<String>,
        config: &Config,
        backend: SharedBackend,
        ledger: Arc<Ledger>,
        bundler: Arc<BundlerManager>,
    ) -> Self {
        let worker = config.worker.clone();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: id.into(),
            claim_ttl: config.scheduler.claim_ttl(),
            project_root: config.node.project_root.clone(),
            packages: config
                .packages
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            backend,
            ledger,
            bundler,
            artifacts: None,
            retry: RetryPolicy::from_config(&config.backend),
            slots: Slots::new(worker.concurrency.max(1)),
            stats: Mutex::new(PerformanceStats::new(worker.ema_alpha)),
            peers: PeerTable::new(Duration::from_secs(worker.peer_stale_secs)),
            seen: Mutex::new(SeenMessages::new(SEEN_MESSAGES)),
            in_flight: DashMap::new(),
            claim_guard: Mutex::new(()),
            draining: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            config: worker,
        }
    }

    /// Skip or restore units whose sources are already cached
    pub fn with_artifacts(mut self, cache: Arc<ArtifactCache>) -> Self {
        self.artifacts = Some(cache);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn slots(&self) -> &Slots {
        &self.slots
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub async fn performance(&self) -> PerformanceStats {
        self.stats.lock().await.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register and spawn the heartbeat, gossip and claim loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.register().await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(
            Arc::clone(self).heartbeat_loop(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).gossip_loop(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).claim_loop(self.shutdown_tx.subscribe()),
        ));

        info!(
            worker_id = %self.id,
            slots = self.slots.max(),
            "Worker started"
        );
        Ok(())
    }

    pub async fn register(&self) -> Result<()> {
        let resource = Resource::new(&self.id, self.config.capabilities.clone(), self.slots.max());
        let key = keys::resource(&self.id);
        let backend = &self.backend;
        with_backoff(&self.retry, "register resource", || {
            backend.set_json(&key, &resource, None)
        })
        .await?;
        self.heartbeat_once().await?;

        self.record(LedgerTransaction::worker_registered(&self.id, self.slots.max()))
            .await;
        self.announce(GossipType::ResourceAdded, &resource).await;
        info!(worker_id = %self.id, "Worker registered");
        Ok(())
    }

    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        self.draining.store(true, Ordering::SeqCst);
        match mode {
            ShutdownMode::Graceful => {
                info!(worker_id = %self.id, in_flight = self.slots.in_use(), "Draining");
                if let Err(e) = self.mark_draining().await {
                    warn!(error = %e, "Could not publish draining state");
                }

                let deadline = Instant::now() + Duration::from_secs(self.config.drain_timeout_secs);
                while self.slots.in_use() > 0 && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                if self.slots.in_use() > 0 {
                    warn!(
                        in_flight = self.slots.in_use(),
                        "Drain timeout reached; remaining claims will expire"
                    );
                }

                self.stop_loops().await;
                self.remove_registration().await?;
                self.announce_departure().await;
                Ok(())
            }
            ShutdownMode::Forced => {
                warn!(worker_id = %self.id, "Forced shutdown");
                self.stop_loops().await;
                let bound = Duration::from_secs(self.config.deregister_timeout_secs);
                match tokio::time::timeout(bound, self.remove_registration()).await {
                    Ok(Ok(())) => {
                        let _ = tokio::time::timeout(bound, self.announce_departure()).await;
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(BuildNetError::Internal(format!(
                        "deregistration did not finish within {}s",
                        bound.as_secs()
                    ))),
                }
            }
        }
    }

    async fn mark_draining(&self) -> Result<()> {
        let key = keys::resource(&self.id);
        if let Some(mut resource) = self.backend.get_json::<Resource>(&key).await? {
            resource.record_health(ResourceStatus::Draining, Some("shutting down".into()));
            self.backend.set_json(&key, &resource, None).await?;
        }
        self.heartbeat_once().await?;
        Ok(())
    }

    async fn stop_loops(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                debug!("Worker loop did not stop in time");
            }
        }
    }

    async fn remove_registration(&self) -> Result<()> {
        self.backend.delete(&keys::worker(&self.id)).await?;
        self.backend.delete(&keys::resource(&self.id)).await?;
        info!(worker_id = %self.id, "Worker deregistered");
        Ok(())
    }

    async fn announce_departure(&self) {
        self.record(LedgerTransaction::worker_deregistered(&self.id, self.slots.max()))
            .await;
        self.announce(GossipType::ResourceRemoved, &self.id).await;
    }

    // ========================================================================
    // Heartbeat and gossip
    // ========================================================================

    /// Current view of this worker
    pub async fn state(&self) -> WorkerState {
        let max = self.slots.max();
        let available = self.slots.available();
        let in_use = max.saturating_sub(available);
        let status = if self.is_draining() {
            WorkerStatus::Draining
        } else if in_use > 0 {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        };
        let stats = self.stats.lock().await;
        WorkerState {
            worker_id: self.id.clone(),
            status,
            current_task: self.in_flight.iter().next().map(|e| e.value().package.clone()),
            load_percentage: in_use as f64 / max.max(1) as f64 * 100.0,
            available_slots: available,
            max_slots: max,
            last_heartbeat: chrono::Utc::now(),
            success_rate: stats.success_rate,
            avg_duration_ms: stats.avg_duration_ms,
        }
    }

    pub async fn heartbeat_once(&self) -> Result<WorkerState> {
        let state = self.state().await;
        let key = keys::worker(&self.id);
        let ttl = Some(Duration::from_secs(self.config.state_ttl_secs));
        let backend = &self.backend;
        with_backoff(&self.retry, "heartbeat", || backend.set_json(&key, &state, ttl)).await?;
        Ok(state)
    }

    /// Publish our state, refresh peers from the backend and prune stale ones
    pub async fn gossip_once(&self) -> Result<()> {
        let state = self.state().await;
        self.announce(GossipType::WorkerState, &state).await;

        for key in self.backend.keys(keys::WORKERS).await? {
            if keys::id_of(&key, "workers") == Some(self.id.as_str()) {
                continue;
            }
            if let Some(peer) = self.backend.get_json::<WorkerState>(&key).await? {
                self.peers.observe(peer);
            }
        }
        let pruned = self.peers.prune(chrono::Utc::now());
        if !pruned.is_empty() {
            debug!(?pruned, "Pruned stale peers");
        }
        Ok(())
    }

    /// Returns whether the message was applied
    pub async fn handle_gossip(&self, message: GossipMessage) -> bool {
        if message.sender_id == self.id || message.is_expired_at(chrono::Utc::now()) {
            return false;
        }
        if !self.seen.lock().await.insert(&message.message_id) {
            return false;
        }
        match message.message_type {
            GossipType::WorkerState | GossipType::Heartbeat => {
                match message.payload_as::<WorkerState>() {
                    Ok(state) => self.peers.observe(state),
                    Err(e) => {
                        debug!(error = %e, "Malformed worker state gossip");
                        return false;
                    }
                }
            }
            GossipType::ResourceRemoved => {
                self.peers.remove(&message.sender_id);
            }
            _ => {}
        }
        true
    }

    async fn announce<T: serde::Serialize>(&self, message_type: GossipType, payload: &T) {
        let ttl = Duration::from_secs(self.config.state_ttl_secs);
        let message = match GossipMessage::new(message_type, &self.id, ttl, payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Could not encode gossip");
                return;
            }
        };
        if let Err(e) = gossip::broadcast(self.backend.as_ref(), &message).await {
            debug!(message_type = %message_type, error = %e, "Gossip broadcast failed");
        }
    }

    /// Extend the TTL of every claim this worker still owns.
    ///
    /// Returns how many claims were renewed. A claim that expired or now
    /// belongs to someone else is left alone; the running unit's result will
    /// be discarded by the scheduler as stale.
    pub async fn renew_claims(&self) -> Result<usize> {
        let _guard = self.claim_guard.lock().await;
        let running: Vec<(String, u32)> = self
            .in_flight
            .iter()
            .map(|e| (e.key().clone(), e.value().attempt))
            .collect();

        let mut renewed = 0;
        for (bundle_id, attempt) in running {
            let key = keys::work_claimed(&bundle_id);
            match self.backend.get_json::<ClaimRecord>(&key).await? {
                Some(record) if record.worker_id == self.id && record.attempt == attempt => {
                    self.backend
                        .set_json(&key, &record, Some(self.claim_ttl))
                        .await?;
                    renewed += 1;
                }
                Some(record) => {
                    warn!(
                        bundle_id = %bundle_id,
                        holder = %record.worker_id,
                        "Claim taken over while building"
                    );
                }
                None => {
                    warn!(bundle_id = %bundle_id, "Claim expired while building");
                }
            }
        }
        Ok(renewed)
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms.max(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.config.renew_claims && !self.in_flight.is_empty() {
                        if let Err(e) = self.renew_claims().await {
                            warn!(error = %e, "Claim renewal failed");
                        }
                    }
                    match self.heartbeat_once().await {
                        Ok(state) => self.announce(GossipType::Heartbeat, &state).await,
                        Err(e) => warn!(error = %e, "Heartbeat failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let types = [
            GossipType::WorkerState,
            GossipType::Heartbeat,
            GossipType::ResourceRemoved,
        ];
        let mut inbound = match gossip::subscribe(self.backend.as_ref(), &types).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Gossip subscription failed; peers refresh from backend only");
                futures::stream::pending::<GossipMessage>().boxed()
            }
        };
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.gossip_interval_ms.max(10)));
        loop {
            tokio::select! {
                Some(message) = inbound.next() => {
                    self.handle_gossip(message).await;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.gossip_once().await {
                        warn!(error = %e, "Gossip round failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    // ========================================================================
    // Claiming and execution
    // ========================================================================

    /// Claimable work, best candidates first
    pub async fn pending_work(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        for key in self.backend.keys(keys::WORK_SPECS).await? {
            let Some(bundle_id) = keys::bundle_id_of(&key, "spec") else {
                continue;
            };
            if self.backend.get(&keys::work_result(bundle_id)).await?.is_some() {
                continue;
            }
            if let Some(item) = self.backend.get_json::<WorkItem>(&key).await? {
                items.push(item);
            }
        }
        items.sort_by(|a, b| {
            let mine = |i: &WorkItem| i.preferred_worker.as_deref() == Some(self.id.as_str());
            mine(b)
                .cmp(&mine(a))
                .then(b.bundle.priority.cmp(&a.bundle.priority))
                .then(a.published_at.cmp(&b.published_at))
        });
        Ok(items)
    }

    /// Take a slot and race for the claim. Does not execute.
    pub async fn claim(&self, item: &WorkItem) -> Result<bool> {
        if self.is_draining() || !self.slots.acquire() {
            return Ok(false);
        }

        let key = keys::work_claimed(&item.bundle.id);
        let record = ClaimRecord {
            worker_id: self.id.clone(),
            claimed_at: chrono::Utc::now(),
            attempt: item.attempt,
        };
        let won = match self
            .backend
            .set_json_if_not_exists(&key, &record, Some(self.claim_ttl))
            .await
        {
            Ok(won) => won,
            Err(e) => {
                self.slots.release();
                return Err(e.into());
            }
        };
        if !won {
            self.slots.release();
            debug!(
                bundle_id = %item.bundle.id,
                error = %BuildNetError::ClaimLost(item.bundle.id.clone()),
                "Claim lost"
            );
            return Ok(false);
        }

        // The work item may have moved to another attempt or been withdrawn meanwhile
        let current = self
            .backend
            .get_json::<WorkItem>(&keys::work_spec(&item.bundle.id))
            .await;
        let live = matches!(
            &current,
            Ok(Some(spec)) if spec.request_id == item.request_id && spec.attempt == item.attempt
        );
        if !live {
            let _ = self.backend.delete(&key).await;
            self.slots.release();
            debug!(bundle_id = %item.bundle.id, "Claimed work is no longer current");
            return Ok(false);
        }

        self.in_flight.insert(
            item.bundle.id.clone(),
            InFlight {
                package: item.bundle.package.clone(),
                attempt: item.attempt,
            },
        );
        info!(
            worker_id = %self.id,
            bundle_id = %item.bundle.id,
            package = %item.bundle.package,
            attempt = item.attempt,
            "Claimed"
        );
        self.record(LedgerTransaction::slot_claimed(
            &self.id,
            &item.bundle.id,
            &item.request_id,
            item.attempt,
        ))
        .await;
        self.announce(
            GossipType::WorkClaimed,
            &WorkClaimedNotice {
                request_id: item.request_id.clone(),
                bundle_id: item.bundle.id.clone(),
                package: item.bundle.package.clone(),
                worker_id: self.id.clone(),
                attempt: item.attempt,
            },
        )
        .await;
        Ok(true)
    }

    /// Claim whatever fits in free slots and start executing it
    pub async fn claim_once(self: &Arc<Self>) -> Result<usize> {
        let mut claimed = 0;
        for item in self.pending_work().await? {
            if self.is_draining() || self.slots.available() == 0 {
                break;
            }
            if self.claim(&item).await? {
                claimed += 1;
                let agent = Arc::clone(self);
                tokio::spawn(async move {
                    agent.execute(item).await;
                });
            }
        }
        Ok(claimed)
    }

    async fn claim_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_draining() || self.slots.available() == 0 {
                        continue;
                    }
                    if let Err(e) = self.claim_once().await {
                        warn!(error = %e, "Claim pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    fn context_for(&self, item: &WorkItem) -> std::result::Result<BuildContext, BuildError> {
        let pkg = self.packages.get(&item.bundle.package).ok_or_else(|| {
            BuildError::new(
                "UNKNOWN_PACKAGE",
                format!("package {} is not configured on {}", item.bundle.package, self.id),
            )
        })?;
        let package_dir = self.project_root.join(&pkg.path);
        Ok(BuildContext {
            package: item.bundle.package.clone(),
            project_root: self.project_root.clone(),
            output_dir: package_dir.join(&pkg.output_dir),
            package_dir,
            entry: item.bundle.entry.clone(),
            mode: item.options.mode,
            timeout: Duration::from_secs(
                item.options
                    .timeout_secs
                    .unwrap_or(self.config.unit_timeout_secs),
            ),
        })
    }

    /// Serve the unit from the artifact cache unless forced, otherwise run
    /// the bundler and cache what it produced
    async fn build_unit(
        &self,
        item: &WorkItem,
        ctx: BuildContext,
        started: Instant,
    ) -> std::result::Result<(BuildOutput, Option<CacheTier>), BuildFailure> {
        let ctx = Arc::new(ctx);
        let key = match &self.artifacts {
            Some(_) => {
                let ctx = Arc::clone(&ctx);
                tokio::task::spawn_blocking(move || ArtifactCache::source_key(&ctx))
                    .await
                    .ok()
                    .flatten()
            }
            None => None,
        };

        if let (Some(cache), Some(key), false) = (&self.artifacts, &key, item.options.force) {
            let (cache, lookup_ctx, key) = (Arc::clone(cache), Arc::clone(&ctx), key.clone());
            match tokio::task::spawn_blocking(move || cache.lookup(&lookup_ctx, &key)).await {
                Ok(Ok(Some(hit))) => {
                    info!(
                        bundle_id = %item.bundle.id,
                        package = %item.bundle.package,
                        tier = ?hit.tier,
                        "Served from artifact cache"
                    );
                    let output = BuildOutput {
                        adapter: "cache".into(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        output_hash: Some(hit.output_hash),
                        warnings: Vec::new(),
                    };
                    return Ok((output, Some(hit.tier)));
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(package = %item.bundle.package, error = %e, "Artifact lookup failed"),
                Err(e) => warn!(package = %item.bundle.package, error = %e, "Artifact lookup panicked"),
            }
        }

        // adapters enforce the timeout themselves; this bounds misbehaving ones
        let bound = ctx.timeout + Duration::from_secs(5);
        let result = match tokio::time::timeout(bound, self.bundler.build(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(BuildFailure::single(
                BuildError::new(TIMEOUT, format!("build exceeded {}s", bound.as_secs())),
                started.elapsed().as_millis() as u64,
            )),
        };

        if let (Ok(_), Some(cache), Some(key)) = (&result, &self.artifacts, key) {
            let cache = Arc::clone(cache);
            match tokio::task::spawn_blocking(move || cache.store(&ctx, &key)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(package = %item.bundle.package, error = %e, "Could not cache build output"),
                Err(e) => warn!(package = %item.bundle.package, error = %e, "Artifact store panicked"),
            }
        }
        result.map(|output| (output, None))
    }

    /// Run a claimed unit to completion and report it
    pub async fn execute(&self, item: WorkItem) -> UnitOutcome {
        let started = Instant::now();
        let result = match self.context_for(&item) {
            Ok(ctx) => self.build_unit(&item, ctx, started).await,
            Err(e) => Err(BuildFailure::single(e, 0)),
        };

        let outcome = match result {
            Ok((output, cached)) => UnitOutcome {
                request_id: item.request_id.clone(),
                bundle_id: item.bundle.id.clone(),
                package: item.bundle.package.clone(),
                attempt: item.attempt,
                worker_id: self.id.clone(),
                success: true,
                duration_ms: output.duration_ms,
                output_hash: output.output_hash,
                errors: Vec::new(),
                cached,
                finished_at: chrono::Utc::now(),
            },
            Err(failure) => UnitOutcome {
                request_id: item.request_id.clone(),
                bundle_id: item.bundle.id.clone(),
                package: item.bundle.package.clone(),
                attempt: item.attempt,
                worker_id: self.id.clone(),
                success: false,
                duration_ms: failure.duration_ms,
                output_hash: None,
                errors: failure.errors,
                cached: None,
                finished_at: chrono::Utc::now(),
            },
        };

        self.finish(&outcome).await;
        outcome
    }

    async fn finish(&self, outcome: &UnitOutcome) {
        let result_key = keys::work_result(&outcome.bundle_id);
        let backend = &self.backend;
        if let Err(e) = with_backoff(&self.retry, "write result", || {
            backend.set_json(&result_key, outcome, None)
        })
        .await
        {
            error!(bundle_id = %outcome.bundle_id, error = %e, "Could not write unit result");
        }

        if let Err(e) = self.release_claim(&outcome.bundle_id, outcome.attempt).await {
            warn!(bundle_id = %outcome.bundle_id, error = %e, "Claim not released; it will expire");
        }
        self.slots.release();
        self.stats
            .lock()
            .await
            .record(outcome.success, outcome.duration_ms);

        let message_type = if outcome.success {
            info!(
                bundle_id = %outcome.bundle_id,
                package = %outcome.package,
                duration_ms = outcome.duration_ms,
                "Unit completed"
            );
            GossipType::WorkCompleted
        } else {
            warn!(
                bundle_id = %outcome.bundle_id,
                package = %outcome.package,
                errors = outcome.errors.len(),
                "Unit failed"
            );
            GossipType::WorkFailed
        };
        self.announce(message_type, outcome).await;
        self.record(LedgerTransaction::claim_released(
            &self.id,
            &outcome.bundle_id,
            &outcome.request_id,
            outcome.success,
        ))
        .await;
    }

    /// Stop renewing and delete the claim if it is still ours
    async fn release_claim(&self, bundle_id: &str, attempt: u32) -> Result<bool> {
        let _guard = self.claim_guard.lock().await;
        self.in_flight.remove(bundle_id);

        let key = keys::work_claimed(bundle_id);
        match self.backend.get_json::<ClaimRecord>(&key).await? {
            Some(record) if record.worker_id == self.id && record.attempt == attempt => {
                Ok(self.backend.delete(&key).await?)
            }
            Some(record) => {
                debug!(bundle_id = %bundle_id, holder = %record.worker_id, "Claim held elsewhere; left in place");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn record(&self, tx: LedgerTransaction) {
        if let Err(e) = self.ledger.record(tx).await {
            error!(worker_id = %self.id, error = %e, "Ledger write failed");
        }
    }
}
