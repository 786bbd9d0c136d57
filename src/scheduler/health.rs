//! Worker liveness
//!
//! Heartbeats land in `workers:{id}` with a short TTL. The monitor remembers
//! the newest heartbeat it has observed per worker so that an expired key
//! still yields a silence duration:
//!
//! ```text
//!   silent < heartbeat_timeout            online (or recovered)
//!   heartbeat_timeout <= silent < offline  unhealthy, claims reported orphaned
//!   silent >= offline_after                offline, resource record removed
//! ```
//!
//! Orphaned claims are not deleted; they become claimable once their TTL lapses.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::events::{BuildEvent, EventBus};
use crate::config::SchedulerConfig;
use crate::error::{BuildNetError, Result};
use crate::ledger::{Ledger, LedgerTransaction};
use crate::model::{ClaimRecord, Resource, ResourceStatus, WorkerState};
use crate::state::{keys, SharedBackend, StateBackendExt};

#[derive(Debug, Clone)]
struct NodeView {
    status: ResourceStatus,
    last_seen: DateTime<Utc>,
}

/// Outcome of one health pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub online: Vec<String>,
    pub unhealthy: Vec<String>,
    pub offline: Vec<String>,
    pub draining: Vec<String>,
    /// `(bundle_id, worker_id)`
    pub orphaned_claims: Vec<(String, String)>,
    /// Free slots advertised by live workers
    pub available_slots: u32,
}

pub struct HealthMonitor {
    backend: SharedBackend,
    ledger: Arc<Ledger>,
    events: EventBus,
    config: SchedulerConfig,
    nodes: DashMap<String, NodeView>,
}

impl HealthMonitor {
    pub fn new(
        backend: SharedBackend,
        ledger: Arc<Ledger>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            backend,
            ledger,
            events,
            config,
            nodes: DashMap::new(),
        }
    }

    pub async fn check(&self) -> Result<HealthReport> {
        self.check_at(Utc::now()).await
    }

    /// One pass with an explicit clock
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let mut report = HealthReport::default();

        let mut resources = Vec::new();
        for key in self.backend.keys(keys::RESOURCES).await? {
            if let Some(resource) = self.backend.get_json::<Resource>(&key).await? {
                resources.push(resource);
            }
        }

        let mut heartbeats = std::collections::HashMap::new();
        for key in self.backend.keys(keys::WORKERS).await? {
            if let Some(state) = self.backend.get_json::<WorkerState>(&key).await? {
                heartbeats.insert(state.worker_id.clone(), state);
            }
        }

        let heartbeat_timeout = chrono::Duration::seconds(self.config.heartbeat_timeout_secs as i64);
        let offline_after = chrono::Duration::seconds(self.config.offline_after_secs as i64);

        for mut resource in resources {
            let id = resource.id.clone();
            let state = heartbeats.get(&id);

            let observed = state
                .map(|s| s.last_heartbeat)
                .unwrap_or(resource.last_seen)
                .max(resource.last_seen);
            let last_seen = match self.nodes.get(&id) {
                Some(view) => view.last_seen.max(observed),
                None => {
                    info!(worker_id = %id, "Worker registered");
                    self.events.publish(BuildEvent::NodeRegistered { worker_id: id.clone() });
                    observed
                }
            };
            let previous = self
                .nodes
                .get(&id)
                .map(|v| v.status)
                .unwrap_or(resource.status);
            let silent = now - last_seen;

            let next = if silent >= offline_after {
                ResourceStatus::Offline
            } else if silent >= heartbeat_timeout {
                ResourceStatus::Unhealthy
            } else if resource.status == ResourceStatus::Draining {
                ResourceStatus::Draining
            } else {
                ResourceStatus::Online
            };

            self.nodes.insert(
                id.clone(),
                NodeView {
                    status: next,
                    last_seen,
                },
            );

            match next {
                ResourceStatus::Online => report.online.push(id.clone()),
                ResourceStatus::Draining => report.draining.push(id.clone()),
                ResourceStatus::Unhealthy => report.unhealthy.push(id.clone()),
                _ => report.offline.push(id.clone()),
            }
            if matches!(next, ResourceStatus::Online | ResourceStatus::Draining) {
                report.available_slots += state.map(|s| s.available_slots).unwrap_or(0);
            }

            if next == previous {
                continue;
            }

            let silent_secs = silent.num_seconds().max(0) as u64;
            match next {
                ResourceStatus::Unhealthy => {
                    warn!(
                        worker_id = %id,
                        error = %BuildNetError::HeartbeatTimeout(format!("silent for {}s", silent_secs)),
                        "Worker unhealthy"
                    );
                    self.events.publish(BuildEvent::NodeUnhealthy {
                        worker_id: id.clone(),
                        silent_secs,
                    });
                    report.orphaned_claims.extend(self.report_orphans(&id).await?);
                }
                ResourceStatus::Offline => {
                    warn!(worker_id = %id, silent_secs, "Worker offline, removing resource");
                    self.events.publish(BuildEvent::NodeOffline { worker_id: id.clone() });
                    if previous != ResourceStatus::Unhealthy {
                        report.orphaned_claims.extend(self.report_orphans(&id).await?);
                    }
                }
                ResourceStatus::Online if previous == ResourceStatus::Unhealthy => {
                    info!(worker_id = %id, "Worker recovered");
                    self.events.publish(BuildEvent::NodeRecovered { worker_id: id.clone() });
                }
                _ => {}
            }

            self.record(LedgerTransaction::node_health_changed(&id, previous, next))
                .await;

            if next == ResourceStatus::Offline {
                resource.record_health(next, Some(format!("silent for {}s", silent_secs)));
                self.backend.delete(&keys::resource(&id)).await?;
                self.nodes.remove(&id);
            } else {
                resource.record_health(next, None);
                resource.last_seen = last_seen;
                self.backend
                    .set_json(&keys::resource(&id), &resource, None)
                    .await?;
            }
        }

        Ok(report)
    }

    /// Claims still held by a silent worker
    async fn report_orphans(&self, worker_id: &str) -> Result<Vec<(String, String)>> {
        let mut orphans = Vec::new();
        for key in self.backend.keys("work:*:claimed").await? {
            let Some(bundle_id) = keys::bundle_id_of(&key, "claimed") else {
                continue;
            };
            let Some(claim) = self.backend.get_json::<ClaimRecord>(&key).await? else {
                continue;
            };
            if claim.worker_id != worker_id {
                continue;
            }
            warn!(
                worker_id,
                bundle_id,
                "Claim orphaned; it will be requeued when its TTL lapses"
            );
            self.record(LedgerTransaction::claim_orphaned(worker_id, bundle_id))
                .await;
            orphans.push((bundle_id.to_string(), worker_id.to_string()));
        }
        Ok(orphans)
    }

    async fn record(&self, tx: LedgerTransaction) {
        if let Err(e) = self.ledger.record(tx).await {
            error!(error = %e, "Failed to record health transition");
        }
    }

    /// Known workers and their last status
    pub fn snapshot(&self) -> Vec<(String, ResourceStatus)> {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .map(|n| (n.key().clone(), n.status))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
            self.config.health_interval_ms.max(50),
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.check().await {
                        Ok(report) => debug!(
                            online = report.online.len(),
                            unhealthy = report.unhealthy.len(),
                            offline = report.offline.len(),
                            "Health pass"
                        ),
                        Err(e) => warn!(error = %e, "Health pass failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::model::WorkerStatus;
    use crate::state::{MemoryBackend, RetryPolicy};
    use std::time::Duration;

    async fn setup() -> (SharedBackend, Arc<Ledger>, EventBus, HealthMonitor) {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let ledger = Arc::new(Ledger::new(
            backend.clone(),
            &LedgerConfig::default(),
            RetryPolicy::default(),
        ));
        let events = EventBus::default();
        let monitor = HealthMonitor::new(
            backend.clone(),
            ledger.clone(),
            events.clone(),
            SchedulerConfig::default(),
        );
        (backend, ledger, events, monitor)
    }

    async fn register(backend: &SharedBackend, id: &str) {
        let resource = Resource::new(id, vec![], 2);
        backend
            .set_json(&keys::resource(id), &resource, None)
            .await
            .unwrap();
        let state = WorkerState {
            worker_id: id.into(),
            status: WorkerStatus::Idle,
            current_task: None,
            load_percentage: 0.0,
            available_slots: 2,
            max_slots: 2,
            last_heartbeat: Utc::now(),
            success_rate: 1.0,
            avg_duration_ms: 0.0,
        };
        backend
            .set_json(&keys::worker(id), &state, Some(Duration::from_secs(15)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_silent_worker_goes_unhealthy_then_offline() {
        let (backend, ledger, events, monitor) = setup().await;
        let mut rx = events.subscribe();
        register(&backend, "w1").await;
        let claim = ClaimRecord {
            worker_id: "w1".into(),
            claimed_at: Utc::now(),
            attempt: 1,
        };
        backend
            .set_json(&keys::work_claimed("b1"), &claim, Some(Duration::from_secs(120)))
            .await
            .unwrap();

        let now = Utc::now();
        let report = monitor.check_at(now).await.unwrap();
        assert_eq!(report.online, vec!["w1".to_string()]);
        assert_eq!(report.available_slots, 2);
        assert_eq!(rx.recv().await.unwrap().event_type, "node_registered");

        let report = monitor
            .check_at(now + chrono::Duration::seconds(31))
            .await
            .unwrap();
        assert_eq!(report.unhealthy, vec!["w1".to_string()]);
        assert_eq!(report.orphaned_claims, vec![("b1".to_string(), "w1".to_string())]);
        assert_eq!(rx.recv().await.unwrap().event_type, "node_unhealthy");

        let report = monitor
            .check_at(now + chrono::Duration::seconds(91))
            .await
            .unwrap();
        assert_eq!(report.offline, vec!["w1".to_string()]);
        assert_eq!(rx.recv().await.unwrap().event_type, "node_offline");
        assert!(backend.get(&keys::resource("w1")).await.unwrap().is_none());

        // health transitions and the orphaned claim are on the ledger
        let history = ledger.entries_for("worker", "w1").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(ledger.entries_for("bundle", "b1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recovery() {
        let (backend, _ledger, events, monitor) = setup().await;
        register(&backend, "w1").await;
        let now = Utc::now();
        monitor.check_at(now).await.unwrap();
        let report = monitor
            .check_at(now + chrono::Duration::seconds(40))
            .await
            .unwrap();
        assert_eq!(report.unhealthy.len(), 1);

        let mut rx = events.subscribe();
        // a fresh heartbeat arrives
        let mut state: WorkerState = backend.get_json(&keys::worker("w1")).await.unwrap().unwrap();
        state.last_heartbeat = now + chrono::Duration::seconds(45);
        backend.set_json(&keys::worker("w1"), &state, None).await.unwrap();

        let report = monitor
            .check_at(now + chrono::Duration::seconds(46))
            .await
            .unwrap();
        assert_eq!(report.online, vec!["w1".to_string()]);
        assert_eq!(rx.recv().await.unwrap().event_type, "node_recovered");
    }
}
