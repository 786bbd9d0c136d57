//! Typed lifecycle events
//!
//! Components publish [`BuildEvent`]s on a bounded broadcast channel; the
//! HTTP layer turns them into `{event_type, package, message, timestamp}`
//! envelopes for the event stream. Slow subscribers lag and lose events
//! rather than block publishers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{BuildError, IntegrityError};
use crate::watcher::ImpactTier;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildEvent {
    BuildQueued {
        request_id: String,
        targets: Vec<String>,
        bundles: usize,
    },
    BuildStarted {
        request_id: String,
    },
    BuildCompleted {
        request_id: String,
        duration_ms: u64,
    },
    BuildFailed {
        request_id: String,
        errors: Vec<BuildError>,
    },
    BuildCancelled {
        request_id: String,
    },
    UnitClaimed {
        request_id: String,
        bundle_id: String,
        package: String,
        worker_id: String,
        attempt: u32,
    },
    UnitCompleted {
        request_id: String,
        bundle_id: String,
        package: String,
        worker_id: String,
        duration_ms: u64,
    },
    UnitFailed {
        request_id: String,
        bundle_id: String,
        package: String,
        worker_id: String,
        errors: Vec<BuildError>,
    },
    UnitRetried {
        request_id: String,
        bundle_id: String,
        package: String,
        attempt: u32,
    },
    NodeRegistered {
        worker_id: String,
    },
    NodeUnhealthy {
        worker_id: String,
        silent_secs: u64,
    },
    NodeOffline {
        worker_id: String,
    },
    NodeRecovered {
        worker_id: String,
    },
    ChangesDetected {
        impact: ImpactTier,
        paths: Vec<PathBuf>,
        affected: Vec<String>,
    },
    AdapterSwitched {
        from: Option<String>,
        to: String,
    },
    LedgerIntegrityFailed {
        errors: usize,
        first: Option<IntegrityError>,
    },
}

impl BuildEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BuildQueued { .. } => "build_queued",
            Self::BuildStarted { .. } => "build_started",
            Self::BuildCompleted { .. } => "build_completed",
            Self::BuildFailed { .. } => "build_failed",
            Self::BuildCancelled { .. } => "build_cancelled",
            Self::UnitClaimed { .. } => "unit_claimed",
            Self::UnitCompleted { .. } => "unit_completed",
            Self::UnitFailed { .. } => "unit_failed",
            Self::UnitRetried { .. } => "unit_retried",
            Self::NodeRegistered { .. } => "node_registered",
            Self::NodeUnhealthy { .. } => "node_unhealthy",
            Self::NodeOffline { .. } => "node_offline",
            Self::NodeRecovered { .. } => "node_recovered",
            Self::ChangesDetected { .. } => "changes_detected",
            Self::AdapterSwitched { .. } => "adapter_switched",
            Self::LedgerIntegrityFailed { .. } => "ledger_integrity_failed",
        }
    }

    pub fn package(&self) -> Option<&str> {
        match self {
            Self::UnitClaimed { package, .. }
            | Self::UnitCompleted { package, .. }
            | Self::UnitFailed { package, .. }
            | Self::UnitRetried { package, .. } => Some(package),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::BuildQueued { request_id, targets, bundles } => format!(
                "Build {} queued: {} target(s), {} bundle(s)",
                request_id,
                targets.len(),
                bundles
            ),
            Self::BuildStarted { request_id } => format!("Build {} started", request_id),
            Self::BuildCompleted { request_id, duration_ms } => {
                format!("Build {} completed in {}ms", request_id, duration_ms)
            }
            Self::BuildFailed { request_id, errors } => match errors.first() {
                Some(first) => format!("Build {} failed: {}", request_id, first),
                None => format!("Build {} failed", request_id),
            },
            Self::BuildCancelled { request_id } => format!("Build {} cancelled", request_id),
            Self::UnitClaimed { package, worker_id, attempt, .. } => {
                format!("{} claimed by {} (attempt {})", package, worker_id, attempt)
            }
            Self::UnitCompleted { package, worker_id, duration_ms, .. } => {
                format!("{} built by {} in {}ms", package, worker_id, duration_ms)
            }
            Self::UnitFailed { package, worker_id, errors, .. } => format!(
                "{} failed on {} with {} error(s)",
                package,
                worker_id,
                errors.len()
            ),
            Self::UnitRetried { package, attempt, .. } => {
                format!("{} requeued for attempt {}", package, attempt)
            }
            Self::NodeRegistered { worker_id } => format!("Worker {} registered", worker_id),
            Self::NodeUnhealthy { worker_id, silent_secs } => {
                format!("Worker {} unhealthy (silent {}s)", worker_id, silent_secs)
            }
            Self::NodeOffline { worker_id } => format!("Worker {} offline", worker_id),
            Self::NodeRecovered { worker_id } => format!("Worker {} recovered", worker_id),
            Self::ChangesDetected { impact, paths, affected } => format!(
                "{} change(s), impact {}, {} package(s) affected",
                paths.len(),
                impact,
                affected.len()
            ),
            Self::AdapterSwitched { from, to } => match from {
                Some(from) => format!("Bundler switched from {} to {}", from, to),
                None => format!("Bundler {} activated", to),
            },
            Self::LedgerIntegrityFailed { errors, first } => match first {
                Some(first) => format!("Ledger integrity check failed ({} error(s)): {}", errors, first),
                None => format!("Ledger integrity check failed ({} error(s))", errors),
            },
        }
    }
}

/// What subscribers receive
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event_type: &'static str,
    pub package: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub details: BuildEvent,
}

impl From<BuildEvent> for EventEnvelope {
    fn from(event: BuildEvent) -> Self {
        Self {
            event_type: event.event_type(),
            package: event.package().map(str::to_string),
            message: event.message(),
            timestamp: Utc::now(),
            details: event,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BuildEvent) {
        let envelope = EventEnvelope::from(event);
        debug!(event_type = envelope.event_type, "{}", envelope.message);
        // No subscribers is fine
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_envelope_shape() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(BuildEvent::UnitCompleted {
            request_id: "r1".into(),
            bundle_id: "b1".into(),
            package: "app".into(),
            worker_id: "w1".into(),
            duration_ms: 12,
        });
        let envelope = rx.recv().await.unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event_type"], "unit_completed");
        assert_eq!(json["package"], "app");
        assert_eq!(json["message"], "app built by w1 in 12ms");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new(4).publish(BuildEvent::NodeOffline { worker_id: "w".into() });
    }
}
