//! Gossip over the backend's pub/sub channels
//!
//! Delivery is best-effort and unordered. Handlers drop expired and
//! duplicate messages, and peer state only moves forward in time.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use crate::model::WorkerState;
use crate::state::{keys, BackendResult, StateBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GossipType {
    WorkerState,
    WorkClaimed,
    WorkCompleted,
    WorkFailed,
    Heartbeat,
    ResourceAdded,
    ResourceRemoved,
}

impl GossipType {
    pub const ALL: [GossipType; 7] = [
        GossipType::WorkerState,
        GossipType::WorkClaimed,
        GossipType::WorkCompleted,
        GossipType::WorkFailed,
        GossipType::Heartbeat,
        GossipType::ResourceAdded,
        GossipType::ResourceRemoved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GossipType::WorkerState => "WORKER_STATE",
            GossipType::WorkClaimed => "WORK_CLAIMED",
            GossipType::WorkCompleted => "WORK_COMPLETED",
            GossipType::WorkFailed => "WORK_FAILED",
            GossipType::Heartbeat => "HEARTBEAT",
            GossipType::ResourceAdded => "RESOURCE_ADDED",
            GossipType::ResourceRemoved => "RESOURCE_REMOVED",
        }
    }

    /// `gossip:{TYPE}`
    pub fn channel(&self) -> String {
        keys::gossip_channel(self.as_str())
    }
}

impl fmt::Display for GossipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: GossipType,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds
    pub ttl: u64,
    pub payload: serde_json::Value,
}

impl GossipMessage {
    pub fn new<T: Serialize>(
        message_type: GossipType,
        sender_id: &str,
        ttl: Duration,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            message_type,
            sender_id: sender_id.to_string(),
            timestamp: Utc::now(),
            ttl: ttl.as_secs().max(1),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.timestamp + ChronoDuration::seconds(self.ttl as i64) < now
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// `WORK_CLAIMED` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkClaimedNotice {
    pub request_id: String,
    pub bundle_id: String,
    pub package: String,
    pub worker_id: String,
    pub attempt: u32,
}

pub async fn broadcast(backend: &dyn StateBackend, message: &GossipMessage) -> BackendResult<()> {
    let raw = serde_json::to_string(message)?;
    backend.publish(&message.message_type.channel(), &raw).await
}

/// Merged stream over several gossip channels; unparseable messages are dropped
pub async fn subscribe(
    backend: &dyn StateBackend,
    types: &[GossipType],
) -> BackendResult<BoxStream<'static, GossipMessage>> {
    let mut streams = Vec::with_capacity(types.len());
    for t in types {
        let sub = backend.subscribe(&t.channel()).await?;
        streams.push(
            sub.filter_map(|raw| async move { serde_json::from_str::<GossipMessage>(&raw).ok() })
                .boxed(),
        );
    }
    Ok(stream::select_all(streams).boxed())
}

/// Bounded record of recently handled message ids
#[derive(Debug)]
pub struct SeenMessages {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// True the first time an id is seen
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Peers' last known state
pub struct PeerTable {
    peers: DashMap<String, WorkerState>,
    stale_after: Duration,
}

impl PeerTable {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            stale_after,
        }
    }

    /// Keep the newer of the stored and observed state
    pub fn observe(&self, state: WorkerState) {
        match self.peers.get_mut(&state.worker_id) {
            Some(mut current) => {
                if state.last_heartbeat >= current.last_heartbeat {
                    *current = state;
                }
            }
            None => {
                self.peers.insert(state.worker_id.clone(), state);
            }
        }
    }

    pub fn remove(&self, worker_id: &str) -> bool {
        self.peers.remove(worker_id).is_some()
    }

    /// Drop peers whose last heartbeat is older than the staleness window
    pub fn prune(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - ChronoDuration::milliseconds(self.stale_after.as_millis() as i64);
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|p| p.last_heartbeat < cutoff)
            .map(|p| p.key().clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerState> {
        self.peers.get(worker_id).map(|p| p.clone())
    }

    pub fn snapshot(&self) -> Vec<WorkerState> {
        let mut peers: Vec<WorkerState> = self.peers.iter().map(|p| p.clone()).collect();
        peers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
