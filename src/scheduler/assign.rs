//! Advisory assignment of bundles to worker slots
//!
//! Greedy list scheduling: bundles are visited in dependency order and each
//! goes to the slot where it would finish earliest. The result only seeds
//! `preferred_worker` on published work; atomic claims decide who runs it.

use std::collections::HashMap;

use crate::model::{MicroBundle, PartAssignment, WorkerState, WorkerStatus};

/// What the planner knows about one worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCapacity {
    pub worker_id: String,
    pub free_slots: u32,
    pub success_rate: f64,
}

impl WorkerCapacity {
    /// Draining and offline workers contribute nothing
    pub fn from_state(state: &WorkerState) -> Option<Self> {
        match state.status {
            WorkerStatus::Draining | WorkerStatus::Offline => None,
            _ if state.available_slots == 0 => None,
            _ => Some(Self {
                worker_id: state.worker_id.clone(),
                free_slots: state.available_slots,
                success_rate: state.success_rate,
            }),
        }
    }

    /// Unreliable workers look slower
    fn scale(&self, duration: u64) -> u64 {
        let rate = self.success_rate.clamp(0.1, 1.0);
        (duration as f64 / rate).round() as u64
    }
}

struct Lane<'a> {
    worker: &'a WorkerCapacity,
    free_at: u64,
}

/// `bundles` must be in dependency order
pub fn plan(bundles: &[MicroBundle], workers: &[WorkerCapacity]) -> Vec<PartAssignment> {
    let mut lanes: Vec<Lane> = workers
        .iter()
        .flat_map(|w| (0..w.free_slots).map(move |_| Lane { worker: w, free_at: 0 }))
        .collect();
    if lanes.is_empty() {
        return Vec::new();
    }

    let mut finish: HashMap<&str, u64> = HashMap::new();
    let mut assignments = Vec::with_capacity(bundles.len());

    for bundle in bundles {
        let ready_at = bundle
            .dependencies
            .iter()
            .filter_map(|d| finish.get(d.as_str()))
            .copied()
            .max()
            .unwrap_or(0);

        let Some((idx, start, end)) = lanes
            .iter()
            .enumerate()
            .map(|(i, lane)| {
                let start = lane.free_at.max(ready_at);
                (i, start, start + lane.worker.scale(bundle.estimated_time))
            })
            .min_by_key(|(i, _, end)| (*end, *i))
        else {
            continue;
        };

        let lane = &mut lanes[idx];
        lane.free_at = end;
        finish.insert(bundle.id.as_str(), end);
        assignments.push(PartAssignment {
            bundle: bundle.id.clone(),
            worker_id: lane.worker.worker_id.clone(),
            dependencies: bundle.dependencies.clone(),
            estimated_start: start,
            estimated_duration: end - start,
        });
    }

    assignments
}

/// Estimated wall-clock for the whole plan
pub fn makespan(assignments: &[PartAssignment]) -> u64 {
    assignments
        .iter()
        .map(|a| a.estimated_start + a.estimated_duration)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(id: &str, deps: &[&str], time: u64) -> MicroBundle {
        MicroBundle {
            id: id.into(),
            package: id.into(),
            entry: "src/index.ts".into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            estimated_size: 0,
            estimated_time: time,
            priority: 0,
        }
    }

    fn worker(id: &str, slots: u32) -> WorkerCapacity {
        WorkerCapacity {
            worker_id: id.into(),
            free_slots: slots,
            success_rate: 1.0,
        }
    }

    #[test]
    fn test_independent_bundles_spread_across_workers() {
        let bundles = vec![bundle("a", &[], 100), bundle("b", &[], 100)];
        let plan = plan(&bundles, &[worker("w1", 1), worker("w2", 1)]);
        assert_eq!(plan.len(), 2);
        assert_ne!(plan[0].worker_id, plan[1].worker_id);
        assert_eq!(makespan(&plan), 100);
    }

    #[test]
    fn test_chain_waits_for_dependencies() {
        let bundles = vec![
            bundle("shared", &[], 100),
            bundle("ui", &["shared"], 200),
            bundle("app", &["ui"], 300),
        ];
        let plan = plan(&bundles, &[worker("w1", 2), worker("w2", 2)]);
        assert_eq!(plan[1].estimated_start, 100);
        assert_eq!(plan[2].estimated_start, 300);
        assert_eq!(makespan(&plan), 600);
    }

    #[test]
    fn test_no_capacity_means_no_hints() {
        let bundles = vec![bundle("a", &[], 100)];
        assert!(plan(&bundles, &[]).is_empty());
        assert!(plan(&bundles, &[worker("w1", 0)]).is_empty());
    }

    #[test]
    fn test_unreliable_worker_avoided() {
        let mut flaky = worker("flaky", 1);
        flaky.success_rate = 0.2;
        let plan = plan(&[bundle("a", &[], 100)], &[flaky, worker("solid", 1)]);
        assert_eq!(plan[0].worker_id, "solid");
    }
}
