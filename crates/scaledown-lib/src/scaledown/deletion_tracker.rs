//! Process-wide bookkeeping of node deletions

use super::{ActuationStatus, DeletionResult};
use crate::models::Pod;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

/// How long evicted pods count as recently evicted
pub const EVICTION_TTL: std::time::Duration = std::time::Duration::from_secs(3 * 60);

#[derive(Debug, Default)]
struct TrackerState {
    deletions_per_group: HashMap<String, usize>,
    empty_nodes: BTreeSet<String>,
    drained_nodes: BTreeSet<String>,
    results: HashMap<String, (DeletionResult, DateTime<Utc>)>,
    evictions: Vec<(Pod, DateTime<Utc>)>,
}

/// Tracks in-flight deletions per node group, terminal results per node and recent evictions.
/// Every operation takes the single lock for a map update only.
#[derive(Debug)]
pub struct NodeDeletionTracker {
    state: Mutex<TrackerState>,
    eviction_ttl: ChronoDuration,
}

impl Default for NodeDeletionTracker {
    fn default() -> Self {
        Self::new(EVICTION_TTL)
    }
}

impl NodeDeletionTracker {
    pub fn new(eviction_ttl: std::time::Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            eviction_ttl: ChronoDuration::from_std(eviction_ttl)
                .unwrap_or_else(|_| ChronoDuration::minutes(3)),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers deletion of an empty node
    pub fn start_deletion(&self, node_group_id: &str, node_name: &str) {
        let mut state = self.state();
        *state
            .deletions_per_group
            .entry(node_group_id.to_string())
            .or_insert(0) += 1;
        state.empty_nodes.insert(node_name.to_string());
    }

    /// Registers deletion of a node that needs draining first
    pub fn start_deletion_with_drain(&self, node_group_id: &str, node_name: &str) {
        let mut state = self.state();
        *state
            .deletions_per_group
            .entry(node_group_id.to_string())
            .or_insert(0) += 1;
        state.drained_nodes.insert(node_name.to_string());
    }

    pub fn end_deletion(&self, node_group_id: &str, node_name: &str, result: DeletionResult) {
        self.end_deletion_at(node_group_id, node_name, result, Utc::now());
    }

    pub fn end_deletion_at(
        &self,
        node_group_id: &str,
        node_name: &str,
        result: DeletionResult,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state();
        match state.deletions_per_group.get_mut(node_group_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    state.deletions_per_group.remove(node_group_id);
                }
            }
            _ => error!(
                node_group = %node_group_id,
                node = %node_name,
                "Deletion ended for a node group without deletions in progress"
            ),
        }
        state.empty_nodes.remove(node_name);
        state.drained_nodes.remove(node_name);
        debug!(node = %node_name, kind = %result.kind, "Node deletion finished");
        state.results.insert(node_name.to_string(), (result, now));
    }

    pub fn deletions_in_progress(&self) -> (Vec<String>, Vec<String>) {
        let state = self.state();
        (
            state.empty_nodes.iter().cloned().collect(),
            state.drained_nodes.iter().cloned().collect(),
        )
    }

    pub fn deletions_count(&self, node_group_id: &str) -> usize {
        self.state()
            .deletions_per_group
            .get(node_group_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_deletion_in_progress(&self, node_name: &str) -> bool {
        let state = self.state();
        state.empty_nodes.contains(node_name) || state.drained_nodes.contains(node_name)
    }

    /// Drained deletions still running
    pub fn non_empty_node_delete_in_progress(&self) -> bool {
        !self.state().drained_nodes.is_empty()
    }

    /// Results recorded so far and the time the view was taken
    pub fn deletion_results(&self) -> (HashMap<String, DeletionResult>, DateTime<Utc>) {
        let now = Utc::now();
        let state = self.state();
        let results = state
            .results
            .iter()
            .map(|(name, (result, _))| (name.clone(), result.clone()))
            .collect();
        (results, now)
    }

    pub fn clear_results_not_newer_than(&self, t: DateTime<Utc>) {
        self.state().results.retain(|_, (_, at)| *at > t);
    }

    pub fn register_eviction(&self, pod: &Pod) {
        self.register_eviction_at(pod, Utc::now());
    }

    pub fn register_eviction_at(&self, pod: &Pod, at: DateTime<Utc>) {
        self.state().evictions.push((pod.clone(), at));
    }

    pub fn recent_evictions(&self) -> Vec<Pod> {
        self.recent_evictions_at(Utc::now())
    }

    /// Drops evictions older than the TTL and returns the rest
    pub fn recent_evictions_at(&self, now: DateTime<Utc>) -> Vec<Pod> {
        let ttl = self.eviction_ttl;
        let mut state = self.state();
        state.evictions.retain(|(_, at)| *at + ttl > now);
        state.evictions.iter().map(|(pod, _)| pod.clone()).collect()
    }

    /// Owned copy of the current state
    pub fn snapshot(&self) -> ActuationSnapshot {
        let recent_evictions = self.recent_evictions();
        let (results, results_as_of) = self.deletion_results();
        let state = self.state();
        ActuationSnapshot {
            empty: state.empty_nodes.iter().cloned().collect(),
            drained: state.drained_nodes.iter().cloned().collect(),
            deletions_per_group: state.deletions_per_group.clone(),
            recent_evictions,
            results,
            results_as_of,
        }
    }
}

impl ActuationStatus for NodeDeletionTracker {
    fn deletions_in_progress(&self) -> (Vec<String>, Vec<String>) {
        NodeDeletionTracker::deletions_in_progress(self)
    }

    fn deletions_count(&self, node_group_id: &str) -> usize {
        NodeDeletionTracker::deletions_count(self, node_group_id)
    }

    fn recent_evictions(&self) -> Vec<Pod> {
        NodeDeletionTracker::recent_evictions(self)
    }

    fn deletion_results(&self) -> (HashMap<String, DeletionResult>, DateTime<Utc>) {
        NodeDeletionTracker::deletion_results(self)
    }
}

/// Point-in-time view of the tracker
#[derive(Debug, Clone, Default)]
pub struct ActuationSnapshot {
    pub empty: Vec<String>,
    pub drained: Vec<String>,
    pub deletions_per_group: HashMap<String, usize>,
    pub recent_evictions: Vec<Pod>,
    pub results: HashMap<String, DeletionResult>,
    pub results_as_of: DateTime<Utc>,
}

impl ActuationStatus for ActuationSnapshot {
    fn deletions_in_progress(&self) -> (Vec<String>, Vec<String>) {
        (self.empty.clone(), self.drained.clone())
    }

    fn deletions_count(&self, node_group_id: &str) -> usize {
        self.deletions_per_group
            .get(node_group_id)
            .copied()
            .unwrap_or(0)
    }

    fn recent_evictions(&self) -> Vec<Pod> {
        self.recent_evictions.clone()
    }

    fn deletion_results(&self) -> (HashMap<String, DeletionResult>, DateTime<Utc>) {
        (self.results.clone(), self.results_as_of)
    }
}
