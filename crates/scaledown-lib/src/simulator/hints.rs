//! Scheduling with per-pod destination hints carried between iterations

use super::predicates::PredicateChecker;
use super::snapshot::{ClusterSnapshot, NodeInfo, SnapshotError};
use crate::models::Pod;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Hint maps keyed by pod uid (or `namespace/name` when the uid is unknown)
#[derive(Debug, Default)]
pub struct Hints {
    current: HashMap<String, String>,
    old: HashMap<String, String>,
}

pub fn hint_key(pod: &Pod) -> String {
    if pod.uid.is_empty() {
        pod.key()
    } else {
        pod.uid.clone()
    }
}

impl Hints {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.current
            .get(key)
            .or_else(|| self.old.get(key))
            .map(String::as_str)
    }

    pub fn set(&mut self, key: String, node_name: String) {
        self.current.insert(key, node_name);
    }

    /// Hints not refreshed since the previous call are forgotten
    pub fn drop_old(&mut self) {
        self.old = std::mem::take(&mut self.current);
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.old.is_empty()
    }
}

/// Where a pod ended up in the simulation
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledPod {
    pub pod: Pod,
    pub node_name: String,
}

pub struct HintingSimulator {
    checker: Arc<dyn PredicateChecker>,
    hints: Hints,
}

impl HintingSimulator {
    pub fn new(checker: Arc<dyn PredicateChecker>) -> Self {
        Self {
            checker,
            hints: Hints::default(),
        }
    }

    /// Places pods one by one into the snapshot, trying each pod's previous destination first.
    /// With `break_on_failure` the first pod that fits nowhere stops the run.
    pub fn try_schedule_pods(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        pods: &[Pod],
        is_node_acceptable: &dyn Fn(&NodeInfo) -> bool,
        break_on_failure: bool,
    ) -> Result<Vec<ScheduledPod>, SnapshotError> {
        let mut scheduled = Vec::with_capacity(pods.len());
        for pod in pods {
            let key = hint_key(pod);
            let destination = self
                .try_hint(snapshot, pod, &key, is_node_acceptable)
                .or_else(|| {
                    self.checker
                        .fits_any_node_matching(snapshot, pod, is_node_acceptable)
                });

            match destination {
                Some(node_name) => {
                    let mut placed = pod.clone();
                    placed.node_name = None;
                    snapshot.add_pod(placed.clone(), &node_name)?;
                    self.hints.set(key, node_name.clone());
                    scheduled.push(ScheduledPod {
                        pod: placed,
                        node_name,
                    });
                }
                None => {
                    debug!(pod = %pod.key(), "No node fits pod in simulation");
                    if break_on_failure {
                        break;
                    }
                }
            }
        }
        Ok(scheduled)
    }

    fn try_hint(
        &self,
        snapshot: &ClusterSnapshot,
        pod: &Pod,
        key: &str,
        is_node_acceptable: &dyn Fn(&NodeInfo) -> bool,
    ) -> Option<String> {
        let hinted = self.hints.get(key)?;
        let info = snapshot.get(hinted)?;
        if !is_node_acceptable(info) {
            return None;
        }
        self.checker
            .check_predicates(snapshot, pod, hinted)
            .ok()
            .map(|_| hinted.to_string())
    }

    pub fn drop_old_hints(&mut self) {
        self.hints.drop_old();
    }

    pub fn hints(&self) -> &Hints {
        &self.hints
    }
}
