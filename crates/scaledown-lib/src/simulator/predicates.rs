//! Scheduling predicates the simulator needs from the scheduler

use super::snapshot::{ClusterSnapshot, NodeInfo};
use crate::models::{Pod, TaintEffect, RESOURCE_PODS};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredicateError {
    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("insufficient {resource}: requested {requested}, available {available}")]
    InsufficientResource {
        resource: String,
        requested: i64,
        available: i64,
    },

    #[error("too many pods")]
    TooManyPods,

    #[error("node has untolerated taint {0}")]
    UntoleratedTaint(String),

    #[error("node does not match the pod's node selector")]
    NodeSelectorMismatch,

    #[error("node is unschedulable")]
    Unschedulable,
}

/// Answers whether a pod fits a node of the snapshot
pub trait PredicateChecker: Send + Sync {
    fn check_predicates(
        &self,
        snapshot: &ClusterSnapshot,
        pod: &Pod,
        node_name: &str,
    ) -> Result<(), PredicateError>;

    /// First node in name order that passes `is_acceptable` and the predicates
    fn fits_any_node_matching(
        &self,
        snapshot: &ClusterSnapshot,
        pod: &Pod,
        is_acceptable: &dyn Fn(&NodeInfo) -> bool,
    ) -> Option<String> {
        snapshot
            .node_infos()
            .filter(|info| is_acceptable(info))
            .find(|info| self.check_predicates(snapshot, pod, info.name()).is_ok())
            .map(|info| info.name().to_string())
    }
}

/// Resource requests, pod count, taints, node selector and cordon checks
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceFitChecker;

impl PredicateChecker for ResourceFitChecker {
    fn check_predicates(
        &self,
        snapshot: &ClusterSnapshot,
        pod: &Pod,
        node_name: &str,
    ) -> Result<(), PredicateError> {
        let info = snapshot
            .get(node_name)
            .ok_or_else(|| PredicateError::NodeNotFound(node_name.to_string()))?;
        let node = &info.node;

        if node.unschedulable {
            return Err(PredicateError::Unschedulable);
        }

        for taint in &node.taints {
            let blocking = matches!(taint.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute);
            if blocking && !pod.tolerates(taint) {
                return Err(PredicateError::UntoleratedTaint(taint.key.clone()));
            }
        }

        if !pod
            .node_selector
            .iter()
            .all(|(k, v)| node.labels.get(k) == Some(v))
        {
            return Err(PredicateError::NodeSelectorMismatch);
        }

        let max_pods = node.allocatable.get(RESOURCE_PODS);
        if max_pods > 0 && info.pod_count() as i64 + 1 > max_pods {
            return Err(PredicateError::TooManyPods);
        }

        let requested = info.requested();
        for (resource, amount) in pod.requests.iter() {
            if amount <= 0 {
                continue;
            }
            let available = node.allocatable.get(resource) - requested.get(resource);
            if amount > available {
                return Err(PredicateError::InsufficientResource {
                    resource: resource.to_string(),
                    requested: amount,
                    available,
                });
            }
        }
        Ok(())
    }
}
