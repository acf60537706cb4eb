//! Scheduling simulation for scale-down
//!
//! This module provides:
//! - A forkable in-memory cluster snapshot
//! - Resource-fit predicates and hint-based pod placement
//! - Disruption budget accounting within one iteration
//! - Node utilization and the node-removal simulation

mod hints;
mod pdb;
mod predicates;
mod removal;
mod snapshot;
mod utilization;

pub use hints::{hint_key, Hints, HintingSimulator, ScheduledPod};
pub use pdb::{PdbCheck, RemainingPdbTracker};
pub use predicates::{PredicateChecker, PredicateError, ResourceFitChecker};
pub use removal::{get_pods_to_move, PodsToMove, RemovalOutcome, RemovalSimulator};
pub use snapshot::{ClusterSnapshot, NodeInfo, SnapshotError};
pub use utilization::{
    calculate as calculate_utilization, is_gpu_node, UtilizationError, UtilizationInfo,
    UtilizationOptions,
};

use crate::models::{Node, Pod};
use serde::Serialize;
use std::fmt;

/// A node that can go, with the pods that would need a new home
#[derive(Debug, Clone, PartialEq)]
pub struct NodeToBeRemoved {
    pub node: Node,
    /// Empty for empty nodes
    pub pods_to_reschedule: Vec<Pod>,
    pub daemonset_pods: Vec<Pod>,
    /// Pods cannot all be evicted at once under their disruption budgets
    pub is_risky: bool,
}

impl NodeToBeRemoved {
    pub fn empty(node: Node) -> Self {
        Self {
            node,
            pods_to_reschedule: Vec::new(),
            daemonset_pods: Vec::new(),
            is_risky: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnremovableReason {
    NoReason,
    ScaleDownDisabledAnnotation,
    NotAutoscaled,
    NotUnneededLongEnough,
    NotUnreadyLongEnough,
    NodeGroupMinSizeReached,
    MinimalResourceLimitExceeded,
    CurrentlyBeingDeleted,
    NotUnderutilized,
    ScaleDownUnreadyDisabled,
    RecentlyUnremovable,
    NoPlaceToMovePods,
    BlockedByPdb,
    AtomicGroupFailed,
    UnexpectedError,
}

impl UnremovableReason {
    pub const ALL: [UnremovableReason; 15] = [
        UnremovableReason::NoReason,
        UnremovableReason::ScaleDownDisabledAnnotation,
        UnremovableReason::NotAutoscaled,
        UnremovableReason::NotUnneededLongEnough,
        UnremovableReason::NotUnreadyLongEnough,
        UnremovableReason::NodeGroupMinSizeReached,
        UnremovableReason::MinimalResourceLimitExceeded,
        UnremovableReason::CurrentlyBeingDeleted,
        UnremovableReason::NotUnderutilized,
        UnremovableReason::ScaleDownUnreadyDisabled,
        UnremovableReason::RecentlyUnremovable,
        UnremovableReason::NoPlaceToMovePods,
        UnremovableReason::BlockedByPdb,
        UnremovableReason::AtomicGroupFailed,
        UnremovableReason::UnexpectedError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnremovableReason::NoReason => "NoReason",
            UnremovableReason::ScaleDownDisabledAnnotation => "ScaleDownDisabledAnnotation",
            UnremovableReason::NotAutoscaled => "NotAutoscaled",
            UnremovableReason::NotUnneededLongEnough => "NotUnneededLongEnough",
            UnremovableReason::NotUnreadyLongEnough => "NotUnreadyLongEnough",
            UnremovableReason::NodeGroupMinSizeReached => "NodeGroupMinSizeReached",
            UnremovableReason::MinimalResourceLimitExceeded => "MinimalResourceLimitExceeded",
            UnremovableReason::CurrentlyBeingDeleted => "CurrentlyBeingDeleted",
            UnremovableReason::NotUnderutilized => "NotUnderutilized",
            UnremovableReason::ScaleDownUnreadyDisabled => "ScaleDownUnreadyDisabled",
            UnremovableReason::RecentlyUnremovable => "RecentlyUnremovable",
            UnremovableReason::NoPlaceToMovePods => "NoPlaceToMovePods",
            UnremovableReason::BlockedByPdb => "BlockedByPdb",
            UnremovableReason::AtomicGroupFailed => "AtomicGroupFailed",
            UnremovableReason::UnexpectedError => "UnexpectedError",
        }
    }
}

impl fmt::Display for UnremovableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockingPodReason {
    NotEnoughPdb,
    NoPlaceToMove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockingPod {
    pub pod: Pod,
    pub reason: BlockingPodReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnremovableNode {
    pub node: Node,
    pub reason: UnremovableReason,
    pub blocking_pod: Option<BlockingPod>,
}

impl UnremovableNode {
    pub fn new(node: Node, reason: UnremovableReason) -> Self {
        Self {
            node,
            reason,
            blocking_pod: None,
        }
    }
}
