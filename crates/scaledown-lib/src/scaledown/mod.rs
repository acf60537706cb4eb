//! Scale-down planning and actuation
//!
//! This module provides:
//! - Bookkeeping of in-flight deletions and their results
//! - Short-term memory of unremovable nodes
//! - Eligibility filtering and the time-indexed unneeded set
//! - The planner that publishes the nodes to delete
//! - Budget cropping, draining and batched deletion

pub mod actuation;
pub mod budgets;
mod deletion_tracker;
mod eligibility;
pub mod planner;
mod resource_limits;
mod unneeded;
mod unremovable;

pub use deletion_tracker::{ActuationSnapshot, NodeDeletionTracker, EVICTION_TTL};
pub use eligibility::{EligibilityChecker, EligibilityOutcome};
pub use resource_limits::{ResourceLimitsFinder, ResourcesLimits};
pub use unneeded::{RemovableAt, UnneededEntry, UnneededNodes};
pub use unremovable::UnremovableNodes;

use crate::error::AutoscalerError;
use crate::models::Pod;
use crate::simulator::UnremovableReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeletionResultKind {
    Ok,
    FailedToMarkToBeDeleted,
    FailedToEvictPods,
    FailedToDelete,
    InternalError,
}

impl fmt::Display for DeletionResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeletionResultKind::Ok => "ok",
            DeletionResultKind::FailedToMarkToBeDeleted => "failed_to_mark",
            DeletionResultKind::FailedToEvictPods => "failed_to_evict",
            DeletionResultKind::FailedToDelete => "failed_to_delete",
            DeletionResultKind::InternalError => "internal",
        };
        f.write_str(name)
    }
}

/// Outcome of evicting one pod
#[derive(Debug, Clone, PartialEq)]
pub struct PodEvictionResult {
    pub pod: Pod,
    pub timed_out: bool,
    pub err: Option<AutoscalerError>,
}

impl PodEvictionResult {
    pub fn was_evict_successful(&self) -> bool {
        self.err.is_none()
    }
}

/// Terminal outcome of one node deletion
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionResult {
    pub kind: DeletionResultKind,
    pub err: Option<AutoscalerError>,
    /// Set when the node failed because of a sibling in an atomic batch
    pub reason: Option<UnremovableReason>,
    /// Keyed by `namespace/name`
    pub pod_eviction_results: HashMap<String, PodEvictionResult>,
}

impl DeletionResult {
    pub fn ok() -> Self {
        Self {
            kind: DeletionResultKind::Ok,
            err: None,
            reason: None,
            pod_eviction_results: HashMap::new(),
        }
    }

    pub fn failed(kind: DeletionResultKind, err: AutoscalerError) -> Self {
        Self {
            kind,
            err: Some(err),
            reason: None,
            pod_eviction_results: HashMap::new(),
        }
    }

    pub fn with_reason(mut self, reason: UnremovableReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_evictions(mut self, results: HashMap<String, PodEvictionResult>) -> Self {
        self.pod_eviction_results = results;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.kind == DeletionResultKind::Ok
    }
}

/// What the actuator is currently doing, as seen by the planner
pub trait ActuationStatus: Send + Sync {
    /// Names of nodes being deleted: (empty, drained)
    fn deletions_in_progress(&self) -> (Vec<String>, Vec<String>);

    fn deletions_count(&self, node_group_id: &str) -> usize;

    /// Pods evicted recently enough that their replacements may still be pending
    fn recent_evictions(&self) -> Vec<Pod>;

    fn deletion_results(&self) -> (HashMap<String, DeletionResult>, DateTime<Utc>);
}
