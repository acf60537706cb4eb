//! Replica accounting for workload controllers

use crate::models::{OwnerReference, Pod};
use std::sync::Arc;

pub const KIND_REPLICA_SET: &str = "ReplicaSet";
pub const KIND_STATEFUL_SET: &str = "StatefulSet";
pub const KIND_REPLICATION_CONTROLLER: &str = "ReplicationController";
pub const KIND_JOB: &str = "Job";

/// Desired and observed replicas of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub desired: i32,
    pub current: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatus {
    /// `None` means 1
    pub parallelism: Option<i32>,
    pub completions: Option<i32>,
    pub succeeded: i32,
    pub active: i32,
}

/// Read access to the workload controllers of the cluster. `None` means the object is gone.
pub trait WorkloadLister: Send + Sync {
    fn replica_set(&self, namespace: &str, name: &str) -> Option<ReplicaCounts>;
    fn stateful_set(&self, namespace: &str, name: &str) -> Option<ReplicaCounts>;
    fn replication_controller(&self, namespace: &str, name: &str) -> Option<ReplicaCounts>;
    fn job(&self, namespace: &str, name: &str) -> Option<JobStatus>;
}

/// Lister that knows no workloads; every known-kind lookup misses
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyWorkloadLister;

impl WorkloadLister for EmptyWorkloadLister {
    fn replica_set(&self, _namespace: &str, _name: &str) -> Option<ReplicaCounts> {
        None
    }

    fn stateful_set(&self, _namespace: &str, _name: &str) -> Option<ReplicaCounts> {
        None
    }

    fn replication_controller(&self, _namespace: &str, _name: &str) -> Option<ReplicaCounts> {
        None
    }

    fn job(&self, _namespace: &str, _name: &str) -> Option<JobStatus> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicasInfo {
    pub target: i32,
    pub current: i32,
}

impl ReplicasInfo {
    /// Replicas the controller still has to create
    pub fn missing(&self) -> i32 {
        (self.target - self.current).max(0)
    }
}

/// Outcome of resolving a pod's controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerLookup {
    /// No owner, or an owner kind that is not tracked
    Unknown,
    /// The owner is a tracked kind but no longer exists
    Missing,
    Found(ReplicasInfo),
}

pub struct ControllerReplicasCalculator {
    lister: Arc<dyn WorkloadLister>,
}

impl ControllerReplicasCalculator {
    pub fn new(lister: Arc<dyn WorkloadLister>) -> Self {
        Self { lister }
    }

    pub fn replicas_for(&self, pod: &Pod) -> ControllerLookup {
        let Some(owner) = known_owner(pod) else {
            return ControllerLookup::Unknown;
        };
        let ns = pod.namespace.as_str();
        let name = owner.name.as_str();
        let info = match owner.kind.as_str() {
            KIND_REPLICA_SET => self.lister.replica_set(ns, name).map(from_counts),
            KIND_STATEFUL_SET => self.lister.stateful_set(ns, name).map(from_counts),
            KIND_REPLICATION_CONTROLLER => {
                self.lister.replication_controller(ns, name).map(from_counts)
            }
            KIND_JOB => self.lister.job(ns, name).map(job_replicas),
            _ => return ControllerLookup::Unknown,
        };
        match info {
            Some(info) => ControllerLookup::Found(info),
            None => ControllerLookup::Missing,
        }
    }
}

fn known_owner(pod: &Pod) -> Option<&OwnerReference> {
    pod.owner.as_ref().filter(|owner| {
        matches!(
            owner.kind.as_str(),
            KIND_REPLICA_SET | KIND_STATEFUL_SET | KIND_REPLICATION_CONTROLLER | KIND_JOB
        )
    })
}

fn from_counts(counts: ReplicaCounts) -> ReplicasInfo {
    ReplicasInfo {
        target: counts.desired,
        current: counts.current,
    }
}

fn job_replicas(job: JobStatus) -> ReplicasInfo {
    let mut target = job.parallelism.unwrap_or(1);
    if let Some(completions) = job.completions {
        target = target.min(completions - job.succeeded);
    }
    ReplicasInfo {
        target,
        current: job.active,
    }
}
