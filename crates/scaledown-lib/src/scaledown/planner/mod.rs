//! Scale-down planner
//!
//! This module provides:
//! - The per-iteration update that decides which nodes are unneeded
//! - Injection of pods from ongoing deletions into the simulated cluster
//! - The list of nodes that may be deleted right now

mod replicas;

pub use replicas::{
    ControllerLookup, ControllerReplicasCalculator, EmptyWorkloadLister, JobStatus, ReplicaCounts,
    ReplicasInfo, WorkloadLister,
};

use super::eligibility::EligibilityChecker;
use super::resource_limits::ResourceLimitsFinder;
use super::unneeded::{UnneededEntry, UnneededNodes};
use super::unremovable::UnremovableNodes;
use super::ActuationStatus;
use crate::cloudprovider::CloudProvider;
use crate::config::{AutoscalingOptions, NodeGroupConfigProcessor};
use crate::error::{AutoscalerError, Result};
use crate::models::{Node, Pod, PodDisruptionBudget};
use crate::observability::{ScaleDownLogger, ScaleDownMetrics, FUNCTION_PLANNER_UPDATE};
use crate::simulator::{
    ClusterSnapshot, HintingSimulator, NodeInfo, NodeToBeRemoved, PredicateChecker,
    RemainingPdbTracker, RemovalOutcome, RemovalSimulator, UnremovableNode, UnremovableReason,
    UtilizationInfo,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub struct Planner {
    provider: Arc<dyn CloudProvider>,
    options: AutoscalingOptions,
    config: NodeGroupConfigProcessor,
    eligibility: EligibilityChecker,
    unremovable: UnremovableNodes,
    unneeded: UnneededNodes,
    removal: RemovalSimulator,
    /// Places pods of ongoing deletions; keeps its own hints
    injector: HintingSimulator,
    replicas: ControllerReplicasCalculator,
    limits_finder: ResourceLimitsFinder,
    pdb_tracker: RemainingPdbTracker,
    utilization: HashMap<String, UtilizationInfo>,
    blocked: Vec<UnremovableNode>,
    cluster_nodes: Vec<Node>,
    latest_update: Option<DateTime<Utc>>,
    min_update_interval: Duration,
    metrics: ScaleDownMetrics,
    logger: ScaleDownLogger,
}

impl Planner {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        options: &AutoscalingOptions,
        checker: Arc<dyn PredicateChecker>,
        workloads: Arc<dyn WorkloadLister>,
    ) -> Self {
        let config = NodeGroupConfigProcessor::new(options.node_group_defaults());
        let limits_finder = ResourceLimitsFinder::new(provider.gpu_label());
        Self {
            eligibility: EligibilityChecker::new(provider.clone(), options),
            unremovable: UnremovableNodes::new(),
            unneeded: UnneededNodes::new(provider.clone(), config.clone(), limits_finder.clone()),
            removal: RemovalSimulator::new(checker.clone()),
            injector: HintingSimulator::new(checker),
            replicas: ControllerReplicasCalculator::new(workloads),
            limits_finder,
            pdb_tracker: RemainingPdbTracker::default(),
            utilization: HashMap::new(),
            blocked: Vec::new(),
            cluster_nodes: Vec::new(),
            latest_update: None,
            min_update_interval: options.scan_interval,
            metrics: ScaleDownMetrics::new(),
            logger: ScaleDownLogger::new(),
            config,
            provider,
            options: options.clone(),
        }
    }

    /// Recomputes the unneeded and unremovable sets. The snapshot is forked for the duration of
    /// the call and left as it was found.
    pub fn update_cluster_state(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        pod_destinations: &[String],
        scale_down_candidates: &[String],
        status: &dyn ActuationStatus,
        pdbs: Vec<PodDisruptionBudget>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let started = Instant::now();
        self.observe_update_interval(now);
        self.cluster_nodes = snapshot.node_infos().map(|info| info.node.clone()).collect();
        if !self.options.node_deletion_candidate_ttl.is_zero() {
            self.unneeded.load_from_existing_taints(
                &self.cluster_nodes,
                now,
                self.options.node_deletion_candidate_ttl,
            );
        }
        self.pdb_tracker.set_pdbs(pdbs);

        snapshot.fork();
        let result = self.update_forked(
            snapshot,
            pod_destinations,
            scale_down_candidates,
            status,
            now,
        );
        snapshot.revert();

        if let Err(e) = &result {
            error!(error = %e, "Scale-down state update failed, forgetting unneeded nodes");
            self.unneeded.clear();
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.publish_metrics(elapsed);
        self.logger
            .log_planner_update(self.unneeded.len(), self.unremovable.len(), elapsed);
        result
    }

    fn update_forked(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        pod_destinations: &[String],
        scale_down_candidates: &[String],
        status: &dyn ActuationStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (empty_in_progress, drained_in_progress) = status.deletions_in_progress();
        let in_progress: HashSet<String> = empty_in_progress
            .iter()
            .chain(drained_in_progress.iter())
            .cloned()
            .collect();

        self.inject_ongoing_actuation(snapshot, &drained_in_progress, &in_progress, status)?;

        let mut destinations: HashSet<String> = pod_destinations
            .iter()
            .filter(|name| !in_progress.contains(*name))
            .cloned()
            .collect();
        let candidates: Vec<String> = scale_down_candidates
            .iter()
            .filter(|name| !in_progress.contains(*name))
            .cloned()
            .collect();

        self.categorize_nodes(snapshot, &mut destinations, &candidates, status, now);
        self.removal.drop_old_hints();
        self.injector.drop_old_hints();
        Ok(())
    }

    fn inject_ongoing_actuation(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        drained: &[String],
        in_progress: &HashSet<String>,
        status: &dyn ActuationStatus,
    ) -> Result<()> {
        let drained_pods: Vec<Pod> = drained
            .iter()
            .filter_map(|name| snapshot.get(name))
            .flat_map(|info| info.pods.iter())
            .filter(|pod| is_recreatable(pod) && !pod.is_terminal())
            .cloned()
            .collect();
        self.inject_pods(snapshot, drained_pods, in_progress)?;

        let mut seen = HashSet::new();
        let evicted: Vec<Pod> = status
            .recent_evictions()
            .into_iter()
            .filter(is_recreatable)
            .filter(|pod| seen.insert(pod.key()))
            .collect();
        let evicted = self.filter_out_replaced_pods(evicted);
        self.inject_pods(snapshot, evicted, in_progress)
    }

    /// Keeps evicted pods whose controller has not recreated them yet
    fn filter_out_replaced_pods(&self, pods: Vec<Pod>) -> Vec<Pod> {
        let mut added: HashMap<String, i32> = HashMap::new();
        let mut to_inject = Vec::new();
        for pod in pods {
            match self.replicas.replicas_for(&pod) {
                ControllerLookup::Unknown => to_inject.push(pod),
                ControllerLookup::Missing => {
                    debug!(pod = %pod.key(), "Controller of evicted pod is gone, not injecting");
                }
                ControllerLookup::Found(info) => {
                    let owner = pod
                        .owner
                        .as_ref()
                        .map(|o| format!("{}/{}/{}", o.kind, pod.namespace, o.name))
                        .unwrap_or_default();
                    let count = added.entry(owner).or_insert(0);
                    if *count < info.missing() {
                        *count += 1;
                        to_inject.push(pod);
                    }
                }
            }
        }
        to_inject
    }

    fn inject_pods(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        pods: Vec<Pod>,
        excluded: &HashSet<String>,
    ) -> Result<()> {
        if pods.is_empty() {
            return Ok(());
        }
        let pods: Vec<Pod> = pods
            .into_iter()
            .map(|mut pod| {
                pod.node_name = None;
                pod
            })
            .collect();
        let accept = |info: &NodeInfo| !excluded.contains(info.name());
        let scheduled = self
            .injector
            .try_schedule_pods(snapshot, &pods, &accept, true)
            .map_err(|e| {
                AutoscalerError::unexpected_state(format!(
                    "cannot scale down, an unexpected error occurred: {e}"
                ))
            })?;
        if scheduled.len() != pods.len() {
            return Err(AutoscalerError::unexpected_state(format!(
                "cannot scale down, can reschedule only {} out of {} pods from ongoing deletions",
                scheduled.len(),
                pods.len()
            )));
        }
        debug!(pods = pods.len(), "Injected pods from ongoing deletions");
        Ok(())
    }

    fn categorize_nodes(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        destinations: &mut HashSet<String>,
        candidates: &[String],
        status: &dyn ActuationStatus,
        now: DateTime<Utc>,
    ) {
        let recheck_at = now
            + ChronoDuration::from_std(self.options.unremovable_node_recheck_timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(5));

        self.unremovable.update(|name| snapshot.contains(name), now);
        self.ingest_atomic_failures(snapshot, status, recheck_at);

        let outcome =
            self.eligibility
                .filter_out_unremovable(snapshot, candidates, now, &self.unremovable);
        for node in outcome.ineligible {
            if !self.unremovable.has_reason(&node.node.name) {
                self.unremovable.add(node);
            }
        }
        self.utilization = outcome.utilization;

        let mut removable = self
            .removal
            .find_empty_nodes_to_remove(snapshot, &outcome.eligible, now);
        let empty: HashSet<String> = removable.iter().map(|n| n.node.name.clone()).collect();
        for name in &empty {
            destinations.remove(name);
        }

        // previously unneeded nodes are simulated first
        let (previous, additional): (Vec<String>, Vec<String>) = outcome
            .eligible
            .into_iter()
            .filter(|name| !empty.contains(name))
            .partition(|name| self.unneeded.contains(name));
        let ordered: Vec<String> = previous.into_iter().chain(additional).collect();

        let limit = self.unneeded_nodes_limit();
        let candidate_limits = self.non_empty_candidate_limits(snapshot.len());
        let deadline = Instant::now() + self.options.scale_down_simulation_timeout;
        let mut counted = 0;
        let mut accepted = 0;
        let mut additional_evaluated = 0;
        let mut unremovable_count = 0;

        for (i, name) in ordered.iter().enumerate() {
            if Instant::now() >= deadline {
                warn!(
                    skipped = ordered.len() - i,
                    total = ordered.len(),
                    "Nodes skipped in scale-down simulation due to timeout"
                );
                for skipped in &ordered[i..] {
                    if let Some(info) = snapshot.get(skipped) {
                        self.unremovable
                            .add_reason(&info.node, UnremovableReason::UnexpectedError);
                    }
                }
                break;
            }
            if counted >= limit {
                debug!(
                    skipped = ordered.len() - i,
                    unneeded = counted,
                    "Enough unneeded nodes found, skipping the rest"
                );
                break;
            }
            if let Some((count, pool_size)) = candidate_limits {
                if accepted >= count {
                    break;
                }
                if !self.unneeded.contains(name) {
                    if additional_evaluated >= pool_size {
                        break;
                    }
                    additional_evaluated += 1;
                }
            }

            match self.removal.simulate_node_removal(
                snapshot,
                name,
                destinations,
                now,
                &self.pdb_tracker,
            ) {
                RemovalOutcome::Removable(mut node) => {
                    if !self
                        .pdb_tracker
                        .can_remove_pods(&node.pods_to_reschedule)
                        .in_parallel
                    {
                        node.is_risky = true;
                    }
                    destinations.remove(name);
                    self.pdb_tracker.remove_pods(&node.pods_to_reschedule);
                    if !self.is_atomic(&node.node) {
                        counted += 1;
                    }
                    accepted += 1;
                    removable.push(node);
                }
                RemovalOutcome::Unremovable(node) => {
                    unremovable_count += 1;
                    self.unremovable.add_with_timeout(node, recheck_at);
                }
            }
        }

        self.unneeded.update(removable, now);
        if unremovable_count > 0 {
            info!(
                count = unremovable_count,
                recheck_at = %recheck_at,
                "Nodes found unremovable in simulation"
            );
        }
    }

    /// Nodes that failed as part of an atomic batch stay away from scale-down for a while
    fn ingest_atomic_failures(
        &mut self,
        snapshot: &ClusterSnapshot,
        status: &dyn ActuationStatus,
        recheck_at: DateTime<Utc>,
    ) {
        let (results, _) = status.deletion_results();
        for (name, result) in results {
            if result.reason != Some(UnremovableReason::AtomicGroupFailed) {
                continue;
            }
            if let Some(info) = snapshot.get(&name) {
                self.unremovable.add_with_timeout(
                    UnremovableNode::new(info.node.clone(), UnremovableReason::AtomicGroupFailed),
                    recheck_at,
                );
            }
        }
    }

    /// Upper bound on unneeded drain nodes worth finding in one iteration
    fn unneeded_nodes_limit(&self) -> usize {
        let n = self.options.max_scale_down_parallelism;
        let extra = n;
        let limit = self.unneeded.len() + n + extra;

        let loop_interval = self.min_update_interval.max(Duration::from_millis(1));
        let unneeded_time = self.min_unneeded_time().max(loop_interval);
        let loops = (unneeded_time.as_nanos() / loop_interval.as_nanos()) as usize;
        let upper_bound = n.saturating_mul(loops).saturating_add(extra);
        limit.min(upper_bound)
    }

    fn min_unneeded_time(&self) -> Duration {
        self.provider
            .node_groups()
            .iter()
            .filter_map(|group| self.config.scale_down_unneeded_time(group.as_ref()).ok())
            .min()
            .unwrap_or(self.config.defaults().scale_down_unneeded_time)
    }

    /// (max accepted, max additional evaluated) when the non-empty candidate limit is on
    fn non_empty_candidate_limits(&self, cluster_size: usize) -> Option<(usize, usize)> {
        let count = self.options.scale_down_non_empty_candidates_count;
        if count <= 0 {
            return None;
        }
        let ratio_size =
            (cluster_size as f64 * self.options.scale_down_candidates_pool_ratio).ceil() as usize;
        let pool_size = ratio_size.max(self.options.scale_down_candidates_pool_min_count);
        Some((count as usize, pool_size))
    }

    fn is_atomic(&self, node: &Node) -> bool {
        match self.provider.node_group_for_node(node) {
            Ok(Some(group)) => self.config.is_atomic(group.as_ref()).unwrap_or(false),
            _ => false,
        }
    }

    fn observe_update_interval(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.latest_update {
            if let Ok(interval) = (now - last).to_std() {
                if !interval.is_zero() && interval < self.min_update_interval {
                    self.min_update_interval = interval;
                }
            }
        }
        self.latest_update = Some(now);
    }

    fn publish_metrics(&self, elapsed_secs: f64) {
        let mut counts: HashMap<UnremovableReason, usize> = HashMap::new();
        for node in self.unremovable.as_list() {
            *counts.entry(node.reason).or_insert(0) += 1;
        }
        self.metrics.set_unneeded_nodes(self.unneeded.len());
        self.metrics.set_unremovable_nodes(&counts);
        self.metrics
            .observe_duration(FUNCTION_PLANNER_UPDATE, elapsed_secs);
    }

    /// Nodes that may be deleted now: (empty, drain). Drain nodes whose pods cannot all be
    /// evicted at once come last.
    pub fn nodes_to_delete(
        &mut self,
        now: DateTime<Utc>,
        status: &dyn ActuationStatus,
    ) -> (Vec<Node>, Vec<Node>) {
        let limiter = match self.provider.resource_limiter() {
            Ok(limiter) => limiter,
            Err(e) => {
                error!(error = %e, "Nothing will scale down, failed to get resource limiter");
                return (Vec::new(), Vec::new());
            }
        };
        let mut limits_left = self.limits_finder.limits_left(&self.cluster_nodes, &limiter);
        let removable =
            self.unneeded
                .removable_at(now, &mut limits_left, &limiter.resources(), status);
        self.blocked = removable.unremovable;

        let empty = removable.empty.into_iter().map(|n| n.node).collect();
        let drain = sort_by_risk(removable.drain)
            .into_iter()
            .map(|n| n.node)
            .collect();
        (empty, drain)
    }

    pub fn unneeded_nodes(&self) -> Vec<Node> {
        self.unneeded.as_list()
    }

    pub fn unneeded_entries(&self) -> &[UnneededEntry] {
        self.unneeded.entries()
    }

    pub fn unneeded_since(&self, name: &str) -> Option<DateTime<Utc>> {
        self.unneeded.since(name)
    }

    pub fn unremovable_nodes(&self) -> Vec<UnremovableNode> {
        self.unremovable.as_list()
    }

    pub fn node_utilization_map(&self) -> &HashMap<String, UtilizationInfo> {
        &self.utilization
    }

    /// Unneeded nodes the last `nodes_to_delete` call held back, with the reason
    pub fn blocked_unneeded_nodes(&self) -> &[UnremovableNode] {
        &self.blocked
    }

    pub fn clean_up_unneeded_nodes(&mut self) {
        self.unneeded.clear();
    }
}

/// Pods a controller will recreate elsewhere
fn is_recreatable(pod: &Pod) -> bool {
    !pod.is_mirror() && !pod.is_static() && !pod.is_daemonset()
}

fn sort_by_risk(nodes: Vec<NodeToBeRemoved>) -> Vec<NodeToBeRemoved> {
    let (safe, risky): (Vec<_>, Vec<_>) = nodes.into_iter().partition(|n| !n.is_risky);
    safe.into_iter().chain(risky).collect()
}
