//! Scale-down actuation
//!
//! This module provides:
//! - The `Actuator` that crops, taints and starts node deletions
//! - Pod eviction with retries and delay-deletion handling
//! - Per node-group batching of cloud deletions
//! - All-or-nothing scheduling of atomic node groups

mod batcher;
mod drain;
mod group_scheduler;

pub use batcher::{BatchedNode, NodeDeletionBatcher};
pub use drain::{
    pods_to_evict, should_evict_daemonset_pod, wait_for_delay_deletion, DrainError, DrainResult,
    Evictor, DELAY_DELETION_POLL_INTERVAL, POD_DISAPPEARANCE_POLL_INTERVAL,
};
pub use group_scheduler::GroupDeletionScheduler;

use super::budgets::{BudgetProcessor, NodeGroupView};
use super::{ActuationSnapshot, DeletionResult, DeletionResultKind, NodeDeletionTracker};
use crate::cloudprovider::{CloudProvider, NodeGroup};
use crate::cluster::{clean_to_be_deleted, mark_to_be_deleted, ClusterApi, EventType};
use crate::config::{AutoscalingOptions, NodeGroupConfigProcessor};
use crate::error::{AutoscalerError, Result};
use crate::models::Node;
use crate::observability::{ScaleDownLogger, ScaleDownMetrics, FUNCTION_CROP_NODES};
use crate::simulator::{get_pods_to_move, NodeInfo, RemainingPdbTracker};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{error, info};

/// Upper bound on concurrent taint calls
pub const MAX_CONCURRENT_NODES_TAINTING: usize = 5;

/// Awaits `call` for at most `budget`. An expired call becomes a transient error; callers
/// do not retry it.
pub(crate) async fn with_deadline<F: Future>(
    budget: Duration,
    what: &str,
    call: F,
) -> Result<F::Output> {
    timeout(budget, call).await.map_err(|_| {
        AutoscalerError::transient(format!(
            "{what} did not complete within {}s",
            budget.as_secs()
        ))
    })
}

/// Handles shared by every deletion task
pub(crate) struct DeletionContext {
    pub(crate) api: Arc<dyn ClusterApi>,
    pub(crate) tracker: Arc<NodeDeletionTracker>,
    pub(crate) metrics: ScaleDownMetrics,
    pub(crate) logger: ScaleDownLogger,
    /// Deadline of a single orchestrator call
    pub(crate) api_call_timeout: Duration,
    /// Deadline of a single cloud deletion call
    pub(crate) cloud_call_timeout: Duration,
}

impl DeletionContext {
    pub(crate) fn new(
        api: Arc<dyn ClusterApi>,
        tracker: Arc<NodeDeletionTracker>,
        options: &AutoscalingOptions,
    ) -> Self {
        Self {
            api,
            tracker,
            metrics: ScaleDownMetrics::new(),
            logger: ScaleDownLogger::new(),
            api_call_timeout: options.api_call_timeout,
            cloud_call_timeout: options.max_cloud_provider_node_deletion_time,
        }
    }

    /// Removes the to-be-deleted taint under the per-call deadline
    pub(crate) async fn untaint(&self, node_name: &str) -> Result<()> {
        with_deadline(
            self.api_call_timeout,
            &format!("removing the to-be-deleted taint from {node_name}"),
            clean_to_be_deleted(self.api.as_ref(), node_name),
        )
        .await?
        .map_err(AutoscalerError::from)
    }

    /// Records the failure event, reverts the to-be-deleted taint and ends the deletion
    pub(crate) async fn clean_up_and_record_failed_scale_down(
        &self,
        node: &Node,
        group_id: &str,
        drain: bool,
        err_msg: &str,
        result: DeletionResult,
    ) {
        let err = result
            .err
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        if drain {
            error!(node = %node.name, context = %err_msg, error = %err, "Scale-down: couldn't delete node with drain");
            self.api.record_node_event(
                &node.name,
                EventType::Warning,
                "ScaleDownFailed",
                &format!("failed to drain and delete node: {err}"),
            );
        } else {
            error!(node = %node.name, context = %err_msg, error = %err, "Scale-down: couldn't delete empty node");
            self.api.record_node_event(
                &node.name,
                EventType::Warning,
                "ScaleDownFailed",
                &format!("failed to delete empty node: {err}"),
            );
        }
        if let Err(e) = self.untaint(&node.name).await {
            error!(node = %node.name, error = %e, "Failed to remove the to-be-deleted taint");
        }
        self.metrics.inc_failed_deletions(result.kind);
        self.logger.log_deletion_result(&node.name, group_id, &result);
        self.tracker.end_deletion(group_id, &node.name, result);
    }

    pub(crate) fn register_successful_scale_down(&self, node: &Node, group_id: &str, drain: bool) {
        self.api.record_node_event(
            &node.name,
            EventType::Normal,
            "ScaleDown",
            "nodes removed by cluster autoscaler",
        );
        self.metrics
            .inc_nodes_deleted(if drain { "drain" } else { "empty" });
        let result = DeletionResult::ok();
        self.logger.log_deletion_result(&node.name, group_id, &result);
        self.tracker.end_deletion(group_id, &node.name, result);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDownResult {
    NoNodeDeleted,
    NodeDeleteStarted,
}

/// A node whose deletion was started
#[derive(Debug, Clone)]
pub struct ScaleDownNode {
    pub node: Node,
    pub node_group_id: String,
    pub drain: bool,
}

#[derive(Debug, Clone)]
pub struct ScaleDownStatus {
    pub result: ScaleDownResult,
    pub nodes: Vec<ScaleDownNode>,
}

/// Starts node deletions and reports on them. Deletions run in background tasks; their results
/// land in the shared tracker.
pub struct Actuator {
    ctx: Arc<DeletionContext>,
    budgets: BudgetProcessor,
    config: NodeGroupConfigProcessor,
    scheduler: Arc<GroupDeletionScheduler>,
}

impl Actuator {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        api: Arc<dyn ClusterApi>,
        tracker: Arc<NodeDeletionTracker>,
        options: &AutoscalingOptions,
    ) -> Self {
        let ctx = Arc::new(DeletionContext::new(api, tracker, options));
        let config = NodeGroupConfigProcessor::new(options.node_group_defaults());
        let batcher = Arc::new(NodeDeletionBatcher::new(
            ctx.clone(),
            options.node_deletion_batcher_interval,
        ));
        let scheduler = Arc::new(GroupDeletionScheduler::new(
            ctx.clone(),
            config.clone(),
            batcher,
            Evictor::new(ctx.clone(), options),
            options.node_deletion_delay_timeout,
        ));
        Self {
            ctx,
            budgets: BudgetProcessor::new(provider, options),
            config,
            scheduler,
        }
    }

    pub fn tracker(&self) -> Arc<NodeDeletionTracker> {
        self.ctx.tracker.clone()
    }

    /// Crops the candidates to the budgets, taints them and starts the deletions. Empty nodes
    /// are tainted and started before drained ones.
    pub async fn start_deletion(&self, empty: &[Node], drain: &[Node]) -> Result<ScaleDownStatus> {
        self.scheduler.reset();

        let started = Instant::now();
        let (empty_views, drain_views) =
            self.budgets
                .crop_nodes(self.ctx.tracker.as_ref(), empty, drain);
        self.ctx
            .metrics
            .observe_duration(FUNCTION_CROP_NODES, started.elapsed().as_secs_f64());

        let mut status = ScaleDownStatus {
            result: ScaleDownResult::NoNodeDeleted,
            nodes: Vec::new(),
        };
        if empty_views.is_empty() && drain_views.is_empty() {
            return Ok(status);
        }

        if !empty_views.is_empty() {
            self.taint_nodes(&empty_views).await?;
            status.nodes.extend(self.delete_async(empty_views, false));
        }
        if !drain_views.is_empty() {
            self.taint_nodes(&drain_views).await?;
            status.nodes.extend(self.delete_async(drain_views, true));
        }
        status.result = ScaleDownResult::NodeDeleteStarted;
        Ok(status)
    }

    /// Applies the to-be-deleted taint to every node; on any failure the applied taints are
    /// reverted
    async fn taint_nodes(&self, views: &[NodeGroupView]) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_NODES_TAINTING));
        let mut tasks = JoinSet::new();
        for node in views.iter().flat_map(|v| v.nodes.iter()) {
            let api = self.ctx.api.clone();
            let semaphore = semaphore.clone();
            let name = node.name.clone();
            let budget = self.ctx.api_call_timeout;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = with_deadline(
                    budget,
                    &format!("tainting node {name}"),
                    mark_to_be_deleted(api.as_ref(), &name, Utc::now()),
                )
                .await
                .and_then(|r| r.map_err(AutoscalerError::from));
                (name, result)
            });
        }

        let mut tainted = Vec::new();
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    self.ctx.api.record_node_event(
                        &name,
                        EventType::Normal,
                        "ScaleDown",
                        "marked the node as toBeDeleted/unschedulable",
                    );
                    tainted.push(name);
                }
                Ok((name, Err(e))) => {
                    error!(node = %name, error = %e, "Failed to taint node");
                    self.ctx.api.record_node_event(
                        &name,
                        EventType::Warning,
                        "ScaleDownFailed",
                        &format!("failed to mark the node as toBeDeleted/unschedulable: {e}"),
                    );
                    failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Tainting task failed");
                    failed += 1;
                }
            }
        }

        if failed == 0 {
            return Ok(());
        }
        for name in &tainted {
            if let Err(e) = self.ctx.untaint(name).await {
                error!(node = %name, error = %e, "Failed to remove the to-be-deleted taint");
            }
        }
        Err(AutoscalerError::api_call(format!(
            "couldn't taint {failed} nodes with ToBeDeleted"
        )))
    }

    /// Registers the nodes in the tracker and spawns one task per node group
    fn delete_async(&self, views: Vec<NodeGroupView>, drain: bool) -> Vec<ScaleDownNode> {
        let mut started = Vec::new();
        for view in views {
            let group_id = view.group.id();
            for node in &view.nodes {
                self.ctx
                    .logger
                    .log_node_removal(&node.name, &group_id, drain, &[]);
                if drain {
                    self.ctx.tracker.start_deletion_with_drain(&group_id, &node.name);
                } else {
                    self.ctx.tracker.start_deletion(&group_id, &node.name);
                }
                started.push(ScaleDownNode {
                    node: node.clone(),
                    node_group_id: group_id.clone(),
                    drain,
                });
            }

            let batch_size = match self.config.is_atomic(view.group.as_ref()) {
                Ok(true) => {
                    self.scheduler.register_atomic_group(&group_id);
                    view.group.target_size().unwrap_or(view.nodes.len())
                }
                _ => view.nodes.len(),
            };
            let ctx = self.ctx.clone();
            let scheduler = self.scheduler.clone();
            tokio::spawn(delete_nodes_async(ctx, scheduler, view, batch_size, drain));
        }
        started
    }

    /// Current in-flight deletions, recent evictions and results
    pub fn check_status(&self) -> ActuationSnapshot {
        self.ctx.tracker.snapshot()
    }

    pub fn clear_results_not_newer_than(&self, t: DateTime<Utc>) {
        self.ctx.tracker.clear_results_not_newer_than(t);
    }

    pub fn deletion_results(&self) -> (HashMap<String, DeletionResult>, DateTime<Utc>) {
        self.ctx.tracker.deletion_results()
    }
}

/// Refreshes each node from the API and schedules it. Empty nodes that gained pods are aborted.
async fn delete_nodes_async(
    ctx: Arc<DeletionContext>,
    scheduler: Arc<GroupDeletionScheduler>,
    view: NodeGroupView,
    batch_size: usize,
    drain: bool,
) {
    let group_id = view.group.id();
    let mut tasks = JoinSet::new();
    for node in view.nodes {
        let info = match fetch_node_info(ctx.api.as_ref(), &node, ctx.api_call_timeout).await {
            Ok(info) => info,
            Err(e) => {
                scheduler
                    .abort_node_deletion(
                        &node,
                        &group_id,
                        drain,
                        "failed to get node info",
                        DeletionResult::failed(DeletionResultKind::InternalError, e),
                    )
                    .await;
                continue;
            }
        };

        if !drain {
            let still_empty = get_pods_to_move(&info, Utc::now(), &RemainingPdbTracker::default())
                .is_ok_and(|p| p.pods.is_empty());
            if !still_empty {
                let err = AutoscalerError::internal(format!(
                    "failed to delete empty node \"{}\", new pods scheduled",
                    node.name
                ));
                scheduler
                    .abort_node_deletion(
                        &node,
                        &group_id,
                        drain,
                        "node is not empty anymore",
                        DeletionResult::failed(DeletionResultKind::InternalError, err),
                    )
                    .await;
                continue;
            }
        }

        info!(node = %node.name, node_group = %group_id, drain, "Scheduling node deletion");
        let scheduler = scheduler.clone();
        let group: Arc<dyn NodeGroup> = view.group.clone();
        tasks.spawn(async move {
            scheduler
                .schedule_deletion(info, group, batch_size, drain)
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(node_group = %group_id, error = %e, "Node deletion task failed");
        }
    }
}

async fn fetch_node_info(
    api: &dyn ClusterApi,
    node: &Node,
    budget: Duration,
) -> Result<NodeInfo> {
    let fresh = with_deadline(
        budget,
        &format!("getting node {}", node.name),
        api.get_node(&node.name),
    )
    .await?
    .map_err(|e| AutoscalerError::internal(format!("failed to get node {}: {}", node.name, e)))?;
    let pods = with_deadline(
        budget,
        &format!("listing pods on node {}", node.name),
        api.list_pods_on_node(&node.name),
    )
    .await?
    .map_err(|e| {
        AutoscalerError::internal(format!("failed to list pods on node {}: {}", node.name, e))
    })?;
    Ok(NodeInfo::new(fresh, pods))
}

#[cfg(test)]
mod tests;
