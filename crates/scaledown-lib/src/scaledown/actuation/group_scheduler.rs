//! Drains nodes and hands them to the batcher, holding atomic groups until complete

use super::batcher::{BatchedNode, NodeDeletionBatcher};
use super::drain::{wait_for_delay_deletion, Evictor};
use super::DeletionContext;
use crate::cloudprovider::NodeGroup;
use crate::config::NodeGroupConfigProcessor;
use crate::error::AutoscalerError;
use crate::models::Node;
use crate::scaledown::{DeletionResult, DeletionResultKind};
use crate::simulator::{NodeInfo, UnremovableReason};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Default)]
struct SchedulerState {
    queues: HashMap<String, Vec<BatchedNode>>,
    failed_groups: HashSet<String>,
    atomic_groups: HashSet<String>,
}

enum Admission {
    Wait,
    GroupFailed,
    Flush(Vec<BatchedNode>),
}

pub struct GroupDeletionScheduler {
    ctx: Arc<DeletionContext>,
    config: NodeGroupConfigProcessor,
    batcher: Arc<NodeDeletionBatcher>,
    evictor: Evictor,
    node_deletion_delay_timeout: Duration,
    state: Mutex<SchedulerState>,
}

impl GroupDeletionScheduler {
    pub(crate) fn new(
        ctx: Arc<DeletionContext>,
        config: NodeGroupConfigProcessor,
        batcher: Arc<NodeDeletionBatcher>,
        evictor: Evictor,
        node_deletion_delay_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            config,
            batcher,
            evictor,
            node_deletion_delay_timeout,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Forgets group failures of the previous actuation round
    pub fn reset(&self) {
        self.state().failed_groups.clear();
    }

    /// Marks the group as scaled atomically so aborts cascade
    pub fn register_atomic_group(&self, group_id: &str) {
        self.state().atomic_groups.insert(group_id.to_string());
    }

    /// Number of drained nodes waiting for the rest of their atomic batch
    pub fn queued(&self, group_id: &str) -> usize {
        self.state().queues.get(group_id).map(Vec::len).unwrap_or(0)
    }

    /// Drains the node (or evicts its daemonset pods when empty), waits for delay-deletion
    /// annotations and queues it for deletion. `batch_size` is only used for atomic groups.
    pub async fn schedule_deletion(
        &self,
        info: NodeInfo,
        group: Arc<dyn NodeGroup>,
        batch_size: usize,
        drain: bool,
    ) {
        let group_id = group.id();
        let atomic = match self.config.is_atomic(group.as_ref()) {
            Ok(atomic) => atomic,
            Err(e) => {
                let result = DeletionResult::failed(
                    DeletionResultKind::InternalError,
                    AutoscalerError::internal(format!("GetOptions returned error {e}")),
                );
                self.abort_node_deletion(
                    &info.node,
                    &group_id,
                    drain,
                    "failed to get autoscaling options for a node group",
                    result,
                )
                .await;
                return;
            }
        };
        if atomic {
            self.register_atomic_group(&group_id);
        }

        let result = self.prepare_node_for_deletion(&info, drain).await;
        if !result.is_ok() {
            self.abort_node_deletion(
                &info.node,
                &group_id,
                drain,
                "prepareNodeForDeletion failed",
                result,
            )
            .await;
            return;
        }

        self.add_to_batcher(info.node, group, batch_size, drain, atomic)
            .await;
    }

    async fn prepare_node_for_deletion(&self, info: &NodeInfo, drain: bool) -> DeletionResult {
        if drain {
            if let Err(e) = self.evictor.drain_node(info).await {
                return DeletionResult::failed(DeletionResultKind::FailedToEvictPods, e.err)
                    .with_evictions(e.results);
            }
        } else if let Err(e) = self.evictor.evict_daemonset_pods(info).await {
            warn!(node = %info.name(), error = %e, "Error while evicting daemonset pods from an empty node");
        }

        if let Err(e) = wait_for_delay_deletion(
            self.ctx.api.as_ref(),
            &info.node,
            self.node_deletion_delay_timeout,
            self.ctx.api_call_timeout,
        )
        .await
        {
            return DeletionResult::failed(DeletionResultKind::FailedToDelete, e);
        }
        DeletionResult::ok()
    }

    async fn add_to_batcher(
        &self,
        node: Node,
        group: Arc<dyn NodeGroup>,
        batch_size: usize,
        drain: bool,
        atomic: bool,
    ) {
        let group_id = group.id();
        let admission = {
            let mut state = self.state();
            if atomic && state.failed_groups.contains(&group_id) {
                state.queues.remove(&group_id);
                Admission::GroupFailed
            } else {
                let queue = state.queues.entry(group_id.clone()).or_default();
                queue.push(BatchedNode {
                    node: node.clone(),
                    drain,
                });
                if atomic && queue.len() < batch_size {
                    Admission::Wait
                } else {
                    Admission::Flush(std::mem::take(queue))
                }
            }
        };

        match admission {
            Admission::Wait => {
                debug!(node = %node.name, node_group = %group_id, "Waiting for the rest of the atomic batch");
            }
            Admission::GroupFailed => {
                self.ctx
                    .clean_up_and_record_failed_scale_down(
                        &node,
                        &group_id,
                        drain,
                        "scale down failed for node group as a whole",
                        cascaded_failure(),
                    )
                    .await;
            }
            Admission::Flush(batch) => self.batcher.add_nodes(batch, group).await,
        }
    }

    /// Records the node's failure, marks the group failed for this round and aborts every
    /// other node queued for the same group
    pub async fn abort_node_deletion(
        &self,
        node: &Node,
        group_id: &str,
        drain: bool,
        err_msg: &str,
        mut result: DeletionResult,
    ) {
        let (atomic, others) = {
            let mut state = self.state();
            state.failed_groups.insert(group_id.to_string());
            let others: Vec<BatchedNode> = state
                .queues
                .remove(group_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|queued| queued.node.name != node.name)
                .collect();
            (state.atomic_groups.contains(group_id), others)
        };

        if atomic {
            result.kind = DeletionResultKind::FailedToDelete;
            result.reason = Some(UnremovableReason::AtomicGroupFailed);
        }
        self.ctx
            .clean_up_and_record_failed_scale_down(node, group_id, drain, err_msg, result)
            .await;

        for other in others {
            self.ctx
                .clean_up_and_record_failed_scale_down(
                    &other.node,
                    group_id,
                    other.drain,
                    "scale down failed for node group as a whole",
                    cascaded_failure(),
                )
                .await;
        }
    }
}

fn cascaded_failure() -> DeletionResult {
    DeletionResult::failed(
        DeletionResultKind::FailedToDelete,
        AutoscalerError::transient("couldn't scale down other nodes in this node group"),
    )
    .with_reason(UnremovableReason::AtomicGroupFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::CloudProviderError;
    use crate::config::{AutoscalingOptions, NodeGroupAutoscalingOptions};
    use crate::models::{OwnerReference, Pod};
    use crate::scaledown::NodeDeletionTracker;
    use crate::testing::{FakeClusterApi, TestNodeGroup};

    struct Fixture {
        api: Arc<FakeClusterApi>,
        tracker: Arc<NodeDeletionTracker>,
        group: Arc<TestNodeGroup>,
        scheduler: GroupDeletionScheduler,
    }

    fn fixture(size: usize, atomic: bool) -> Fixture {
        let options = AutoscalingOptions {
            max_pod_eviction_time: Duration::from_secs(60),
            eviction_retry_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let api = Arc::new(FakeClusterApi::new());
        let tracker = Arc::new(NodeDeletionTracker::default());
        let group = Arc::new(TestNodeGroup::new("g1", 0, 10, size));
        if atomic {
            group.set_options(NodeGroupAutoscalingOptions {
                zero_or_max_node_scaling: true,
                ..Default::default()
            });
        }
        for i in 0..size {
            let node = Node::new(format!("n{i}"));
            group.add_node(&node);
            api.add_node(node);
            tracker.start_deletion_with_drain("g1", &format!("n{i}"));
        }
        let ctx = Arc::new(DeletionContext::new(api.clone(), tracker.clone(), &options));
        let batcher = Arc::new(NodeDeletionBatcher::new(ctx.clone(), Duration::ZERO));
        let scheduler = GroupDeletionScheduler::new(
            ctx.clone(),
            NodeGroupConfigProcessor::new(options.node_group_defaults()),
            batcher,
            Evictor::new(ctx, &options),
            Duration::ZERO,
        );
        Fixture {
            api,
            tracker,
            group,
            scheduler,
        }
    }

    fn info(f: &Fixture, name: &str, pod: Option<&str>) -> NodeInfo {
        let node = f.api.node(name).unwrap_or_else(|| Node::new(name));
        let pods = pod
            .map(|pod_name| {
                let mut pod = Pod::new("default", pod_name);
                pod.node_name = Some(name.to_string());
                pod.owner = Some(OwnerReference::new("ReplicaSet", "rs", "rs-uid"));
                f.api.add_pod(pod.clone());
                vec![pod]
            })
            .unwrap_or_default();
        NodeInfo::new(node, pods)
    }

    fn group(f: &Fixture) -> Arc<dyn NodeGroup> {
        f.group.clone()
    }

    #[tokio::test]
    async fn test_atomic_batch_waits_for_target_size() {
        let f = fixture(2, true);

        f.scheduler
            .schedule_deletion(info(&f, "n0", None), group(&f), 2, true)
            .await;
        assert_eq!(f.scheduler.queued("g1"), 1);
        assert_eq!(f.group.delete_calls(), 0);

        f.scheduler
            .schedule_deletion(info(&f, "n1", None), group(&f), 2, true)
            .await;
        assert_eq!(f.scheduler.queued("g1"), 0);
        assert_eq!(f.group.delete_calls(), 1);
        assert_eq!(f.group.deleted_nodes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_drain_aborts_queued_siblings() {
        let f = fixture(3, true);
        f.scheduler
            .schedule_deletion(info(&f, "n1", None), group(&f), 3, true)
            .await;

        let failing = info(&f, "n0", Some("stuck"));
        f.api.fail_evictions("default/stuck");
        f.scheduler
            .schedule_deletion(failing, group(&f), 3, true)
            .await;

        // arrives after the failure and is rejected on admission
        f.scheduler
            .schedule_deletion(info(&f, "n2", None), group(&f), 3, true)
            .await;

        let (results, _) = f.tracker.deletion_results();
        assert_eq!(results.len(), 3);
        for result in results.values() {
            assert_eq!(result.kind, DeletionResultKind::FailedToDelete);
            assert_eq!(result.reason, Some(UnremovableReason::AtomicGroupFailed));
        }
        assert!(!results["n0"].pod_eviction_results.is_empty());
        assert_eq!(f.group.delete_calls(), 0);
        assert_eq!(f.tracker.deletions_count("g1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_atomic_failure_keeps_its_kind() {
        let f = fixture(2, false);
        let failing = info(&f, "n0", Some("stuck"));
        f.api.fail_evictions("default/stuck");

        f.scheduler
            .schedule_deletion(failing, group(&f), 0, true)
            .await;
        f.scheduler
            .schedule_deletion(info(&f, "n1", None), group(&f), 0, true)
            .await;

        let (results, _) = f.tracker.deletion_results();
        assert_eq!(results["n0"].kind, DeletionResultKind::FailedToEvictPods);
        assert_eq!(results["n0"].reason, None);
        assert!(results["n1"].is_ok());
        assert_eq!(f.group.deleted_nodes(), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_options_error_aborts_node() {
        struct BrokenGroup(TestNodeGroup);

        #[async_trait::async_trait]
        impl NodeGroup for BrokenGroup {
            fn id(&self) -> String {
                self.0.id()
            }
            fn min_size(&self) -> usize {
                self.0.min_size()
            }
            fn max_size(&self) -> usize {
                self.0.max_size()
            }
            fn target_size(&self) -> Result<usize, CloudProviderError> {
                self.0.target_size()
            }
            async fn increase_size(&self, delta: i64) -> Result<(), CloudProviderError> {
                self.0.increase_size(delta).await
            }
            async fn decrease_target_size(&self, delta: i64) -> Result<(), CloudProviderError> {
                self.0.decrease_target_size(delta).await
            }
            async fn delete_nodes(&self, nodes: &[Node]) -> Result<(), CloudProviderError> {
                self.0.delete_nodes(nodes).await
            }
            fn nodes(&self) -> Result<Vec<crate::cloudprovider::Instance>, CloudProviderError> {
                self.0.nodes()
            }
            fn template_node_info(&self) -> Result<NodeInfo, CloudProviderError> {
                self.0.template_node_info()
            }
            fn options(
                &self,
                _defaults: &NodeGroupAutoscalingOptions,
            ) -> Result<Option<NodeGroupAutoscalingOptions>, CloudProviderError> {
                Err(CloudProviderError::Internal("options unavailable".into()))
            }
        }

        let f = fixture(1, false);
        let broken: Arc<dyn NodeGroup> = Arc::new(BrokenGroup(TestNodeGroup::new("g1", 0, 10, 1)));
        f.scheduler
            .schedule_deletion(info(&f, "n0", None), broken, 0, false)
            .await;

        let (results, _) = f.tracker.deletion_results();
        assert_eq!(results["n0"].kind, DeletionResultKind::InternalError);
        assert_eq!(f.api.events_with_reason("ScaleDownFailed").len(), 1);
    }
}
