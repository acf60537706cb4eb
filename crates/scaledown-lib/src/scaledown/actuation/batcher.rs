//! Per node-group batching of cloud deletions

use super::{with_deadline, DeletionContext};
use crate::cloudprovider::NodeGroup;
use crate::error::AutoscalerError;
use crate::models::Node;
use crate::observability::FUNCTION_DELETE_NODES;
use crate::scaledown::{DeletionResult, DeletionResultKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// A node handed to the batcher; `drain` tells how it was emptied
#[derive(Debug, Clone)]
pub struct BatchedNode {
    pub node: Node,
    pub drain: bool,
}

struct Bucket {
    group: Arc<dyn NodeGroup>,
    nodes: Vec<BatchedNode>,
}

/// Collects nodes per node group and deletes each bucket with a single cloud call.
/// With a zero interval every call is forwarded immediately.
pub struct NodeDeletionBatcher {
    ctx: Arc<DeletionContext>,
    interval: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl NodeDeletionBatcher {
    pub(crate) fn new(ctx: Arc<DeletionContext>, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn add_nodes(self: &Arc<Self>, nodes: Vec<BatchedNode>, group: Arc<dyn NodeGroup>) {
        if nodes.is_empty() {
            return;
        }
        if self.interval.is_zero() {
            self.delete_nodes_and_register_status(nodes, group).await;
            return;
        }
        let group_id = group.id();
        if self.add_to_bucket(nodes, group) {
            let batcher = Arc::clone(self);
            let interval = self.interval;
            tokio::spawn(async move {
                sleep(interval).await;
                batcher.flush(&group_id).await;
            });
        }
    }

    /// Returns true when the bucket was empty before
    fn add_to_bucket(&self, nodes: Vec<BatchedNode>, group: Arc<dyn NodeGroup>) -> bool {
        let mut buckets = self.buckets();
        match buckets.get_mut(&group.id()) {
            Some(bucket) if !bucket.nodes.is_empty() => {
                bucket.nodes.extend(nodes);
                false
            }
            _ => {
                buckets.insert(group.id(), Bucket { group, nodes });
                true
            }
        }
    }

    /// Number of nodes waiting in the group's bucket
    pub fn pending(&self, group_id: &str) -> usize {
        self.buckets()
            .get(group_id)
            .map(|b| b.nodes.len())
            .unwrap_or(0)
    }

    async fn flush(&self, group_id: &str) {
        let bucket = self.buckets().remove(group_id);
        match bucket {
            Some(bucket) => {
                self.delete_nodes_and_register_status(bucket.nodes, bucket.group)
                    .await
            }
            None => warn!(node_group = %group_id, "Node group is not present in the batch deleter"),
        }
    }

    async fn delete_nodes_and_register_status(
        &self,
        nodes: Vec<BatchedNode>,
        group: Arc<dyn NodeGroup>,
    ) {
        let group_id = group.id();
        let to_delete: Vec<Node> = nodes.iter().map(|n| n.node.clone()).collect();
        debug!(node_group = %group_id, count = to_delete.len(), "Deleting nodes from cloud provider");

        let started = Instant::now();
        let result = with_deadline(
            self.ctx.cloud_call_timeout,
            &format!("deleting nodes from group {group_id}"),
            group.delete_nodes(&to_delete),
        )
        .await
        .and_then(|deleted| {
            deleted.map_err(|e| {
                AutoscalerError::cloud_provider(format!(
                    "failed to delete nodes from group {group_id}: {e}"
                ))
            })
        });
        self.ctx
            .metrics
            .observe_duration(FUNCTION_DELETE_NODES, started.elapsed().as_secs_f64());

        for batched in &nodes {
            match &result {
                Ok(()) => self
                    .ctx
                    .register_successful_scale_down(&batched.node, &group_id, batched.drain),
                Err(e) => {
                    self.ctx
                        .clean_up_and_record_failed_scale_down(
                            &batched.node,
                            &group_id,
                            batched.drain,
                            "",
                            DeletionResult::failed(DeletionResultKind::FailedToDelete, e.clone()),
                        )
                        .await
                }
            }
        }
    }
}
