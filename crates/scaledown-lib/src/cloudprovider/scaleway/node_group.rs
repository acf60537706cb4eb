//! A Kapsule pool exposed as a node group

use super::client::{KapsuleApi, KapsuleNode, NodeStatus, Pool};
use crate::cloudprovider::{
    CloudProviderError, Instance, InstanceErrorClass, InstanceErrorInfo, InstanceState,
    InstanceStatus, NodeGroup,
};
use crate::models::{Node, OwnerReference, Pod, ResourceList, HOSTNAME_LABEL, RESOURCE_CPU};
use crate::simulator::NodeInfo;
use crate::taints::parse_taints;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};

struct PoolState {
    pool: Pool,
    /// Keyed by provider id
    nodes: HashMap<String, KapsuleNode>,
}

pub struct ScalewayNodeGroup {
    client: Arc<dyn KapsuleApi>,
    id: String,
    state: Mutex<PoolState>,
}

impl ScalewayNodeGroup {
    pub fn new(client: Arc<dyn KapsuleApi>, pool: Pool, nodes: Vec<KapsuleNode>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|n| (n.provider_id.clone(), n))
            .collect();
        Self {
            client,
            id: pool.id.clone(),
            state: Mutex::new(PoolState { pool, nodes }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pool(&self) -> Pool {
        self.state().pool.clone()
    }

    pub fn has_node(&self, provider_id: &str) -> bool {
        self.state().nodes.contains_key(provider_id)
    }

    pub fn node_count(&self) -> usize {
        self.state().nodes.len()
    }

    pub fn node_status(&self, provider_id: &str) -> Option<NodeStatus> {
        self.state().nodes.get(provider_id).map(|n| n.status)
    }

    /// Undoes the local view change of a rejected deletion
    fn restore_node(&self, provider_id: &str, status: NodeStatus) {
        let mut state = self.state();
        state.pool.size += 1;
        if let Some(tracked) = state.nodes.get_mut(provider_id) {
            tracked.status = status;
        }
    }

    pub(crate) fn price_per_hour(&self) -> f64 {
        self.state().pool.node_price_per_hour
    }

    async fn resize(&self, target: u32) -> Result<(), CloudProviderError> {
        let updated = self.client.update_pool(&self.id, target).await?;
        if updated.size != target {
            return Err(CloudProviderError::Internal(format!(
                "couldn't resize pool {} to {}, current size is {}",
                self.id, target, updated.size
            )));
        }
        self.state().pool.size = target;
        Ok(())
    }
}

/// Maps a Kapsule node status onto a generic instance status
pub fn instance_status(status: NodeStatus) -> InstanceStatus {
    let error = |message: &str| InstanceStatus {
        state: None,
        error_info: Some(InstanceErrorInfo {
            error_class: InstanceErrorClass::Other,
            error_code: status.as_str().to_string(),
            error_message: message.to_string(),
        }),
    };
    let state = |state| InstanceStatus {
        state: Some(state),
        error_info: None,
    };

    match status {
        NodeStatus::Ready => state(InstanceState::Running),
        NodeStatus::Creating
        | NodeStatus::Starting
        | NodeStatus::Registering
        | NodeStatus::NotReady
        | NodeStatus::Upgrading
        | NodeStatus::Rebooting => state(InstanceState::Creating),
        NodeStatus::Deleting => state(InstanceState::Deleting),
        NodeStatus::CreationError => error("scaleway node could not be created"),
        NodeStatus::Deleted => error("node has already been deleted"),
        NodeStatus::Locked => error("node is locked for legal reasons"),
        NodeStatus::Unknown => error(""),
    }
}

/// Synthetic kube-proxy pod every node of the pool runs
fn kube_proxy_pod(pool_name: &str) -> Pod {
    let mut pod = Pod::new("kube-system", format!("kube-proxy-{pool_name}"));
    pod.uid = format!("kube-proxy-{pool_name}");
    pod.labels.insert("component".into(), "kube-proxy".into());
    pod.labels.insert("tier".into(), "node".into());
    pod.owner = Some(OwnerReference::new("DaemonSet", "kube-proxy", "kube-proxy"));
    pod.requests = ResourceList::new().with(RESOURCE_CPU, 100);
    pod
}

#[async_trait]
impl NodeGroup for ScalewayNodeGroup {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn min_size(&self) -> usize {
        self.state().pool.min_size as usize
    }

    fn max_size(&self) -> usize {
        self.state().pool.max_size as usize
    }

    fn target_size(&self) -> Result<usize, CloudProviderError> {
        Ok(self.state().pool.size as usize)
    }

    async fn increase_size(&self, delta: i64) -> Result<(), CloudProviderError> {
        if delta <= 0 {
            return Err(CloudProviderError::InvalidArgument(format!(
                "delta must be strictly positive, have: {delta}"
            )));
        }
        let (size, max) = {
            let state = self.state();
            (i64::from(state.pool.size), i64::from(state.pool.max_size))
        };
        let target = size + delta;
        if target > max {
            return Err(CloudProviderError::InvalidArgument(format!(
                "size increase is too large. current: {size} desired: {target} max: {max}"
            )));
        }
        self.resize(target as u32).await
    }

    async fn decrease_target_size(&self, delta: i64) -> Result<(), CloudProviderError> {
        if delta >= 0 {
            return Err(CloudProviderError::InvalidArgument(format!(
                "delta must be strictly negative, have: {delta}"
            )));
        }
        let (size, min, registered) = {
            let state = self.state();
            let registered = state
                .nodes
                .values()
                .filter(|n| n.status != NodeStatus::Deleting && n.status != NodeStatus::Deleted)
                .count() as i64;
            (
                i64::from(state.pool.size),
                i64::from(state.pool.min_size),
                registered,
            )
        };
        let target = size + delta;
        if target < min {
            return Err(CloudProviderError::InvalidArgument(format!(
                "size decrease is too large. current: {size} desired: {target} min: {min}"
            )));
        }
        if target < registered {
            return Err(CloudProviderError::InvalidArgument(format!(
                "attempt to delete existing nodes, target size: {target} registered nodes: {registered}"
            )));
        }
        self.resize(target as u32).await
    }

    async fn delete_nodes(&self, nodes: &[Node]) -> Result<(), CloudProviderError> {
        for node in nodes {
            // the local view reads Deleting while the request is in flight
            let claimed = {
                let mut state = self.state();
                let claimed = state.nodes.get_mut(&node.provider_id).map(|tracked| {
                    let previous = std::mem::replace(&mut tracked.status, NodeStatus::Deleting);
                    (tracked.id.clone(), previous)
                });
                if claimed.is_some() {
                    state.pool.size = state.pool.size.saturating_sub(1);
                }
                claimed
            };
            let Some((kapsule_id, previous)) = claimed else {
                error!(
                    provider_id = %node.provider_id,
                    pool_id = %self.id,
                    "Node marked for deletion not found in pool"
                );
                continue;
            };

            let outcome = match self.client.delete_node(&kapsule_id).await {
                Ok(deleted) if deleted.status == NodeStatus::Deleting => Ok(()),
                Ok(deleted) => Err(CloudProviderError::Internal(format!(
                    "node {} is {} after deletion request, expected deleting",
                    kapsule_id,
                    deleted.status.as_str()
                ))),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                self.restore_node(&node.provider_id, previous);
                return Err(e);
            }
            info!(node = %node.name, pool_id = %self.id, "Node deletion requested");
        }
        Ok(())
    }

    fn nodes(&self) -> Result<Vec<Instance>, CloudProviderError> {
        let state = self.state();
        let mut instances: Vec<Instance> = state
            .nodes
            .values()
            .map(|n| Instance {
                id: n.provider_id.clone(),
                status: Some(instance_status(n.status)),
            })
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    fn template_node_info(&self) -> Result<NodeInfo, CloudProviderError> {
        let state = self.state();
        let pool = &state.pool;
        let name = pool
            .labels
            .get(HOSTNAME_LABEL)
            .cloned()
            .unwrap_or_else(|| format!("{}-template", pool.name));

        let mut node = Node::new(name);
        node.labels = pool.labels.clone().into_iter().collect();
        node.capacity = ResourceList::from(pool.capacity.clone());
        node.allocatable = ResourceList::from(pool.allocatable.clone());
        node.taints = parse_taints(&pool.taints);

        Ok(NodeInfo::new(node, vec![kube_proxy_pod(&pool.name)]))
    }

    fn debug(&self) -> String {
        let state = self.state();
        format!(
            "{} ({}): size {} min {} max {}",
            self.id, state.pool.name, state.pool.size, state.pool.min_size, state.pool.max_size
        )
    }
}
