//! In-memory cloud provider and orchestrator API for tests

use crate::cloudprovider::{
    CloudProvider, CloudProviderError, Instance, InstanceState, InstanceStatus, NodeGroup,
    ResourceLimiter,
};
use crate::cluster::{ApiError, ClusterApi, EventType};
use crate::config::NodeGroupAutoscalingOptions;
use crate::models::{Node, Pod, Taint};
use crate::simulator::NodeInfo;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

pub const TEST_GPU_LABEL: &str = "test.cloud/gpu";

#[derive(Debug, Default)]
struct GroupState {
    target_size: usize,
    nodes: BTreeMap<String, Node>,
    deleted: Vec<String>,
    delete_calls: usize,
    options: Option<NodeGroupAutoscalingOptions>,
    delete_error: Option<CloudProviderError>,
    hang_deletes: bool,
}

/// Node group whose size and membership live in memory. Deleted nodes are recorded.
pub struct TestNodeGroup {
    id: String,
    min_size: usize,
    max_size: usize,
    state: Mutex<GroupState>,
}

impl TestNodeGroup {
    pub fn new(id: impl Into<String>, min_size: usize, max_size: usize, target_size: usize) -> Self {
        Self {
            id: id.into(),
            min_size,
            max_size,
            state: Mutex::new(GroupState {
                target_size,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_node(&self, node: &Node) {
        self.state().nodes.insert(node.name.clone(), node.clone());
    }

    pub fn set_options(&self, options: NodeGroupAutoscalingOptions) {
        self.state().options = Some(options);
    }

    /// Makes every later `delete_nodes` call fail
    pub fn fail_deletes(&self, err: CloudProviderError) {
        self.state().delete_error = Some(err);
    }

    /// Makes every later `delete_nodes` call stay pending forever
    pub fn hang_deletes(&self) {
        self.state().hang_deletes = true;
    }

    pub fn deleted_nodes(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.state().delete_calls
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.state().nodes.contains_key(name)
    }
}

#[async_trait]
impl NodeGroup for TestNodeGroup {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn min_size(&self) -> usize {
        self.min_size
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn target_size(&self) -> Result<usize, CloudProviderError> {
        Ok(self.state().target_size)
    }

    async fn increase_size(&self, delta: i64) -> Result<(), CloudProviderError> {
        if delta <= 0 {
            return Err(CloudProviderError::InvalidArgument(
                "size increase must be positive".into(),
            ));
        }
        let mut state = self.state();
        let new_size = state.target_size + delta as usize;
        if new_size > self.max_size {
            return Err(CloudProviderError::InvalidArgument(format!(
                "size increase too large - desired:{} max:{}",
                new_size, self.max_size
            )));
        }
        state.target_size = new_size;
        Ok(())
    }

    async fn decrease_target_size(&self, delta: i64) -> Result<(), CloudProviderError> {
        if delta >= 0 {
            return Err(CloudProviderError::InvalidArgument(
                "size decrease must be negative".into(),
            ));
        }
        let mut state = self.state();
        state.target_size = state.target_size.saturating_sub(delta.unsigned_abs() as usize);
        Ok(())
    }

    async fn delete_nodes(&self, nodes: &[Node]) -> Result<(), CloudProviderError> {
        let hangs = {
            let mut state = self.state();
            state.delete_calls += 1;
            state.hang_deletes
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        let mut state = self.state();
        if let Some(err) = &state.delete_error {
            return Err(err.clone());
        }
        for node in nodes {
            if state.nodes.remove(&node.name).is_some() {
                state.deleted.push(node.name.clone());
                state.target_size = state.target_size.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn nodes(&self) -> Result<Vec<Instance>, CloudProviderError> {
        Ok(self
            .state()
            .nodes
            .values()
            .map(|node| Instance {
                id: if node.provider_id.is_empty() {
                    node.name.clone()
                } else {
                    node.provider_id.clone()
                },
                status: Some(InstanceStatus {
                    state: Some(InstanceState::Running),
                    error_info: None,
                }),
            })
            .collect())
    }

    fn template_node_info(&self) -> Result<NodeInfo, CloudProviderError> {
        Err(CloudProviderError::NotImplemented)
    }

    fn options(
        &self,
        _defaults: &NodeGroupAutoscalingOptions,
    ) -> Result<Option<NodeGroupAutoscalingOptions>, CloudProviderError> {
        Ok(self.state().options.clone())
    }
}

/// Cloud provider over `TestNodeGroup`s; nodes are matched by name
#[derive(Default)]
pub struct TestCloudProvider {
    groups: RwLock<Vec<Arc<TestNodeGroup>>>,
    node_groups_by_node: RwLock<HashMap<String, String>>,
    limiter: RwLock<ResourceLimiter>,
}

impl TestCloudProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node_group(&self, group: TestNodeGroup) -> Arc<TestNodeGroup> {
        let group = Arc::new(group);
        self.groups
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(group.clone());
        group
    }

    pub fn add_node(&self, group_id: &str, node: &Node) {
        if let Some(group) = self.group(group_id) {
            group.add_node(node);
            self.node_groups_by_node
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(node.name.clone(), group_id.to_string());
        }
    }

    pub fn set_options(&self, group_id: &str, options: NodeGroupAutoscalingOptions) {
        if let Some(group) = self.group(group_id) {
            group.set_options(options);
        }
    }

    pub fn set_resource_limiter(&self, limiter: ResourceLimiter) {
        *self.limiter.write().unwrap_or_else(|p| p.into_inner()) = limiter;
    }

    pub fn group(&self, group_id: &str) -> Option<Arc<TestNodeGroup>> {
        self.groups
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|g| g.id == group_id)
            .cloned()
    }
}

#[async_trait]
impl CloudProvider for TestCloudProvider {
    fn name(&self) -> &str {
        "test"
    }

    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>> {
        self.groups
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|g| g.clone() as Arc<dyn NodeGroup>)
            .collect()
    }

    fn node_group_for_node(
        &self,
        node: &Node,
    ) -> Result<Option<Arc<dyn NodeGroup>>, CloudProviderError> {
        let group_id = self
            .node_groups_by_node
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&node.name)
            .cloned();
        Ok(group_id
            .and_then(|id| self.group(&id))
            .map(|g| g as Arc<dyn NodeGroup>))
    }

    fn gpu_label(&self) -> &str {
        TEST_GPU_LABEL
    }

    fn resource_limiter(&self) -> Result<ResourceLimiter, CloudProviderError> {
        Ok(self.limiter.read().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn refresh(&self) -> Result<(), CloudProviderError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Node name or pod `namespace/name`
    pub object: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Orchestrator calls that can be made to never answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HangingCall {
    GetNode,
    ListPods,
    GetPod,
    EvictPod,
    AddTaint,
}

#[derive(Debug, Default)]
struct ApiState {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
    scripted_eviction_errors: HashMap<String, VecDeque<ApiError>>,
    failing_evictions: HashSet<String>,
    sticky_pods: HashSet<String>,
    failing_taints: HashSet<String>,
    hanging: HashSet<HangingCall>,
    evictions: Vec<(String, i64)>,
    events: Vec<RecordedEvent>,
}

/// Orchestrator API backed by in-memory nodes and pods. Evicted pods disappear unless marked
/// sticky.
#[derive(Default)]
pub struct FakeClusterApi {
    state: Mutex<ApiState>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ApiState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_node(&self, node: Node) {
        self.state().nodes.insert(node.name.clone(), node);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state().pods.insert(pod.key(), pod);
    }

    pub fn remove_pod(&self, key: &str) {
        self.state().pods.remove(key);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state().nodes.get(name).cloned()
    }

    /// Node with the annotation removed, as an operator would
    pub fn remove_node_annotation(&self, node: &str, key: &str) {
        if let Some(node) = self.state().nodes.get_mut(node) {
            node.annotations.remove(key);
        }
    }

    /// Errors returned by the next eviction attempts of the pod, in order
    pub fn script_eviction_errors(&self, pod_key: &str, errors: Vec<ApiError>) {
        self.state()
            .scripted_eviction_errors
            .insert(pod_key.to_string(), errors.into());
    }

    pub fn fail_evictions(&self, pod_key: &str) {
        self.state().failing_evictions.insert(pod_key.to_string());
    }

    /// Evictions of the pod are accepted but the pod never goes away
    pub fn keep_after_eviction(&self, pod_key: &str) {
        self.state().sticky_pods.insert(pod_key.to_string());
    }

    pub fn fail_taints(&self, node: &str) {
        self.state().failing_taints.insert(node.to_string());
    }

    /// Every later call of this kind stays pending forever. Evictions are still recorded.
    pub fn hang(&self, call: HangingCall) {
        self.state().hanging.insert(call);
    }

    async fn maybe_hang(&self, call: HangingCall) {
        let hangs = self.state().hanging.contains(&call);
        if hangs {
            std::future::pending::<()>().await;
        }
    }

    /// Pod keys of every eviction attempt, in order
    pub fn eviction_attempts(&self) -> Vec<String> {
        self.state().evictions.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn eviction_grace(&self, pod_key: &str) -> Option<i64> {
        self.state()
            .evictions
            .iter()
            .find(|(k, _)| k == pod_key)
            .map(|(_, grace)| *grace)
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state().events.clone()
    }

    pub fn events_with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.state()
            .events
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }

    fn record(&self, object: String, event_type: EventType, reason: &str, message: &str) {
        self.state().events.push(RecordedEvent {
            object,
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn get_node(&self, name: &str) -> Result<Node, ApiError> {
        self.maybe_hang(HangingCall::GetNode).await;
        self.node(name)
            .ok_or_else(|| ApiError::NotFound(format!("node {name}")))
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ApiError> {
        self.maybe_hang(HangingCall::ListPods).await;
        Ok(self
            .state()
            .pods
            .values()
            .filter(|p| p.node_name.as_deref() == Some(node_name))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError> {
        self.maybe_hang(HangingCall::GetPod).await;
        let key = format!("{namespace}/{name}");
        self.state()
            .pods
            .get(&key)
            .cloned()
            .ok_or(ApiError::NotFound(key))
    }

    async fn evict_pod(&self, pod: &Pod, grace_period_secs: i64) -> Result<(), ApiError> {
        let key = pod.key();
        self.state().evictions.push((key.clone(), grace_period_secs));
        self.maybe_hang(HangingCall::EvictPod).await;
        let mut state = self.state();
        if let Some(err) = state
            .scripted_eviction_errors
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if state.failing_evictions.contains(&key) {
            return Err(ApiError::Other("fail to evict the pod".into()));
        }
        if !state.pods.contains_key(&key) {
            return Err(ApiError::NotFound(key));
        }
        if !state.sticky_pods.contains(&key) {
            state.pods.remove(&key);
        }
        Ok(())
    }

    async fn add_taint(&self, node_name: &str, taint: Taint) -> Result<(), ApiError> {
        self.maybe_hang(HangingCall::AddTaint).await;
        let mut state = self.state();
        if state.failing_taints.contains(node_name) {
            return Err(ApiError::Other(format!("failed to update node {node_name}")));
        }
        let node = state
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| ApiError::NotFound(format!("node {node_name}")))?;
        node.taints.retain(|t| t.key != taint.key);
        node.taints.push(taint);
        Ok(())
    }

    async fn remove_taint(&self, node_name: &str, key: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| ApiError::NotFound(format!("node {node_name}")))?;
        node.taints.retain(|t| t.key != key);
        Ok(())
    }

    fn record_node_event(&self, node_name: &str, event_type: EventType, reason: &str, message: &str) {
        self.record(node_name.to_string(), event_type, reason, message);
    }

    fn record_pod_event(&self, pod: &Pod, event_type: EventType, reason: &str, message: &str) {
        self.record(pod.key(), event_type, reason, message);
    }
}
