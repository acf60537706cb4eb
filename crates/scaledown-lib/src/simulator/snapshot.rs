//! In-memory cluster view used for scheduling simulations
//!
//! The snapshot is a stack of layers. `fork` pushes a copy of the current layer, `commit` folds it
//! into the one below and `revert` discards it, so a simulation can always be undone.

use crate::models::{Node, Pod, ResourceList};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("node {0} not found in cluster snapshot")]
    NodeNotFound(String),

    #[error("node {0} already exists in cluster snapshot")]
    NodeAlreadyExists(String),

    #[error("pod {pod} not found on node {node} in cluster snapshot")]
    PodNotFound { pod: String, node: String },

    #[error("cluster snapshot is not forked")]
    NotForked,
}

/// A node together with the pods bound to it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub node: Node,
    pub pods: Vec<Pod>,
}

impl NodeInfo {
    pub fn new(node: Node, pods: Vec<Pod>) -> Self {
        Self { node, pods }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Summed requests of the non-terminal pods on the node
    pub fn requested(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for pod in self.pods.iter().filter(|p| !p.is_terminal()) {
            total.add(&pod.requests);
        }
        total
    }

    pub fn pod_count(&self) -> usize {
        self.pods.iter().filter(|p| !p.is_terminal()).count()
    }
}

type Layer = BTreeMap<String, NodeInfo>;

#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    layers: Vec<Layer>,
}

impl Default for ClusterSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterSnapshot {
    pub fn new() -> Self {
        Self {
            layers: vec![Layer::new()],
        }
    }

    /// Builds a snapshot from node infos, binding every pod to its node
    pub fn from_node_infos(infos: impl IntoIterator<Item = NodeInfo>) -> Self {
        let mut snapshot = Self::new();
        for mut info in infos {
            for pod in &mut info.pods {
                pod.node_name = Some(info.node.name.clone());
            }
            snapshot.current_mut().insert(info.node.name.clone(), info);
        }
        snapshot
    }

    fn current(&self) -> &Layer {
        // the base layer is never popped
        &self.layers[self.layers.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Layer {
        let top = self.layers.len() - 1;
        &mut self.layers[top]
    }

    pub fn fork(&mut self) {
        let copy = self.current().clone();
        self.layers.push(copy);
    }

    /// Folds the top layer into the one below
    pub fn commit(&mut self) -> Result<(), SnapshotError> {
        if self.layers.len() < 2 {
            return Err(SnapshotError::NotForked);
        }
        if let Some(top) = self.layers.pop() {
            *self.current_mut() = top;
        }
        Ok(())
    }

    /// Discards the top layer. Reverting an unforked snapshot is a no-op.
    pub fn revert(&mut self) {
        if self.layers.len() > 1 {
            self.layers.pop();
        }
    }

    pub fn fork_depth(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), SnapshotError> {
        self.add_node_info(NodeInfo::new(node, Vec::new()))
    }

    pub fn add_node_info(&mut self, mut info: NodeInfo) -> Result<(), SnapshotError> {
        if self.current().contains_key(&info.node.name) {
            return Err(SnapshotError::NodeAlreadyExists(info.node.name));
        }
        for pod in &mut info.pods {
            pod.node_name = Some(info.node.name.clone());
        }
        self.current_mut().insert(info.node.name.clone(), info);
        Ok(())
    }

    pub fn remove_node(&mut self, name: &str) -> Result<NodeInfo, SnapshotError> {
        self.current_mut()
            .remove(name)
            .ok_or_else(|| SnapshotError::NodeNotFound(name.to_string()))
    }

    /// Binds the pod to the node
    pub fn add_pod(&mut self, mut pod: Pod, node_name: &str) -> Result<(), SnapshotError> {
        let info = self
            .current_mut()
            .get_mut(node_name)
            .ok_or_else(|| SnapshotError::NodeNotFound(node_name.to_string()))?;
        pod.node_name = Some(node_name.to_string());
        info.pods.push(pod);
        Ok(())
    }

    pub fn remove_pod(
        &mut self,
        namespace: &str,
        name: &str,
        node_name: &str,
    ) -> Result<Pod, SnapshotError> {
        let info = self
            .current_mut()
            .get_mut(node_name)
            .ok_or_else(|| SnapshotError::NodeNotFound(node_name.to_string()))?;
        let position = info
            .pods
            .iter()
            .position(|p| p.namespace == namespace && p.name == name)
            .ok_or_else(|| SnapshotError::PodNotFound {
                pod: format!("{namespace}/{name}"),
                node: node_name.to_string(),
            })?;
        Ok(info.pods.remove(position))
    }

    pub fn get(&self, name: &str) -> Option<&NodeInfo> {
        self.current().get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.current().contains_key(name)
    }

    /// Node infos in name order
    pub fn node_infos(&self) -> impl Iterator<Item = &NodeInfo> {
        self.current().values()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.current().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ClusterSnapshot {
        let mut pod = Pod::new("default", "web-1");
        pod.requests = ResourceList::new().with("cpu", 500);
        ClusterSnapshot::from_node_infos(vec![
            NodeInfo::new(Node::new("n1"), vec![pod]),
            NodeInfo::new(Node::new("n2"), vec![]),
        ])
    }

    #[test]
    fn test_from_node_infos_binds_pods() {
        let snapshot = snapshot();
        let info = snapshot.get("n1").unwrap();
        assert_eq!(info.pods[0].node_name.as_deref(), Some("n1"));
        assert_eq!(info.requested().cpu_millis(), 500);
        assert_eq!(snapshot.node_names(), vec!["n1", "n2"]);
    }

    #[test]
    fn test_revert_discards_changes() {
        let mut snapshot = snapshot();
        snapshot.fork();
        let pod = snapshot.remove_pod("default", "web-1", "n1").unwrap();
        snapshot.add_pod(pod, "n2").unwrap();
        snapshot.remove_node("n1").unwrap();
        assert_eq!(snapshot.len(), 1);

        snapshot.revert();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("n1").unwrap().pods.len(), 1);
        assert!(snapshot.get("n2").unwrap().pods.is_empty());
    }

    #[test]
    fn test_nested_commit_keeps_changes_in_parent_fork() {
        let mut snapshot = snapshot();
        snapshot.fork();
        snapshot.fork();
        let pod = snapshot.remove_pod("default", "web-1", "n1").unwrap();
        snapshot.add_pod(pod, "n2").unwrap();
        snapshot.commit().unwrap();
        assert_eq!(snapshot.fork_depth(), 1);
        assert_eq!(snapshot.get("n2").unwrap().pods.len(), 1);

        snapshot.revert();
        assert_eq!(snapshot.get("n1").unwrap().pods.len(), 1);
        assert_eq!(snapshot.commit(), Err(SnapshotError::NotForked));
    }

    #[test]
    fn test_missing_entities() {
        let mut snapshot = snapshot();
        assert_eq!(
            snapshot.add_pod(Pod::new("default", "x"), "nope"),
            Err(SnapshotError::NodeNotFound("nope".into()))
        );
        assert!(matches!(
            snapshot.remove_pod("default", "x", "n1"),
            Err(SnapshotError::PodNotFound { .. })
        ));
        assert_eq!(
            snapshot.add_node(Node::new("n1")),
            Err(SnapshotError::NodeAlreadyExists("n1".into()))
        );
    }
}
