//! Short-term memory of nodes that could not be removed

use crate::models::Node;
use crate::simulator::{UnremovableNode, UnremovableReason};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::info;

/// Reasons live for one planner iteration; entries added with a timeout also make the node
/// "recently unremovable" until the timeout passes.
#[derive(Debug, Default)]
pub struct UnremovableNodes {
    ttls: HashMap<String, DateTime<Utc>>,
    reasons: HashMap<String, UnremovableNode>,
}

impl UnremovableNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new iteration: forgets reasons and expires entries that timed out or whose
    /// node is gone from the cluster
    pub fn update(&mut self, is_visible: impl Fn(&str) -> bool, now: DateTime<Utc>) {
        self.reasons.clear();
        self.ttls.retain(|name, until| {
            if !is_visible(name) {
                info!(node = %name, "Unremovable node no longer in the cluster");
                return false;
            }
            *until >= now
        });
    }

    pub fn add(&mut self, node: UnremovableNode) {
        self.reasons.insert(node.node.name.clone(), node);
    }

    pub fn add_reason(&mut self, node: &Node, reason: UnremovableReason) {
        self.add(UnremovableNode::new(node.clone(), reason));
    }

    pub fn add_with_timeout(&mut self, node: UnremovableNode, until: DateTime<Utc>) {
        self.ttls.insert(node.node.name.clone(), until);
        self.add(node);
    }

    pub fn is_recent(&self, name: &str) -> bool {
        self.ttls.contains_key(name)
    }

    pub fn has_reason(&self, name: &str) -> bool {
        self.reasons.contains_key(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.has_reason(name) || self.is_recent(name)
    }

    pub fn get(&self, name: &str) -> Option<&UnremovableNode> {
        self.reasons.get(name)
    }

    /// Sorted by node name
    pub fn as_list(&self) -> Vec<UnremovableNode> {
        let mut list: Vec<_> = self.reasons.values().cloned().collect();
        list.sort_by(|a, b| a.node.name.cmp(&b.node.name));
        list
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }
}
