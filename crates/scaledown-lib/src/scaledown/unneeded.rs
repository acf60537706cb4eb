//! Time-indexed set of nodes believed unneeded

use super::resource_limits::{ResourceLimitsFinder, ResourcesLimits};
use super::ActuationStatus;
use crate::cloudprovider::CloudProvider;
use crate::config::NodeGroupConfigProcessor;
use crate::models::Node;
use crate::simulator::{NodeToBeRemoved, UnremovableNode, UnremovableReason};
use crate::taints::{deletion_candidate_time, has_deletion_candidate_taint};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct UnneededEntry {
    pub node: NodeToBeRemoved,
    /// First time the node was found unneeded in an unbroken run of iterations
    pub since: DateTime<Utc>,
}

/// Result of `removable_at`
#[derive(Debug, Clone, Default)]
pub struct RemovableAt {
    pub empty: Vec<NodeToBeRemoved>,
    pub drain: Vec<NodeToBeRemoved>,
    pub unremovable: Vec<UnremovableNode>,
}

pub struct UnneededNodes {
    provider: Arc<dyn CloudProvider>,
    config: NodeGroupConfigProcessor,
    limits_finder: ResourceLimitsFinder,
    entries: Vec<UnneededEntry>,
    index: HashMap<String, usize>,
}

impl UnneededNodes {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        config: NodeGroupConfigProcessor,
        limits_finder: ResourceLimitsFinder,
    ) -> Self {
        Self {
            provider,
            config,
            limits_finder,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Replaces the set, keeping `since` for nodes that were already unneeded
    pub fn update(&mut self, removables: Vec<NodeToBeRemoved>, now: DateTime<Utc>) {
        let mut entries = Vec::with_capacity(removables.len());
        let mut index = HashMap::with_capacity(removables.len());
        for node in removables {
            let name = node.node.name.clone();
            if index.contains_key(&name) {
                continue;
            }
            let since = self.since(&name).unwrap_or(now);
            index.insert(name, entries.len());
            entries.push(UnneededEntry { node, since });
        }
        self.entries = entries;
        self.index = index;
    }

    /// Seeds the set from deletion-candidate taints younger than `ttl`, using the taint time as
    /// `since`. Nodes already in the set are left alone.
    pub fn load_from_existing_taints<'a>(
        &mut self,
        nodes: impl IntoIterator<Item = &'a Node>,
        now: DateTime<Utc>,
        ttl: std::time::Duration,
    ) {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero());
        for node in nodes {
            if !has_deletion_candidate_taint(node) || self.contains(&node.name) {
                continue;
            }
            let Some(tainted_at) = deletion_candidate_time(node) else {
                continue;
            };
            if now - tainted_at > ttl {
                continue;
            }
            debug!(node = %node.name, since = %tainted_at, "Restored unneeded node from taint");
            self.index.insert(node.name.clone(), self.entries.len());
            self.entries.push(UnneededEntry {
                node: NodeToBeRemoved::empty(node.clone()),
                since: tainted_at,
            });
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn since(&self, name: &str) -> Option<DateTime<Utc>> {
        self.index.get(name).map(|&i| self.entries[i].since)
    }

    pub fn drop(&mut self, name: &str) {
        if self.index.remove(name).is_some() {
            self.entries.retain(|e| e.node.node.name != name);
            self.reindex();
        }
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.node.node.name.clone(), i))
            .collect();
    }

    pub fn as_list(&self) -> Vec<Node> {
        self.entries.iter().map(|e| e.node.node.clone()).collect()
    }

    pub fn entries(&self) -> &[UnneededEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Splits the set into nodes that can be deleted right now and nodes that cannot.
    /// Empty nodes are considered first. `limits_left` is consumed by each accepted node.
    pub fn removable_at(
        &self,
        now: DateTime<Utc>,
        limits_left: &mut ResourcesLimits,
        tracked_resources: &[String],
        status: &dyn ActuationStatus,
    ) -> RemovableAt {
        let mut result = RemovableAt::default();
        let mut group_sizes: HashMap<String, usize> = HashMap::new();

        let empty_first = self
            .entries
            .iter()
            .filter(|e| e.node.pods_to_reschedule.is_empty())
            .chain(
                self.entries
                    .iter()
                    .filter(|e| !e.node.pods_to_reschedule.is_empty()),
            );

        for entry in empty_first {
            let reason = self.unremovable_reason(
                entry,
                now,
                limits_left,
                tracked_resources,
                status,
                &mut group_sizes,
            );
            match reason {
                UnremovableReason::NoReason if entry.node.pods_to_reschedule.is_empty() => {
                    result.empty.push(entry.node.clone())
                }
                UnremovableReason::NoReason => result.drain.push(entry.node.clone()),
                reason => {
                    debug!(node = %entry.node.node.name, %reason, "Unneeded node not removable yet");
                    result
                        .unremovable
                        .push(UnremovableNode::new(entry.node.node.clone(), reason));
                }
            }
        }
        result
    }

    fn unremovable_reason(
        &self,
        entry: &UnneededEntry,
        now: DateTime<Utc>,
        limits_left: &mut ResourcesLimits,
        tracked_resources: &[String],
        status: &dyn ActuationStatus,
        group_sizes: &mut HashMap<String, usize>,
    ) -> UnremovableReason {
        let node = &entry.node.node;

        if node.has_scale_down_disabled_annotation() {
            return UnremovableReason::ScaleDownDisabledAnnotation;
        }

        let group = match self.provider.node_group_for_node(node) {
            Ok(Some(group)) => group,
            Ok(None) => return UnremovableReason::NotAutoscaled,
            Err(e) => {
                warn!(node = %node.name, error = %e, "Failed to get node group");
                return UnremovableReason::UnexpectedError;
            }
        };

        let (required, too_early) = if node.ready {
            (
                self.config.scale_down_unneeded_time(group.as_ref()),
                UnremovableReason::NotUnneededLongEnough,
            )
        } else {
            (
                self.config.scale_down_unready_time(group.as_ref()),
                UnremovableReason::NotUnreadyLongEnough,
            )
        };
        let required = match required {
            Ok(required) => ChronoDuration::from_std(required).unwrap_or_else(|_| ChronoDuration::zero()),
            Err(e) => {
                warn!(node = %node.name, error = %e, "Failed to get node group options");
                return UnremovableReason::UnexpectedError;
            }
        };
        if entry.since + required > now {
            return too_early;
        }

        let group_id = group.id();
        let size = match group_sizes.get(&group_id) {
            Some(size) => *size,
            None => match group.target_size() {
                Ok(size) => size,
                Err(e) => {
                    warn!(node_group = %group_id, error = %e, "Failed to get node group size");
                    return UnremovableReason::UnexpectedError;
                }
            },
        };
        let in_flight = status.deletions_count(&group_id);
        if size.saturating_sub(in_flight) <= group.min_size() {
            return UnremovableReason::NodeGroupMinSizeReached;
        }

        let delta = self.limits_finder.delta_for_node(node, tracked_resources);
        if let Err(exceeded) = limits_left.try_decrement_by(&delta) {
            debug!(node = %node.name, ?exceeded, "Removing node would cross resource floor");
            return UnremovableReason::MinimalResourceLimitExceeded;
        }

        group_sizes.insert(group_id, size.saturating_sub(1));
        UnremovableReason::NoReason
    }
}
