//! Crops the nodes to delete to the parallelism budgets
//!
//! Atomic node groups are admitted whole or not at all. A single atomic bucket larger than the
//! remaining budget may still be admitted when nothing else was admitted before it, so large
//! groups are not starved by small ones.

use super::ActuationStatus;
use crate::cloudprovider::{CloudProvider, NodeGroup};
use crate::config::{AutoscalingOptions, NodeGroupConfigProcessor};
use crate::models::Node;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Nodes of one node group handled together
#[derive(Clone)]
pub struct NodeGroupView {
    pub group: Arc<dyn NodeGroup>,
    pub nodes: Vec<Node>,
}

impl fmt::Debug for NodeGroupView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGroupView")
            .field("group", &self.group.id())
            .field(
                "nodes",
                &self.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl NodeGroupView {
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }
}

pub struct BudgetProcessor {
    provider: Arc<dyn CloudProvider>,
    config: NodeGroupConfigProcessor,
    max_scale_down_parallelism: usize,
    max_drain_parallelism: usize,
}

impl BudgetProcessor {
    pub fn new(provider: Arc<dyn CloudProvider>, options: &AutoscalingOptions) -> Self {
        Self {
            provider,
            config: NodeGroupConfigProcessor::new(options.node_group_defaults()),
            max_scale_down_parallelism: options.max_scale_down_parallelism,
            max_drain_parallelism: options.max_drain_parallelism,
        }
    }

    /// Returns the (empty, drain) buckets that fit the budgets left by in-flight deletions
    pub fn crop_nodes(
        &self,
        status: &dyn ActuationStatus,
        empty: &[Node],
        drain: &[Node],
    ) -> (Vec<NodeGroupView>, Vec<NodeGroupView>) {
        let (empty_individual, empty_atomic) = self.categorize(self.group(empty));
        let (drain_individual, drain_atomic) = self.categorize(self.group(drain));

        let (empty_in_progress, drain_in_progress) = status.deletions_in_progress();
        let mut parallelism_budget = self
            .max_scale_down_parallelism
            .saturating_sub(empty_in_progress.len() + drain_in_progress.len());
        let mut drain_budget = self
            .max_drain_parallelism
            .saturating_sub(drain_in_progress.len());

        let mut empty_to_delete = Vec::new();
        let mut drain_to_delete = Vec::new();

        let (allowed, can_overflow) =
            crop_atomic(&mut empty_to_delete, empty_atomic, parallelism_budget, true);
        parallelism_budget = parallelism_budget.saturating_sub(allowed);
        drain_budget = drain_budget.min(parallelism_budget);

        let (allowed, _) = crop_atomic(&mut drain_to_delete, drain_atomic, drain_budget, can_overflow);
        parallelism_budget = parallelism_budget.saturating_sub(allowed);
        drain_budget = drain_budget.saturating_sub(allowed);

        let allowed = crop_individual(&mut empty_to_delete, empty_individual, parallelism_budget);
        parallelism_budget = parallelism_budget.saturating_sub(allowed);
        drain_budget = drain_budget.min(parallelism_budget);

        crop_individual(&mut drain_to_delete, drain_individual, drain_budget);

        debug!(
            empty = empty_to_delete.iter().map(|v| v.nodes.len()).sum::<usize>(),
            drain = drain_to_delete.iter().map(|v| v.nodes.len()).sum::<usize>(),
            "Cropped nodes to delete"
        );
        (empty_to_delete, drain_to_delete)
    }

    /// Buckets nodes by node group, keeping first-seen order
    fn group(&self, nodes: &[Node]) -> Vec<NodeGroupView> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut grouped: Vec<NodeGroupView> = Vec::new();
        for node in nodes {
            let group = match self.provider.node_group_for_node(node) {
                Ok(Some(group)) => group,
                Ok(None) => {
                    error!(node = %node.name, "Failed to find node group for node");
                    continue;
                }
                Err(e) => {
                    error!(node = %node.name, error = %e, "Failed to find node group for node");
                    continue;
                }
            };
            let id = group.id();
            match positions.get(&id) {
                Some(&i) => grouped[i].nodes.push(node.clone()),
                None => {
                    positions.insert(id, grouped.len());
                    grouped.push(NodeGroupView {
                        group,
                        nodes: vec![node.clone()],
                    });
                }
            }
        }
        grouped
    }

    /// Splits buckets into (individual, atomic)
    fn categorize(&self, views: Vec<NodeGroupView>) -> (Vec<NodeGroupView>, Vec<NodeGroupView>) {
        let mut individual = Vec::new();
        let mut atomic = Vec::new();
        for view in views {
            match self.config.is_atomic(view.group.as_ref()) {
                Ok(true) => atomic.push(view),
                Ok(false) => individual.push(view),
                Err(e) => {
                    error!(node_group = %view.group.id(), error = %e, "Failed to get autoscaling options");
                }
            }
        }
        (individual, atomic)
    }
}

fn crop_atomic(
    to_delete: &mut Vec<NodeGroupView>,
    views: Vec<NodeGroupView>,
    budget: usize,
    mut can_overflow: bool,
) -> (usize, bool) {
    let mut remaining = budget as i64;
    for view in views {
        let size = view.nodes.len() as i64;
        if remaining < size && (remaining <= 0 || !can_overflow) {
            break;
        }
        remaining -= size;
        to_delete.push(view);
        can_overflow = false;
    }
    let allowed = (budget as i64 - remaining).max(0) as usize;
    (allowed, can_overflow)
}

fn crop_individual(
    to_delete: &mut Vec<NodeGroupView>,
    views: Vec<NodeGroupView>,
    budget: usize,
) -> usize {
    let mut remaining = budget;
    for mut view in views {
        if remaining == 0 {
            break;
        }
        view.nodes.truncate(remaining);
        remaining -= view.nodes.len();
        to_delete.push(view);
    }
    budget - remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeGroupAutoscalingOptions;
    use crate::scaledown::ActuationSnapshot;
    use crate::testing::{TestCloudProvider, TestNodeGroup};

    fn nodes(prefix: &str, count: usize) -> Vec<Node> {
        (0..count).map(|i| Node::new(format!("{prefix}-{i}"))).collect()
    }

    fn processor(provider: Arc<TestCloudProvider>, parallelism: usize, drain: usize) -> BudgetProcessor {
        let options = AutoscalingOptions {
            max_scale_down_parallelism: parallelism,
            max_drain_parallelism: drain,
            ..Default::default()
        };
        BudgetProcessor::new(provider, &options)
    }

    fn add_group(provider: &TestCloudProvider, id: &str, members: &[Node], atomic: bool) {
        provider.add_node_group(TestNodeGroup::new(id, 0, 100, members.len()));
        for node in members {
            provider.add_node(id, node);
        }
        if atomic {
            provider.set_options(
                id,
                NodeGroupAutoscalingOptions {
                    zero_or_max_node_scaling: true,
                    ..Default::default()
                },
            );
        }
    }

    fn count(views: &[NodeGroupView]) -> usize {
        views.iter().map(|v| v.nodes.len()).sum()
    }

    #[test]
    fn test_empty_nodes_take_budget_before_drain() {
        let provider = Arc::new(TestCloudProvider::new());
        let empty = nodes("e", 8);
        let drain = nodes("d", 8);
        add_group(&provider, "g1", &empty, false);
        add_group(&provider, "g2", &drain, false);

        let (empty_out, drain_out) =
            processor(provider, 10, 5).crop_nodes(&ActuationSnapshot::default(), &empty, &drain);
        assert_eq!(count(&empty_out), 8);
        assert_eq!(drain_out[0].node_names(), vec!["d-0", "d-1"]);
    }

    #[test]
    fn test_in_flight_deletions_reduce_budget() {
        let provider = Arc::new(TestCloudProvider::new());
        let empty = nodes("e", 5);
        let drain = nodes("d", 5);
        add_group(&provider, "g1", &empty, false);
        add_group(&provider, "g2", &drain, false);
        let status = ActuationSnapshot {
            empty: vec!["x".into(), "y".into()],
            drained: vec!["z".into()],
            ..Default::default()
        };

        let (empty_out, drain_out) = processor(provider, 6, 2).crop_nodes(&status, &empty, &drain);
        assert_eq!(count(&empty_out), 3);
        assert!(drain_out.is_empty());
    }

    #[test]
    fn test_first_atomic_group_may_exceed_budget() {
        let provider = Arc::new(TestCloudProvider::new());
        let slice = nodes("a", 11);
        add_group(&provider, "slice", &slice, true);

        let (empty_out, drain_out) =
            processor(provider, 10, 5).crop_nodes(&ActuationSnapshot::default(), &slice, &[]);
        assert_eq!(empty_out.len(), 1);
        assert_eq!(count(&empty_out), 11);
        assert!(drain_out.is_empty());
    }

    #[test]
    fn test_only_one_oversize_atomic_group_sneaks_in() {
        let provider = Arc::new(TestCloudProvider::new());
        let first = nodes("a", 4);
        let second = nodes("b", 4);
        let drain_slice = nodes("c", 2);
        add_group(&provider, "first", &first, true);
        add_group(&provider, "second", &second, true);
        add_group(&provider, "third", &drain_slice, true);
        let empty: Vec<Node> = first.iter().chain(second.iter()).cloned().collect();

        let (empty_out, drain_out) =
            processor(provider, 6, 6).crop_nodes(&ActuationSnapshot::default(), &empty, &drain_slice);
        // first fits, second would overflow and overflow is only allowed for the first bucket
        assert_eq!(empty_out.len(), 1);
        assert_eq!(empty_out[0].group.id(), "first");
        assert_eq!(drain_out.len(), 1);
        assert_eq!(count(&drain_out), 2);
    }

    #[test]
    fn test_atomic_drain_cannot_overflow_after_empty_admission() {
        let provider = Arc::new(TestCloudProvider::new());
        let empty = nodes("e", 2);
        let slice = nodes("s", 5);
        add_group(&provider, "g1", &empty, true);
        add_group(&provider, "slice", &slice, true);

        let (empty_out, drain_out) =
            processor(provider, 4, 4).crop_nodes(&ActuationSnapshot::default(), &empty, &slice);
        assert_eq!(count(&empty_out), 2);
        assert!(drain_out.is_empty());
    }

    #[test]
    fn test_nodes_without_group_are_skipped() {
        let provider = Arc::new(TestCloudProvider::new());
        let (empty_out, _) = processor(provider, 10, 5).crop_nodes(
            &ActuationSnapshot::default(),
            &nodes("stray", 2),
            &[],
        );
        assert!(empty_out.is_empty());
    }
}
