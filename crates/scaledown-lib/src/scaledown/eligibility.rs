//! First-pass filter over scale-down candidates

use super::unremovable::UnremovableNodes;
use crate::cloudprovider::CloudProvider;
use crate::config::{AutoscalingOptions, NodeGroupConfigProcessor};
use crate::models::Node;
use crate::simulator::{
    calculate_utilization, is_gpu_node, ClusterSnapshot, NodeInfo, UnremovableNode,
    UnremovableReason, UtilizationInfo, UtilizationOptions,
};
use crate::taints::{has_to_be_deleted_taint, to_be_deleted_time};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct EligibilityOutcome {
    /// Candidates worth simulating, in input order
    pub eligible: Vec<String>,
    pub utilization: HashMap<String, UtilizationInfo>,
    pub ineligible: Vec<UnremovableNode>,
}

pub struct EligibilityChecker {
    provider: Arc<dyn CloudProvider>,
    config: NodeGroupConfigProcessor,
    ignore_mirror_pods_utilization: bool,
    scale_down_unready_enabled: bool,
    being_deleted_window: ChronoDuration,
}

impl EligibilityChecker {
    pub fn new(provider: Arc<dyn CloudProvider>, options: &AutoscalingOptions) -> Self {
        let graceful = std::time::Duration::from_secs(options.max_graceful_termination_sec.max(0) as u64)
            + options.pod_eviction_headroom;
        let window = options.max_cloud_provider_node_deletion_time.max(graceful);
        Self {
            provider,
            config: NodeGroupConfigProcessor::new(options.node_group_defaults()),
            ignore_mirror_pods_utilization: options.ignore_mirror_pods_utilization,
            scale_down_unready_enabled: options.scale_down_unready_enabled,
            being_deleted_window: ChronoDuration::from_std(window)
                .unwrap_or_else(|_| ChronoDuration::minutes(10)),
        }
    }

    pub fn filter_out_unremovable(
        &self,
        snapshot: &ClusterSnapshot,
        candidates: &[String],
        now: DateTime<Utc>,
        unremovable: &UnremovableNodes,
    ) -> EligibilityOutcome {
        let mut outcome = EligibilityOutcome::default();
        for name in candidates {
            let Some(info) = snapshot.get(name) else {
                warn!(node = %name, "Scale-down candidate missing from cluster snapshot");
                outcome.ineligible.push(UnremovableNode::new(
                    Node::new(name.as_str()),
                    UnremovableReason::UnexpectedError,
                ));
                continue;
            };
            let (reason, utilization) = self.unremovable_reason(info, now, unremovable);
            if let Some(utilization) = utilization {
                outcome.utilization.insert(name.clone(), utilization);
            }
            match reason {
                UnremovableReason::NoReason => outcome.eligible.push(name.clone()),
                reason => outcome
                    .ineligible
                    .push(UnremovableNode::new(info.node.clone(), reason)),
            }
        }
        debug!(
            eligible = outcome.eligible.len(),
            ineligible = outcome.ineligible.len(),
            "Filtered scale-down candidates"
        );
        outcome
    }

    fn unremovable_reason(
        &self,
        info: &NodeInfo,
        now: DateTime<Utc>,
        unremovable: &UnremovableNodes,
    ) -> (UnremovableReason, Option<UtilizationInfo>) {
        let node = &info.node;

        if unremovable.is_recent(&node.name) {
            return (UnremovableReason::RecentlyUnremovable, None);
        }

        if self.is_being_deleted(node, now) {
            debug!(node = %node.name, "Node is currently being deleted");
            return (UnremovableReason::CurrentlyBeingDeleted, None);
        }

        if node.has_scale_down_disabled_annotation() {
            debug!(node = %node.name, "Scale down disabled by annotation");
            return (UnremovableReason::ScaleDownDisabledAnnotation, None);
        }

        let group = match self.provider.node_group_for_node(node) {
            Ok(Some(group)) => group,
            Ok(None) => return (UnremovableReason::NotAutoscaled, None),
            Err(e) => {
                warn!(node = %node.name, error = %e, "Failed to get node group");
                return (UnremovableReason::UnexpectedError, None);
            }
        };
        let group_options = match self.config.options_for(group.as_ref()) {
            Ok(options) => options,
            Err(e) => {
                warn!(node = %node.name, error = %e, "Failed to get node group options");
                return (UnremovableReason::UnexpectedError, None);
            }
        };

        let options = UtilizationOptions {
            skip_daemonset_pods: group_options.ignore_daemonsets_utilization,
            skip_mirror_pods: self.ignore_mirror_pods_utilization,
        };
        let gpu_label = self.provider.gpu_label();
        let utilization = match calculate_utilization(info, options, gpu_label, now) {
            Ok(utilization) => utilization,
            Err(e) => {
                warn!(node = %node.name, error = %e, "Failed to calculate utilization");
                return (UnremovableReason::UnexpectedError, None);
            }
        };

        if !node.ready && !self.scale_down_unready_enabled {
            return (UnremovableReason::ScaleDownUnreadyDisabled, Some(utilization));
        }

        let threshold = if is_gpu_node(node, gpu_label) {
            group_options.scale_down_gpu_utilization_threshold
        } else {
            group_options.scale_down_utilization_threshold
        };
        if utilization.utilization >= threshold {
            debug!(
                node = %node.name,
                utilization = utilization.utilization,
                threshold,
                "Node is not underutilized"
            );
            return (UnremovableReason::NotUnderutilized, Some(utilization));
        }
        (UnremovableReason::NoReason, Some(utilization))
    }

    /// A to-be-deleted taint older than the deletion window is considered stale
    fn is_being_deleted(&self, node: &Node, now: DateTime<Utc>) -> bool {
        if !has_to_be_deleted_taint(node) {
            return false;
        }
        match to_be_deleted_time(node) {
            Some(since) => now - since < self.being_deleted_window,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeGroupAutoscalingOptions;
    use crate::models::{Pod, ResourceList, SCALE_DOWN_DISABLED_ANNOTATION};
    use crate::taints::to_be_deleted_taint;
    use crate::testing::{TestCloudProvider, TestNodeGroup};

    fn node(name: &str) -> Node {
        let mut node = Node::new(name);
        node.provider_id = format!("test://{name}");
        node.allocatable = ResourceList::new().with("cpu", 1000).with("memory", 1000);
        node
    }

    fn pod(name: &str, cpu: i64) -> Pod {
        let mut pod = Pod::new("default", name);
        pod.requests = ResourceList::new().with("cpu", cpu).with("memory", cpu);
        pod
    }

    fn setup(nodes: Vec<NodeInfo>) -> (Arc<TestCloudProvider>, ClusterSnapshot) {
        let provider = Arc::new(TestCloudProvider::new());
        let group = TestNodeGroup::new("g1", 0, 10, nodes.len());
        provider.add_node_group(group);
        for info in &nodes {
            if info.node.name != "orphan" {
                provider.add_node("g1", &info.node);
            }
        }
        (provider, ClusterSnapshot::from_node_infos(nodes))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_reasons_in_order() {
        let now = Utc::now();
        let mut disabled = node("disabled");
        disabled
            .annotations
            .insert(SCALE_DOWN_DISABLED_ANNOTATION.into(), "true".into());
        let mut deleting = node("deleting");
        deleting.taints.push(to_be_deleted_taint(now));
        let mut unready = node("unready");
        unready.ready = false;

        let (provider, snapshot) = setup(vec![
            NodeInfo::new(node("idle"), vec![pod("a", 100)]),
            NodeInfo::new(node("busy"), vec![pod("b", 900)]),
            NodeInfo::new(disabled, vec![]),
            NodeInfo::new(deleting, vec![]),
            NodeInfo::new(node("recent"), vec![]),
            NodeInfo::new(node("orphan"), vec![]),
            NodeInfo::new(unready, vec![]),
        ]);
        let options = AutoscalingOptions {
            scale_down_unready_enabled: false,
            ..Default::default()
        };
        let checker = EligibilityChecker::new(provider, &options);
        let mut unremovable = UnremovableNodes::new();
        unremovable.add_with_timeout(
            UnremovableNode::new(Node::new("recent"), UnremovableReason::NoPlaceToMovePods),
            now + ChronoDuration::minutes(5),
        );

        let outcome = checker.filter_out_unremovable(
            &snapshot,
            &names(&["idle", "busy", "disabled", "deleting", "recent", "orphan", "unready"]),
            now,
            &unremovable,
        );

        assert_eq!(outcome.eligible, names(&["idle"]));
        let reasons: HashMap<_, _> = outcome
            .ineligible
            .iter()
            .map(|n| (n.node.name.as_str(), n.reason))
            .collect();
        assert_eq!(reasons["busy"], UnremovableReason::NotUnderutilized);
        assert_eq!(reasons["disabled"], UnremovableReason::ScaleDownDisabledAnnotation);
        assert_eq!(reasons["deleting"], UnremovableReason::CurrentlyBeingDeleted);
        assert_eq!(reasons["recent"], UnremovableReason::RecentlyUnremovable);
        assert_eq!(reasons["orphan"], UnremovableReason::NotAutoscaled);
        assert_eq!(reasons["unready"], UnremovableReason::ScaleDownUnreadyDisabled);

        assert!(outcome.utilization.contains_key("idle"));
        assert!(outcome.utilization.contains_key("busy"));
        assert!(!outcome.utilization.contains_key("disabled"));
    }

    #[test]
    fn test_stale_to_be_deleted_taint_is_ignored() {
        let now = Utc::now();
        let mut stale = node("stale");
        stale
            .taints
            .push(to_be_deleted_taint(now - ChronoDuration::hours(2)));
        let (provider, snapshot) = setup(vec![NodeInfo::new(stale, vec![])]);
        let checker = EligibilityChecker::new(provider, &AutoscalingOptions::default());

        let outcome =
            checker.filter_out_unremovable(&snapshot, &names(&["stale"]), now, &UnremovableNodes::new());
        assert_eq!(outcome.eligible, names(&["stale"]));
    }

    #[test]
    fn test_group_threshold_override_wins() {
        let now = Utc::now();
        let (provider, snapshot) = setup(vec![NodeInfo::new(node("n1"), vec![pod("a", 700)])]);
        provider.set_options(
            "g1",
            NodeGroupAutoscalingOptions {
                scale_down_utilization_threshold: 0.8,
                ..Default::default()
            },
        );
        let checker = EligibilityChecker::new(provider, &AutoscalingOptions::default());

        let outcome =
            checker.filter_out_unremovable(&snapshot, &names(&["n1"]), now, &UnremovableNodes::new());
        assert_eq!(outcome.eligible, names(&["n1"]));
    }
}
