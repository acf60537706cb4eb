//! Simulates removing a node by rescheduling its pods elsewhere

use super::hints::HintingSimulator;
use super::pdb::RemainingPdbTracker;
use super::predicates::PredicateChecker;
use super::snapshot::{ClusterSnapshot, NodeInfo};
use super::{BlockingPod, BlockingPodReason, NodeToBeRemoved, UnremovableNode, UnremovableReason};
use crate::models::{Node, Pod};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Exactly one of the two is produced per simulated node
#[derive(Debug, Clone, PartialEq)]
pub enum RemovalOutcome {
    Removable(NodeToBeRemoved),
    Unremovable(UnremovableNode),
}

/// Pods that have to go when a node is drained
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodsToMove {
    pub pods: Vec<Pod>,
    pub daemonset_pods: Vec<Pod>,
    /// All `pods` can be evicted at once under their disruption budgets
    pub in_parallel: bool,
}

/// Splits the pods of a node into pods to reschedule and daemonset pods. Mirror, static,
/// terminal and long-terminating pods need no action. Fails with the first pod whose
/// disruption budget is exhausted.
pub fn get_pods_to_move(
    info: &NodeInfo,
    now: DateTime<Utc>,
    pdbs: &RemainingPdbTracker,
) -> Result<PodsToMove, BlockingPod> {
    let mut result = PodsToMove::default();
    for pod in &info.pods {
        if pod.is_mirror() || pod.is_static() || pod.is_terminal() || pod.is_long_terminating(now) {
            continue;
        }
        if pod.is_daemonset() {
            result.daemonset_pods.push(pod.clone());
        } else {
            result.pods.push(pod.clone());
        }
    }

    let check = pdbs.can_remove_pods(&result.pods);
    if let Some(pod) = check.blocking_pod {
        return Err(BlockingPod {
            pod,
            reason: BlockingPodReason::NotEnoughPdb,
        });
    }
    result.in_parallel = check.in_parallel;
    Ok(result)
}

pub struct RemovalSimulator {
    hinting: HintingSimulator,
}

impl RemovalSimulator {
    pub fn new(checker: Arc<dyn PredicateChecker>) -> Self {
        Self {
            hinting: HintingSimulator::new(checker),
        }
    }

    /// Checks whether every pod of the node fits on one of `destinations`. On success the moves
    /// stay in the snapshot so later simulations see the capacity as taken.
    pub fn simulate_node_removal(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        node_name: &str,
        destinations: &HashSet<String>,
        now: DateTime<Utc>,
        pdbs: &RemainingPdbTracker,
    ) -> RemovalOutcome {
        let Some(info) = snapshot.get(node_name).cloned() else {
            warn!(node = %node_name, "Node not found in cluster snapshot");
            return RemovalOutcome::Unremovable(UnremovableNode::new(
                Node::new(node_name),
                UnremovableReason::UnexpectedError,
            ));
        };

        let to_move = match get_pods_to_move(&info, now, pdbs) {
            Ok(to_move) => to_move,
            Err(blocking) => {
                debug!(node = %node_name, pod = %blocking.pod.key(), "Node blocked by disruption budget");
                return RemovalOutcome::Unremovable(UnremovableNode {
                    node: info.node,
                    reason: UnremovableReason::BlockedByPdb,
                    blocking_pod: Some(blocking),
                });
            }
        };

        match self.find_place_for(snapshot, node_name, &to_move.pods, destinations) {
            Ok(()) => RemovalOutcome::Removable(NodeToBeRemoved {
                node: info.node,
                pods_to_reschedule: to_move.pods,
                daemonset_pods: to_move.daemonset_pods,
                is_risky: !to_move.in_parallel,
            }),
            Err(pod) => {
                debug!(node = %node_name, "No place to move pods");
                RemovalOutcome::Unremovable(UnremovableNode {
                    node: info.node,
                    reason: UnremovableReason::NoPlaceToMovePods,
                    blocking_pod: pod.map(|pod| BlockingPod {
                        pod,
                        reason: BlockingPodReason::NoPlaceToMove,
                    }),
                })
            }
        }
    }

    /// Candidates without pods to reschedule, in input order
    pub fn find_empty_nodes_to_remove(
        &self,
        snapshot: &ClusterSnapshot,
        candidates: &[String],
        now: DateTime<Utc>,
    ) -> Vec<NodeToBeRemoved> {
        let no_budgets = RemainingPdbTracker::default();
        candidates
            .iter()
            .filter_map(|name| snapshot.get(name))
            .filter_map(|info| {
                let to_move = get_pods_to_move(info, now, &no_budgets).ok()?;
                to_move.pods.is_empty().then(|| NodeToBeRemoved {
                    node: info.node.clone(),
                    pods_to_reschedule: Vec::new(),
                    daemonset_pods: to_move.daemonset_pods,
                    is_risky: false,
                })
            })
            .collect()
    }

    pub fn drop_old_hints(&mut self) {
        self.hinting.drop_old_hints();
    }

    fn find_place_for(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        removed: &str,
        pods: &[Pod],
        destinations: &HashSet<String>,
    ) -> Result<(), Option<Pod>> {
        snapshot.fork();
        match self.place(snapshot, removed, pods, destinations) {
            Ok(()) => {
                if let Err(e) = snapshot.commit() {
                    error!(error = %e, "Failed to commit simulated pod moves");
                }
                Ok(())
            }
            Err(pod) => {
                snapshot.revert();
                Err(pod)
            }
        }
    }

    fn place(
        &mut self,
        snapshot: &mut ClusterSnapshot,
        removed: &str,
        pods: &[Pod],
        destinations: &HashSet<String>,
    ) -> Result<(), Option<Pod>> {
        for pod in pods {
            snapshot
                .remove_pod(&pod.namespace, &pod.name, removed)
                .map_err(|e| {
                    warn!(error = %e, "Simulated removal failed");
                    None
                })?;
        }

        let is_acceptable =
            |info: &NodeInfo| info.name() != removed && destinations.contains(info.name());
        let scheduled = self
            .hinting
            .try_schedule_pods(snapshot, pods, &is_acceptable, true)
            .map_err(|e| {
                warn!(error = %e, "Simulated scheduling failed");
                None
            })?;

        if scheduled.len() < pods.len() {
            return Err(pods.get(scheduled.len()).cloned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        OwnerReference, PodDisruptionBudget, PodPhase, ResourceList, MIRROR_POD_ANNOTATION,
    };
    use crate::simulator::predicates::ResourceFitChecker;
    use std::collections::BTreeMap;

    fn node(name: &str, cpu: i64) -> Node {
        let mut node = Node::new(name);
        node.allocatable = ResourceList::new().with("cpu", cpu).with("memory", 8 << 30);
        node
    }

    fn pod(name: &str, cpu: i64) -> Pod {
        let mut pod = Pod::new("default", name);
        pod.uid = format!("uid-{name}");
        pod.requests = ResourceList::new().with("cpu", cpu);
        pod.owner = Some(OwnerReference::new("ReplicaSet", "web", "rs-1"));
        pod
    }

    fn ds_pod(name: &str) -> Pod {
        let mut pod = Pod::new("kube-system", name);
        pod.owner = Some(OwnerReference::new("DaemonSet", "proxy", "ds-1"));
        pod
    }

    fn destinations(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_pods_to_move_classifies_pods() {
        let mut mirror = pod("mirror", 100);
        mirror.annotations.insert(MIRROR_POD_ANNOTATION.into(), "x".into());
        let mut done = pod("done", 100);
        done.phase = PodPhase::Succeeded;
        let info = NodeInfo::new(
            node("n1", 1000),
            vec![pod("web-1", 100), ds_pod("proxy"), mirror, done],
        );

        let to_move = get_pods_to_move(&info, Utc::now(), &RemainingPdbTracker::default()).unwrap();
        assert_eq!(to_move.pods.len(), 1);
        assert_eq!(to_move.pods[0].name, "web-1");
        assert_eq!(to_move.daemonset_pods.len(), 1);
        assert!(to_move.in_parallel);
    }

    #[test]
    fn test_removable_node_commits_moves() {
        let mut snapshot = ClusterSnapshot::from_node_infos(vec![
            NodeInfo::new(node("n1", 1000), vec![pod("a", 600)]),
            NodeInfo::new(node("n2", 1000), vec![pod("b", 600)]),
            NodeInfo::new(node("n3", 1000), vec![]),
        ]);
        let mut sim = RemovalSimulator::new(Arc::new(ResourceFitChecker));
        let pdbs = RemainingPdbTracker::default();
        let now = Utc::now();

        let first = sim.simulate_node_removal(
            &mut snapshot,
            "n1",
            &destinations(&["n2", "n3"]),
            now,
            &pdbs,
        );
        let RemovalOutcome::Removable(removed) = first else {
            panic!("n1 should be removable");
        };
        assert_eq!(removed.pods_to_reschedule.len(), 1);
        assert_eq!(snapshot.get("n3").unwrap().pods.len(), 1);

        // n3 capacity is now taken, n2 cannot be drained onto it
        let second = sim.simulate_node_removal(
            &mut snapshot,
            "n2",
            &destinations(&["n3"]),
            now,
            &pdbs,
        );
        let RemovalOutcome::Unremovable(unremovable) = second else {
            panic!("n2 should not be removable");
        };
        assert_eq!(unremovable.reason, UnremovableReason::NoPlaceToMovePods);
        assert_eq!(unremovable.blocking_pod.unwrap().pod.name, "b");
        assert_eq!(snapshot.get("n2").unwrap().pods.len(), 1);
    }

    #[test]
    fn test_disruption_budget_blocks_node() {
        let mut snapshot = ClusterSnapshot::from_node_infos(vec![
            NodeInfo::new(node("n1", 1000), vec![pod("a", 100)]),
            NodeInfo::new(node("n2", 1000), vec![]),
        ]);
        let mut labelled = snapshot.get("n1").unwrap().clone();
        labelled.pods[0].labels.insert("app".into(), "web".into());
        snapshot.remove_node("n1").unwrap();
        snapshot.add_node_info(labelled).unwrap();

        let pdbs = RemainingPdbTracker::new(vec![PodDisruptionBudget {
            namespace: "default".into(),
            name: "web".into(),
            selector: BTreeMap::from([("app".to_string(), "web".to_string())]),
            disruptions_allowed: 0,
        }]);
        let mut sim = RemovalSimulator::new(Arc::new(ResourceFitChecker));
        let outcome =
            sim.simulate_node_removal(&mut snapshot, "n1", &destinations(&["n2"]), Utc::now(), &pdbs);
        let RemovalOutcome::Unremovable(unremovable) = outcome else {
            panic!("budget should block");
        };
        assert_eq!(unremovable.reason, UnremovableReason::BlockedByPdb);
    }

    #[test]
    fn test_find_empty_nodes() {
        let snapshot = ClusterSnapshot::from_node_infos(vec![
            NodeInfo::new(node("n1", 1000), vec![ds_pod("proxy")]),
            NodeInfo::new(node("n2", 1000), vec![pod("a", 100)]),
            NodeInfo::new(node("n3", 1000), vec![]),
        ]);
        let sim = RemovalSimulator::new(Arc::new(ResourceFitChecker));
        let empty = sim.find_empty_nodes_to_remove(
            &snapshot,
            &["n3".to_string(), "n2".to_string(), "n1".to_string(), "gone".to_string()],
            Utc::now(),
        );
        let names: Vec<_> = empty.iter().map(|n| n.node.name.as_str()).collect();
        assert_eq!(names, vec!["n3", "n1"]);
        assert_eq!(empty[1].daemonset_pods.len(), 1);
    }
}
