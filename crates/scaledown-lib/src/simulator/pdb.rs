//! Disruption budget slack remaining within one planner iteration

use crate::models::{Pod, PodDisruptionBudget};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbCheck {
    pub can_remove: bool,
    /// All pods can be evicted at once without exhausting any budget
    pub in_parallel: bool,
    pub blocking_pod: Option<Pod>,
}

#[derive(Debug, Clone, Default)]
pub struct RemainingPdbTracker {
    budgets: Vec<(PodDisruptionBudget, i32)>,
}

impl RemainingPdbTracker {
    pub fn new(pdbs: Vec<PodDisruptionBudget>) -> Self {
        let mut tracker = Self::default();
        tracker.set_pdbs(pdbs);
        tracker
    }

    pub fn set_pdbs(&mut self, pdbs: Vec<PodDisruptionBudget>) {
        self.budgets = pdbs
            .into_iter()
            .map(|pdb| {
                let allowed = pdb.disruptions_allowed;
                (pdb, allowed)
            })
            .collect();
    }

    pub fn pdbs(&self) -> Vec<PodDisruptionBudget> {
        self.budgets.iter().map(|(pdb, _)| pdb.clone()).collect()
    }

    pub fn remaining(&self, namespace: &str, name: &str) -> Option<i32> {
        self.budgets
            .iter()
            .find(|(pdb, _)| pdb.namespace == namespace && pdb.name == name)
            .map(|(_, remaining)| *remaining)
    }

    pub fn can_remove_pods(&self, pods: &[Pod]) -> PdbCheck {
        let mut in_parallel = true;
        for (pdb, remaining) in &self.budgets {
            let mut matched = 0;
            for pod in pods.iter().filter(|p| pdb.matches(p)) {
                if *remaining < 1 {
                    return PdbCheck {
                        can_remove: false,
                        in_parallel: false,
                        blocking_pod: Some(pod.clone()),
                    };
                }
                matched += 1;
            }
            if matched > *remaining {
                in_parallel = false;
            }
        }
        PdbCheck {
            can_remove: true,
            in_parallel,
            blocking_pod: None,
        }
    }

    /// Consumes budget for pods the iteration decided to move
    pub fn remove_pods(&mut self, pods: &[Pod]) {
        for (pdb, remaining) in &mut self.budgets {
            let matched = pods.iter().filter(|p| pdb.matches(p)).count() as i32;
            *remaining = (*remaining - matched).max(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pdb(allowed: i32) -> PodDisruptionBudget {
        PodDisruptionBudget {
            namespace: "default".into(),
            name: "web".into(),
            selector: BTreeMap::from([("app".to_string(), "web".to_string())]),
            disruptions_allowed: allowed,
        }
    }

    fn web_pod(name: &str) -> Pod {
        let mut pod = Pod::new("default", name);
        pod.labels.insert("app".into(), "web".into());
        pod
    }

    #[test]
    fn test_budget_blocks_when_exhausted() {
        let tracker = RemainingPdbTracker::new(vec![pdb(0)]);
        let check = tracker.can_remove_pods(&[web_pod("w1")]);
        assert!(!check.can_remove);
        assert_eq!(check.blocking_pod.unwrap().name, "w1");

        let other = Pod::new("default", "db");
        assert!(tracker.can_remove_pods(&[other]).can_remove);
    }

    #[test]
    fn test_parallel_removal_needs_enough_slack() {
        let tracker = RemainingPdbTracker::new(vec![pdb(1)]);
        let check = tracker.can_remove_pods(&[web_pod("w1"), web_pod("w2")]);
        assert!(check.can_remove);
        assert!(!check.in_parallel);

        assert!(tracker.can_remove_pods(&[web_pod("w1")]).in_parallel);
    }

    #[test]
    fn test_remove_pods_consumes_budget() {
        let mut tracker = RemainingPdbTracker::new(vec![pdb(2)]);
        tracker.remove_pods(&[web_pod("w1")]);
        assert_eq!(tracker.remaining("default", "web"), Some(1));
        tracker.remove_pods(&[web_pod("w2"), web_pod("w3")]);
        assert_eq!(tracker.remaining("default", "web"), Some(0));
        assert!(!tracker.can_remove_pods(&[web_pod("w4")]).can_remove);
    }
}
