//! Cluster-wide resource floors honored when removing nodes

use crate::cloudprovider::{ResourceLimiter, RESOURCE_NAME_CORES, RESOURCE_NAME_MEMORY};
use crate::models::{Node, RESOURCE_CPU, RESOURCE_GPU, RESOURCE_MEMORY};
use crate::taints::has_to_be_deleted_taint;
use std::collections::HashMap;

/// Amount of each limited resource that may still be removed from the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcesLimits(HashMap<String, i64>);

impl ResourcesLimits {
    pub fn new(left: HashMap<String, i64>) -> Self {
        Self(left)
    }

    pub fn get(&self, resource: &str) -> Option<i64> {
        self.0.get(resource).copied()
    }

    /// Resources for which removing `delta` would cross the floor, sorted
    pub fn exceeded_by(&self, delta: &HashMap<String, i64>) -> Vec<String> {
        let mut exceeded: Vec<String> = delta
            .iter()
            .filter(|(resource, amount)| {
                self.0
                    .get(resource.as_str())
                    .is_some_and(|left| **amount > *left)
            })
            .map(|(resource, _)| resource.clone())
            .collect();
        exceeded.sort();
        exceeded
    }

    /// Consumes `delta` when it fits in full; returns the exceeded resources otherwise
    pub fn try_decrement_by(&mut self, delta: &HashMap<String, i64>) -> Result<(), Vec<String>> {
        let exceeded = self.exceeded_by(delta);
        if !exceeded.is_empty() {
            return Err(exceeded);
        }
        for (resource, amount) in delta {
            if let Some(left) = self.0.get_mut(resource) {
                *left -= amount;
            }
        }
        Ok(())
    }
}

/// Computes what may still be removed and what each node contributes
#[derive(Debug, Clone)]
pub struct ResourceLimitsFinder {
    gpu_label: String,
}

impl ResourceLimitsFinder {
    pub fn new(gpu_label: impl Into<String>) -> Self {
        Self {
            gpu_label: gpu_label.into(),
        }
    }

    /// Cluster total minus the declared minimum, per limited resource. Nodes already marked
    /// for deletion do not count towards the total.
    pub fn limits_left<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a Node>,
        limiter: &ResourceLimiter,
    ) -> ResourcesLimits {
        let resources = limiter.resources();
        let mut totals: HashMap<String, i64> =
            resources.iter().map(|r| (r.clone(), 0)).collect();
        for node in nodes.into_iter().filter(|n| !has_to_be_deleted_taint(n)) {
            for (resource, amount) in self.delta_for_node(node, &resources) {
                *totals.entry(resource).or_insert(0) += amount;
            }
        }
        ResourcesLimits(
            totals
                .into_iter()
                .map(|(resource, total)| {
                    let left = (total - limiter.min(&resource)).max(0);
                    (resource, left)
                })
                .collect(),
        )
    }

    /// What removing the node takes away from each limited resource. CPU counts in whole cores.
    pub fn delta_for_node(&self, node: &Node, resources: &[String]) -> HashMap<String, i64> {
        let mut delta = HashMap::new();
        for resource in resources {
            let amount = match resource.as_str() {
                RESOURCE_NAME_CORES => (node.capacity.get(RESOURCE_CPU) + 999) / 1000,
                RESOURCE_NAME_MEMORY => node.capacity.get(RESOURCE_MEMORY),
                gpu_type => {
                    if node.labels.get(&self.gpu_label).map(String::as_str) == Some(gpu_type) {
                        node.capacity.get(RESOURCE_GPU)
                    } else {
                        node.capacity.get(gpu_type)
                    }
                }
            };
            delta.insert(resource.clone(), amount);
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceList;
    use crate::taints::to_be_deleted_taint;
    use chrono::Utc;

    fn node(name: &str, millis: i64, mem: i64) -> Node {
        let mut node = Node::new(name);
        node.capacity = ResourceList::new().with("cpu", millis).with("memory", mem);
        node
    }

    fn limiter(min_cores: i64) -> ResourceLimiter {
        ResourceLimiter::new(
            HashMap::from([("cpu".to_string(), min_cores), ("memory".to_string(), 0)]),
            HashMap::new(),
        )
    }

    #[test]
    fn test_limits_left_skips_deleted_nodes() {
        let finder = ResourceLimitsFinder::new("gpu");
        let mut deleting = node("n3", 4000, 100);
        deleting.taints.push(to_be_deleted_taint(Utc::now()));
        let nodes = vec![node("n1", 2000, 100), node("n2", 1500, 100), deleting];

        let left = finder.limits_left(&nodes, &limiter(1));
        // 2 + 2 cores, minus the floor of 1
        assert_eq!(left.get("cpu"), Some(3));
        assert_eq!(left.get("memory"), Some(200));
    }

    #[test]
    fn test_try_decrement_admits_until_floor() {
        let finder = ResourceLimitsFinder::new("gpu");
        let mut left = ResourcesLimits::new(HashMap::from([("cpu".to_string(), 2)]));
        let resources = vec!["cpu".to_string()];
        let delta = finder.delta_for_node(&node("n1", 2000, 0), &resources);

        assert!(left.try_decrement_by(&delta).is_ok());
        assert_eq!(left.get("cpu"), Some(0));
        assert_eq!(left.try_decrement_by(&delta), Err(vec!["cpu".to_string()]));
    }

    #[test]
    fn test_gpu_delta_uses_gpu_type_label() {
        let finder = ResourceLimitsFinder::new("k8s.scw.cloud/gpu");
        let mut gpu_node = node("g1", 8000, 0);
        gpu_node
            .labels
            .insert("k8s.scw.cloud/gpu".into(), "nvidia-l4".into());
        gpu_node.capacity.set(RESOURCE_GPU, 2);

        let delta = finder.delta_for_node(&gpu_node, &["nvidia-l4".to_string()]);
        assert_eq!(delta["nvidia-l4"], 2);
    }
}
