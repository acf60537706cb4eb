//! Node resource utilization

use super::snapshot::NodeInfo;
use crate::models::{Node, Pod, RESOURCE_CPU, RESOURCE_GPU, RESOURCE_MEMORY};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UtilizationError {
    #[error("{resource} has zero allocatable on node {node}")]
    ZeroAllocatable { resource: String, node: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UtilizationInfo {
    pub cpu: f64,
    pub mem: f64,
    pub gpu: f64,
    /// Resource that determined `utilization`
    pub resource_name: String,
    pub utilization: f64,
}

/// Which pods are left out of the requests sum
#[derive(Debug, Clone, Copy, Default)]
pub struct UtilizationOptions {
    pub skip_daemonset_pods: bool,
    pub skip_mirror_pods: bool,
}

/// GPU nodes carry the provider's GPU label or advertise GPU capacity
pub fn is_gpu_node(node: &Node, gpu_label: &str) -> bool {
    node.labels.contains_key(gpu_label) || node.capacity.get(RESOURCE_GPU) > 0
}

pub fn calculate(
    info: &NodeInfo,
    options: UtilizationOptions,
    gpu_label: &str,
    now: DateTime<Utc>,
) -> Result<UtilizationInfo, UtilizationError> {
    let counted: Vec<&Pod> = info
        .pods
        .iter()
        .filter(|p| !p.is_terminal() && !p.is_long_terminating(now))
        .filter(|p| !(options.skip_daemonset_pods && p.is_daemonset()))
        .filter(|p| !(options.skip_mirror_pods && p.is_mirror()))
        .collect();

    if is_gpu_node(&info.node, gpu_label) {
        return match resource_utilization(&info.node, &counted, RESOURCE_GPU) {
            Ok(gpu) => Ok(UtilizationInfo {
                gpu,
                resource_name: RESOURCE_GPU.to_string(),
                utilization: gpu,
                ..Default::default()
            }),
            Err(_) => {
                // GPU not yet exposed by the driver; the node still counts as idle
                debug!(node = %info.node.name, "Node has unready GPU resource");
                Ok(UtilizationInfo {
                    resource_name: RESOURCE_GPU.to_string(),
                    ..Default::default()
                })
            }
        };
    }

    let cpu = resource_utilization(&info.node, &counted, RESOURCE_CPU)?;
    let mem = resource_utilization(&info.node, &counted, RESOURCE_MEMORY)?;
    let (resource_name, utilization) = if cpu >= mem {
        (RESOURCE_CPU, cpu)
    } else {
        (RESOURCE_MEMORY, mem)
    };
    Ok(UtilizationInfo {
        cpu,
        mem,
        gpu: 0.0,
        resource_name: resource_name.to_string(),
        utilization,
    })
}

fn resource_utilization(
    node: &Node,
    pods: &[&Pod],
    resource: &str,
) -> Result<f64, UtilizationError> {
    let allocatable = node.allocatable.get(resource);
    if allocatable <= 0 {
        return Err(UtilizationError::ZeroAllocatable {
            resource: resource.to_string(),
            node: node.name.clone(),
        });
    }
    let requested: i64 = pods.iter().map(|p| p.requests.get(resource)).sum();
    Ok(requested as f64 / allocatable as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OwnerReference, ResourceList, MIRROR_POD_ANNOTATION};
    use chrono::Duration as ChronoDuration;

    fn node(name: &str, cpu: i64, mem: i64) -> Node {
        let mut node = Node::new(name);
        node.allocatable = ResourceList::new().with("cpu", cpu).with("memory", mem);
        node
    }

    fn pod(name: &str, cpu: i64, mem: i64) -> Pod {
        let mut pod = Pod::new("default", name);
        pod.requests = ResourceList::new().with("cpu", cpu).with("memory", mem);
        pod
    }

    #[test]
    fn test_utilization_is_max_of_cpu_and_memory() {
        let now = Utc::now();
        let info = NodeInfo::new(
            node("n1", 2000, 2_000_000),
            vec![pod("p1", 100, 200_000), pod("p2", 100, 200_000)],
        );
        let util = calculate(&info, UtilizationOptions::default(), "gpu", now).unwrap();
        assert!((util.cpu - 0.1).abs() < 1e-9);
        assert!((util.utilization - 0.2).abs() < 1e-9);
        assert_eq!(util.resource_name, "memory");
    }

    #[test]
    fn test_zero_allocatable_is_an_error() {
        let info = NodeInfo::new(node("n2", 2000, 0), vec![pod("p1", 100, 200_000)]);
        assert!(calculate(&info, UtilizationOptions::default(), "gpu", Utc::now()).is_err());
    }

    #[test]
    fn test_skipped_pods() {
        let now = Utc::now();
        let mut ds = pod("ds", 1000, 0);
        ds.owner = Some(OwnerReference::new("DaemonSet", "ds", "uid"));
        let mut mirror = pod("mirror", 1000, 0);
        mirror.annotations.insert(MIRROR_POD_ANNOTATION.into(), String::new());
        let mut terminating = pod("old", 1000, 0);
        terminating.deletion_timestamp = Some(now - ChronoDuration::minutes(10));

        let info = NodeInfo::new(
            node("n1", 2000, 1_000_000),
            vec![pod("p1", 200, 0), ds, mirror, terminating],
        );
        let options = UtilizationOptions {
            skip_daemonset_pods: true,
            skip_mirror_pods: true,
        };
        let util = calculate(&info, options, "gpu", now).unwrap();
        assert!((util.cpu - 0.1).abs() < 1e-9);

        let util = calculate(&info, UtilizationOptions::default(), "gpu", now).unwrap();
        assert!((util.cpu - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_gpu_node_uses_gpu_utilization() {
        let now = Utc::now();
        let mut gpu_node = node("g1", 4000, 8_000_000);
        gpu_node.labels.insert("gpu-label".into(), "true".into());
        gpu_node.allocatable.set(RESOURCE_GPU, 2);
        let mut trainer = pod("train", 3000, 0);
        trainer.requests.set(RESOURCE_GPU, 1);

        let util = calculate(
            &NodeInfo::new(gpu_node.clone(), vec![trainer]),
            UtilizationOptions::default(),
            "gpu-label",
            now,
        )
        .unwrap();
        assert_eq!(util.resource_name, RESOURCE_GPU);
        assert!((util.utilization - 0.5).abs() < 1e-9);

        gpu_node.allocatable.set(RESOURCE_GPU, 0);
        let util = calculate(
            &NodeInfo::new(gpu_node, vec![]),
            UtilizationOptions::default(),
            "gpu-label",
            now,
        )
        .unwrap();
        assert_eq!(util.utilization, 0.0);
    }
}
