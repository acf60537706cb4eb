//! Node-group abstraction over the cloud provider
//!
//! This module provides:
//! - The `CloudProvider` / `NodeGroup` traits the planner and actuator depend on
//! - Generic instance states reported by node groups
//! - Cluster-wide resource limits
//! - The Scaleway Kapsule implementation

pub mod scaleway;

use crate::config::{AutoscalingOptions, NodeGroupAutoscalingOptions};
use crate::models::{Node, RESOURCE_CPU, RESOURCE_MEMORY};
use crate::simulator::NodeInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudProviderError {
    #[error("cluster ID is not provided")]
    MissingClusterId,

    #[error("scaleway secret key is not provided")]
    MissingSecretKey,

    #[error("region is not provided")]
    MissingRegion,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("400 error type: {method} {url} returned {status}: {message}")]
    ClientSide {
        status: u16,
        method: String,
        url: String,
        message: String,
    },

    #[error("500 error type: {method} {url} returned {status}: {message}")]
    ServerSide {
        status: u16,
        method: String,
        url: String,
        message: String,
    },

    #[error("generic error type: {method} {url} returned {status}: {message}")]
    OtherHttp {
        status: u16,
        method: String,
        url: String,
        message: String,
    },

    /// Response could not be decoded or was not JSON
    #[error("{0}")]
    Framing(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("node {0} not found in any node group")]
    NodeNotFound(String),

    #[error("{0}")]
    Internal(String),

    #[error("not implemented")]
    NotImplemented,
}

/// Generic lifecycle state of a cloud instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Creating,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceErrorClass {
    OutOfResources,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceErrorInfo {
    pub error_class: InstanceErrorClass,
    pub error_code: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    /// `None` when the instance is in an error state
    pub state: Option<InstanceState>,
    pub error_info: Option<InstanceErrorInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Provider id of the instance
    pub id: String,
    pub status: Option<InstanceStatus>,
}

/// Cluster-wide minimum and maximum per resource. CPU is counted in cores, memory in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimiter {
    min: HashMap<String, i64>,
    max: HashMap<String, i64>,
}

pub const RESOURCE_NAME_CORES: &str = RESOURCE_CPU;
pub const RESOURCE_NAME_MEMORY: &str = RESOURCE_MEMORY;

impl ResourceLimiter {
    pub fn new(min: HashMap<String, i64>, max: HashMap<String, i64>) -> Self {
        Self { min, max }
    }

    pub fn from_options(options: &AutoscalingOptions) -> Self {
        let mut min = HashMap::from([
            (RESOURCE_NAME_CORES.to_string(), options.min_cores_total),
            (RESOURCE_NAME_MEMORY.to_string(), options.min_memory_total),
        ]);
        let mut max = HashMap::from([
            (RESOURCE_NAME_CORES.to_string(), options.max_cores_total),
            (RESOURCE_NAME_MEMORY.to_string(), options.max_memory_total),
        ]);
        for limit in &options.gpu_limits {
            min.insert(limit.gpu_type.clone(), limit.min);
            max.insert(limit.gpu_type.clone(), limit.max);
        }
        Self { min, max }
    }

    pub fn min(&self, resource: &str) -> i64 {
        self.min.get(resource).copied().unwrap_or(0)
    }

    pub fn max(&self, resource: &str) -> i64 {
        self.max.get(resource).copied().unwrap_or(i64::MAX)
    }

    /// Every resource with a declared bound, sorted
    pub fn resources(&self) -> Vec<String> {
        self.min
            .keys()
            .chain(self.max.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// A homogeneous pool of nodes addressable as a scaling unit
#[async_trait]
pub trait NodeGroup: Send + Sync {
    fn id(&self) -> String;

    fn min_size(&self) -> usize;

    fn max_size(&self) -> usize;

    /// Desired size, which may transiently differ from the number of registered nodes
    fn target_size(&self) -> Result<usize, CloudProviderError>;

    async fn increase_size(&self, delta: i64) -> Result<(), CloudProviderError>;

    /// Reduces pending provisioning only; existing nodes are never deleted
    async fn decrease_target_size(&self, delta: i64) -> Result<(), CloudProviderError>;

    async fn delete_nodes(&self, nodes: &[Node]) -> Result<(), CloudProviderError>;

    fn nodes(&self) -> Result<Vec<Instance>, CloudProviderError>;

    fn template_node_info(&self) -> Result<NodeInfo, CloudProviderError>;

    fn exist(&self) -> bool {
        true
    }

    fn autoprovisioned(&self) -> bool {
        false
    }

    /// Group-specific overrides. `NotImplemented` means the defaults apply.
    fn options(
        &self,
        _defaults: &NodeGroupAutoscalingOptions,
    ) -> Result<Option<NodeGroupAutoscalingOptions>, CloudProviderError> {
        Err(CloudProviderError::NotImplemented)
    }

    fn debug(&self) -> String {
        format!(
            "{} (min: {}, max: {})",
            self.id(),
            self.min_size(),
            self.max_size()
        )
    }
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Autoscaled node groups only
    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>>;

    /// `Ok(None)` when the node is not part of any autoscaled group
    fn node_group_for_node(
        &self,
        node: &Node,
    ) -> Result<Option<Arc<dyn NodeGroup>>, CloudProviderError>;

    fn node_price(
        &self,
        _node: &Node,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<f64, CloudProviderError> {
        Err(CloudProviderError::NotImplemented)
    }

    fn gpu_label(&self) -> &str;

    fn resource_limiter(&self) -> Result<ResourceLimiter, CloudProviderError>;

    fn available_machine_types(&self) -> Result<Vec<String>, CloudProviderError> {
        Ok(Vec::new())
    }

    fn new_node_group(
        &self,
        _machine_type: &str,
    ) -> Result<Arc<dyn NodeGroup>, CloudProviderError> {
        Err(CloudProviderError::NotImplemented)
    }

    /// Brings the local view up to date; implementations may serve it from cache
    async fn refresh(&self) -> Result<(), CloudProviderError>;

    async fn cleanup(&self) -> Result<(), CloudProviderError> {
        Ok(())
    }
}
