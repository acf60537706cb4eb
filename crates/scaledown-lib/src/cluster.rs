//! Narrow interface to the container orchestrator's API

use crate::models::{Node, Pod, Taint};
use crate::taints::{to_be_deleted_taint, TO_BE_DELETED_TAINT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Eviction rejected because it would violate a disruption budget
    #[error("too many requests: {0}")]
    TooManyRequests(String),
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Calls the actuator makes against the orchestrator. Implementations must be cheap to share.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, ApiError>;

    /// Pods currently bound to the node
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ApiError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError>;

    /// Posts an eviction for the pod. `TooManyRequests` means a disruption budget blocks it for now.
    async fn evict_pod(&self, pod: &Pod, grace_period_secs: i64) -> Result<(), ApiError>;

    /// Adds the taint, replacing any existing taint with the same key
    async fn add_taint(&self, node_name: &str, taint: Taint) -> Result<(), ApiError>;

    async fn remove_taint(&self, node_name: &str, key: &str) -> Result<(), ApiError>;

    fn record_node_event(&self, node_name: &str, event_type: EventType, reason: &str, message: &str);

    fn record_pod_event(&self, pod: &Pod, event_type: EventType, reason: &str, message: &str);
}

/// Taints the node with the to-be-deleted marker, which also keeps new pods away
pub async fn mark_to_be_deleted(
    api: &dyn ClusterApi,
    node_name: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    api.add_taint(node_name, to_be_deleted_taint(now)).await
}

pub async fn clean_to_be_deleted(api: &dyn ClusterApi, node_name: &str) -> Result<(), ApiError> {
    match api.remove_taint(node_name, TO_BE_DELETED_TAINT).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
