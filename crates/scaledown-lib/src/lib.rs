//! Scale-down core of a cluster autoscaler
//!
//! This crate provides the core functionality for:
//! - Simulating node removal against a forkable cluster snapshot
//! - Planning which underutilized nodes are unneeded and may be deleted
//! - Cropping deletions to the configured parallelism budgets
//! - Tainting, draining and deleting nodes through the cloud provider
//! - Tracking deletions in flight and their results
//! - Structured logging and Prometheus metrics

pub mod cloudprovider;
pub mod cluster;
pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod scaledown;
pub mod simulator;
pub mod taints;
pub mod testing;

pub use cloudprovider::{CloudProvider, CloudProviderError, NodeGroup, ResourceLimiter};
pub use cluster::{ApiError, ClusterApi, EventType};
pub use config::{AutoscalingOptions, NodeGroupAutoscalingOptions, NodeGroupConfigProcessor};
pub use error::{AutoscalerError, ErrorKind, Result};
pub use models::*;
pub use observability::{ScaleDownLogger, ScaleDownMetrics};
pub use scaledown::actuation::{Actuator, ScaleDownStatus};
pub use scaledown::planner::Planner;
pub use scaledown::{ActuationStatus, DeletionResult, DeletionResultKind, NodeDeletionTracker};
pub use simulator::{ClusterSnapshot, NodeInfo, UnremovableReason};
