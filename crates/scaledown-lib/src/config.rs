//! Scale-down options and per node-group overrides

use crate::cloudprovider::{CloudProviderError, NodeGroup};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("scale_down_candidates_pool_ratio must be within (0, 1], got {0}")]
    InvalidPoolRatio(f64),

    #[error("gpu limit for {gpu_type}: min {min} is greater than max {max}")]
    InvalidGpuLimit { gpu_type: String, min: i64, max: i64 },
}

/// Serde helper: durations are written as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Lower and upper bound for one GPU type across the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuLimit {
    #[serde(rename = "type")]
    pub gpu_type: String,
    pub min: i64,
    pub max: i64,
}

/// Options a node group may override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroupAutoscalingOptions {
    pub scale_down_utilization_threshold: f64,
    pub scale_down_gpu_utilization_threshold: f64,
    #[serde(rename = "scale_down_unneeded_time_secs", with = "duration_secs")]
    pub scale_down_unneeded_time: Duration,
    #[serde(rename = "scale_down_unready_time_secs", with = "duration_secs")]
    pub scale_down_unready_time: Duration,
    pub ignore_daemonsets_utilization: bool,
    /// Atomic scaling: the group is scaled only by its full size or to zero
    pub zero_or_max_node_scaling: bool,
}

impl Default for NodeGroupAutoscalingOptions {
    fn default() -> Self {
        Self {
            scale_down_utilization_threshold: default_utilization_threshold(),
            scale_down_gpu_utilization_threshold: default_utilization_threshold(),
            scale_down_unneeded_time: default_unneeded_time(),
            scale_down_unready_time: default_unready_time(),
            ignore_daemonsets_utilization: false,
            zero_or_max_node_scaling: false,
        }
    }
}

/// Every option the scale-down core recognizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingOptions {
    /// Outer loop period, used to size the per-iteration unneeded-nodes limit
    #[serde(rename = "scan_interval_secs", default = "default_scan_interval", with = "duration_secs")]
    pub scan_interval: Duration,

    #[serde(default = "default_max_scale_down_parallelism")]
    pub max_scale_down_parallelism: usize,

    #[serde(default = "default_max_drain_parallelism")]
    pub max_drain_parallelism: usize,

    #[serde(
        rename = "scale_down_unneeded_time_secs",
        default = "default_unneeded_time",
        with = "duration_secs"
    )]
    pub scale_down_unneeded_time: Duration,

    #[serde(
        rename = "scale_down_unready_time_secs",
        default = "default_unready_time",
        with = "duration_secs"
    )]
    pub scale_down_unready_time: Duration,

    #[serde(default = "default_utilization_threshold")]
    pub scale_down_utilization_threshold: f64,

    #[serde(default = "default_utilization_threshold")]
    pub scale_down_gpu_utilization_threshold: f64,

    #[serde(default)]
    pub ignore_daemonsets_utilization: bool,

    #[serde(default)]
    pub ignore_mirror_pods_utilization: bool,

    #[serde(
        rename = "unremovable_node_recheck_timeout_secs",
        default = "default_unremovable_recheck_timeout",
        with = "duration_secs"
    )]
    pub unremovable_node_recheck_timeout: Duration,

    #[serde(
        rename = "max_cloud_provider_node_deletion_time_secs",
        default = "default_max_cloud_provider_node_deletion_time",
        with = "duration_secs"
    )]
    pub max_cloud_provider_node_deletion_time: Duration,

    #[serde(
        rename = "max_kubernetes_empty_node_deletion_time_secs",
        default = "default_max_kubernetes_empty_node_deletion_time",
        with = "duration_secs"
    )]
    pub max_kubernetes_empty_node_deletion_time: Duration,

    #[serde(
        rename = "max_pod_eviction_time_secs",
        default = "default_max_pod_eviction_time",
        with = "duration_secs"
    )]
    pub max_pod_eviction_time: Duration,

    #[serde(
        rename = "pod_eviction_headroom_secs",
        default = "default_pod_eviction_headroom",
        with = "duration_secs"
    )]
    pub pod_eviction_headroom: Duration,

    #[serde(
        rename = "eviction_retry_interval_secs",
        default = "default_eviction_retry_interval",
        with = "duration_secs"
    )]
    pub eviction_retry_interval: Duration,

    #[serde(default = "default_max_graceful_termination_sec")]
    pub max_graceful_termination_sec: i64,

    #[serde(
        rename = "node_deletion_batcher_interval_secs",
        default,
        with = "duration_secs"
    )]
    pub node_deletion_batcher_interval: Duration,

    #[serde(
        rename = "node_deletion_delay_timeout_secs",
        default = "default_node_deletion_delay_timeout",
        with = "duration_secs"
    )]
    pub node_deletion_delay_timeout: Duration,

    /// Deadline of each orchestrator call made while deleting nodes. Evictions use the
    /// remaining eviction window instead.
    #[serde(
        rename = "api_call_timeout_secs",
        default = "default_api_call_timeout",
        with = "duration_secs"
    )]
    pub api_call_timeout: Duration,

    /// Zero keeps deletion-candidate taints valid forever
    #[serde(
        rename = "node_deletion_candidate_ttl_secs",
        default,
        with = "duration_secs"
    )]
    pub node_deletion_candidate_ttl: Duration,

    #[serde(default)]
    pub min_cores_total: i64,

    #[serde(default = "default_max_cores_total")]
    pub max_cores_total: i64,

    /// Bytes
    #[serde(default)]
    pub min_memory_total: i64,

    /// Bytes
    #[serde(default = "default_max_memory_total")]
    pub max_memory_total: i64,

    #[serde(default)]
    pub gpu_limits: Vec<GpuLimit>,

    #[serde(default = "default_true")]
    pub scale_down_unready_enabled: bool,

    #[serde(default)]
    pub daemonset_eviction_for_empty_nodes: bool,

    #[serde(default = "default_true")]
    pub daemonset_eviction_for_occupied_nodes: bool,

    /// Zero or negative disables the limit
    #[serde(default = "default_non_empty_candidates_count")]
    pub scale_down_non_empty_candidates_count: i64,

    #[serde(default = "default_candidates_pool_ratio")]
    pub scale_down_candidates_pool_ratio: f64,

    #[serde(default = "default_candidates_pool_min_count")]
    pub scale_down_candidates_pool_min_count: usize,

    #[serde(
        rename = "scale_down_simulation_timeout_secs",
        default = "default_simulation_timeout",
        with = "duration_secs"
    )]
    pub scale_down_simulation_timeout: Duration,
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_scale_down_parallelism() -> usize {
    10
}

fn default_max_drain_parallelism() -> usize {
    1
}

fn default_unneeded_time() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_unready_time() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_utilization_threshold() -> f64 {
    0.5
}

fn default_unremovable_recheck_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_cloud_provider_node_deletion_time() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_kubernetes_empty_node_deletion_time() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_max_pod_eviction_time() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_pod_eviction_headroom() -> Duration {
    Duration::from_secs(30)
}

fn default_eviction_retry_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_graceful_termination_sec() -> i64 {
    600
}

fn default_node_deletion_delay_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_api_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_cores_total() -> i64 {
    320_000
}

fn default_max_memory_total() -> i64 {
    6_400_000 * 1024 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_non_empty_candidates_count() -> i64 {
    30
}

fn default_candidates_pool_ratio() -> f64 {
    0.1
}

fn default_candidates_pool_min_count() -> usize {
    50
}

fn default_simulation_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for AutoscalingOptions {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            max_scale_down_parallelism: default_max_scale_down_parallelism(),
            max_drain_parallelism: default_max_drain_parallelism(),
            scale_down_unneeded_time: default_unneeded_time(),
            scale_down_unready_time: default_unready_time(),
            scale_down_utilization_threshold: default_utilization_threshold(),
            scale_down_gpu_utilization_threshold: default_utilization_threshold(),
            ignore_daemonsets_utilization: false,
            ignore_mirror_pods_utilization: false,
            unremovable_node_recheck_timeout: default_unremovable_recheck_timeout(),
            max_cloud_provider_node_deletion_time: default_max_cloud_provider_node_deletion_time(),
            max_kubernetes_empty_node_deletion_time:
                default_max_kubernetes_empty_node_deletion_time(),
            max_pod_eviction_time: default_max_pod_eviction_time(),
            pod_eviction_headroom: default_pod_eviction_headroom(),
            eviction_retry_interval: default_eviction_retry_interval(),
            max_graceful_termination_sec: default_max_graceful_termination_sec(),
            node_deletion_batcher_interval: Duration::ZERO,
            node_deletion_delay_timeout: default_node_deletion_delay_timeout(),
            api_call_timeout: default_api_call_timeout(),
            node_deletion_candidate_ttl: Duration::ZERO,
            min_cores_total: 0,
            max_cores_total: default_max_cores_total(),
            min_memory_total: 0,
            max_memory_total: default_max_memory_total(),
            gpu_limits: Vec::new(),
            scale_down_unready_enabled: true,
            daemonset_eviction_for_empty_nodes: false,
            daemonset_eviction_for_occupied_nodes: true,
            scale_down_non_empty_candidates_count: default_non_empty_candidates_count(),
            scale_down_candidates_pool_ratio: default_candidates_pool_ratio(),
            scale_down_candidates_pool_min_count: default_candidates_pool_min_count(),
            scale_down_simulation_timeout: default_simulation_timeout(),
        }
    }
}

impl AutoscalingOptions {
    /// Load options from an optional file, overlaid with `SCALEDOWN_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("SCALEDOWN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read scale-down configuration")?;

        let options: AutoscalingOptions = settings
            .try_deserialize()
            .context("Failed to parse scale-down configuration")?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (name, value) in [
            (
                "scale_down_utilization_threshold",
                self.scale_down_utilization_threshold,
            ),
            (
                "scale_down_gpu_utilization_threshold",
                self.scale_down_gpu_utilization_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        if self.scale_down_candidates_pool_ratio <= 0.0 || self.scale_down_candidates_pool_ratio > 1.0 {
            return Err(ConfigError::InvalidPoolRatio(
                self.scale_down_candidates_pool_ratio,
            ));
        }
        if let Some(limit) = self.gpu_limits.iter().find(|l| l.min > l.max) {
            return Err(ConfigError::InvalidGpuLimit {
                gpu_type: limit.gpu_type.clone(),
                min: limit.min,
                max: limit.max,
            });
        }
        Ok(())
    }

    /// Group-level defaults derived from the global options
    pub fn node_group_defaults(&self) -> NodeGroupAutoscalingOptions {
        NodeGroupAutoscalingOptions {
            scale_down_utilization_threshold: self.scale_down_utilization_threshold,
            scale_down_gpu_utilization_threshold: self.scale_down_gpu_utilization_threshold,
            scale_down_unneeded_time: self.scale_down_unneeded_time,
            scale_down_unready_time: self.scale_down_unready_time,
            ignore_daemonsets_utilization: self.ignore_daemonsets_utilization,
            zero_or_max_node_scaling: false,
        }
    }
}

/// Resolves per node-group options: the group's own options win over the global defaults
#[derive(Debug, Clone)]
pub struct NodeGroupConfigProcessor {
    defaults: NodeGroupAutoscalingOptions,
}

impl NodeGroupConfigProcessor {
    pub fn new(defaults: NodeGroupAutoscalingOptions) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &NodeGroupAutoscalingOptions {
        &self.defaults
    }

    pub fn options_for(
        &self,
        group: &dyn NodeGroup,
    ) -> std::result::Result<NodeGroupAutoscalingOptions, CloudProviderError> {
        match group.options(&self.defaults) {
            Ok(Some(options)) => Ok(options),
            Ok(None) | Err(CloudProviderError::NotImplemented) => Ok(self.defaults.clone()),
            Err(e) => Err(e),
        }
    }

    pub fn scale_down_unneeded_time(
        &self,
        group: &dyn NodeGroup,
    ) -> std::result::Result<Duration, CloudProviderError> {
        Ok(self.options_for(group)?.scale_down_unneeded_time)
    }

    pub fn scale_down_unready_time(
        &self,
        group: &dyn NodeGroup,
    ) -> std::result::Result<Duration, CloudProviderError> {
        Ok(self.options_for(group)?.scale_down_unready_time)
    }

    pub fn is_atomic(&self, group: &dyn NodeGroup) -> std::result::Result<bool, CloudProviderError> {
        Ok(self.options_for(group)?.zero_or_max_node_scaling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let options = AutoscalingOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.max_scale_down_parallelism, 10);
        assert_eq!(options.max_drain_parallelism, 1);
        assert_eq!(options.scale_down_unneeded_time, Duration::from_secs(600));
        assert_eq!(options.node_deletion_batcher_interval, Duration::ZERO);
        assert!(options.daemonset_eviction_for_occupied_nodes);
        assert_eq!(options.api_call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let options = AutoscalingOptions {
            scale_down_gpu_utilization_threshold: 1.5,
            ..Default::default()
        };
        assert_eq!(
            options.validate(),
            Err(ConfigError::ThresholdOutOfRange {
                name: "scale_down_gpu_utilization_threshold",
                value: 1.5
            })
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
max_scale_down_parallelism = 4
max_drain_parallelism = 2
scale_down_unneeded_time_secs = 120
node_deletion_batcher_interval_secs = 5
api_call_timeout_secs = 15
scale_down_utilization_threshold = 0.7

[[gpu_limits]]
type = "nvidia-tesla-t4"
min = 0
max = 8
"#
        )
        .unwrap();

        let options = AutoscalingOptions::load(Some(file.path())).unwrap();
        assert_eq!(options.max_scale_down_parallelism, 4);
        assert_eq!(options.max_drain_parallelism, 2);
        assert_eq!(options.scale_down_unneeded_time, Duration::from_secs(120));
        assert_eq!(options.node_deletion_batcher_interval, Duration::from_secs(5));
        assert_eq!(options.api_call_timeout, Duration::from_secs(15));
        assert_eq!(options.scale_down_utilization_threshold, 0.7);
        assert_eq!(options.gpu_limits.len(), 1);
        assert_eq!(options.gpu_limits[0].gpu_type, "nvidia-tesla-t4");
        // untouched keys keep their defaults
        assert_eq!(options.max_pod_eviction_time, Duration::from_secs(120));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "scale_down_utilization_threshold = 2.0").unwrap();

        assert!(AutoscalingOptions::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_group_defaults_follow_globals() {
        let options = AutoscalingOptions {
            scale_down_unready_time: Duration::from_secs(30),
            ignore_daemonsets_utilization: true,
            ..Default::default()
        };
        let defaults = options.node_group_defaults();
        assert_eq!(defaults.scale_down_unready_time, Duration::from_secs(30));
        assert!(defaults.ignore_daemonsets_utilization);
        assert!(!defaults.zero_or_max_node_scaling);
    }
}
