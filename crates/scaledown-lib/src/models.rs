//! Orchestrator-side data model shared by the planner, the simulator and the actuator

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// CPU, expressed in millicores
pub const RESOURCE_CPU: &str = "cpu";
/// Memory, expressed in bytes
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_PODS: &str = "pods";
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const RESOURCE_GPU: &str = "nvidia.com/gpu";

pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
pub const CONFIG_SOURCE_ANNOTATION: &str = "kubernetes.io/config.source";
pub const DAEMONSET_POD_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/daemonset-pod";
pub const ENABLE_DS_EVICTION_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/enable-ds-eviction";
pub const SCALE_DOWN_DISABLED_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/scale-down-disabled";
pub const DELAY_DELETION_ANNOTATION_PREFIX: &str = "delay-deletion.cluster-autoscaler.kubernetes.io/";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Grace period applied to pods that do not declare one
pub const DEFAULT_TERMINATION_GRACE_PERIOD_SECS: i64 = 30;

/// Extra time after a pod's grace period before it counts as long-terminating
pub const POD_LONG_TERMINATING_EXTRA_THRESHOLD_SECS: i64 = 30;

/// Resource quantities keyed by resource name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, i64>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, name: &str, value: i64) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, value: i64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn add(&mut self, other: &ResourceList) {
        for (name, value) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += value;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn cpu_millis(&self) -> i64 {
        self.get(RESOURCE_CPU)
    }

    pub fn memory_bytes(&self) -> i64 {
        self.get(RESOURCE_MEMORY)
    }
}

impl From<HashMap<String, i64>> for ResourceList {
    fn from(map: HashMap<String, i64>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl From<BTreeMap<String, i64>> for ResourceList {
    fn from(map: BTreeMap<String, i64>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NoSchedule" => Some(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Some(TaintEffect::PreferNoSchedule),
            "NoExecute" => Some(TaintEffect::NoExecute),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    /// Empty key with `Exists` tolerates everything
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// `None` matches every effect
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

/// Controller reference of a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerReference {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }
}

/// A worker node as seen by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Cloud instance identifier, the key used by node-group adapters
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub capacity: ResourceList,
    #[serde(default)]
    pub allocatable: ResourceList,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: true,
            ..Default::default()
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn taint(&self, key: &str) -> Option<&Taint> {
        self.taints.iter().find(|t| t.key == key)
    }

    pub fn has_scale_down_disabled_annotation(&self) -> bool {
        self.annotation(SCALE_DOWN_DISABLED_ANNOTATION) == Some("true")
    }

    pub fn has_delay_deletion_annotation(&self) -> bool {
        self.annotations
            .keys()
            .any(|k| k.starts_with(DELAY_DELETION_ANNOTATION_PREFIX))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    #[default]
    Running,
    Succeeded,
    Failed,
}

/// A pod bound (or about to be bound) to a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    /// Node the pod is bound to, `None` for pending or injected pods
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner: Option<OwnerReference>,
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub termination_grace_period_secs: Option<i64>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase: PodPhase,
}

impl Pod {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_mirror(&self) -> bool {
        self.annotations.contains_key(MIRROR_POD_ANNOTATION)
    }

    pub fn is_daemonset(&self) -> bool {
        if let Some(owner) = &self.owner {
            if owner.kind == "DaemonSet" {
                return true;
            }
        }
        self.annotations
            .get(DAEMONSET_POD_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// Pods created from a kubelet manifest rather than through the API server
    pub fn is_static(&self) -> bool {
        self.annotations
            .get(CONFIG_SOURCE_ANNOTATION)
            .is_some_and(|source| source != "api")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    pub fn grace_period_secs(&self) -> i64 {
        self.termination_grace_period_secs
            .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD_SECS)
    }

    /// A pod that has been terminating for longer than its grace period plus a fixed threshold
    pub fn is_long_terminating(&self, now: DateTime<Utc>) -> bool {
        let Some(deleted_at) = self.deletion_timestamp else {
            return false;
        };
        let deadline = deleted_at
            + ChronoDuration::seconds(self.grace_period_secs())
            + ChronoDuration::seconds(POD_LONG_TERMINATING_EXTRA_THRESHOLD_SECS);
        deadline < now
    }

    pub fn tolerates(&self, taint: &Taint) -> bool {
        self.tolerations.iter().any(|t| t.tolerates(taint))
    }
}

/// A disruption budget restricting voluntary evictions of matching pods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDisruptionBudget {
    pub namespace: String,
    pub name: String,
    /// Label selector; an empty selector matches nothing
    pub selector: BTreeMap<String, String>,
    pub disruptions_allowed: i32,
}

impl PodDisruptionBudget {
    pub fn matches(&self, pod: &Pod) -> bool {
        pod.namespace == self.namespace
            && !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(k, v)| pod.labels.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toleration_matching() {
        let taint = Taint::new("dedicated", "gpu", TaintEffect::NoSchedule);

        let exact = Toleration {
            key: "dedicated".into(),
            value: "gpu".into(),
            ..Default::default()
        };
        assert!(exact.tolerates(&taint));

        let wrong_value = Toleration {
            key: "dedicated".into(),
            value: "cpu".into(),
            ..Default::default()
        };
        assert!(!wrong_value.tolerates(&taint));

        let wildcard = Toleration {
            operator: TolerationOperator::Exists,
            ..Default::default()
        };
        assert!(wildcard.tolerates(&taint));

        let other_effect = Toleration {
            key: "dedicated".into(),
            operator: TolerationOperator::Exists,
            effect: Some(TaintEffect::NoExecute),
            ..Default::default()
        };
        assert!(!other_effect.tolerates(&taint));
    }

    #[test]
    fn test_pod_kinds() {
        let mut pod = Pod::new("kube-system", "proxy");
        assert!(!pod.is_daemonset());
        pod.owner = Some(OwnerReference::new("DaemonSet", "proxy", "uid-1"));
        assert!(pod.is_daemonset());

        let mut annotated = Pod::new("default", "agent");
        annotated
            .annotations
            .insert(DAEMONSET_POD_ANNOTATION.into(), "true".into());
        assert!(annotated.is_daemonset());

        let mut mirror = Pod::new("kube-system", "etcd");
        mirror
            .annotations
            .insert(MIRROR_POD_ANNOTATION.into(), "abc".into());
        mirror
            .annotations
            .insert(CONFIG_SOURCE_ANNOTATION.into(), "file".into());
        assert!(mirror.is_mirror());
        assert!(mirror.is_static());
    }

    #[test]
    fn test_long_terminating() {
        let now = Utc::now();
        let mut pod = Pod::new("default", "web");
        assert!(!pod.is_long_terminating(now));

        pod.termination_grace_period_secs = Some(10);
        pod.deletion_timestamp = Some(now - ChronoDuration::seconds(39));
        assert!(!pod.is_long_terminating(now));

        pod.deletion_timestamp = Some(now - ChronoDuration::seconds(41));
        assert!(pod.is_long_terminating(now));
    }

    #[test]
    fn test_pdb_selector() {
        let pdb = PodDisruptionBudget {
            namespace: "default".into(),
            name: "web".into(),
            selector: BTreeMap::from([("app".to_string(), "web".to_string())]),
            disruptions_allowed: 1,
        };
        let mut pod = Pod::new("default", "web-1");
        assert!(!pdb.matches(&pod));
        pod.labels.insert("app".into(), "web".into());
        assert!(pdb.matches(&pod));
        pod.namespace = "other".into();
        assert!(!pdb.matches(&pod));
    }

    #[test]
    fn test_resource_list_add() {
        let mut total = ResourceList::new().with(RESOURCE_CPU, 500);
        total.add(&ResourceList::new().with(RESOURCE_CPU, 250).with(RESOURCE_MEMORY, 1024));
        assert_eq!(total.cpu_millis(), 750);
        assert_eq!(total.memory_bytes(), 1024);
        assert_eq!(total.get(RESOURCE_GPU), 0);
    }
}
