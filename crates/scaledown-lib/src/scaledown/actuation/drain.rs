//! Pod eviction for nodes that are about to be deleted

use super::{with_deadline, DeletionContext};
use crate::cluster::{ClusterApi, EventType};
use crate::config::AutoscalingOptions;
use crate::error::{AutoscalerError, ErrorKind, Result};
use crate::models::{Node, Pod, ENABLE_DS_EVICTION_ANNOTATION};
use crate::observability::FUNCTION_DRAIN_NODE;
use crate::scaledown::{NodeDeletionTracker, PodEvictionResult};
use crate::simulator::NodeInfo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Interval between checks that evicted pods are gone
pub const POD_DISAPPEARANCE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between checks of the delay-deletion annotations
pub const DELAY_DELETION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Drain failure with the per-pod results gathered so far
#[derive(Debug, Clone, Error)]
#[error("{err}")]
pub struct DrainError {
    pub err: AutoscalerError,
    /// Keyed by `namespace/name`
    pub results: HashMap<String, PodEvictionResult>,
}

pub type DrainResult = std::result::Result<HashMap<String, PodEvictionResult>, DrainError>;

/// Whether a daemonset pod should be evicted; the pod annotation overrides the default
pub fn should_evict_daemonset_pod(pod: &Pod, evict_by_default: bool) -> bool {
    match pod.annotations.get(ENABLE_DS_EVICTION_ANNOTATION).map(String::as_str) {
        Some("true") => true,
        Some("false") => false,
        _ => evict_by_default,
    }
}

/// Splits the pods of a node into (daemonset pods to evict, other pods). Mirror pods stay.
pub fn pods_to_evict(info: &NodeInfo, evict_ds_by_default: bool) -> (Vec<Pod>, Vec<Pod>) {
    let mut ds_pods = Vec::new();
    let mut pods = Vec::new();
    for pod in info.pods.iter().filter(|p| !p.is_mirror()) {
        if pod.is_daemonset() {
            if should_evict_daemonset_pod(pod, evict_ds_by_default) {
                ds_pods.push(pod.clone());
            }
        } else {
            pods.push(pod.clone());
        }
    }
    (ds_pods, pods)
}

/// Evicts pods with retries under a shared deadline, then waits for them to go away
#[derive(Clone)]
pub struct Evictor {
    ctx: Arc<DeletionContext>,
    max_pod_eviction_time: Duration,
    eviction_retry_interval: Duration,
    pod_eviction_headroom: Duration,
    max_graceful_termination_sec: i64,
    ds_eviction_for_empty_nodes: bool,
    ds_eviction_for_occupied_nodes: bool,
}

impl Evictor {
    pub(crate) fn new(ctx: Arc<DeletionContext>, options: &AutoscalingOptions) -> Self {
        Self {
            ctx,
            max_pod_eviction_time: options.max_pod_eviction_time,
            eviction_retry_interval: options.eviction_retry_interval,
            pod_eviction_headroom: options.pod_eviction_headroom,
            max_graceful_termination_sec: options.max_graceful_termination_sec,
            ds_eviction_for_empty_nodes: options.daemonset_eviction_for_empty_nodes,
            ds_eviction_for_occupied_nodes: options.daemonset_eviction_for_occupied_nodes,
        }
    }

    /// Evicts every pod of an occupied node. Daemonset pods are best-effort.
    pub async fn drain_node(&self, info: &NodeInfo) -> DrainResult {
        let (ds_pods, pods) = pods_to_evict(info, self.ds_eviction_for_occupied_nodes);
        let started = Instant::now();
        let result = self.drain_node_with_pods(&info.node, pods, ds_pods).await;
        self.ctx
            .metrics
            .observe_duration(FUNCTION_DRAIN_NODE, started.elapsed().as_secs_f64());
        result
    }

    /// Best-effort eviction of the daemonset pods of an empty node
    pub async fn evict_daemonset_pods(&self, info: &NodeInfo) -> DrainResult {
        let (ds_pods, _) = pods_to_evict(info, self.ds_eviction_for_empty_nodes);
        self.drain_node_with_pods(&info.node, Vec::new(), ds_pods).await
    }

    pub async fn drain_node_with_pods(
        &self,
        node: &Node,
        pods: Vec<Pod>,
        ds_pods: Vec<Pod>,
    ) -> DrainResult {
        if pods.is_empty() && ds_pods.is_empty() {
            return Ok(HashMap::new());
        }
        let results = self.initiate_eviction(node, &pods, ds_pods).await?;
        self.wait_pods_to_disappear(node, &pods, results).await
    }

    async fn initiate_eviction(
        &self,
        node: &Node,
        pods: &[Pod],
        ds_pods: Vec<Pod>,
    ) -> DrainResult {
        let retry_until = Instant::now() + self.max_pod_eviction_time;
        let mut results: HashMap<String, PodEvictionResult> = pods
            .iter()
            .map(|pod| {
                (
                    pod.key(),
                    PodEvictionResult {
                        pod: pod.clone(),
                        timed_out: true,
                        err: None,
                    },
                )
            })
            .collect();

        let mut tasks = JoinSet::new();
        for (pod, is_daemonset) in pods
            .iter()
            .cloned()
            .map(|p| (p, false))
            .chain(ds_pods.into_iter().map(|p| (p, true)))
        {
            let attempt = EvictionAttempt {
                api: self.ctx.api.clone(),
                tracker: self.ctx.tracker.clone(),
                retry_until,
                retry_interval: self.eviction_retry_interval,
                max_termination: self.max_graceful_termination_sec,
            };
            tasks.spawn(async move {
                let result = attempt.evict(&pod, is_daemonset).await;
                (result, is_daemonset)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (result, is_daemonset) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(node = %node.name, error = %e, "Eviction task failed");
                    continue;
                }
            };
            if is_daemonset {
                if !result.was_evict_successful() {
                    warn!(
                        pod = %result.pod.key(),
                        node = %node.name,
                        error = ?result.err.as_ref().map(|e| e.to_string()),
                        "Failed to evict daemonset pod"
                    );
                }
                continue;
            }
            self.ctx.metrics.inc_evictions(result.was_evict_successful());
            results.insert(result.pod.key(), result);
        }

        let errors: Vec<&AutoscalerError> =
            results.values().filter_map(|r| r.err.as_ref()).collect();
        if !errors.is_empty() {
            let message = format!(
                "Failed to drain node {}, due to following errors: [{}]",
                node.name,
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            // expired calls keep the drain retryable on a later loop
            let err = if errors.iter().all(|e| e.kind == ErrorKind::TransientError) {
                AutoscalerError::transient(message)
            } else {
                AutoscalerError::api_call(message)
            };
            return Err(DrainError { err, results });
        }
        Ok(results)
    }

    async fn wait_pods_to_disappear(
        &self,
        node: &Node,
        pods: &[Pod],
        mut results: HashMap<String, PodEvictionResult>,
    ) -> DrainResult {
        let timeout = Duration::from_secs(self.max_graceful_termination_sec.max(0) as u64)
            + self.pod_eviction_headroom;
        let start = Instant::now();
        while start.elapsed() < timeout {
            let gone = match self.all_gone(node, pods).await {
                Ok(gone) => gone,
                Err(err) => {
                    warn!(node = %node.name, error = %err, "Stopped waiting for evicted pods");
                    return Err(DrainError { err, results });
                }
            };
            if gone {
                info!(node = %node.name, "All pods removed from node");
                for pod in pods {
                    if let Some(result) = results.get_mut(&pod.key()) {
                        result.timed_out = false;
                    }
                }
                return Ok(results);
            }
            sleep(POD_DISAPPEARANCE_POLL_INTERVAL).await;
        }

        for pod in pods {
            let lookup = with_deadline(
                self.ctx.api_call_timeout,
                &format!("getting pod {}", pod.key()),
                self.ctx.api.get_pod(&pod.namespace, &pod.name),
            )
            .await;
            let lookup = match lookup {
                Ok(lookup) => lookup,
                Err(expired) => {
                    results.insert(
                        pod.key(),
                        PodEvictionResult {
                            pod: pod.clone(),
                            timed_out: true,
                            err: Some(expired),
                        },
                    );
                    continue;
                }
            };
            match lookup {
                Ok(current) if current.node_name.as_deref() == Some(node.name.as_str()) => {
                    results.insert(
                        pod.key(),
                        PodEvictionResult {
                            pod: pod.clone(),
                            timed_out: true,
                            err: None,
                        },
                    );
                }
                Err(e) if !e.is_not_found() => {
                    results.insert(
                        pod.key(),
                        PodEvictionResult {
                            pod: pod.clone(),
                            timed_out: true,
                            err: Some(e.into()),
                        },
                    );
                }
                _ => {}
            }
        }
        Err(DrainError {
            err: AutoscalerError::transient(format!(
                "Failed to drain node {}: pods remaining after timeout",
                node.name
            )),
            results,
        })
    }

    /// Fails only when a lookup outlives its deadline
    async fn all_gone(&self, node: &Node, pods: &[Pod]) -> Result<bool> {
        for pod in pods {
            let lookup = with_deadline(
                self.ctx.api_call_timeout,
                &format!("getting pod {}", pod.key()),
                self.ctx.api.get_pod(&pod.namespace, &pod.name),
            )
            .await?;
            match lookup {
                Ok(current) if current.node_name.as_deref() == Some(node.name.as_str()) => {
                    debug!(pod = %pod.key(), "Not deleted yet");
                    return Ok(false);
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(pod = %pod.key(), error = %e, "Failed to check pod");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// One pod's eviction loop
struct EvictionAttempt {
    api: Arc<dyn ClusterApi>,
    tracker: Arc<NodeDeletionTracker>,
    retry_until: Instant,
    retry_interval: Duration,
    max_termination: i64,
}

impl EvictionAttempt {
    async fn evict(&self, pod: &Pod, is_daemonset: bool) -> PodEvictionResult {
        self.api.record_pod_event(
            pod,
            EventType::Normal,
            "ScaleDown",
            "deleting pod for node scale down",
        );
        let mut grace = pod.grace_period_secs();
        if self.max_termination > 0 && grace > self.max_termination {
            grace = self.max_termination;
        }

        let last_error = loop {
            // an expired attempt ends the eviction, it is not retried
            let window = self.retry_until.saturating_duration_since(Instant::now());
            let attempt = match with_deadline(
                window,
                &format!("evicting pod {}", pod.key()),
                self.api.evict_pod(pod, grace),
            )
            .await
            {
                Ok(attempt) => attempt,
                Err(expired) => break expired,
            };
            match attempt {
                Ok(()) => {
                    self.tracker.register_eviction(pod);
                    return PodEvictionResult {
                        pod: pod.clone(),
                        timed_out: false,
                        err: None,
                    };
                }
                Err(e) if e.is_not_found() => {
                    return PodEvictionResult {
                        pod: pod.clone(),
                        timed_out: false,
                        err: None,
                    };
                }
                Err(e) => {
                    debug!(pod = %pod.key(), error = %e, "Eviction rejected, retrying");
                    sleep(self.retry_interval).await;
                    if Instant::now() >= self.retry_until {
                        break AutoscalerError::api_call(format!(
                            "failed to evict pod {} within allowed timeout (last error: {})",
                            pod.key(),
                            e
                        ));
                    }
                }
            }
        };

        if !is_daemonset {
            error!(pod = %pod.key(), error = %last_error, "Failed to evict pod");
            self.api.record_pod_event(
                pod,
                EventType::Warning,
                "ScaleDownFailed",
                "failed to delete pod for ScaleDown",
            );
        }
        PodEvictionResult {
            pod: pod.clone(),
            timed_out: true,
            err: Some(last_error),
        }
    }
}

/// Waits up to `timeout` for the node to lose its delay-deletion annotations.
/// Timing out is not an error; failing to read the node, or a read outliving `call_timeout`, is.
pub async fn wait_for_delay_deletion(
    api: &dyn ClusterApi,
    node: &Node,
    timeout: Duration,
    call_timeout: Duration,
) -> Result<()> {
    if timeout.is_zero() || !node.has_delay_deletion_annotation() {
        return Ok(());
    }
    info!(node = %node.name, "Waiting for delay-deletion annotations to be removed");
    let deadline = Instant::now() + timeout;
    loop {
        sleep(DELAY_DELETION_POLL_INTERVAL).await;
        let fresh = with_deadline(
            call_timeout,
            &format!("getting node {}", node.name),
            api.get_node(&node.name),
        )
        .await?
        .map_err(|e| {
            AutoscalerError::api_call(format!("failed to get node {}: {}", node.name, e))
        })?;
        if !fresh.has_delay_deletion_annotation() {
            debug!(node = %node.name, "Delay-deletion annotations removed");
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(
                node = %node.name,
                timeout_secs = timeout.as_secs(),
                "Delay node deletion timed out, this might slow down scale down"
            );
            return Ok(());
        }
    }
}
