use super::*;
use crate::error::ErrorKind;
use crate::models::{OwnerReference, Pod};
use crate::taints::has_to_be_deleted_taint;
use crate::testing::{FakeClusterApi, HangingCall, TestCloudProvider, TestNodeGroup};
use std::time::Duration;
use tokio::time::sleep;

struct Fixture {
    provider: Arc<TestCloudProvider>,
    api: Arc<FakeClusterApi>,
    tracker: Arc<NodeDeletionTracker>,
    actuator: Actuator,
    nodes: Vec<Node>,
}

fn fixture(count: usize, options: AutoscalingOptions) -> Fixture {
    let provider = Arc::new(TestCloudProvider::new());
    let api = Arc::new(FakeClusterApi::new());
    let tracker = Arc::new(NodeDeletionTracker::default());
    provider.add_node_group(TestNodeGroup::new("g1", 0, 10, count));
    let nodes: Vec<Node> = (0..count).map(|i| Node::new(format!("n{i}"))).collect();
    for node in &nodes {
        provider.add_node("g1", node);
        api.add_node(node.clone());
    }
    let actuator = Actuator::new(provider.clone(), api.clone(), tracker.clone(), &options);
    Fixture {
        provider,
        api,
        tracker,
        actuator,
        nodes,
    }
}

fn pod_on(name: &str, node: &str) -> Pod {
    let mut pod = Pod::new("default", name);
    pod.node_name = Some(node.to_string());
    pod.owner = Some(OwnerReference::new("ReplicaSet", "web", "web-uid"));
    pod
}

async fn wait_idle(tracker: &NodeDeletionTracker) {
    for _ in 0..1000 {
        let (empty, drained) = tracker.deletions_in_progress();
        if empty.is_empty() && drained.is_empty() {
            return;
        }
        sleep(Duration::from_secs(1)).await;
    }
    panic!("deletions did not finish");
}

#[tokio::test(start_paused = true)]
async fn test_empty_nodes_are_deleted() {
    let f = fixture(2, AutoscalingOptions::default());

    let status = f
        .actuator
        .start_deletion(&f.nodes, &[])
        .await
        .expect("deletion should start");
    assert_eq!(status.result, ScaleDownResult::NodeDeleteStarted);
    assert_eq!(status.nodes.len(), 2);
    assert!(status.nodes.iter().all(|n| !n.drain && n.node_group_id == "g1"));

    wait_idle(&f.tracker).await;
    let group = f.provider.group("g1").expect("group exists");
    let mut deleted = group.deleted_nodes();
    deleted.sort();
    assert_eq!(deleted, vec!["n0", "n1"]);
    let (results, _) = f.actuator.deletion_results();
    assert!(results.values().all(DeletionResult::is_ok));
}

#[tokio::test(start_paused = true)]
async fn test_nothing_admitted_is_no_op() {
    let f = fixture(1, AutoscalingOptions::default());
    let status = f
        .actuator
        .start_deletion(&[], &[])
        .await
        .expect("no-op");
    assert_eq!(status.result, ScaleDownResult::NoNodeDeleted);
    assert!(f.api.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_taint_failure_reverts_applied_taints() {
    let f = fixture(2, AutoscalingOptions::default());
    f.api.fail_taints("n1");

    let err = f
        .actuator
        .start_deletion(&f.nodes, &[])
        .await
        .expect_err("tainting fails");
    assert_eq!(err.kind, ErrorKind::ApiCallError);
    assert!(err.message.contains("couldn't taint 1 nodes with ToBeDeleted"));

    let n0 = f.api.node("n0").expect("node exists");
    assert!(!has_to_be_deleted_taint(&n0));
    assert_eq!(f.tracker.deletions_count("g1"), 0);
    let failures = f.api.events_with_reason("ScaleDownFailed");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].object, "n1");
}

#[tokio::test(start_paused = true)]
async fn test_empty_node_that_gained_pods_is_aborted() {
    let f = fixture(1, AutoscalingOptions::default());
    f.api.add_pod(pod_on("newcomer", "n0"));

    f.actuator
        .start_deletion(&f.nodes, &[])
        .await
        .expect("deletion should start");
    wait_idle(&f.tracker).await;

    let (results, _) = f.actuator.deletion_results();
    let result = &results["n0"];
    assert_eq!(result.kind, DeletionResultKind::InternalError);
    let err = result.err.as_ref().expect("error recorded");
    assert!(err.message.contains("new pods scheduled"));
    assert!(!has_to_be_deleted_taint(&f.api.node("n0").expect("node exists")));
    assert!(f.provider.group("g1").expect("group").deleted_nodes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_drained_node_is_evicted_then_deleted() {
    let f = fixture(1, AutoscalingOptions::default());
    f.api.add_pod(pod_on("web-1", "n0"));

    let status = f
        .actuator
        .start_deletion(&[], &f.nodes)
        .await
        .expect("deletion should start");
    assert!(status.nodes[0].drain);
    assert_eq!(f.actuator.check_status().drained, vec!["n0".to_string()]);

    wait_idle(&f.tracker).await;
    assert_eq!(f.api.eviction_attempts(), vec!["default/web-1"]);
    assert_eq!(f.provider.group("g1").expect("group").deleted_nodes(), vec!["n0"]);
    let snapshot = f.actuator.check_status();
    assert_eq!(snapshot.recent_evictions.len(), 1);
    assert!(snapshot.results["n0"].is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_drain_parallelism_is_respected() {
    let options = AutoscalingOptions {
        max_drain_parallelism: 1,
        ..Default::default()
    };
    let f = fixture(3, options);

    let status = f
        .actuator
        .start_deletion(&[], &f.nodes)
        .await
        .expect("deletion should start");
    assert_eq!(status.nodes.len(), 1);
    assert_eq!(status.nodes[0].node.name, "n0");
    assert!(f.api.node("n1").map(|n| !has_to_be_deleted_taint(&n)).unwrap_or(false));
    wait_idle(&f.tracker).await;
}

#[tokio::test(start_paused = true)]
async fn test_clear_results() {
    let f = fixture(1, AutoscalingOptions::default());
    f.actuator
        .start_deletion(&f.nodes, &[])
        .await
        .expect("deletion should start");
    wait_idle(&f.tracker).await;
    assert_eq!(f.actuator.deletion_results().0.len(), 1);

    f.actuator
        .clear_results_not_newer_than(Utc::now() + chrono::Duration::seconds(1));
    assert!(f.actuator.deletion_results().0.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hung_taint_calls_fail_the_round() {
    let options = AutoscalingOptions {
        api_call_timeout: Duration::from_secs(20),
        ..Default::default()
    };
    let f = fixture(2, options);
    f.api.hang(HangingCall::AddTaint);

    let started = Instant::now();
    let err = f
        .actuator
        .start_deletion(&f.nodes, &[])
        .await
        .expect_err("taint calls never answer");

    assert!(err.message.contains("couldn't taint 2 nodes with ToBeDeleted"));
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(started.elapsed() < Duration::from_secs(40));
    assert_eq!(f.tracker.deletions_count("g1"), 0);
    assert_eq!(f.api.events_with_reason("ScaleDownFailed").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hung_node_refresh_ends_the_deletion() {
    let f = fixture(1, AutoscalingOptions::default());
    f.api.hang(HangingCall::GetNode);

    f.actuator
        .start_deletion(&f.nodes, &[])
        .await
        .expect("deletion should start");
    wait_idle(&f.tracker).await;

    let (results, _) = f.actuator.deletion_results();
    let result = &results["n0"];
    assert_eq!(result.kind, DeletionResultKind::InternalError);
    assert_eq!(
        result.err.as_ref().map(|e| e.kind),
        Some(ErrorKind::TransientError)
    );
    assert!(!has_to_be_deleted_taint(&f.api.node("n0").expect("node exists")));
    assert!(f.provider.group("g1").expect("group").deleted_nodes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hung_eviction_releases_the_node() {
    let f = fixture(1, AutoscalingOptions::default());
    f.api.add_pod(pod_on("web-1", "n0"));
    f.api.hang(HangingCall::EvictPod);

    f.actuator
        .start_deletion(&[], &f.nodes)
        .await
        .expect("deletion should start");
    wait_idle(&f.tracker).await;

    let (results, _) = f.actuator.deletion_results();
    assert_eq!(results["n0"].kind, DeletionResultKind::FailedToEvictPods);
    assert_eq!(f.api.eviction_attempts(), vec!["default/web-1"]);
    assert!(!has_to_be_deleted_taint(&f.api.node("n0").expect("node exists")));
}
