//! Scaleway Kapsule node-group adapter
//!
//! Pools with autoscaling enabled become node groups. The view is refreshed from the API no more
//! often than the Cache-Control hint the API advertises.

pub mod client;
pub mod node_group;

pub use client::{
    parse_cache_control, CloudConfig, KapsuleApi, KapsuleClient, KapsuleNode, NodeStatus, Pool,
    PoolStatus, DEFAULT_API_URL, PAGE_SIZE,
};
pub use node_group::{instance_status, ScalewayNodeGroup};

use crate::cloudprovider::{CloudProvider, CloudProviderError, NodeGroup, ResourceLimiter};
use crate::models::Node;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PROVIDER_NAME: &str = "scaleway";

/// Label carried by GPU nodes
pub const GPU_LABEL: &str = "k8s.scw.cloud/gpu";

/// Interval used until the API has advertised one
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

struct RefreshState {
    node_groups: Vec<Arc<ScalewayNodeGroup>>,
    last_refresh: Option<DateTime<Utc>>,
    refresh_interval: Duration,
    last_error: Option<CloudProviderError>,
}

pub struct ScalewayCloudProvider {
    client: Arc<dyn KapsuleApi>,
    cluster_id: String,
    resource_limiter: ResourceLimiter,
    state: RwLock<RefreshState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ScalewayCloudProvider {
    pub fn new(
        client: Arc<dyn KapsuleApi>,
        cluster_id: impl Into<String>,
        resource_limiter: ResourceLimiter,
    ) -> Self {
        Self {
            client,
            cluster_id: cluster_id.into(),
            resource_limiter,
            state: RwLock::new(RefreshState {
                node_groups: Vec::new(),
                last_refresh: None,
                refresh_interval: DEFAULT_REFRESH_INTERVAL,
                last_error: None,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Builds the HTTP client from the cloud config
    pub fn from_config(
        config: &CloudConfig,
        resource_limiter: ResourceLimiter,
    ) -> Result<Self, CloudProviderError> {
        let client = KapsuleClient::new(config)?;
        info!(
            cluster_id = %config.cluster_id,
            region = %config.region,
            api_url = %client.api_url(),
            "Scaleway cloud provider configured"
        );
        Ok(Self::new(
            Arc::new(client),
            config.cluster_id.clone(),
            resource_limiter,
        ))
    }

    fn read(&self) -> RwLockReadGuard<'_, RefreshState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RefreshState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn refresh_interval(&self) -> Duration {
        self.read().refresh_interval
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.read().last_refresh
    }

    pub fn last_refresh_error(&self) -> Option<CloudProviderError> {
        self.read().last_error.clone()
    }

    /// Every node registered through Kapsule carries a provider id
    pub fn has_instance(&self, node: &Node) -> bool {
        !node.provider_id.is_empty()
    }

    pub fn pod_price(&self) -> f64 {
        0.0
    }

    pub fn scaleway_node_groups(&self) -> Vec<Arc<ScalewayNodeGroup>> {
        self.read().node_groups.clone()
    }

    fn group_of(&self, node: &Node) -> Option<Arc<ScalewayNodeGroup>> {
        self.read()
            .node_groups
            .iter()
            .find(|g| g.has_node(&node.provider_id))
            .cloned()
    }

    /// Refreshes the view unless the last attempt is younger than the refresh interval.
    /// A failed attempt is remembered and returned until the interval elapses.
    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<(), CloudProviderError> {
        let _guard = self.refresh_lock.lock().await;
        {
            let state = self.read();
            if let Some(last) = state.last_refresh {
                let interval = ChronoDuration::from_std(state.refresh_interval)
                    .unwrap_or_else(|_| ChronoDuration::seconds(i64::from(u32::MAX)));
                if now < last + interval {
                    debug!(last_refresh = %last, "Using cached node groups");
                    return match &state.last_error {
                        Some(e) => Err(e.clone()),
                        None => Ok(()),
                    };
                }
            }
        }

        let result = self.fetch().await;
        let mut state = self.write();
        state.last_refresh = Some(now);
        match result {
            Ok((interval, node_groups)) => {
                info!(
                    node_groups = node_groups.len(),
                    refresh_interval_secs = interval.as_secs(),
                    "Refreshed node groups"
                );
                state.node_groups = node_groups;
                state.refresh_interval = interval;
                state.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to refresh node groups");
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    async fn fetch(&self) -> Result<(Duration, Vec<Arc<ScalewayNodeGroup>>), CloudProviderError> {
        let (pools_hint, pools) = self.client.list_pools(&self.cluster_id).await?;
        let (nodes_hint, nodes) = self.client.list_nodes(&self.cluster_id).await?;

        let known_pools: HashSet<String> = pools.iter().map(|p| p.id.clone()).collect();
        let mut members: HashMap<String, Vec<KapsuleNode>> = pools
            .iter()
            .filter(|p| p.autoscaling)
            .map(|p| (p.id.clone(), Vec::new()))
            .collect();

        for node in nodes {
            match members.get_mut(&node.pool_id) {
                Some(list) => list.push(node),
                None if known_pools.contains(&node.pool_id) => {
                    debug!(node = %node.name, pool_id = %node.pool_id, "Node of a pool without autoscaling");
                }
                None => {
                    warn!(
                        node = %node.name,
                        pool_id = %node.pool_id,
                        "Node belongs to an unknown pool, ignoring it"
                    );
                }
            }
        }

        let mut node_groups: Vec<Arc<ScalewayNodeGroup>> = pools
            .into_iter()
            .filter(|p| p.autoscaling)
            .map(|pool| {
                let nodes = members.remove(&pool.id).unwrap_or_default();
                Arc::new(ScalewayNodeGroup::new(self.client.clone(), pool, nodes))
            })
            .collect();
        node_groups.sort_by_key(|g| g.id());

        Ok((pools_hint.min(nodes_hint), node_groups))
    }
}

#[async_trait]
impl CloudProvider for ScalewayCloudProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>> {
        self.read()
            .node_groups
            .iter()
            .map(|g| g.clone() as Arc<dyn NodeGroup>)
            .collect()
    }

    fn node_group_for_node(
        &self,
        node: &Node,
    ) -> Result<Option<Arc<dyn NodeGroup>>, CloudProviderError> {
        Ok(self.group_of(node).map(|g| g as Arc<dyn NodeGroup>))
    }

    /// Whole hours are billed: the duration is rounded up
    fn node_price(
        &self,
        node: &Node,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64, CloudProviderError> {
        let Some(group) = self.group_of(node) else {
            return Ok(0.0);
        };
        let hours = ((end - start).num_seconds().max(0) as f64 / 3600.0).ceil();
        Ok(hours * group.price_per_hour())
    }

    fn gpu_label(&self) -> &str {
        GPU_LABEL
    }

    fn resource_limiter(&self) -> Result<ResourceLimiter, CloudProviderError> {
        Ok(self.resource_limiter.clone())
    }

    async fn refresh(&self) -> Result<(), CloudProviderError> {
        self.refresh_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeApi {
        pools: Mutex<Result<(Duration, Vec<Pool>), CloudProviderError>>,
        nodes: Mutex<Result<(Duration, Vec<KapsuleNode>), CloudProviderError>>,
        list_pools_calls: AtomicUsize,
        list_nodes_calls: AtomicUsize,
    }

    impl FakeApi {
        fn new(pools: Vec<Pool>, nodes: Vec<KapsuleNode>, hint: Duration) -> Self {
            Self {
                pools: Mutex::new(Ok((hint, pools))),
                nodes: Mutex::new(Ok((hint, nodes))),
                list_pools_calls: AtomicUsize::new(0),
                list_nodes_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KapsuleApi for FakeApi {
        async fn list_pools(
            &self,
            _cluster_id: &str,
        ) -> Result<(Duration, Vec<Pool>), CloudProviderError> {
            self.list_pools_calls.fetch_add(1, Ordering::SeqCst);
            self.pools.lock().unwrap().clone()
        }

        async fn list_nodes(
            &self,
            _cluster_id: &str,
        ) -> Result<(Duration, Vec<KapsuleNode>), CloudProviderError> {
            self.list_nodes_calls.fetch_add(1, Ordering::SeqCst);
            self.nodes.lock().unwrap().clone()
        }

        async fn update_pool(&self, pool_id: &str, size: u32) -> Result<Pool, CloudProviderError> {
            Ok(Pool {
                id: pool_id.into(),
                size,
                ..Default::default()
            })
        }

        async fn delete_node(&self, node_id: &str) -> Result<KapsuleNode, CloudProviderError> {
            Ok(KapsuleNode {
                id: node_id.into(),
                status: NodeStatus::Deleting,
                ..Default::default()
            })
        }
    }

    fn pool(id: &str, autoscaling: bool, size: u32) -> Pool {
        Pool {
            id: id.into(),
            name: format!("pool-{id}"),
            autoscaling,
            size,
            min_size: 1,
            max_size: 10,
            node_price_per_hour: 0.1,
            ..Default::default()
        }
    }

    fn kapsule_node(id: &str, pool_id: &str) -> KapsuleNode {
        KapsuleNode {
            id: id.into(),
            pool_id: pool_id.into(),
            provider_id: format!("scaleway://instance/fr-par-1/{id}"),
            name: id.into(),
            status: NodeStatus::Ready,
            ..Default::default()
        }
    }

    fn k8s_node(id: &str) -> Node {
        let mut node = Node::new(id);
        node.provider_id = format!("scaleway://instance/fr-par-1/{id}");
        node
    }

    fn provider(api: Arc<FakeApi>) -> ScalewayCloudProvider {
        ScalewayCloudProvider::new(api, "cluster-1", ResourceLimiter::default())
    }

    #[tokio::test]
    async fn test_refresh_builds_autoscaled_groups_only() {
        let api = Arc::new(FakeApi::new(
            vec![pool("p1", true, 2), pool("p2", false, 1)],
            vec![
                kapsule_node("a", "p1"),
                kapsule_node("b", "p1"),
                kapsule_node("c", "p2"),
                kapsule_node("d", "unknown"),
            ],
            Duration::from_secs(30),
        ));
        let provider = provider(api);
        provider.refresh().await.unwrap();

        let groups = provider.scaleway_node_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id(), "p1");
        assert_eq!(groups[0].node_count(), 2);
        assert_eq!(provider.refresh_interval(), Duration::from_secs(30));

        let group = provider.node_group_for_node(&k8s_node("a")).unwrap();
        assert_eq!(group.map(|g| g.id()), Some("p1".to_string()));
        assert!(provider.node_group_for_node(&k8s_node("c")).unwrap().is_none());
        assert!(provider.node_group_for_node(&k8s_node("d")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_honours_cache_hint() {
        let api = Arc::new(FakeApi::new(
            vec![pool("p1", true, 1)],
            vec![kapsule_node("a", "p1")],
            Duration::from_secs(30),
        ));
        let provider = provider(api.clone());
        let t0 = Utc::now();

        provider.refresh_at(t0).await.unwrap();
        provider
            .refresh_at(t0 + ChronoDuration::seconds(5))
            .await
            .unwrap();
        assert_eq!(api.list_pools_calls.load(Ordering::SeqCst), 1);

        provider
            .refresh_at(t0 + ChronoDuration::seconds(31))
            .await
            .unwrap();
        assert_eq!(api.list_pools_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.list_nodes_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_cached() {
        let api = Arc::new(FakeApi::new(vec![], vec![], Duration::from_secs(30)));
        *api.nodes.lock().unwrap() = Err(CloudProviderError::ServerSide {
            status: 500,
            method: "GET".into(),
            url: "http://api/nodes".into(),
            message: "boom".into(),
        });
        let provider = provider(api.clone());
        let t0 = Utc::now();

        let err = provider.refresh_at(t0).await.unwrap_err();
        assert_eq!(provider.last_refresh_error(), Some(err.clone()));

        // cached failure, no new calls
        let again = provider
            .refresh_at(t0 + ChronoDuration::seconds(1))
            .await
            .unwrap_err();
        assert_eq!(again, err);
        assert_eq!(api.list_pools_calls.load(Ordering::SeqCst), 1);

        *api.nodes.lock().unwrap() = Ok((Duration::from_secs(30), vec![]));
        provider
            .refresh_at(t0 + ChronoDuration::seconds(61))
            .await
            .unwrap();
        assert!(provider.last_refresh_error().is_none());
    }

    #[tokio::test]
    async fn test_node_price_rounds_hours_up() {
        let api = Arc::new(FakeApi::new(
            vec![pool("p1", true, 1)],
            vec![kapsule_node("a", "p1")],
            Duration::from_secs(30),
        ));
        let provider = provider(api);
        provider.refresh().await.unwrap();

        let start = Utc::now();
        let end = start + ChronoDuration::minutes(150);
        let price = provider.node_price(&k8s_node("a"), start, end).unwrap();
        assert!((price - 0.3).abs() < 1e-9);

        assert_eq!(
            provider.node_price(&k8s_node("zz"), start, end).unwrap(),
            0.0
        );
    }

    #[test]
    fn test_static_capabilities() {
        let provider = provider(Arc::new(FakeApi::new(vec![], vec![], Duration::ZERO)));
        assert_eq!(provider.name(), "scaleway");
        assert_eq!(provider.gpu_label(), GPU_LABEL);
        assert_eq!(provider.pod_price(), 0.0);
        assert!(provider.available_machine_types().unwrap().is_empty());
        assert!(matches!(
            provider.new_node_group("GP1-XS"),
            Err(CloudProviderError::NotImplemented)
        ));
        assert!(provider.has_instance(&k8s_node("a")));
        assert!(!provider.has_instance(&Node::new("bare")));
    }
}
