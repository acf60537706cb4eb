//! HTTP client for the Scaleway Kapsule API

use crate::cloudprovider::CloudProviderError;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.scaleway.com";

/// Fixed page size for listings; a shorter page ends the pagination
pub const PAGE_SIZE: usize = 100;

pub const DEFAULT_CACHE_CONTROL: Duration = Duration::from_secs(30);

/// Also bounds the TLS handshake and the wait for response headers
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_USER_AGENT: &str = "cluster-autoscaler";

/// Contents of the cloud-config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub user_agent: String,
    /// Refresh interval used when the API sends no usable Cache-Control header
    #[serde(default)]
    pub default_cache_control_secs: Option<u64>,
}

impl CloudConfig {
    /// Load the JSON cloud-config file, then apply `CLUSTER_ID`, `SCW_SECRET_KEY`, `SCW_REGION`
    /// and `SCW_API_URL` from the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Json),
            );
        }
        for (key, var) in [
            ("cluster_id", "CLUSTER_ID"),
            ("secret_key", "SCW_SECRET_KEY"),
            ("region", "SCW_REGION"),
            ("api_url", "SCW_API_URL"),
        ] {
            builder = builder.set_override_option(key, std::env::var(var).ok())?;
        }

        builder
            .build()
            .context("Failed to read cloud config")?
            .try_deserialize()
            .context("Failed to parse cloud config")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Ready,
    Deleting,
    Deleted,
    Scaling,
    Warning,
    Locked,
    Upgrading,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Creating,
    Starting,
    Registering,
    NotReady,
    Ready,
    Deleting,
    Deleted,
    Locked,
    Rebooting,
    CreationError,
    Upgrading,
    #[default]
    #[serde(other)]
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Creating => "creating",
            NodeStatus::Starting => "starting",
            NodeStatus::Registering => "registering",
            NodeStatus::NotReady => "not_ready",
            NodeStatus::Ready => "ready",
            NodeStatus::Deleting => "deleting",
            NodeStatus::Deleted => "deleted",
            NodeStatus::Locked => "locked",
            NodeStatus::Rebooting => "rebooting",
            NodeStatus::CreationError => "creation_error",
            NodeStatus::Upgrading => "upgrading",
        }
    }
}

/// An autoscaler view of a Kapsule pool, including its node template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: PoolStatus,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub autoscaling: bool,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub min_size: u32,
    #[serde(default)]
    pub max_size: u32,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub node_price_per_hour: f64,
    #[serde(default)]
    pub capacity: HashMap<String, i64>,
    #[serde(default)]
    pub allocatable: HashMap<String, i64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// `key: "value:Effect"`
    #[serde(default)]
    pub taints: HashMap<String, String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An instance running in a Kapsule pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KapsuleNode {
    pub id: String,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ListPoolsResponse {
    #[serde(default)]
    pools: Vec<Pool>,
}

#[derive(Debug, Deserialize)]
struct ListNodesResponse {
    #[serde(default)]
    nodes: Vec<KapsuleNode>,
}

/// Calls made by the Scaleway node-group adapter. Listings return the cache hint
/// advertised by the API alongside the items.
#[async_trait]
pub trait KapsuleApi: Send + Sync {
    async fn list_pools(
        &self,
        cluster_id: &str,
    ) -> Result<(Duration, Vec<Pool>), CloudProviderError>;

    async fn list_nodes(
        &self,
        cluster_id: &str,
    ) -> Result<(Duration, Vec<KapsuleNode>), CloudProviderError>;

    /// Resizes the pool; the returned pool is expected to be `Scaling`
    async fn update_pool(&self, pool_id: &str, size: u32) -> Result<Pool, CloudProviderError>;

    /// Starts the asynchronous deletion; the returned node is expected to be `Deleting`
    async fn delete_node(&self, node_id: &str) -> Result<KapsuleNode, CloudProviderError>;
}

/// Parses `max-age` out of a Cache-Control header value, falling back to `default`
pub fn parse_cache_control(value: Option<&str>, default: Duration) -> Duration {
    value
        .and_then(|v| {
            v.split(',')
                .map(str::trim)
                .find_map(|directive| directive.strip_prefix("max-age="))
        })
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Kapsule API client
#[derive(Debug, Clone)]
pub struct KapsuleClient {
    http: Client,
    api_url: String,
    token: String,
    user_agent: String,
    region: String,
    default_cache_control: Duration,
}

impl KapsuleClient {
    pub fn new(config: &CloudConfig) -> Result<Self, CloudProviderError> {
        if config.cluster_id.is_empty() {
            return Err(CloudProviderError::MissingClusterId);
        }
        if config.secret_key.is_empty() {
            return Err(CloudProviderError::MissingSecretKey);
        }
        if config.region.is_empty() {
            return Err(CloudProviderError::MissingRegion);
        }

        let api_url = if config.api_url.is_empty() {
            DEFAULT_API_URL.to_string()
        } else {
            config.api_url.trim_end_matches('/').to_string()
        };
        let agent = if config.user_agent.is_empty() {
            DEFAULT_USER_AGENT
        } else {
            config.user_agent.as_str()
        };

        let http = Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .connect_timeout(DIAL_TIMEOUT)
            .build()
            .map_err(|e| CloudProviderError::Internal(format!("could not build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_url,
            token: config.secret_key.clone(),
            user_agent: format!(
                "{}/{} cluster-id/{}",
                agent,
                env!("CARGO_PKG_VERSION"),
                config.cluster_id
            ),
            region: config.region.clone(),
            default_cache_control: config
                .default_cache_control_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CACHE_CONTROL),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<(T, HeaderMap), CloudProviderError> {
        let mut url = Url::parse(&format!("{}{}", self.api_url, path))
            .map_err(|e| CloudProviderError::InvalidArgument(format!("invalid URL: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header("X-Auth-Token", &self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        debug!(method = %method, url = %url, "Calling Kapsule API");
        let response = request
            .send()
            .await
            .map_err(|e| CloudProviderError::Transport(format!("error executing request: {e}")))?;

        let status = response.status();
        let headers = response.headers().clone();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mime = content_type.split(';').next().map(str::trim).unwrap_or("");
        if mime != "application/json" {
            return Err(CloudProviderError::Framing(format!(
                "unexpected content-type: {} with status: {}",
                content_type, status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CloudProviderError::Transport(format!("error reading response: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(
                status,
                method.as_str(),
                url.as_str(),
                error_message(&bytes),
            ));
        }

        let value = serde_json::from_slice(&bytes).map_err(|e| {
            CloudProviderError::Framing(format!(
                "could not parse {} response body: {}",
                content_type, e
            ))
        })?;
        Ok((value, headers))
    }

    async fn paginate<R, T>(
        &self,
        path: &str,
        items: impl Fn(R) -> Vec<T> + Send,
    ) -> Result<(Duration, Vec<T>), CloudProviderError>
    where
        R: DeserializeOwned + Send,
        T: Send,
    {
        let mut all = Vec::new();
        let mut cache_hint = None;
        let mut page = 1u32;
        loop {
            let query = [
                ("page", page.to_string()),
                ("page_size", PAGE_SIZE.to_string()),
            ];
            let (response, headers): (R, HeaderMap) =
                self.request(Method::GET, path, &query, None).await?;
            if cache_hint.is_none() {
                let header = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok());
                cache_hint = Some(parse_cache_control(header, self.default_cache_control));
            }

            let batch = items(response);
            let count = batch.len();
            all.extend(batch);
            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok((cache_hint.unwrap_or(self.default_cache_control), all))
    }
}

fn classify_status(status: StatusCode, method: &str, url: &str, message: String) -> CloudProviderError {
    let code = status.as_u16();
    let (method, url) = (method.to_string(), url.to_string());
    match code {
        400..=499 => CloudProviderError::ClientSide {
            status: code,
            method,
            url,
            message,
        },
        500..=599 => CloudProviderError::ServerSide {
            status: code,
            method,
            url,
            message,
        },
        _ => CloudProviderError::OtherHttp {
            status: code,
            method,
            url,
            message,
        },
    }
}

/// Scaleway errors carry a `message` field; fall back to the raw body
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

#[async_trait]
impl KapsuleApi for KapsuleClient {
    async fn list_pools(
        &self,
        cluster_id: &str,
    ) -> Result<(Duration, Vec<Pool>), CloudProviderError> {
        if cluster_id.is_empty() {
            return Err(CloudProviderError::InvalidArgument(
                "clusterID cannot be empty".into(),
            ));
        }
        let path = format!(
            "/k8s/v1/regions/{}/clusters/{}/pools-autoscaler",
            self.region, cluster_id
        );
        self.paginate(&path, |r: ListPoolsResponse| r.pools).await
    }

    async fn list_nodes(
        &self,
        cluster_id: &str,
    ) -> Result<(Duration, Vec<KapsuleNode>), CloudProviderError> {
        if cluster_id.is_empty() {
            return Err(CloudProviderError::InvalidArgument(
                "clusterID cannot be empty".into(),
            ));
        }
        let path = format!(
            "/k8s/v1/regions/{}/clusters/{}/nodes",
            self.region, cluster_id
        );
        self.paginate(&path, |r: ListNodesResponse| r.nodes).await
    }

    async fn update_pool(&self, pool_id: &str, size: u32) -> Result<Pool, CloudProviderError> {
        if pool_id.is_empty() {
            return Err(CloudProviderError::InvalidArgument(
                "poolID cannot be empty".into(),
            ));
        }
        let path = format!("/k8s/v1/regions/{}/pools/{}", self.region, pool_id);
        let body = serde_json::json!({ "size": size });
        let (pool, _) = self.request(Method::PATCH, &path, &[], Some(body)).await?;
        Ok(pool)
    }

    async fn delete_node(&self, node_id: &str) -> Result<KapsuleNode, CloudProviderError> {
        if node_id.is_empty() {
            return Err(CloudProviderError::InvalidArgument(
                "nodeID cannot be empty".into(),
            ));
        }
        let path = format!("/k8s/v1/regions/{}/nodes/{}", self.region, node_id);
        let (node, _) = self.request(Method::DELETE, &path, &[], None).await?;
        Ok(node)
    }
}
