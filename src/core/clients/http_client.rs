use futures::future::join_all;
use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use reqwest::{Client, ClientBuilder, StatusCode, Url};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::path::Path;
use crate::core::metrics::exporter_metrics::EXPORTER_HTTP_REQUESTS;

/// After this many consecutive failures a node is excluded for a while
const CIRCUIT_BREAKER_THRESHOLD: usize = 5;
const CIRCUIT_BREAKER_DURATION: Duration = Duration::from_secs(60);
/// Different nodes tried per call. Backoff belongs to the caller.
const MAX_NODE_ATTEMPTS: u32 = 2;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NodePoolErrors {
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("No healthy nodes to call for: {0}")]
    NoHealthyNodes(String),

    #[error("No RPC nodes configured")]
    NoNodes,

    #[error("Invalid node url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// A named RPC endpoint as it appears in the configuration.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    pub name: String,
    pub url: String,
    pub health_endpoint: String,
}

impl NodeEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            health_endpoint: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    url: String,
    health_path: Path,
    healthy: bool,
    consecutive_failures: usize,
    circuit_breaker_until: Option<Instant>,
}

impl Node {
    fn new(endpoint: NodeEndpoint) -> Result<Self, NodePoolErrors> {
        let url = endpoint.url.trim_end_matches('/').to_string();
        let parsed = Url::parse(&url).map_err(|e| NodePoolErrors::InvalidUrl {
            url: endpoint.url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(NodePoolErrors::InvalidUrl {
                url: endpoint.url,
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        Ok(Node {
            name: endpoint.name,
            url,
            health_path: Path::from(endpoint.health_endpoint.as_str()),
            healthy: true,
            consecutive_failures: 0,
            circuit_breaker_until: None,
        })
    }

    fn is_available(&self, now: Instant) -> bool {
        self.healthy
            && self
                .circuit_breaker_until
                .map(|until| now > until)
                .unwrap_or(true)
    }

    fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD {
            self.circuit_breaker_until = Some(now + CIRCUIT_BREAKER_DURATION);
            warn!(
                "(NodePool) Node {} ({}) circuit breaker activated for {}s ({} consecutive failures)",
                self.name,
                self.url,
                CIRCUIT_BREAKER_DURATION.as_secs(),
                self.consecutive_failures
            );
        }
    }

    fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                "(NodePool) Node {} ({}) recovered from {} consecutive failures",
                self.name, self.url, self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.circuit_breaker_until = None;
    }

    async fn check_health(self, client: Client, network: String) -> bool {
        let health_url = construct_url(&self.url, &self.health_path);

        match client.get(&health_url).send().await {
            Ok(response) => {
                let status = response.status();
                EXPORTER_HTTP_REQUESTS
                    .with_label_values(&[
                        &self.url,
                        self.health_path.route(),
                        &status.as_u16().to_string(),
                        &network,
                    ])
                    .inc();
                if status == StatusCode::OK {
                    true
                } else {
                    warn!(
                        "(NodePool) Health check failed for {} with status {}",
                        health_url, status
                    );
                    false
                }
            }
            Err(e) => {
                warn!("(NodePool) Health check failed for {}: {}", health_url, e);
                false
            }
        }
    }
}

fn construct_url(node_url: &str, path: &Path) -> String {
    format!("{}{}", node_url.trim_end_matches('/'), path)
}

fn is_transient_error(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn extract_retry_after(res: &reqwest::Response) -> Option<Duration> {
    res.headers()
        .get("retry-after")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// CometBFT reports application errors (unknown height, pruned block...)
/// as a JSON-RPC error object, sometimes with HTTP 500. The node itself is fine.
pub(crate) fn is_rpc_error_body(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .map(|json| json.get("error").map(|e| !e.is_null()).unwrap_or(false))
        .unwrap_or(false)
}

///
/// NodePool spreads RPC calls over healthy nodes and tracks their health.
///
pub struct NodePool {
    nodes: Arc<RwLock<Vec<Node>>>,
    client: Client,
    network: String,
    health_check_interval: Duration,
}

impl NodePool {
    pub fn new(
        endpoints: Vec<NodeEndpoint>,
        health_check_interval: Option<Duration>,
        network: String,
        timeout: Option<Duration>,
    ) -> Result<Self, NodePoolErrors> {
        if endpoints.is_empty() {
            return Err(NodePoolErrors::NoNodes);
        }

        let nodes = endpoints
            .into_iter()
            .map(Node::new)
            .collect::<Result<Vec<_>, _>>()?;

        let client = ClientBuilder::new()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()?;

        Ok(Self {
            nodes: Arc::new(RwLock::new(nodes)),
            client,
            network,
            health_check_interval: health_check_interval.unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL),
        })
    }

    /// Pool with a single node, as used by the watcher when given one endpoint.
    pub fn single(rpc_endpoint: &str, network: String) -> Result<Self, NodePoolErrors> {
        Self::new(
            vec![NodeEndpoint::new("rpc", rpc_endpoint)],
            None,
            network,
            None,
        )
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Periodically probes every node until `shutdown` is cancelled.
    pub fn start_health_checks(&self, shutdown: CancellationToken) {
        let nodes = Arc::clone(&self.nodes);
        let client = self.client.clone();
        let network = self.network.clone();
        let interval = self.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot = nodes.read().await.clone();
                let results = join_all(
                    snapshot
                        .into_iter()
                        .map(|node| node.check_health(client.clone(), network.clone())),
                )
                .await;

                let mut nodes_write = nodes.write().await;
                let now = Instant::now();
                for (node, is_healthy) in nodes_write.iter_mut().zip(results) {
                    if is_healthy {
                        if !node.healthy {
                            info!(
                                "(NodePool) Node {} ({}) recovered and is now healthy",
                                node.name, node.url
                            );
                        }
                        node.healthy = true;
                        if node.circuit_breaker_until.map(|until| now > until).unwrap_or(false) {
                            node.record_success();
                        }
                    } else {
                        if node.healthy {
                            warn!(
                                "(NodePool) Node {} ({}) marked as UNHEALTHY",
                                node.name, node.url
                            );
                        }
                        node.healthy = false;
                        node.record_failure(now);
                    }
                }
            }
            debug!("(NodePool) Health checks stopped");
        });
    }

    async fn pick_node(&self, rng: &mut SmallRng) -> Option<(String, String)> {
        let nodes = self.nodes.read().await;
        let now = Instant::now();
        let available: Vec<&Node> = nodes.iter().filter(|n| n.is_available(now)).collect();
        available
            .choose(rng)
            .map(|node| (node.url.clone(), node.name.clone()))
    }

    async fn update_node(&self, node_url: &str, update: impl FnOnce(&mut Node)) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.iter_mut().find(|n| n.url == node_url) {
            update(node);
        }
    }

    /// GET `path` on one of the healthy nodes, trying another node on
    /// transport errors and transient statuses.
    pub async fn get(&self, path: Path) -> Result<String, NodePoolErrors> {
        debug!("Making call to {}", path);
        let mut rng = SmallRng::from_os_rng();

        for _ in 0..MAX_NODE_ATTEMPTS {
            let Some((node_url, node_name)) = self.pick_node(&mut rng).await else {
                break;
            };
            let url = construct_url(&node_url, &path);

            let res = match self.client.get(&url).send().await {
                Ok(res) => res,
                Err(e) => {
                    EXPORTER_HTTP_REQUESTS
                        .with_label_values(&[&node_url, path.route(), "error", &self.network])
                        .inc();
                    warn!("(NodePool) {} Network error for {}: {}", node_name, url, e);
                    self.update_node(&node_url, |n| n.record_failure(Instant::now()))
                        .await;
                    continue;
                }
            };

            let status = res.status();
            EXPORTER_HTTP_REQUESTS
                .with_label_values(&[
                    &node_url,
                    path.route(),
                    &status.as_u16().to_string(),
                    &self.network,
                ])
                .inc();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = extract_retry_after(&res).unwrap_or(Duration::from_secs(1));
                warn!(
                    "(NodePool) {} Rate limited (429) for {}. Retry after {}s",
                    node_name,
                    url,
                    retry_after.as_secs()
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if status.is_client_error() {
                warn!(
                    "(NodePool) {} Permanent error ({}): {}. Skipping this node",
                    node_name,
                    status.as_u16(),
                    url
                );
                continue;
            }

            let text = res.text().await?;

            if status == StatusCode::OK || is_rpc_error_body(&text) {
                self.update_node(&node_url, Node::record_success).await;
                return Ok(text);
            }

            if is_transient_error(status) {
                warn!(
                    "(NodePool) {} Transient error ({}): {}. Will retry on next node",
                    node_name,
                    status.as_u16(),
                    url
                );
                self.update_node(&node_url, |n| n.record_failure(Instant::now()))
                    .await;
                continue;
            }

            warn!(
                "(NodePool) {} Unexpected status {}: {}",
                node_name,
                status.as_u16(),
                url
            );
        }

        Err(NodePoolErrors::NoHealthyNodes(path.to_string()))
    }
}
