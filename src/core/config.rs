use anyhow::{bail, Context};
use serde::Deserialize;
use std::time::Duration;

use crate::core::clients::http_client::NodeEndpoint;
use crate::core::retry::RetryPolicy;

/// Chain id value meaning "ask the node via /status"
pub const CHAIN_ID_FROM_NODE: &str = "cometbft";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{}', expected console or json", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub verbose: bool,
}

/// General configuration for the service
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub network: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: String,
    #[serde(default = "default_rpc_timeout_seconds")]
    pub rpc_timeout_seconds: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub nodes: NodesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub address: String,
    pub port: u16,
    pub path: String,
}

/// RPC node entry
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub url: String,
    #[serde(rename = "healthEndpoint", default = "default_health_endpoint")]
    pub health_endpoint: String,
}

impl From<&NodeConfig> for NodeEndpoint {
    fn from(node: &NodeConfig) -> Self {
        NodeEndpoint {
            name: node.name.clone(),
            url: node.url.clone(),
            health_endpoint: node.health_endpoint.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodesConfig {
    pub rpc: Vec<NodeConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.max_delay_ms))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlockReportsConfig {
    #[serde(default)]
    pub persistence: bool,
    #[serde(default = "default_window")]
    pub window: usize,
}

impl Default for BlockReportsConfig {
    fn default() -> Self {
        Self {
            persistence: false,
            window: default_window(),
        }
    }
}

/// Block watcher configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CoremonConfig {
    #[serde(default = "default_parallel_fetch_jobs")]
    pub parallel_fetch_jobs: usize,
    #[serde(default)]
    pub start_height: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub block_reports: BlockReportsConfig,
}

impl Default for CoremonConfig {
    fn default() -> Self {
        Self {
            parallel_fetch_jobs: default_parallel_fetch_jobs(),
            start_height: 0,
            retry: RetryConfig::default(),
            block_reports: BlockReportsConfig::default(),
        }
    }
}

/// Top-level config struct
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub coremon: CoremonConfig,
}

fn default_chain_id() -> String {
    CHAIN_ID_FROM_NODE.to_string()
}

fn default_rpc_timeout_seconds() -> u64 {
    30
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_window() -> usize {
    1000
}

fn default_parallel_fetch_jobs() -> usize {
    1
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl AppConfig {
    pub fn from_yaml(source: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(source).context("Failed to parse config")
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let source =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        Self::from_yaml(&source).with_context(|| format!("Invalid config file {}", path))
    }

    /// Applies `COREMON_*` overrides looked up through `lookup`
    /// (normally `std::env::var(..).ok()`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("COREMON_ENV") {
            self.general.network = env;
        }
        if let Some(chain_id) = lookup("COREMON_CHAIN_ID") {
            self.general.chain_id = chain_id;
        }
        if let Some(rpc) = lookup("COREMON_TENDERMINT_RPC") {
            self.general.nodes.rpc = vec![NodeConfig {
                name: "rpc".to_string(),
                url: rpc,
                health_endpoint: default_health_endpoint(),
            }];
        }
        if let Some(jobs) = lookup("COREMON_BLOCK_FETCH_JOBS") {
            self.coremon.parallel_fetch_jobs = jobs
                .trim()
                .parse()
                .with_context(|| format!("COREMON_BLOCK_FETCH_JOBS is not a number: {}", jobs))?;
        }
        if let Some(format) = lookup("COREMON_LOG_FORMAT") {
            self.general.logging.format = format.parse()?;
        }
        if let Some(verbose) = lookup("COREMON_LOG_VERBOSE") {
            self.general.logging.verbose = parse_bool(&verbose)
                .with_context(|| format!("COREMON_LOG_VERBOSE is not a boolean: {}", verbose))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.coremon.parallel_fetch_jobs == 0 {
            bail!("coremon.parallel_fetch_jobs must be at least 1");
        }
        if self.general.nodes.rpc.is_empty() {
            bail!("general.nodes.rpc must list at least one node");
        }
        if self.coremon.retry.attempts == 0 {
            bail!("coremon.retry.attempts must be at least 1");
        }
        Ok(())
    }

    pub fn rpc_endpoints(&self) -> Vec<NodeEndpoint> {
        self.general.nodes.rpc.iter().map(NodeEndpoint::from).collect()
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.general.rpc_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const FULL: &str = r#"
general:
  network: devnet
  chain_id: coreum-devnet-1
  rpc_timeout_seconds: 10
  logging:
    format: json
    verbose: true
  metrics:
    address: 0.0.0.0
    port: 9100
    path: /metrics
  nodes:
    rpc:
      - name: local
        url: http://localhost:26657
        healthEndpoint: /status
coremon:
  parallel_fetch_jobs: 4
  start_height: 1200
  retry:
    attempts: 5
    max_delay_ms: 2000
  block_reports:
    persistence: true
    window: 50
"#;

    const MINIMAL: &str = r#"
general:
  network: local
  metrics: { address: 127.0.0.1, port: 9100, path: /metrics }
  nodes:
    rpc:
      - { name: local, url: "http://localhost:26657" }
"#;

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_yaml(FULL).unwrap();
        assert_eq!(config.general.chain_id, "coreum-devnet-1");
        assert_eq!(config.general.logging.format, LogFormat::Json);
        assert!(config.general.logging.verbose);
        assert_eq!(config.coremon.parallel_fetch_jobs, 4);
        assert_eq!(config.coremon.start_height, 1200);
        assert_eq!(
            config.coremon.retry.policy().max_delay,
            Duration::from_secs(2)
        );
        assert!(config.coremon.block_reports.persistence);
        assert_eq!(config.rpc_endpoints()[0].health_endpoint, "/status");
        assert_eq!(config.rpc_timeout(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.general.chain_id, CHAIN_ID_FROM_NODE);
        assert_eq!(config.general.logging.format, LogFormat::Console);
        assert_eq!(config.coremon.parallel_fetch_jobs, 1);
        assert_eq!(config.coremon.retry.attempts, 10);
        assert_eq!(config.coremon.block_reports.window, 1000);
        assert_eq!(config.general.nodes.rpc[0].health_endpoint, "/health");
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("COREMON_ENV", "mainnet"),
            ("COREMON_CHAIN_ID", "coreum-mainnet-1"),
            ("COREMON_TENDERMINT_RPC", "https://rpc.example.com:443"),
            ("COREMON_BLOCK_FETCH_JOBS", "8"),
            ("COREMON_LOG_FORMAT", "JSON"),
            ("COREMON_LOG_VERBOSE", "true"),
        ]);
        let mut config = AppConfig::from_yaml(MINIMAL).unwrap();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.general.network, "mainnet");
        assert_eq!(config.general.chain_id, "coreum-mainnet-1");
        assert_eq!(config.general.nodes.rpc.len(), 1);
        assert_eq!(config.general.nodes.rpc[0].url, "https://rpc.example.com:443");
        assert_eq!(config.coremon.parallel_fetch_jobs, 8);
        assert_eq!(config.general.logging.format, LogFormat::Json);
        assert!(config.general.logging.verbose);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = AppConfig::from_yaml(MINIMAL).unwrap();
        let result = config.apply_overrides(|key| {
            (key == "COREMON_BLOCK_FETCH_JOBS").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::from_yaml(MINIMAL).unwrap();
        config.coremon.parallel_fetch_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_yaml(MINIMAL).unwrap();
        config.general.nodes.rpc.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_yaml(MINIMAL).unwrap();
        config.coremon.retry.attempts = 0;
        assert!(config.validate().is_err());
    }
}
