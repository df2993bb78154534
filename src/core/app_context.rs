use crate::blockchains::cometbft::rpc::CometRpc;
use crate::core::clients::http_client::NodePool;
use crate::core::config::{AppConfig, CHAIN_ID_FROM_NODE};
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    pub config: AppConfig,
    pub rpc: Arc<NodePool>,
    pub chain_id: String,
}

impl AppContext {
    pub fn new(config: AppConfig, rpc: Arc<NodePool>, chain_id: String) -> Self {
        Self {
            config,
            rpc,
            chain_id,
        }
    }

    /// Builds the RPC pool from the config and settles the chain id,
    /// asking the node when the config leaves it to `cometbft`.
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let rpc = NodePool::new(
            config.rpc_endpoints(),
            None,
            config.general.network.clone(),
            Some(config.rpc_timeout()),
        )
        .context("Could not build RPC node pool")?;
        let rpc = Arc::new(rpc);

        let chain_id = if config.general.chain_id == CHAIN_ID_FROM_NODE {
            let chain_id = CometRpc::new(Arc::clone(&rpc))
                .chain_id()
                .await
                .context("Could not fetch chain id from node")?;
            info!("[main] Chain id fetched from node: {}", chain_id);
            chain_id
        } else {
            config.general.chain_id.clone()
        };

        Ok(Self::new(config, rpc, chain_id))
    }

    pub fn block_source(&self) -> Arc<CometRpc> {
        Arc::new(CometRpc::new(Arc::clone(&self.rpc)))
    }
}
