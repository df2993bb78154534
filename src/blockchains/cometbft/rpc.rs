use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

use crate::blockchains::cometbft::types::{
    Block, BlockResult, BlockResults, RpcResponse, StatusResult,
};
use crate::core::clients::http_client::{NodePool, NodePoolErrors};
use crate::core::clients::path::Path;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(#[from] NodePoolErrors),

    #[error("Could not decode {route} response: {source}")]
    Decode {
        route: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Node returned error {code} for {route}: {message} {data}")]
    Node {
        route: String,
        code: i64,
        message: String,
        data: String,
    },

    #[error("Empty result for {0}")]
    EmptyResult(String),

    #[error("Invalid height '{0}' in response")]
    InvalidHeight(String),

    #[error("Requested block {requested} but node returned {returned}")]
    HeightMismatch { requested: u64, returned: u64 },
}

/// Chain head as reported by `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    /// `None` while the node reports the zero timestamp
    pub time: Option<NaiveDateTime>,
}

///
/// Source of finalized blocks. Each call is a single attempt;
/// retrying is up to the caller.
///
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn latest_height_and_time(&self) -> Result<ChainTip, RpcError>;
    async fn fetch_block(&self, height: u64) -> Result<Block, RpcError>;
    async fn fetch_block_results(&self, height: u64) -> Result<BlockResults, RpcError>;
}

/// `BlockSource` over CometBFT's URI RPC.
pub struct CometRpc {
    pool: Arc<NodePool>,
}

impl CometRpc {
    pub fn new(pool: Arc<NodePool>) -> Self {
        Self { pool }
    }

    async fn query<T: DeserializeOwned>(&self, path: Path) -> Result<T, RpcError> {
        let body = self.pool.get(path.clone()).await?;
        decode(&path, &body)
    }

    /// Network name the node reports, used as chain id.
    pub async fn chain_id(&self) -> Result<String, RpcError> {
        let status: StatusResult = self.query(Path::status()).await?;
        Ok(status.node_info.network)
    }
}

fn decode<T: DeserializeOwned>(path: &Path, body: &str) -> Result<T, RpcError> {
    let response: RpcResponse<T> = serde_json::from_str(body).map_err(|e| RpcError::Decode {
        route: path.route().to_string(),
        source: e,
    })?;

    if let Some(error) = response.error {
        return Err(RpcError::Node {
            route: path.route().to_string(),
            code: error.code,
            message: error.message,
            data: error.data.unwrap_or_default(),
        });
    }

    response
        .result
        .ok_or_else(|| RpcError::EmptyResult(path.to_string()))
}

fn parse_height(raw: &str) -> Result<u64, RpcError> {
    raw.parse()
        .map_err(|_| RpcError::InvalidHeight(raw.to_string()))
}

#[async_trait]
impl BlockSource for CometRpc {
    async fn latest_height_and_time(&self) -> Result<ChainTip, RpcError> {
        let status: StatusResult = self.query(Path::status()).await?;
        let height = parse_height(&status.sync_info.latest_block_height)?;
        let time = status.sync_info.latest_block_time;
        Ok(ChainTip {
            height,
            time: (time.year() > 1).then_some(time),
        })
    }

    async fn fetch_block(&self, height: u64) -> Result<Block, RpcError> {
        let result: BlockResult = self.query(Path::block(height)).await?;
        let returned = parse_height(&result.block.header.height)?;
        if returned != height {
            return Err(RpcError::HeightMismatch {
                requested: height,
                returned,
            });
        }
        Ok(result.block)
    }

    async fn fetch_block_results(&self, height: u64) -> Result<BlockResults, RpcError> {
        self.query(Path::block_results(height)).await
    }
}
