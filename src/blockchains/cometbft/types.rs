use chrono::NaiveDateTime;
use serde::Deserialize;

/// JSON-RPC envelope returned by every CometBFT URI endpoint.
#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeader {
    pub chain_id: String,
    pub height: String,
    #[serde(with = "serde_naive_datetime")]
    pub time: NaiveDateTime,
    #[serde(default)]
    pub proposer_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlockData {
    #[serde(default)]
    pub txs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(default)]
    pub data: BlockData,
}

impl Block {
    pub fn height(&self) -> Result<u64, std::num::ParseIntError> {
        self.header.height.parse()
    }

    /// Base64 encoded transactions; CometBFT sends `null` for empty blocks.
    pub fn txs(&self) -> &[String] {
        self.data.txs.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockResult {
    pub block: Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockResults {
    pub height: String,
    #[serde(default)]
    pub txs_results: Option<Vec<TxResult>>,
}

impl BlockResults {
    pub fn txs_results(&self) -> &[TxResult] {
        self.txs_results.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub gas_wanted: String,
    #[serde(default)]
    pub gas_used: String,
}

impl TxResult {
    pub fn is_failed(&self) -> bool {
        self.code != 0
    }

    pub fn gas_wanted(&self) -> u64 {
        self.gas_wanted.parse().unwrap_or(0)
    }

    pub fn gas_used(&self) -> u64 {
        self.gas_used.parse().unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusResult {
    pub node_info: NodeInfo,
    pub sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub id: String,
    pub network: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub moniker: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyncInfo {
    pub catching_up: bool,
    pub latest_block_height: String,
    #[serde(with = "serde_naive_datetime")]
    pub latest_block_time: NaiveDateTime,
}

mod serde_naive_datetime {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer};
    const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";
    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, DATE_FORMAT).map_err(serde::de::Error::custom)
    }
}
