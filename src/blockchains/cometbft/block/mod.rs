use crate::blockchains::cometbft::types::{Block, BlockResults};

pub mod getter;
pub mod handler;
pub mod storage;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;

/// A fetched height: block and execution results, handed downstream once.
#[derive(Debug, Clone)]
pub struct NewBlockData {
    pub height: u64,
    pub block: Block,
    pub block_results: BlockResults,
}
