use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::watcher::NewBlockHandler;
use super::NewBlockData;
use crate::blockchains::cometbft::rpc::{BlockSource, ChainTip, RpcError};
use crate::blockchains::cometbft::types::{Block, BlockData, BlockHeader, BlockResults, TxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    Block,
    BlockResults,
}

pub fn block_time(height: u64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        + TimeDelta::seconds(height as i64)
}

pub fn sample_block(height: u64, txs: Vec<String>) -> Block {
    Block {
        header: BlockHeader {
            chain_id: "test-chain".to_string(),
            height: height.to_string(),
            time: block_time(height),
            proposer_address: "AB12".to_string(),
        },
        data: BlockData { txs: Some(txs) },
    }
}

pub fn sample_results(height: u64, results: Vec<TxResult>) -> BlockResults {
    BlockResults {
        height: height.to_string(),
        txs_results: Some(results),
    }
}

pub fn sample_data(height: u64) -> NewBlockData {
    NewBlockData {
        height,
        block: sample_block(height, vec![]),
        block_results: sample_results(height, vec![]),
    }
}

///
/// Scripted `BlockSource`: a fixed tip, optional per-height delays and
/// failure budgets, and a record of every call.
///
pub struct MockBlockSource {
    tip: AtomicU64,
    tip_fails: AtomicBool,
    max_height: Option<u64>,
    delays: HashMap<u64, Duration>,
    failures: Mutex<HashMap<(FetchKind, u64), u32>>,
    calls: Mutex<HashMap<(FetchKind, u64), u32>>,
    completed: Mutex<Vec<u64>>,
}

impl MockBlockSource {
    pub fn new(tip: u64) -> Self {
        Self {
            tip: AtomicU64::new(tip),
            tip_fails: AtomicBool::new(false),
            max_height: None,
            delays: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Heights above `max_height` are answered with a node error.
    pub fn with_max_height(mut self, max_height: u64) -> Self {
        self.max_height = Some(max_height);
        self
    }

    pub fn with_delay(mut self, height: u64, delay: Duration) -> Self {
        self.delays.insert(height, delay);
        self
    }

    pub fn with_failures(self, kind: FetchKind, height: u64, count: u32) -> Self {
        self.failures.lock().unwrap().insert((kind, height), count);
        self
    }

    pub fn failing_tip(self) -> Self {
        self.tip_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn block_calls(&self, height: u64) -> u32 {
        self.call_count(FetchKind::Block, height)
    }

    pub fn results_calls(&self, height: u64) -> u32 {
        self.call_count(FetchKind::BlockResults, height)
    }

    fn call_count(&self, kind: FetchKind, height: u64) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&(kind, height))
            .copied()
            .unwrap_or(0)
    }

    /// Heights whose block fetch succeeded, in completion order.
    pub fn completed_blocks(&self) -> Vec<u64> {
        self.completed.lock().unwrap().clone()
    }

    async fn attempt(&self, kind: FetchKind, height: u64) -> Result<(), RpcError> {
        *self.calls.lock().unwrap().entry((kind, height)).or_insert(0) += 1;

        tokio::task::yield_now().await;
        if kind == FetchKind::Block {
            if let Some(delay) = self.delays.get(&height) {
                tokio::time::sleep(*delay).await;
            }
        }

        if self.max_height.is_some_and(|max| height > max) {
            return Err(RpcError::Node {
                route: "/block".to_string(),
                code: -32603,
                message: "Internal error".to_string(),
                data: format!("height {} is not available yet", height),
            });
        }

        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&(kind, height)) {
            if *left > 0 {
                *left -= 1;
                return Err(RpcError::EmptyResult(format!("{:?} {}", kind, height)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlockSource for MockBlockSource {
    async fn latest_height_and_time(&self) -> Result<ChainTip, RpcError> {
        if self.tip_fails.load(Ordering::SeqCst) {
            return Err(RpcError::EmptyResult("/status".to_string()));
        }
        let height = self.tip.load(Ordering::SeqCst);
        Ok(ChainTip {
            height,
            time: Some(block_time(height)),
        })
    }

    async fn fetch_block(&self, height: u64) -> Result<Block, RpcError> {
        self.attempt(FetchKind::Block, height).await?;
        self.completed.lock().unwrap().push(height);
        Ok(sample_block(height, vec![]))
    }

    async fn fetch_block_results(&self, height: u64) -> Result<BlockResults, RpcError> {
        self.attempt(FetchKind::BlockResults, height).await?;
        Ok(sample_results(height, vec![]))
    }
}

/// Handler recording heights; can fail at one height or stall per block.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub seen: Arc<Mutex<Vec<u64>>>,
    pub fail_at: Option<u64>,
    pub delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn failing_at(height: u64) -> Self {
        Self {
            fail_at: Some(height),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn heights(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl NewBlockHandler for RecordingHandler {
    async fn handle(&mut self, data: &NewBlockData) -> anyhow::Result<()> {
        if self.fail_at == Some(data.height) {
            anyhow::bail!("refusing block {}", data.height);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().unwrap().push(data.height);
        Ok(())
    }
}
