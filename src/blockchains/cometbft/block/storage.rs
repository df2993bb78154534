use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::Serialize;
use std::collections::VecDeque;

use super::handler::BlockReport;

/// Destination of per-block reports.
#[async_trait]
pub trait BlockReportStorage: Send + Sync {
    async fn save_report(&mut self, report: &BlockReport) -> Result<()>;
}

/// Keeps the reports of the last `window` blocks
pub struct InMemoryBlockReportStorage {
    window: usize,
    reports: VecDeque<BlockReport>,
}

impl InMemoryBlockReportStorage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            reports: VecDeque::with_capacity(window.clamp(1, 4096)),
        }
    }

    pub fn reports(&self) -> impl Iterator<Item = &BlockReport> {
        self.reports.iter()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

#[async_trait]
impl BlockReportStorage for InMemoryBlockReportStorage {
    async fn save_report(&mut self, report: &BlockReport) -> Result<()> {
        if self.reports.len() == self.window {
            self.reports.pop_front();
        }
        self.reports.push_back(report.clone());
        Ok(())
    }
}

const BLOCK_REPORTS_TABLE: &str = "coremon_block_reports";

#[derive(Debug, Row, Serialize)]
struct BlockReportRow<'a> {
    chain_id: &'a str,
    network: &'a str,
    height: u64,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    block_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    ingested_at: DateTime<Utc>,
    latency_ms: u64,
    txs: u32,
    failed_txs: u32,
    gas_used: u64,
    gas_wanted: u64,
    avg_tx_size: f64,
    blocktime_diff_ms: Option<u64>,
    tx_tp_abs: Option<f64>,
}

pub struct ClickhouseBlockReportStorage {
    pub clickhouse_client: clickhouse::Client,
    pub chain_id: String,
    pub network: String,
}

fn read_env_var(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{} must be set for block report persistence", key))
}

impl ClickhouseBlockReportStorage {
    /// Client configured from `CLICKHOUSE_URL`, `CLICKHOUSE_USER`,
    /// `CLICKHOUSE_PASSWORD` and `CLICKHOUSE_DATABASE`.
    pub fn from_env(chain_id: &str, network: &str) -> Result<Self> {
        let clickhouse_client = clickhouse::Client::default()
            .with_url(read_env_var("CLICKHOUSE_URL")?)
            .with_user(read_env_var("CLICKHOUSE_USER")?)
            .with_password(read_env_var("CLICKHOUSE_PASSWORD")?)
            .with_database(read_env_var("CLICKHOUSE_DATABASE")?);

        Ok(Self {
            clickhouse_client,
            chain_id: chain_id.to_string(),
            network: network.to_string(),
        })
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {}
            (
                chain_id String,
                network String,
                height UInt64,
                block_time DateTime,
                ingested_at DateTime,
                latency_ms UInt64,
                txs UInt32,
                failed_txs UInt32,
                gas_used UInt64,
                gas_wanted UInt64,
                avg_tx_size Float64,
                blocktime_diff_ms Nullable(UInt64),
                tx_tp_abs Nullable(Float64)
            )
            ENGINE = ReplacingMergeTree
            ORDER BY (chain_id, height)
            "#,
            BLOCK_REPORTS_TABLE
        );
        self.clickhouse_client
            .query(&ddl)
            .execute()
            .await
            .with_context(|| format!("Failed to create table {}", BLOCK_REPORTS_TABLE))
    }
}

#[async_trait]
impl BlockReportStorage for ClickhouseBlockReportStorage {
    async fn save_report(&mut self, report: &BlockReport) -> Result<()> {
        let row = BlockReportRow {
            chain_id: &self.chain_id,
            network: &self.network,
            height: report.height,
            block_time: report.block_time.and_utc(),
            ingested_at: report.ingested_at,
            latency_ms: report.latency.as_millis() as u64,
            txs: report.txs as u32,
            failed_txs: report.failed_txs as u32,
            gas_used: report.gas_used,
            gas_wanted: report.gas_wanted,
            avg_tx_size: report.avg_tx_size,
            blocktime_diff_ms: report.blocktime_diff.map(|d| d.as_millis() as u64),
            tx_tp_abs: report.tx_tp_abs,
        };

        let mut insert = self.clickhouse_client.insert(BLOCK_REPORTS_TABLE)?;
        insert
            .write(&row)
            .await
            .context("Failed to write block report")?;
        insert
            .end()
            .await
            .context("Failed to end block report insert")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchains::cometbft::block::test_utils::sample_data;

    #[tokio::test]
    async fn test_in_memory_storage_keeps_window() {
        let mut storage = InMemoryBlockReportStorage::new(3);
        for height in 1..=5 {
            let report = BlockReport::from_block(&sample_data(height), None, Utc::now());
            storage.save_report(&report).await.unwrap();
        }
        let heights: Vec<u64> = storage.reports().map(|r| r.height).collect();
        assert_eq!(heights, vec![3, 4, 5]);
        assert_eq!(storage.len(), 3);
    }
}
