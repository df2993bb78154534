use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::storage::BlockReportStorage;
use super::watcher::{NewBlockHandler, WatcherError};
use super::NewBlockData;
use crate::blockchains::cometbft::metrics::{
    COREMON_BLOCKS_PACE, COREMON_BLOCKTIME_DIFF, COREMON_BLOCK_FAILED_TXS,
    COREMON_BLOCK_GAS_USED, COREMON_BLOCK_GAS_WANTED, COREMON_BLOCK_HEIGHT,
    COREMON_BLOCK_TX_SIZE, COREMON_INGEST_LATENCY, COREMON_TX_PER_BLOCK, COREMON_TX_TOTAL,
    COREMON_TX_TP_ABS, COREMON_TX_TP_REAL,
};
use crate::core::pace::{per_second, tracing_reporter, Pace};

const LOG_PACE_INTERVAL: Duration = Duration::from_secs(60);
const GAUGE_PACE_INTERVAL: Duration = Duration::from_secs(15);

/// Measurements taken from one handled block.
#[derive(Debug, Clone)]
pub struct BlockReport {
    pub height: u64,
    pub block_time: NaiveDateTime,
    pub ingested_at: DateTime<Utc>,
    /// Wall clock time since the block was produced, zero if the block is ahead of us
    pub latency: Duration,
    pub txs: usize,
    pub failed_txs: usize,
    pub gas_used: u64,
    pub gas_wanted: u64,
    pub avg_tx_size: f64,
    pub blocktime_diff: Option<Duration>,
    pub tx_tp_abs: Option<f64>,
}

impl BlockReport {
    /// `previous` is the height and time of the last handled block; the block
    /// time diff is only known when it is the direct parent.
    pub fn from_block(
        data: &NewBlockData,
        previous: Option<(u64, NaiveDateTime)>,
        now: DateTime<Utc>,
    ) -> Self {
        let block_time = data.block.header.time;
        let txs = data.block.txs();

        let latency = (now - block_time.and_utc())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let avg_tx_size = if txs.is_empty() {
            0.0
        } else {
            txs.iter()
                .filter_map(|tx| general_purpose::STANDARD.decode(tx).ok())
                .map(|decoded| decoded.len())
                .sum::<usize>() as f64
                / txs.len() as f64
        };

        let results = data.block_results.txs_results();
        let gas_used = results.iter().map(|r| r.gas_used()).sum();
        let gas_wanted = results.iter().map(|r| r.gas_wanted()).sum();
        let failed_txs = results.iter().filter(|r| r.is_failed()).count();

        let blocktime_diff = previous
            .filter(|(height, _)| height + 1 == data.height)
            .and_then(|(_, time)| (block_time - time).to_std().ok())
            .filter(|diff| !diff.is_zero());
        let tx_tp_abs = blocktime_diff.map(|diff| txs.len() as f64 / diff.as_secs_f64());

        Self {
            height: data.height,
            block_time,
            ingested_at: now,
            latency,
            txs: txs.len(),
            failed_txs,
            gas_used,
            gas_wanted,
            avg_tx_size,
            blocktime_diff,
            tx_tp_abs,
        }
    }
}

/// Pace publishing its per second rate to `gauge`.
fn gauge_pace(
    label: &str,
    chain_id: &str,
    network: &str,
    gauge: &'static prometheus::GaugeVec,
) -> Arc<Pace> {
    let labels = [chain_id.to_string(), network.to_string()];
    Arc::new(Pace::new(
        label,
        GAUGE_PACE_INTERVAL,
        Box::new(move |_, timeframe, value| {
            gauge
                .with_label_values(&[&labels[0], &labels[1]])
                .set(per_second(timeframe, value));
        }),
    ))
}

///
/// Block handler publishing per-block metrics, block and tx pace,
/// and a `BlockReport` per block to the configured storage.
///
pub struct BlockMetricsHandler {
    chain_id: String,
    network: String,
    storage: Box<dyn BlockReportStorage>,
    previous: Option<(u64, NaiveDateTime)>,
    blocks_synced: Arc<Pace>,
    tx_throughput: Arc<Pace>,
    blocks_pace: Arc<Pace>,
    tx_tp_real: Arc<Pace>,
    shutdown: CancellationToken,
}

impl BlockMetricsHandler {
    /// Spawns the pace reporters, which stop with `shutdown`.
    pub fn new(
        chain_id: &str,
        network: &str,
        storage: Box<dyn BlockReportStorage>,
        shutdown: CancellationToken,
    ) -> Self {
        let blocks_synced = Arc::new(Pace::new(
            "blocks synced",
            LOG_PACE_INTERVAL,
            tracing_reporter(),
        ));
        let tx_throughput = Arc::new(Pace::new(
            "tx throughput",
            LOG_PACE_INTERVAL,
            tracing_reporter(),
        ));
        let blocks_pace = gauge_pace("blocks pace", chain_id, network, &COREMON_BLOCKS_PACE);
        let tx_tp_real = gauge_pace("tx tp real", chain_id, network, &COREMON_TX_TP_REAL);

        for pace in [&blocks_synced, &tx_throughput, &blocks_pace, &tx_tp_real] {
            Arc::clone(pace).spawn(shutdown.clone());
        }

        Self {
            chain_id: chain_id.to_string(),
            network: network.to_string(),
            storage,
            previous: None,
            blocks_synced,
            tx_throughput,
            blocks_pace,
            tx_tp_real,
            shutdown,
        }
    }

    fn publish(&self, report: &BlockReport) {
        let labels = [self.chain_id.as_str(), self.network.as_str()];

        COREMON_BLOCK_HEIGHT
            .with_label_values(&labels)
            .set(report.height as i64);
        COREMON_INGEST_LATENCY
            .with_label_values(&labels)
            .observe(report.latency.as_secs_f64());

        if report.txs > 0 {
            COREMON_TX_PER_BLOCK
                .with_label_values(&labels)
                .set(report.txs as i64);
            COREMON_TX_TOTAL
                .with_label_values(&labels)
                .inc_by(report.txs as u64);
        }

        if let Some(diff) = report.blocktime_diff {
            COREMON_BLOCKTIME_DIFF
                .with_label_values(&labels)
                .observe(diff.as_secs_f64());
            if let Some(tp) = report.tx_tp_abs.filter(|tp| *tp > 0.0) {
                COREMON_TX_TP_ABS.with_label_values(&labels).set(tp);
            }
        }

        COREMON_BLOCK_GAS_USED
            .with_label_values(&labels)
            .set(report.gas_used as i64);
        COREMON_BLOCK_GAS_WANTED
            .with_label_values(&labels)
            .set(report.gas_wanted as i64);
        COREMON_BLOCK_FAILED_TXS
            .with_label_values(&labels)
            .set(report.failed_txs as i64);
        COREMON_BLOCK_TX_SIZE
            .with_label_values(&labels)
            .set(report.avg_tx_size);
    }
}

#[async_trait]
impl NewBlockHandler for BlockMetricsHandler {
    async fn handle(&mut self, data: &NewBlockData) -> anyhow::Result<()> {
        let report = BlockReport::from_block(data, self.previous, Utc::now());
        debug!(
            height = report.height,
            latency_ms = report.latency.as_millis() as u64,
            "(Block Handler) Got new block {}",
            report.height
        );
        self.previous = Some((report.height, report.block_time));

        self.blocks_synced.step(1);
        self.blocks_pace.step(1);
        self.tx_throughput.step(report.txs as u64);
        self.tx_tp_real.step(report.txs as u64);

        self.publish(&report);

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(WatcherError::ShuttingDown.into()),
            saved = self.storage.save_report(&report) => saved
                .with_context(|| format!("Could not save report for block {}", report.height))?,
        }
        Ok(())
    }
}
