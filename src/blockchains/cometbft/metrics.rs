use lazy_static::lazy_static;
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref COREMON_BLOCK_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("coremon_block_height", "Height of the last handled block"),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_INGEST_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "coremon_ingest_latency_seconds",
            "Time between block production and its handling"
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0]),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_TX_PER_BLOCK: IntGaugeVec = IntGaugeVec::new(
        Opts::new("coremon_tx_per_block", "Transactions in the last non-empty block"),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_TX_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("coremon_tx_total", "Transactions seen in handled blocks"),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_BLOCKTIME_DIFF: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "coremon_blocktime_diff_seconds",
            "Time between two consecutive block timestamps"
        )
        .buckets(vec![0.5, 1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 20.0, 60.0]),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_TX_TP_ABS: GaugeVec = GaugeVec::new(
        Opts::new(
            "coremon_tx_tp_abs",
            "Transactions per second of chain time in the last block"
        ),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_TX_TP_REAL: GaugeVec = GaugeVec::new(
        Opts::new(
            "coremon_tx_tp_real",
            "Transactions handled per second of wall clock time"
        ),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_BLOCKS_PACE: GaugeVec = GaugeVec::new(
        Opts::new(
            "coremon_blocks_pace",
            "Blocks handled per second of wall clock time"
        ),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_BLOCK_GAS_USED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("coremon_block_gas_used", "Block gas used"),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_BLOCK_GAS_WANTED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("coremon_block_gas_wanted", "Block gas wanted"),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_BLOCK_FAILED_TXS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("coremon_block_failed_txs", "Failed transactions in block"),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_BLOCK_TX_SIZE: GaugeVec = GaugeVec::new(
        Opts::new("coremon_block_tx_size", "Block average transaction size"),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_LAST_SYNCED_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "coremon_last_synced_height",
            "Last height the block handler processed successfully"
        ),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_PENDING_BLOCKS: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "coremon_pending_blocks",
            "Fetched blocks waiting for their turn to be handled"
        ),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_NEXT_FETCH_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("coremon_next_fetch_height", "Next height a fetch job will claim"),
        &["chain_id", "network"]
    )
    .unwrap();
    pub static ref COREMON_FETCH_RETRIES: IntCounterVec = IntCounterVec::new(
        Opts::new("coremon_fetch_retries_total", "Failed RPC fetch attempts"),
        &["chain_id", "network", "kind"]
    )
    .unwrap();
    pub static ref COREMON_FETCH_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "coremon_fetch_failures_total",
            "Heights whose fetch exhausted all retries and was started over"
        ),
        &["chain_id", "network"]
    )
    .unwrap();
}

pub fn coremon_custom_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(COREMON_BLOCK_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(COREMON_INGEST_LATENCY.clone()))?;
    REGISTRY.register(Box::new(COREMON_TX_PER_BLOCK.clone()))?;
    REGISTRY.register(Box::new(COREMON_TX_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COREMON_BLOCKTIME_DIFF.clone()))?;
    REGISTRY.register(Box::new(COREMON_TX_TP_ABS.clone()))?;
    REGISTRY.register(Box::new(COREMON_TX_TP_REAL.clone()))?;
    REGISTRY.register(Box::new(COREMON_BLOCKS_PACE.clone()))?;
    REGISTRY.register(Box::new(COREMON_BLOCK_GAS_USED.clone()))?;
    REGISTRY.register(Box::new(COREMON_BLOCK_GAS_WANTED.clone()))?;
    REGISTRY.register(Box::new(COREMON_BLOCK_FAILED_TXS.clone()))?;
    REGISTRY.register(Box::new(COREMON_BLOCK_TX_SIZE.clone()))?;
    REGISTRY.register(Box::new(COREMON_LAST_SYNCED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(COREMON_PENDING_BLOCKS.clone()))?;
    REGISTRY.register(Box::new(COREMON_NEXT_FETCH_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(COREMON_FETCH_RETRIES.clone()))?;
    REGISTRY.register(Box::new(COREMON_FETCH_FAILURES.clone()))?;
    Ok(())
}
