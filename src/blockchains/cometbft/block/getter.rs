use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::NewBlockData;
use crate::blockchains::cometbft::metrics::{
    COREMON_FETCH_FAILURES, COREMON_FETCH_RETRIES, COREMON_NEXT_FETCH_HEIGHT,
    COREMON_PENDING_BLOCKS,
};
use crate::blockchains::cometbft::rpc::{BlockSource, RpcError};
use crate::core::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Could not fetch block {height}: {source}")]
    Block {
        height: u64,
        #[source]
        source: RpcError,
    },

    #[error("Could not fetch block results {height}: {source}")]
    BlockResults {
        height: u64,
        #[source]
        source: RpcError,
    },
}

#[derive(Debug, Clone)]
pub struct BlockGetterOptions {
    /// Parallel fetch jobs, at least 1
    pub jobs: usize,
    pub retry: RetryPolicy,
    /// Pause before a height whose retries ran out is fetched again
    pub refetch_delay: Duration,
    pub backlog_poll: Duration,
    pub backlog_per_job: usize,
    pub output_capacity_per_job: usize,
    /// Environment label on metrics
    pub network: String,
}

impl Default for BlockGetterOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            retry: RetryPolicy::default(),
            refetch_delay: Duration::from_secs(1),
            backlog_poll: Duration::from_millis(200),
            backlog_per_job: 1024,
            output_capacity_per_job: 100,
            network: "local".to_string(),
        }
    }
}

impl BlockGetterOptions {
    pub fn with_jobs(jobs: usize) -> Self {
        Self {
            jobs,
            ..Default::default()
        }
    }

    fn backlog_limit(&self) -> usize {
        self.backlog_per_job * self.jobs.max(1)
    }
}

/// Next height to fetch. Every `claim` hands out a height nobody else got.
#[derive(Debug)]
pub struct HeightClaims {
    next: AtomicU64,
}

impl HeightClaims {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn claim(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

///
/// Fetched blocks that arrived ahead of their turn, keyed by height.
///
/// Filled by the fetch jobs and drained by the single sequencer, which parks
/// on `wait_for_insert` when the height it needs is not there yet. `Notify`
/// keeps a permit when nobody is parked, so an insert between a missed `take`
/// and the wait is not lost.
///
#[derive(Default)]
pub struct PendingBlocks {
    blocks: Mutex<HashMap<u64, NewBlockData>>,
    inserted: Notify,
}

impl PendingBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the buffer size after the insert.
    pub fn insert(&self, data: NewBlockData) -> usize {
        let len = {
            let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
            blocks.insert(data.height, data);
            blocks.len()
        };
        self.inserted.notify_one();
        len
    }

    pub fn take(&self, height: u64) -> Option<NewBlockData> {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&height)
    }

    pub fn len(&self) -> usize {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn wait_for_insert(&self) {
        self.inserted.notified().await
    }
}

/// State shared by the fetch jobs and the sequencer.
struct Shared {
    source: Arc<dyn BlockSource>,
    claims: HeightClaims,
    pending: PendingBlocks,
    options: BlockGetterOptions,
    chain_id: String,
    shutdown: CancellationToken,
}

impl Shared {
    fn labels(&self) -> [&str; 2] {
        [&self.chain_id, &self.options.network]
    }

    fn record_retry(&self, kind: &str, height: u64, attempt: u32, error: &RpcError) {
        debug!(
            height,
            attempt,
            "(Block Getter) Failed to fetch {} {}: {}",
            kind,
            height,
            error
        );
        COREMON_FETCH_RETRIES
            .with_label_values(&[&self.chain_id, &self.options.network, kind])
            .inc();
    }
}

///
/// Fetches blocks with `jobs` parallel workers starting at `init_height`
/// and publishes them strictly in height order, without gaps.
///
pub struct BlockGetter {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl BlockGetter {
    /// Spawns the fetch jobs and the sequencer. Returns the getter and the
    /// ordered block stream, which ends once `shutdown` is cancelled.
    pub fn start(
        source: Arc<dyn BlockSource>,
        chain_id: &str,
        init_height: u64,
        options: BlockGetterOptions,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<NewBlockData>) {
        let jobs = options.jobs.max(1);
        let (tx, rx) = mpsc::channel(jobs * options.output_capacity_per_job.max(1));

        let shared = Arc::new(Shared {
            source,
            claims: HeightClaims::new(init_height),
            pending: PendingBlocks::new(),
            options,
            chain_id: chain_id.to_string(),
            shutdown,
        });

        info!(
            "(Block Getter) Starting {} fetch jobs from height {}",
            jobs, init_height
        );

        let mut tasks = Vec::with_capacity(jobs + 1);
        tasks.push(tokio::spawn(announce_blocks(
            Arc::clone(&shared),
            init_height,
            tx,
        )));
        for job in 0..jobs {
            tasks.push(tokio::spawn(pull_blocks(Arc::clone(&shared), job)));
        }

        (Self { shared, tasks }, rx)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn next_fetch_height(&self) -> u64 {
        self.shared.claims.peek()
    }

    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    /// Waits for the sequencer and every fetch job to stop.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("(Block Getter) Task ended abnormally: {}", e);
            }
        }
    }
}

/// Sequencer: moves blocks from the pending buffer to `out` in height order.
async fn announce_blocks(shared: Arc<Shared>, init_height: u64, out: mpsc::Sender<NewBlockData>) {
    let mut next_height = init_height;

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let data = match shared.pending.take(next_height) {
            Some(data) => data,
            None => {
                tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.pending.wait_for_insert() => {}
                }
                continue;
            }
        };

        COREMON_PENDING_BLOCKS
            .with_label_values(&shared.labels())
            .set(shared.pending.len() as i64);

        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            sent = out.send(data) => {
                if sent.is_err() {
                    debug!("(Block Getter) Block receiver dropped");
                    break;
                }
            }
        }
        next_height += 1;
    }

    debug!(
        "(Block Getter) Sequencer stopped, next height was {}",
        next_height
    );
}

/// Fetch job: claims heights and fills the pending buffer until shutdown.
async fn pull_blocks(shared: Arc<Shared>, job: usize) {
    let backlog_limit = shared.options.backlog_limit();

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let height = shared.claims.claim();
        COREMON_NEXT_FETCH_HEIGHT
            .with_label_values(&shared.labels())
            .set(shared.claims.peek() as i64);

        let data = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            data = fetch_until_done(&shared, job, height) => data,
        };

        let pending = shared.pending.insert(data);
        COREMON_PENDING_BLOCKS
            .with_label_values(&shared.labels())
            .set(pending as i64);

        while shared.pending.len() > backlog_limit {
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => return,
                _ = tokio::time::sleep(shared.options.backlog_poll) => {}
            }
        }
    }

    debug!(job, "(Block Getter) Fetch job {} stopped", job);
}

/// Never gives up on a height; a height that ran out of retries starts over.
async fn fetch_until_done(shared: &Shared, job: usize, height: u64) -> NewBlockData {
    loop {
        match fetch_block_by_num(shared, height).await {
            Ok(data) => return data,
            Err(e) => {
                warn!(
                    job,
                    height,
                    "(Block Getter) Fetch job {} giving up on attempt for height {}, retrying: {}",
                    job,
                    height,
                    e
                );
                COREMON_FETCH_FAILURES
                    .with_label_values(&shared.labels())
                    .inc();
                tokio::time::sleep(shared.options.refetch_delay).await;
            }
        }
    }
}

/// Fetches the block and its results concurrently, each with its own retries.
async fn fetch_block_by_num(shared: &Shared, height: u64) -> Result<NewBlockData, FetchError> {
    let retry = &shared.options.retry;

    let block = async {
        retry
            .retry_notify(
                || shared.source.fetch_block(height),
                |attempt, e| shared.record_retry("block", height, attempt, e),
            )
            .await
            .map_err(|source| FetchError::Block { height, source })
    };
    let block_results = async {
        retry
            .retry_notify(
                || shared.source.fetch_block_results(height),
                |attempt, e| shared.record_retry("block_results", height, attempt, e),
            )
            .await
            .map_err(|source| FetchError::BlockResults { height, source })
    };

    let (block, block_results) = tokio::try_join!(block, block_results)?;

    Ok(NewBlockData {
        height,
        block,
        block_results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchains::cometbft::block::test_utils::{sample_data, FetchKind, MockBlockSource};
    use rand::seq::SliceRandom;
    use std::collections::HashSet;

    fn fast_options(jobs: usize) -> BlockGetterOptions {
        BlockGetterOptions {
            jobs,
            ..Default::default()
        }
    }

    async fn receive(rx: &mut mpsc::Receiver<NewBlockData>, count: usize) -> Vec<u64> {
        let mut heights = Vec::with_capacity(count);
        for _ in 0..count {
            let data = rx.recv().await.expect("block stream ended early");
            heights.push(data.height);
        }
        heights
    }

    #[test]
    fn test_pending_blocks_take_once() {
        let pending = PendingBlocks::new();
        assert_eq!(pending.insert(sample_data(7)), 1);
        assert_eq!(pending.insert(sample_data(9)), 2);
        assert!(pending.take(8).is_none());
        assert_eq!(pending.take(7).map(|d| d.height), Some(7));
        assert!(pending.take(7).is_none());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_claims_are_unique_across_tasks() {
        let claims = Arc::new(HeightClaims::new(500));
        let workers = 8;
        let per_worker = 1000;

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let claims = Arc::clone(&claims);
                tokio::spawn(async move {
                    let mut mine = Vec::with_capacity(per_worker);
                    for _ in 0..per_worker {
                        mine.push(claims.claim());
                        if mine.len() % 100 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();

        let expected: Vec<u64> = (500..500 + (workers * per_worker) as u64).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn test_sequencer_orders_any_permutation() {
        let start = 1_000;
        let mut heights: Vec<u64> = (start..=start + 50).collect();
        heights.shuffle(&mut rand::rng());

        let shared = Arc::new(Shared {
            source: Arc::new(MockBlockSource::new(0)),
            claims: HeightClaims::new(start),
            pending: PendingBlocks::new(),
            options: fast_options(1),
            chain_id: "test-chain".to_string(),
            shutdown: CancellationToken::new(),
        });
        let (tx, mut rx) = mpsc::channel(4);
        let sequencer = tokio::spawn(announce_blocks(Arc::clone(&shared), start, tx));

        let feeder = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                for height in heights {
                    shared.pending.insert(sample_data(height));
                    tokio::task::yield_now().await;
                }
            })
        };

        let received = receive(&mut rx, 51).await;
        feeder.await.unwrap();
        assert_eq!(received, (start..=start + 50).collect::<Vec<_>>());

        shared.shutdown.cancel();
        sequencer.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completions_are_emitted_in_order() {
        let source = Arc::new(
            MockBlockSource::new(200)
                .with_max_height(104)
                .with_delay(100, Duration::from_millis(20))
                .with_delay(101, Duration::from_millis(40))
                .with_delay(102, Duration::from_millis(10))
                .with_delay(103, Duration::from_millis(50))
                .with_delay(104, Duration::from_millis(10)),
        );
        let shutdown = CancellationToken::new();
        let (getter, mut rx) = BlockGetter::start(
            source.clone(),
            "test-chain",
            100,
            fast_options(3),
            shutdown.clone(),
        );

        let received = receive(&mut rx, 5).await;
        assert_eq!(received, vec![100, 101, 102, 103, 104]);

        let completed: Vec<u64> = source
            .completed_blocks()
            .into_iter()
            .filter(|h| *h <= 104)
            .collect();
        assert_eq!(completed, vec![102, 100, 104, 101, 103]);

        getter.close();
        getter.join().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_height_failing_nine_times_is_emitted_once() {
        let source = Arc::new(
            MockBlockSource::new(200)
                .with_max_height(104)
                .with_failures(FetchKind::Block, 102, 9),
        );
        let (getter, mut rx) = BlockGetter::start(
            source.clone(),
            "test-chain",
            100,
            fast_options(2),
            CancellationToken::new(),
        );

        let received = receive(&mut rx, 5).await;
        assert_eq!(received, vec![100, 101, 102, 103, 104]);
        assert_eq!(source.block_calls(102), 10);

        getter.close();
        getter.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_height_is_fetched_again_not_skipped() {
        let source = Arc::new(
            MockBlockSource::new(200)
                .with_max_height(104)
                .with_failures(FetchKind::BlockResults, 101, 10),
        );
        let (getter, mut rx) = BlockGetter::start(
            source.clone(),
            "test-chain",
            100,
            fast_options(3),
            CancellationToken::new(),
        );

        let received = receive(&mut rx, 5).await;
        assert_eq!(received, vec![100, 101, 102, 103, 104]);
        assert_eq!(source.results_calls(101), 11);

        let unique: HashSet<u64> = received.iter().copied().collect();
        assert_eq!(unique.len(), received.len());

        getter.close();
        getter.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_pauses_fetching() {
        let source = Arc::new(MockBlockSource::new(u64::MAX));
        let options = BlockGetterOptions {
            jobs: 2,
            backlog_per_job: 4,
            output_capacity_per_job: 1,
            ..Default::default()
        };
        let limit = options.backlog_limit();
        let (getter, _rx) = BlockGetter::start(
            source.clone(),
            "test-chain",
            1,
            options,
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        let pending = getter.pending_len();
        assert!(pending >= limit, "pending {} below limit {}", pending, limit);
        assert!(pending <= limit + 2, "pending {} above limit {}", pending, limit);

        let claimed = getter.next_fetch_height();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(getter.next_fetch_height(), claimed);
        assert_eq!(getter.pending_len(), pending);

        getter.close();
        getter.join().await;
    }
}
