use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::getter::{BlockGetter, BlockGetterOptions};
use super::NewBlockData;
use crate::blockchains::cometbft::metrics::COREMON_LAST_SYNCED_HEIGHT;
use crate::blockchains::cometbft::rpc::{BlockSource, CometRpc, RpcError};
use crate::core::clients::http_client::{NodePool, NodePoolErrors};

/// Longest `close` waits for the in-flight block to be handled
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Could not build RPC client: {0}")]
    Rpc(#[from] NodePoolErrors),

    #[error("Parallel block fetch jobs must be at least 1")]
    NoFetchJobs,

    #[error("Block watcher is shutting down")]
    ShuttingDown,

    #[error("Failed to get latest block info from chain daemon: {0}")]
    InitialSync(#[source] RpcError),

    #[error("Failed to handle block {height}: {source:#}")]
    Handler {
        height: u64,
        #[source]
        source: anyhow::Error,
    },
}

impl WatcherError {
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, WatcherError::ShuttingDown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Initializing,
    Syncing,
    Live,
    Closing,
    Closed,
    /// The live loop ended on a handler error
    Stopped,
}

/// Receives every block once, in height order, never concurrently.
#[async_trait]
pub trait NewBlockHandler: Send {
    async fn handle(&mut self, data: &NewBlockData) -> anyhow::Result<()>;
}

fn is_shutdown_error(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<WatcherError>()
        .is_some_and(WatcherError::is_shutting_down)
}

///
/// Tails a chain: catches up to the tip, then runs the block getter and
/// hands each block to the handler, tracking the last synced height.
///
/// Share it behind an `Arc`: `start_watching` runs until the watcher stops,
/// while status queries and `close` are called from elsewhere.
///
pub struct BlockWatcher {
    chain_id: String,
    source: Arc<dyn BlockSource>,
    options: BlockGetterOptions,
    handler: Mutex<Box<dyn NewBlockHandler>>,
    last_synced: RwLock<u64>,
    state: RwLock<WatcherState>,
    started: AtomicBool,
    closing: CancellationToken,
    synced: CancellationToken,
    drained: CancellationToken,
}

impl BlockWatcher {
    /// Watcher over a single RPC endpoint.
    pub fn connect(
        ctx: &CancellationToken,
        chain_id: &str,
        rpc_endpoint: &str,
        parallel_fetch_jobs: usize,
        handler: Box<dyn NewBlockHandler>,
    ) -> Result<Self, WatcherError> {
        if parallel_fetch_jobs == 0 {
            return Err(WatcherError::NoFetchJobs);
        }
        let options = BlockGetterOptions::with_jobs(parallel_fetch_jobs);
        let pool = NodePool::single(rpc_endpoint, options.network.clone())?;
        let source = Arc::new(CometRpc::new(Arc::new(pool)));
        Self::with_source(ctx, chain_id, source, options, handler)
    }

    pub fn with_source(
        ctx: &CancellationToken,
        chain_id: &str,
        source: Arc<dyn BlockSource>,
        options: BlockGetterOptions,
        handler: Box<dyn NewBlockHandler>,
    ) -> Result<Self, WatcherError> {
        if options.jobs == 0 {
            return Err(WatcherError::NoFetchJobs);
        }

        Ok(Self {
            chain_id: chain_id.to_string(),
            source,
            options,
            handler: Mutex::new(handler),
            last_synced: RwLock::new(0),
            state: RwLock::new(WatcherState::Initializing),
            started: AtomicBool::new(false),
            closing: ctx.child_token(),
            synced: CancellationToken::new(),
            drained: CancellationToken::new(),
        })
    }

    pub fn last_synced_block(&self) -> u64 {
        *self.last_synced.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once catch-up is done, or once closing has begun.
    pub fn is_synced(&self) -> bool {
        self.synced.is_cancelled() || self.closing.is_cancelled()
    }

    pub async fn wait_for_sync(&self) {
        tokio::select! {
            _ = self.synced.cancelled() => {}
            _ = self.closing.cancelled() => {}
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WatcherState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_last_synced(&self, height: u64) {
        *self
            .last_synced
            .write()
            .unwrap_or_else(PoisonError::into_inner) = height;
        COREMON_LAST_SYNCED_HEIGHT
            .with_label_values(&[&self.chain_id, &self.options.network])
            .set(height as i64);
    }

    /// Catches up from `from_height`, then handles new blocks until the
    /// watcher is closed or the handler fails. Call once.
    pub async fn start_watching(&self, from_height: u64) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("(Block Watcher) Already started, ignoring start_watching");
            return;
        }
        let _drained = self.drained.clone().drop_guard();

        if let Err(e) = self.run_initial_sync(from_height).await {
            if !e.is_shutting_down() {
                error!("(Block Watcher) Failed to run initial block sync: {}", e);
            }
            return;
        }

        let init_height = self.last_synced_block() + 1;
        let (getter, mut blocks) = BlockGetter::start(
            Arc::clone(&self.source),
            &self.chain_id,
            init_height,
            self.options.clone(),
            self.closing.child_token(),
        );

        self.set_state(WatcherState::Live);
        self.synced.cancel();
        info!(
            "(Block Watcher) Initial sync done. Continuing to poll RPC for new blocks from {}",
            init_height
        );

        let outcome = self.run_live(&mut blocks).await;

        getter.close();
        getter.join().await;

        match outcome {
            Err(e) if e.is_shutting_down() => {
                if self.state() == WatcherState::Live {
                    self.set_state(WatcherState::Closed);
                }
                debug!(
                    "(Block Watcher) Stopped watching at {}",
                    self.last_synced_block()
                );
            }
            Err(e) => {
                self.set_state(WatcherState::Stopped);
                error!(
                    height = self.last_synced_block(),
                    "(Block Watcher) {}, stopped at {}",
                    e,
                    self.last_synced_block()
                );
            }
            Ok(()) => {}
        }
    }

    async fn run_initial_sync(&self, from_height: u64) -> Result<(), WatcherError> {
        let tip = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(WatcherError::ShuttingDown),
            tip = self.source.latest_height_and_time() => tip.map_err(WatcherError::InitialSync)?,
        };
        self.set_state(WatcherState::Syncing);

        match tip.time {
            Some(time) => info!(
                "(Block Watcher) At block height {} while chain is at {} ({})",
                from_height,
                tip.height,
                time.and_utc().to_rfc3339()
            ),
            None => info!(
                "(Block Watcher) At block height {} while chain is at {}",
                from_height, tip.height
            ),
        }

        if from_height >= tip.height {
            self.set_last_synced(from_height);
        } else {
            // No backfill: blocks below the tip are skipped.
            self.set_last_synced(tip.height);
        }
        Ok(())
    }

    async fn run_live(&self, blocks: &mut mpsc::Receiver<NewBlockData>) -> Result<(), WatcherError> {
        loop {
            let data = tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Err(WatcherError::ShuttingDown),
                data = blocks.recv() => data.ok_or(WatcherError::ShuttingDown)?,
            };

            let mut handler = self.handler.lock().await;
            if let Err(e) = handler.handle(&data).await {
                if is_shutdown_error(&e) {
                    return Err(WatcherError::ShuttingDown);
                }
                return Err(WatcherError::Handler {
                    height: data.height,
                    source: e,
                });
            }
            drop(handler);

            self.set_last_synced(data.height);
        }
    }

    /// Stops fetching and waits up to 3s for the block being handled.
    /// Always returns `Ok`.
    pub async fn close(&self) -> Result<(), WatcherError> {
        let previous = self.state();
        if previous != WatcherState::Stopped {
            self.set_state(WatcherState::Closing);
        }
        self.closing.cancel();

        if self.started.load(Ordering::SeqCst)
            && tokio::time::timeout(DRAIN_TIMEOUT, self.drained.cancelled())
                .await
                .is_err()
        {
            warn!(
                "(Block Watcher) Timed out waiting for block handler to finish, last synced {}",
                self.last_synced_block()
            );
        }

        if previous != WatcherState::Stopped {
            self.set_state(WatcherState::Closed);
        }
        info!("(Block Watcher) Closed at height {}", self.last_synced_block());
        Ok(())
    }
}
