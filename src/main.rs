use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use coremon::blockchains::cometbft::block::getter::BlockGetterOptions;
use coremon::blockchains::cometbft::block::handler::BlockMetricsHandler;
use coremon::blockchains::cometbft::block::storage::{
    BlockReportStorage, ClickhouseBlockReportStorage, InMemoryBlockReportStorage,
};
use coremon::blockchains::cometbft::block::watcher::BlockWatcher;
use coremon::blockchains::cometbft::metrics::coremon_custom_metrics;
use coremon::core::app_context::AppContext;
use coremon::core::config::{AppConfig, LoggingConfig};
use coremon::core::logging::init_tracing;
use coremon::core::metrics::exporter_metrics::{
    register_app_version_info, register_exporter_metrics,
};
use coremon::core::metrics::serve_metrics::serve_metrics;

struct CliArgs {
    config_path: String,
    from_height: Option<u64>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut cli = CliArgs {
        config_path: "config.yaml".to_string(),
        from_height: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                cli.config_path = args
                    .next()
                    .context("--config flag provided but no file specified")?;
            }
            "--from-height" => {
                let raw = args
                    .next()
                    .context("--from-height flag provided but no height specified")?;
                cli.from_height = Some(
                    raw.parse()
                        .with_context(|| format!("--from-height is not a height: {}", raw))?,
                );
            }
            other => bail!("Unknown argument {}", other),
        }
    }
    Ok(cli)
}

fn load_config(cli: &CliArgs) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::from_file(&cli.config_path)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

async fn build_storage(
    config: &AppConfig,
    chain_id: &str,
) -> anyhow::Result<Box<dyn BlockReportStorage>> {
    let reports = &config.coremon.block_reports;
    if reports.persistence {
        let storage = ClickhouseBlockReportStorage::from_env(chain_id, &config.general.network)?;
        storage.ensure_table().await?;
        info!("[main] Block reports are persisted to ClickHouse");
        Ok(Box::new(storage))
    } else {
        Ok(Box::new(InMemoryBlockReportStorage::new(reports.window)))
    }
}

fn exit_with(err: anyhow::Error) -> ! {
    error!("Startup failed:");
    for (i, cause) in err.chain().enumerate() {
        error!("  {}: {}", i, cause);
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    // It's okay if .env doesn't exist
    let _ = dotenv::dotenv();

    let config = match parse_args().and_then(|cli| load_config(&cli).map(|c| (cli, c))) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            exit_with(e);
        }
    };
    let (cli, config) = config;
    init_tracing(&config.general.logging);

    info!(
        "[main] coremon {} ({}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH")
    );

    if let Err(e) = register_exporter_metrics().and_then(|_| coremon_custom_metrics()) {
        exit_with(anyhow::anyhow!("Could not register metrics: {}", e));
    }
    let network = config.general.network.clone();
    register_app_version_info(&network);

    let token = CancellationToken::new();

    info!("[main] Building node pool...");
    let app_context = match AppContext::from_config(config).await {
        Ok(ctx) => ctx,
        Err(e) => exit_with(e),
    };
    app_context.rpc.start_health_checks(token.clone());
    let chain_id = app_context.chain_id.clone();
    let config = &app_context.config;

    let storage = match build_storage(config, &chain_id).await {
        Ok(storage) => storage,
        Err(e) => exit_with(e),
    };
    let handler = BlockMetricsHandler::new(&chain_id, &network, storage, token.clone());

    let options = BlockGetterOptions {
        jobs: config.coremon.parallel_fetch_jobs,
        retry: config.coremon.retry.policy(),
        network: network.clone(),
        ..Default::default()
    };
    let watcher = match BlockWatcher::with_source(
        &token,
        &chain_id,
        app_context.block_source(),
        options,
        Box::new(handler),
    ) {
        Ok(watcher) => Arc::new(watcher),
        Err(e) => exit_with(e.into()),
    };

    let from_height = cli.from_height.unwrap_or(config.coremon.start_height);
    info!(
        "[main] Watching chain {} with {} fetch jobs from height {}",
        chain_id, config.coremon.parallel_fetch_jobs, from_height
    );
    let mut watcher_task = tokio::spawn({
        let watcher = Arc::clone(&watcher);
        async move { watcher.start_watching(from_height).await }
    });

    let metrics = &config.general.metrics;
    let mut metrics_task = tokio::spawn(serve_metrics(
        metrics.address.clone(),
        metrics.port,
        metrics.path.clone(),
        token.clone(),
    ));

    let exit_code = tokio::select! {
        _ = listen_for_shutdown() => {
            let _ = watcher.close().await;
            token.cancel();
            if let Err(e) = watcher_task.await {
                warn!("[main] Block watcher task failed: {}", e);
            }
            info!("Gracefully shut down at height {}", watcher.last_synced_block());
            0
        }
        _ = &mut watcher_task => {
            error!(
                "[main] Block watcher stopped at height {}",
                watcher.last_synced_block()
            );
            token.cancel();
            1
        }
        served = &mut metrics_task => {
            match served {
                Ok(Ok(())) => error!("[main] Metrics server exited"),
                Ok(Err(e)) => error!("[main] Metrics server failed: {:#}", e),
                Err(e) => error!("[main] Metrics server task failed: {}", e),
            }
            let _ = watcher.close().await;
            token.cancel();
            1
        }
    };

    std::process::exit(exit_code);
}

async fn listen_for_shutdown() {
    let sigint = signal::ctrl_c();
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigint => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Could not listen for SIGTERM: {}", e);
            if sigint.await.is_ok() {
                info!("Received SIGINT");
            }
        }
    }
}
