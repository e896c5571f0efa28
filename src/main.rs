mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use onchain_etl::abi;
use onchain_etl::backfill::Backfill;
use onchain_etl::chain::RpcChainClient;
use onchain_etl::config::{AppCfg, LogFormat};
use onchain_etl::db::PgEventStore;
use onchain_etl::listener::LiveListener;
use onchain_etl::processor::RangeProcessor;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let cfg = match AppCfg::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing("info", LogFormat::Json);
            error!(config = %cli.config.display(), "Failed to load configuration: {e:#}");
            return Err(e);
        }
    };
    init_tracing(&cfg.log.level, cfg.log.format);

    if let Err(e) = run(cli.command, cfg).await {
        error!("Fatal: {e:#}");
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, cfg: AppCfg) -> anyhow::Result<()> {
    let registry = Arc::new(abi::load_registry(&cfg)?);
    let names: Vec<&str> = registry.iter().map(|b| b.name.as_str()).collect();
    info!(contracts = ?names, "ABI registry ready");

    let chain = Arc::new(RpcChainClient::connect(&cfg.chain).await?);

    let store = PgEventStore::connect(&cfg.postgres.dsn, cfg.postgres.statement_timeout_secs).await?;
    store.ensure_schema(cfg.postgres.schema.as_deref()).await?;

    let processor = Arc::new(RangeProcessor::new(
        registry,
        chain,
        Arc::new(store),
        Duration::from_secs(cfg.postgres.statement_timeout_secs.max(1)),
    ));

    match command {
        Command::Backfill { from, to } => {
            let backfill = Backfill::new(
                processor,
                cfg.indexing.deployment_block,
                cfg.indexing.backfill_window,
            );
            backfill.run(from, to).await?;
        }
        Command::Listen => {
            let mut listener = LiveListener::start(
                processor,
                Duration::from_secs(cfg.indexing.poll_interval_secs),
                cfg.indexing.resume_live_from_cursor,
            )
            .await?;
            listener.run(shutdown_signal()).await?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().with_env_filter(filter).compact().init(),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
