//! Blockchain watcher binary.
//!
//! # Usage
//!
//! ```bash
//! # Watch every configured chain
//! blockchain-watcher run --config config/watchers.json
//!
//! # One-shot replay of a block range
//! blockchain-watcher backfiller --chain-name solana --from 200000000 --to 200000100 --rate-limit 2
//! ```

mod config;

use anyhow::{Context, Result};
use blockchain_watcher::config::{WatcherParams, WatchersConfig};
use blockchain_watcher::processor::build_watcher;
use blockchain_watcher::store::{WatcherDb, WatcherDbConfig};
use blockchain_watcher::watcher::BackfillRequest;
use blockchain_watcher::WatcherConfig;
use clap::Parser;
use config::{BackfillerArgs, Cli, Command, CommonArgs, RunArgs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(&cli.common, args).await,
        Command::Backfiller(args) => backfill(&cli.common, args).await,
    }
}

fn load_params(common: &CommonArgs) -> Result<Vec<WatcherParams>> {
    let params = WatchersConfig::from_path(&common.config)
        .and_then(|config| config.validate())
        .with_context(|| format!("Invalid watcher config {}", common.config))?;
    Ok(params)
}

async fn open_db(common: &CommonArgs) -> Result<Arc<WatcherDb>> {
    let db = WatcherDb::new(WatcherDbConfig {
        path: common.database_url.clone(),
    })
    .await?;
    Ok(Arc::new(db))
}

async fn run(common: &CommonArgs, args: RunArgs) -> Result<()> {
    let params = load_params(common)?;
    if params.is_empty() {
        tracing::warn!(target: "watcher::main", "No watchers configured, only the admin server will run");
    }
    for p in &params {
        tracing::info!(
            target: "watcher::main",
            chain = %p.chain,
            chain_id = %p.chain_id,
            family = p.source.family(),
            initial_block = p.initial_block,
            "Configured watcher"
        );
    }

    let db = open_db(common).await?;

    let config = WatcherConfig::builder()
        .host(args.host)
        .port(args.port)
        .shutdown_timeout(args.shutdown_timeout)
        .with_watchers(params)
        .with_stores(db.clone(), db)
        .build();

    blockchain_watcher::run(config)
        .await
        .map_err(|e| anyhow::anyhow!("Watcher failed: {e}"))
}

async fn backfill(common: &CommonArgs, args: BackfillerArgs) -> Result<()> {
    let mut params = load_params(common)?
        .into_iter()
        .find(|p| p.chain == args.chain_name)
        .with_context(|| format!("Chain {} is not in {}", args.chain_name, common.config))?;
    if let Some(url) = &args.chain_url {
        params = params.with_url(url)?;
    }
    if let Some(rate_limit) = args.rate_limit {
        params.rate_limit = rate_limit;
    }

    tracing::info!(
        target: "watcher::main",
        network = args.network.as_str(),
        chain = %params.chain,
        url = %params.url,
        from = args.from,
        to = args.to,
        persist = args.persist_blocks,
        "Starting backfiller"
    );

    let db = open_db(common).await?;
    let watcher = build_watcher(&params, db.clone(), db);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(target: "watcher::main", "Received SIGINT (Ctrl+C), stopping backfill...");
                cancel.cancel();
            }
        }
    });

    let request = BackfillRequest {
        from: args.from,
        to: args.to,
        page_size: args.page_size,
        persist: args.persist_blocks,
    };
    let report = watcher.backfill(request, cancel).await.context("Backfill failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

