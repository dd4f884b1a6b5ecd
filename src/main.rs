use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use whaletrace::engine::MonitorEngine;
use whaletrace::fanout::{FanoutEvent, FanoutReceivers};
use whaletrace::metadata::{HeliusAssetProvider, MarketDataProvider, TokenMetadataCache};
use whaletrace::pricing::{HttpPriceFeed, PriceService};
use whaletrace::rpc::ChainRpcClient;
use whaletrace::shutdown::{run_with_deadline, wait_for_signal, ShutdownDeadlines};
use whaletrace::store::TradeStore;
use whaletrace::types::AccountKind;
use whaletrace::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "whaletrace", about = "Real-time whale & KOL swap ingestion pipeline")]
struct Cli {
    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long)]
    database: Option<String>,

    /// Run only the whale pipeline
    #[arg(long, conflicts_with = "kols_only")]
    whales_only: bool,

    /// Run only the KOL pipeline
    #[arg(long)]
    kols_only: bool,
}

/// Drain one pipeline's fan-out channels. The real consumers (alert
/// matcher, websocket broadcast, tweet composer) live in other services;
/// this keeps the channels moving and surfaces the events in the logs.
fn spawn_fanout_drains(kind: AccountKind, receivers: FanoutReceivers) {
    let FanoutReceivers { mut alert_rx, mut broadcast_rx, mut tweet_rx } = receivers;
    tokio::spawn(async move {
        while let Some(FanoutEvent::AlertMatch(trade)) = alert_rx.recv().await {
            info!(
                "[{}] alert: {} {} {} ${:.2}",
                kind.as_str(),
                trade.tracked_account,
                trade.trade_type.as_str(),
                trade.token_out.symbol,
                trade.usd_buy_amount,
            );
        }
    });
    tokio::spawn(async move {
        while broadcast_rx.recv().await.is_some() {}
    });
    tokio::spawn(async move {
        while let Some(FanoutEvent::TweetCandidate(trade)) = tweet_rx.recv().await {
            info!(
                "[{}] tweet candidate: {} bought {} (${:.0}, hotness {})",
                kind.as_str(),
                trade.tracked_account,
                trade.token_out.symbol,
                trade.usd_buy_amount,
                trade.hotness_score,
            );
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let store = TradeStore::open(&config.database_path)?;
    let metadata = TokenMetadataCache::new(
        Arc::new(HeliusAssetProvider::new(config.rpc_endpoint())),
        Arc::new(MarketDataProvider::new()),
    );
    let prices = PriceService::new(Arc::new(HttpPriceFeed::new()));
    let fetcher = Arc::new(ChainRpcClient::new(config.rpc_endpoint()));

    let mut engines = Vec::new();
    let kinds: Vec<AccountKind> = if cli.whales_only {
        vec![AccountKind::Whale]
    } else if cli.kols_only {
        vec![AccountKind::Kol]
    } else {
        vec![AccountKind::Whale, AccountKind::Kol]
    };

    for kind in kinds {
        let (mut engine, receivers) = MonitorEngine::new(
            kind,
            config.clone(),
            store.clone(),
            metadata.clone(),
            prices.clone(),
            fetcher.clone(),
        )?;
        match engine.start() {
            Ok(()) => {
                spawn_fanout_drains(kind, receivers);
                engines.push(engine);
            }
            Err(e) => {
                error!("{} pipeline failed to start: {}", kind.as_str(), e);
            }
        }
    }

    if engines.is_empty() {
        anyhow::bail!("no pipeline started");
    }

    info!("whaletrace running; send SIGTERM or SIGINT to stop");
    wait_for_signal().await;
    warn!("Shutdown signal received, beginning ordered teardown");

    let deadlines = ShutdownDeadlines::default();
    let exit_code = run_with_deadline(
        async move {
            for engine in engines {
                engine.shutdown(deadlines).await?;
            }
            Ok(())
        },
        deadlines,
    )
    .await;

    std::process::exit(exit_code);
}
