use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::constants::{PROCESSED_SET_KOL, PROCESSED_SET_WHALE, QUEUE_DEPTH_WARN, QUEUE_KOL, QUEUE_WHALE};
use crate::dedup::DedupLayer;
use crate::fanout::{FanoutBus, FanoutReceivers};
use crate::kv::KvStore;
use crate::metadata::TokenMetadataCache;
use crate::metrics::IngestMetrics;
use crate::pricing::PriceService;
use crate::queue::JobQueue;
use crate::rpc::TxFetcher;
use crate::shutdown::ShutdownDeadlines;
use crate::store::TradeStore;
use crate::subscription::SubscriptionManager;
use crate::types::{AccountKind, TrackedAccount};
use crate::worker::{WorkerContext, WorkerPool};

/// Cadence of the janitor and stats background tasks
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// One pipeline's runtime: address snapshot, subscription, dedup layer,
/// queue, worker pool, KV, store, fan-out, and supervised background tasks.
/// All state lives here; nothing is global.
pub struct MonitorEngine {
    kind: AccountKind,
    config: EngineConfig,
    store: TradeStore,
    kv: KvStore,
    queue: JobQueue,
    dedup: DedupLayer,
    metrics: IngestMetrics,
    fanout: Arc<FanoutBus>,
    accounts: Arc<HashMap<String, TrackedAccount>>,
    metadata: TokenMetadataCache,
    prices: PriceService,
    fetcher: Arc<dyn TxFetcher>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    subscription_handle: Option<JoinHandle<()>>,
    worker_pool: Option<WorkerPool>,
    background: Vec<JoinHandle<()>>,
}

impl MonitorEngine {
    /// Assemble one pipeline. The watch-list snapshot is taken here; adding
    /// accounts later requires constructing a fresh engine.
    pub fn new(
        kind: AccountKind,
        config: EngineConfig,
        store: TradeStore,
        metadata: TokenMetadataCache,
        prices: PriceService,
        fetcher: Arc<dyn TxFetcher>,
    ) -> Result<(Self, FanoutReceivers)> {
        let accounts: Vec<TrackedAccount> = store
            .load_tracked_accounts(kind)
            .context("failed to load tracked accounts")?
            .into_iter()
            .filter(|account| {
                if Pubkey::from_str(&account.address).is_err() {
                    warn!(
                        "Dropping tracked account with invalid address: {}",
                        account.address
                    );
                    return false;
                }
                true
            })
            .collect();
        info!(
            "{} pipeline: {} tracked accounts loaded",
            kind.as_str(),
            accounts.len()
        );

        let (queue_name, processed_set) = match kind {
            AccountKind::Whale => (QUEUE_WHALE, PROCESSED_SET_WHALE),
            AccountKind::Kol => (QUEUE_KOL, PROCESSED_SET_KOL),
        };
        let pipeline = config.pipeline(kind).clone();

        let kv = KvStore::new();
        let queue = JobQueue::new(
            queue_name,
            store.connection(),
            pipeline.rate_limit_max,
            pipeline.rate_window,
        );
        let dedup = DedupLayer::new(kv.clone(), queue.clone(), processed_set);
        let metrics = IngestMetrics::new(kind.as_str())?;
        let (fanout, receivers) = FanoutBus::new();

        let accounts: HashMap<String, TrackedAccount> = accounts
            .into_iter()
            .map(|account| (account.address.clone(), account))
            .collect();
        metrics.tracked_accounts.set(accounts.len() as i64);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok((
            Self {
                kind,
                config,
                store,
                kv,
                queue,
                dedup,
                metrics,
                fanout: Arc::new(fanout),
                accounts: Arc::new(accounts),
                metadata,
                prices,
                fetcher,
                shutdown_tx,
                shutdown_rx,
                subscription_handle: None,
                worker_pool: None,
                background: Vec::new(),
            },
            receivers,
        ))
    }

    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn dedup(&self) -> &DedupLayer {
        &self.dedup
    }

    /// Bring the pipeline up: recover the queue, start workers, subscribe,
    /// and launch the supervised maintenance tasks.
    pub fn start(&mut self) -> Result<()> {
        self.queue
            .recover_stale()
            .context("stale job recovery failed")?;

        let pipeline = self.config.pipeline(self.kind).clone();
        let ctx = Arc::new(WorkerContext {
            kind: self.kind,
            min_confidence: self.config.min_alert_confidence,
            queue: self.queue.clone(),
            dedup: self.dedup.clone(),
            store: self.store.clone(),
            metadata: self.metadata.clone(),
            prices: self.prices.clone(),
            fetcher: self.fetcher.clone(),
            fanout: self.fanout.clone(),
            metrics: self.metrics.clone(),
            accounts: self.accounts.clone(),
        });
        self.worker_pool = Some(WorkerPool::spawn(
            ctx,
            pipeline.num_workers,
            pipeline.worker_concurrency,
            self.shutdown_rx.clone(),
        ));

        let mut subscription = SubscriptionManager::new(
            self.config.ws_endpoint(),
            self.accounts.values().cloned().collect(),
            self.dedup.clone(),
            self.metrics.clone(),
            self.shutdown_rx.clone(),
        );
        self.subscription_handle = Some(tokio::spawn(async move {
            subscription.run().await;
        }));

        self.background.push(self.spawn_janitor());
        self.background.push(self.spawn_stats_reporter());

        info!("{} pipeline started", self.kind.as_str());
        Ok(())
    }

    /// Supervised KV janitor: sweeps expired locks with a per-tick cap
    fn spawn_janitor(&self) -> JoinHandle<()> {
        let kv = self.kv.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        kv.sweep_expired();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Periodic pipeline statistics, including the queue-depth warning
    fn spawn_stats_reporter(&self) -> JoinHandle<()> {
        let kind = self.kind;
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        let fanout = self.fanout.clone();
        let kv = self.kv.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let depth = queue.depth().unwrap_or(0);
                        metrics.queue_depth.set(depth as i64);
                        if depth > QUEUE_DEPTH_WARN {
                            warn!(
                                "{} queue backlog: {} jobs pending",
                                kind.as_str(), depth
                            );
                        }
                        let (alert_drops, broadcast_drops, tweet_drops) = fanout.dropped();
                        info!(
                            "{} pipeline stats: received={} enqueued={} dedup_hits={} \
                             classified={} splits={} persisted={} queue_depth={} \
                             live_locks={} fanout_drops={}/{}/{}",
                            kind.as_str(),
                            metrics.notifications_received.get(),
                            metrics.jobs_enqueued.get(),
                            metrics.dedup_hits.get(),
                            metrics.swaps_classified.get(),
                            metrics.splits_classified.get(),
                            metrics.records_persisted.get(),
                            depth,
                            kv.live_lock_count(),
                            alert_drops, broadcast_drops, tweet_drops,
                        );
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Ordered teardown:
    ///   1. stop intake (subscription socket closes),
    ///   2. snapshot queue depth,
    ///   3. close workers under the per-worker deadline,
    ///   4. obliterate the queue under its deadline,
    ///   5. drop queue backend state,
    ///   6. clear the KV store.
    pub async fn shutdown(mut self, deadlines: ShutdownDeadlines) -> Result<()> {
        info!("{} pipeline shutting down", self.kind.as_str());
        self.shutdown_tx.send(true).ok();

        if let Some(handle) = self.subscription_handle.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Subscription task did not stop in time");
            }
        }

        let depth = self.queue.depth().unwrap_or(0);
        info!(
            "{} queue depth at shutdown: {} jobs",
            self.kind.as_str(),
            depth
        );

        if let Some(pool) = self.worker_pool.take() {
            pool.close(deadlines.per_worker).await;
        }

        let queue = self.queue.clone();
        let obliterate = tokio::task::spawn_blocking(move || queue.obliterate());
        match tokio::time::timeout(deadlines.obliterate, obliterate).await {
            Ok(Ok(Ok(removed))) => info!("Obliterated {} queued jobs", removed),
            Ok(Ok(Err(e))) => warn!("Queue obliterate failed: {}", e),
            Ok(Err(e)) => warn!("Queue obliterate task failed: {}", e),
            Err(_) => warn!("Queue obliterate missed its deadline"),
        }

        for handle in self.background.drain(..) {
            handle.abort();
        }

        self.kv.clear();
        info!("{} pipeline stopped", self.kind.as_str());
        Ok(())
    }
}
