use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::classify;
use crate::types::Classification;
use crate::constants::{
    is_native_mint, lamports_to_sol, DAILY_REPEAT_LIMIT, SMALL_BUY_THROTTLE_USD,
    SOLANA_GENESIS_TIMESTAMP,
};
use crate::dedup::DedupLayer;
use crate::fanout::FanoutBus;
use crate::metadata::TokenMetadataCache;
use crate::metrics::IngestMetrics;
use crate::pricing::{sol_amounts, swap_ratio_price, PriceService};
use crate::queue::{Job, JobQueue};
use crate::rpc::TxFetcher;
use crate::scoring::score_buy;
use crate::store::{StoreError, TradeStore};
use crate::types::{
    AccountKind, Confidence, Direction, ParsedSwap, StoredTrade, TokenDescriptor, TrackedAccount,
};

/// Idle wait between claim attempts when the queue is empty
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Everything a worker slot needs to process jobs for one pipeline
pub struct WorkerContext {
    pub kind: AccountKind,
    pub min_confidence: Option<Confidence>,
    pub queue: JobQueue,
    pub dedup: DedupLayer,
    pub store: TradeStore,
    pub metadata: TokenMetadataCache,
    pub prices: PriceService,
    pub fetcher: Arc<dyn TxFetcher>,
    pub fanout: Arc<FanoutBus>,
    pub metrics: IngestMetrics,
    pub accounts: Arc<HashMap<String, TrackedAccount>>,
}

/// Terminal state of one processing attempt
#[derive(Debug, PartialEq)]
pub enum JobOutcome {
    /// Finished (persisted, rejected, or legitimately skipped)
    Completed,
    /// Transient failure; the queue reschedules with backoff
    Retry(String),
}

/// Pool of worker slots draining one pipeline's queue. `num_workers`
/// consumers with `concurrency` slots each gives at most N×C jobs in
/// flight; the queue's rate limiter bounds claim rate underneath.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        ctx: Arc<WorkerContext>,
        num_workers: usize,
        concurrency: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut handles = Vec::new();
        for worker_id in 0..num_workers.max(1) {
            for slot in 0..concurrency.max(1) {
                let ctx = ctx.clone();
                let shutdown_rx = shutdown_rx.clone();
                handles.push(tokio::spawn(async move {
                    run_slot(ctx, worker_id, slot, shutdown_rx).await;
                }));
            }
        }
        info!(
            "Worker pool up: {} workers x {} slots",
            num_workers.max(1),
            concurrency.max(1)
        );
        Self { handles }
    }

    pub fn slot_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every slot to wind down, force-aborting stragglers after
    /// the per-worker deadline.
    pub async fn close(self, per_worker_deadline: Duration) {
        for handle in self.handles {
            let aborter = handle.abort_handle();
            match tokio::time::timeout(per_worker_deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker slot ended with error: {}", e),
                Err(_) => {
                    aborter.abort();
                    warn!("Worker slot missed the shutdown deadline, force-closed");
                }
            }
        }
    }
}

async fn run_slot(
    ctx: Arc<WorkerContext>,
    worker_id: usize,
    slot: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!("Worker {}/{} slot online", worker_id, slot);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            claimed = ctx.queue.claim_ready() => {
                match claimed {
                    Ok(Some(job)) => {
                        let started = Instant::now();
                        let job_id = job.id.clone();
                        let outcome = process_job(&ctx, job).await;
                        ctx.metrics.job_seconds.observe(started.elapsed().as_secs_f64());
                        let result = match outcome {
                            JobOutcome::Completed => ctx.queue.complete(&job_id),
                            JobOutcome::Retry(reason) => ctx.queue.fail(&job_id, &reason),
                        };
                        if let Err(e) = result {
                            error!("Queue bookkeeping failed for {}: {}", job_id, e);
                        }
                    }
                    Ok(None) => {
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    Err(e) => {
                        error!("Queue claim failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
    debug!("Worker {}/{} slot stopped", worker_id, slot);
}

/// Process one job to a terminal state. Acquires the per-signature lock and
/// always releases it (and the processed-pair entry) on the way out, even
/// if the inner processing panics.
pub async fn process_job(ctx: &WorkerContext, job: Job) -> JobOutcome {
    if !ctx.dedup.acquire_processing_lock(&job.signature) {
        debug!("Lock held elsewhere for {}, rescheduling", job.signature);
        return JobOutcome::Retry("processing lock held".into());
    }

    let signature = job.signature.clone();
    let tracked_account = job.tracked_account.clone();
    let outcome = AssertUnwindSafe(process_locked(ctx, job))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!("Job for {} panicked", signature);
            JobOutcome::Retry("worker panic".into())
        });

    ctx.dedup.release_processing_lock(&signature);
    ctx.dedup.clear_processed(&signature, &tracked_account);
    outcome
}

async fn process_locked(ctx: &WorkerContext, job: Job) -> JobOutcome {
    // A fully persisted signature (single record or split pair) means some
    // worker already finished this transaction.
    match ctx.store.count_records(ctx.kind, &job.signature) {
        Ok(count) if count >= 2 => {
            ctx.metrics.duplicates_skipped.inc();
            return JobOutcome::Completed;
        }
        Ok(_) => {}
        Err(e) => return JobOutcome::Retry(format!("record count failed: {e}")),
    }

    // Prefer the payload cached from the notification; re-fetch over RPC
    // only when the queue lost it.
    let raw = match job.payload {
        Some(raw) => raw,
        None => match ctx.fetcher.fetch_parsed_transaction(&job.signature).await {
            Ok(raw) => raw,
            Err(e) if e.retryable() => {
                return JobOutcome::Retry(format!("rpc fetch failed: {e}"));
            }
            Err(e) => {
                warn!("Dropping {}: {}", job.signature, e);
                return JobOutcome::Completed;
            }
        },
    };

    let Some(account) = ctx.accounts.get(&job.tracked_account).cloned() else {
        warn!(
            "Tracked account {} left the watch list, dropping {}",
            job.tracked_account, job.signature
        );
        return JobOutcome::Completed;
    };

    let classification = match classify(&raw, &account, ctx.min_confidence) {
        Ok(classification) => classification,
        Err(rejection) => {
            ctx.metrics
                .rejections
                .with_label_values(&[rejection.reason.as_str()])
                .inc();
            debug!(
                "Rejected {} for {}: {} (fee_payer={:?}, signers={}, deltas={:?})",
                job.signature,
                account.address,
                rejection.reason,
                rejection.debug.fee_payer,
                rejection.debug.signer_count,
                rejection.debug.delta_summary,
            );
            return JobOutcome::Completed;
        }
    };

    match classification {
        Classification::Single(swap) => {
            ctx.metrics.swaps_classified.inc();
            let trade = match build_record(ctx, &swap, &account).await {
                Ok(Some(trade)) => trade,
                Ok(None) => return JobOutcome::Completed,
                Err(e) => return JobOutcome::Retry(e.to_string()),
            };
            persist_and_emit(ctx, vec![trade])
        }
        Classification::Split(pair) => {
            ctx.metrics.splits_classified.inc();
            // Enrichment runs independently for the two synthetic legs
            let sell = match build_record(ctx, &pair.sell, &account).await {
                Ok(Some(trade)) => trade,
                Ok(None) => return JobOutcome::Completed,
                Err(e) => return JobOutcome::Retry(e.to_string()),
            };
            let buy = match build_record(ctx, &pair.buy, &account).await {
                Ok(Some(trade)) => trade,
                Ok(None) => return JobOutcome::Completed,
                Err(e) => return JobOutcome::Retry(e.to_string()),
            };
            match ctx.store.insert_split_pair(&sell, &buy) {
                Ok(()) => {
                    ctx.metrics.records_persisted.inc_by(2);
                    ctx.fanout.emit(&sell);
                    ctx.fanout.emit(&buy);
                    JobOutcome::Completed
                }
                Err(StoreError::Duplicate) => {
                    ctx.metrics.duplicates_skipped.inc();
                    JobOutcome::Completed
                }
                Err(e) => JobOutcome::Retry(format!("split persist failed: {e}")),
            }
        }
    }
}

fn persist_and_emit(ctx: &WorkerContext, trades: Vec<StoredTrade>) -> JobOutcome {
    for trade in trades {
        match ctx.store.insert_trade(&trade) {
            Ok(()) => {
                ctx.metrics.records_persisted.inc();
                ctx.fanout.emit(&trade);
            }
            Err(StoreError::Duplicate) => {
                ctx.metrics.duplicates_skipped.inc();
            }
            Err(e) => return JobOutcome::Retry(format!("persist failed: {e}")),
        }
    }
    JobOutcome::Completed
}

/// Enrich, price, and score one classified swap into its stored form.
/// Returns Ok(None) when the small-buy throttle suppresses persistence.
async fn build_record(
    ctx: &WorkerContext,
    swap: &ParsedSwap,
    account: &TrackedAccount,
) -> Result<Option<StoredTrade>, StoreError> {
    let base_symbol = if swap.base_asset.symbol.is_empty() {
        None
    } else {
        Some(swap.base_asset.symbol.as_str())
    };
    let base_meta = ctx.metadata.resolve(&swap.base_asset.mint, base_symbol).await;
    let base_created = ctx.metadata.creation_time(&swap.base_asset.mint).await;
    let base_market = ctx.prices.token_market(&swap.base_asset.mint).await;

    let timestamp = swap.timestamp.timestamp();
    let sol_usd = ctx.prices.historical_sol_price(timestamp).await;

    // Native amount actually observed for this swap, if any
    let native_amount = match swap.direction {
        Direction::Buy => swap.amounts.total_wallet_cost,
        Direction::Sell => swap.amounts.net_wallet_received,
    };

    // Swap-ratio pricing bypasses per-trade DEX price queries whenever both
    // legs were observed; otherwise fall back to the market quote.
    let (token_price, price_imputed) = match native_amount
        .and_then(|native| swap_ratio_price(native, sol_usd, swap.amounts.base_amount))
    {
        Some(ratio_price) => (ratio_price, base_market.price_usd <= 0.0),
        None => (base_market.price_usd, false),
    };

    let usd_value = match native_amount {
        Some(native) => native * sol_usd,
        None => {
            let value = token_price * swap.amounts.base_amount;
            if value <= 0.0 {
                warn!(
                    "No USD price for {} on {}, persisting zero-value record",
                    swap.base_asset.mint, swap.signature
                );
            }
            value
        }
    };

    // Small-buy throttle: after the daily repeat limit, minor re-buys are
    // recorded but not persisted as alertable trades.
    let utc_day = swap.timestamp.format("%Y-%m-%d").to_string();
    if swap.direction == Direction::Buy {
        let prior_buys =
            ctx.store
                .todays_buy_count(ctx.kind, &account.address, &swap.base_asset.mint, &utc_day)?;
        if prior_buys >= DAILY_REPEAT_LIMIT && usd_value < SMALL_BUY_THROTTLE_USD {
            debug!(
                "Throttling small repeat buy: {} {} ${:.2} ({} prior today)",
                account.address, swap.base_asset.mint, usd_value, prior_buys
            );
            ctx.store.record_purchase(
                ctx.kind,
                &account.address,
                &swap.base_asset.mint,
                &swap.signature,
                usd_value,
                &utc_day,
                true,
            )?;
            return Ok(None);
        }
    }

    let base_descriptor = TokenDescriptor {
        address: swap.base_asset.mint.clone(),
        symbol: base_meta.symbol.clone(),
        name: base_meta.name.clone(),
        image_url: base_meta.image_url.clone(),
        market_cap: base_market.market_cap,
        usd_amount: usd_value,
        created_at: base_created,
    };
    let native_descriptor = TokenDescriptor {
        address: swap.quote_asset.mint.clone(),
        symbol: "SOL".to_string(),
        name: "Solana".to_string(),
        image_url: None,
        market_cap: None,
        usd_amount: usd_value,
        created_at: Some(SOLANA_GENESIS_TIMESTAMP),
    };
    debug_assert!(is_native_mint(&swap.quote_asset.mint));

    // Wallet perspective: token_in is what the wallet paid into the swap,
    // token_out is what it received.
    let (token_in, token_in_amount, token_in_price, token_out, token_out_amount, token_out_price) =
        match swap.direction {
            Direction::Buy => (
                native_descriptor,
                native_amount.unwrap_or(0.0),
                sol_usd,
                base_descriptor,
                swap.amounts.base_amount,
                token_price,
            ),
            Direction::Sell => (
                base_descriptor,
                swap.amounts.base_amount,
                token_price,
                native_descriptor,
                native_amount.unwrap_or(0.0),
                sol_usd,
            ),
        };

    let (buy_sol_amount, sell_sol_amount) = sol_amounts(swap);
    let gas_fee_usd = lamports_to_sol(swap.amounts.fee_lamports) * sol_usd;

    let hotness_score = if swap.direction == Direction::Buy {
        let (score, _prior) = score_buy(
            &ctx.store,
            account,
            &swap.base_asset.mint,
            &swap.signature,
            usd_value,
            base_market.market_cap,
            swap.timestamp,
        )?;
        ctx.store.record_purchase(
            ctx.kind,
            &account.address,
            &swap.base_asset.mint,
            &swap.signature,
            usd_value,
            &utc_day,
            false,
        )?;
        score
    } else {
        0
    };

    Ok(Some(StoredTrade {
        signature: swap.signature.clone(),
        trade_type: swap.direction,
        classification_source: swap.classification_source.clone(),
        usd_buy_amount: usd_value,
        usd_sell_amount: usd_value,
        token_in,
        token_in_amount,
        token_in_price,
        token_out,
        token_out_amount,
        token_out_price,
        price_imputed,
        buy_sol_amount,
        sell_sol_amount,
        protocol: swap.protocol.clone(),
        gas_fee_usd,
        tracked_account: account.address.clone(),
        account_kind: account.kind,
        account_labels: account.labels.clone(),
        influencer: account.influencer.clone(),
        hotness_score,
        confidence: swap.confidence,
        tx_timestamp: timestamp,
    }))
}
