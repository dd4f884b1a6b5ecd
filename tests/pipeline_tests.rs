//! End-to-end pipeline tests: notification frame -> dedup -> queue ->
//! worker -> store, with stubbed providers instead of live endpoints.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use whaletrace::constants::{PROCESSED_SET_WHALE, QUEUE_WHALE};
use whaletrace::dedup::DedupLayer;
use whaletrace::fanout::{FanoutBus, FanoutEvent};
use whaletrace::kv::KvStore;
use whaletrace::metadata::{MetadataProvider, ProviderMetadata, TokenMetadataCache};
use whaletrace::metrics::IngestMetrics;
use whaletrace::pricing::{PriceFeed, PriceService, TokenMarket};
use whaletrace::queue::JobQueue;
use whaletrace::rpc::{RpcError, TxFetcher};
use whaletrace::store::TradeStore;
use whaletrace::subscription::{HandleOutcome, SubscriptionManager};
use whaletrace::types::{AccountKind, TrackedAccount};
use whaletrace::worker::{process_job, JobOutcome, WorkerContext};

const WHALE: &str = "Whale1111111111111111111111111111111111111111";
const TOK_A: &str = "TokenAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
const TOK_B: &str = "TokenBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

struct NoMetadata;

#[async_trait]
impl MetadataProvider for NoMetadata {
    async fn token_metadata(&self, _mint: &str) -> anyhow::Result<Option<ProviderMetadata>> {
        Ok(None)
    }
}

/// SOL pinned at $100; token market quotes unavailable so swap-ratio
/// pricing takes over.
struct PinnedPrices;

#[async_trait]
impl PriceFeed for PinnedPrices {
    async fn current_sol_price(&self) -> anyhow::Result<Option<f64>> {
        Ok(Some(100.0))
    }
    async fn historical_sol_price(&self, _timestamp: i64) -> anyhow::Result<Option<f64>> {
        Ok(Some(100.0))
    }
    async fn token_market(&self, _mint: &str) -> anyhow::Result<Option<TokenMarket>> {
        Ok(None)
    }
}

struct NoFetch;

#[async_trait]
impl TxFetcher for NoFetch {
    async fn fetch_parsed_transaction(&self, _signature: &str) -> Result<Value, RpcError> {
        Err(RpcError::NotFound)
    }
}

struct Pipeline {
    store: TradeStore,
    kv: KvStore,
    queue: JobQueue,
    subscription: SubscriptionManager,
    ctx: Arc<WorkerContext>,
}

fn pipeline() -> Pipeline {
    let store = TradeStore::in_memory().expect("store");
    let queue = JobQueue::new(
        QUEUE_WHALE,
        store.connection(),
        30,
        Duration::from_millis(5000),
    );
    let kv = KvStore::new();
    let dedup = DedupLayer::new(kv.clone(), queue.clone(), PROCESSED_SET_WHALE);
    let metadata = TokenMetadataCache::new(Arc::new(NoMetadata), Arc::new(NoMetadata));
    let prices = PriceService::new(Arc::new(PinnedPrices));
    let (fanout, _receivers) = FanoutBus::new();
    let metrics = IngestMetrics::new("whale-e2e").expect("metrics");

    let tracked = TrackedAccount {
        address: WHALE.to_string(),
        kind: AccountKind::Whale,
        labels: vec![],
        influencer: None,
    };
    let accounts: HashMap<String, TrackedAccount> =
        HashMap::from([(WHALE.to_string(), tracked.clone())]);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let subscription = SubscriptionManager::new(
        "wss://example.invalid".to_string(),
        vec![tracked],
        dedup.clone(),
        metrics.clone(),
        shutdown_rx,
    );

    let ctx = Arc::new(WorkerContext {
        kind: AccountKind::Whale,
        min_confidence: None,
        queue: queue.clone(),
        dedup: dedup.clone(),
        store: store.clone(),
        metadata,
        prices,
        fetcher: Arc::new(NoFetch),
        fanout: Arc::new(fanout),
        metrics,
        accounts: Arc::new(accounts),
    });

    Pipeline { store, kv, queue, subscription, ctx }
}

fn token_balance(index: u64, mint: &str, owner: &str, amount: f64, decimals: u8) -> Value {
    json!({
        "accountIndex": index,
        "mint": mint,
        "owner": owner,
        "uiTokenAmount": {
            "uiAmount": amount,
            "decimals": decimals,
            "amount": format!("{}", (amount * 10f64.powi(decimals as i32)) as u64),
            "uiAmountString": format!("{amount}")
        }
    })
}

fn notification_frame(
    signature: &str,
    pre_lamports: u64,
    post_lamports: u64,
    pre_tokens: Vec<Value>,
    post_tokens: Vec<Value>,
    err: Value,
) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": "transactionNotification",
        "params": {
            "result": {
                "signature": signature,
                "transaction": {
                    "transaction": {
                        "message": {"accountKeys": [
                            {"pubkey": WHALE, "signer": true, "writable": true}
                        ]},
                        "signatures": [signature]
                    },
                    "meta": {
                        "err": err,
                        "fee": 5000,
                        "preBalances": [pre_lamports],
                        "postBalances": [post_lamports],
                        "preTokenBalances": pre_tokens,
                        "postTokenBalances": post_tokens,
                        "innerInstructions": []
                    }
                },
                "blockTime": 1_700_000_000
            }
        }
    })
    .to_string()
}

async fn drain_queue(p: &Pipeline) {
    while let Some(job) = p.queue.claim().expect("claim") {
        let job_id = job.id.clone();
        match process_job(&p.ctx, job).await {
            JobOutcome::Completed => p.queue.complete(&job_id).expect("complete"),
            JobOutcome::Retry(reason) => p.queue.fail(&job_id, &reason).expect("fail"),
        }
    }
}

#[tokio::test]
async fn single_native_buy_end_to_end() {
    let p = pipeline();

    // Swapper spends 1 SOL and receives 1000 TOK_A
    let frame = notification_frame(
        "sig-buy",
        10_000_000_000,
        8_999_995_000,
        vec![token_balance(1, TOK_A, WHALE, 0.0, 6)],
        vec![token_balance(1, TOK_A, WHALE, 1000.0, 6)],
        Value::Null,
    );
    assert_eq!(p.subscription.handle_text(&frame), HandleOutcome::Enqueued(1));
    drain_queue(&p).await;

    assert_eq!(p.store.count_records(AccountKind::Whale, "sig-buy").unwrap(), 1);
    let conn = p.store.connection();
    let guard = conn.lock().unwrap();
    let row: (String, f64, f64, Option<f64>, Option<f64>, String, f64) = guard
        .query_row(
            "SELECT trade_type, token_out_amount, usd_buy_amount, sell_sol_amount,
                    buy_sol_amount, classification_source, token_out_price
             FROM whale_swaps WHERE signature = 'sig-buy'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?)),
        )
        .unwrap();

    assert_eq!(row.0, "buy");
    assert_eq!(row.1, 1000.0);
    assert!((row.2 - 100.0).abs() < 1.0, "usd buy {}", row.2);
    assert!(row.3.unwrap() > 0.99, "gross SOL spent");
    assert!(row.4.is_none(), "no native received on a buy");
    assert_eq!(row.5, "v2_parser");
    // ~1 SOL x $100 / 1000 tokens
    assert!((row.6 - 0.1).abs() < 0.01, "token price {}", row.6);
}

#[tokio::test]
async fn token_to_token_split_end_to_end() {
    let p = pipeline();

    // 500 A -> 1000 B with no native leg beyond the fee
    let frame = notification_frame(
        "sig-split",
        1_000_000_000,
        999_995_000,
        vec![
            token_balance(1, TOK_A, WHALE, 500.0, 6),
            token_balance(2, TOK_B, WHALE, 0.0, 9),
        ],
        vec![
            token_balance(1, TOK_A, WHALE, 0.0, 6),
            token_balance(2, TOK_B, WHALE, 1000.0, 9),
        ],
        Value::Null,
    );
    assert_eq!(p.subscription.handle_text(&frame), HandleOutcome::Enqueued(1));
    drain_queue(&p).await;

    assert_eq!(p.store.count_records(AccountKind::Whale, "sig-split").unwrap(), 2);
    let conn = p.store.connection();
    let guard = conn.lock().unwrap();
    let mut stmt = guard
        .prepare(
            "SELECT trade_type, classification_source, token_in_address, token_out_address,
                    buy_sol_amount, sell_sol_amount
             FROM whale_swaps WHERE signature = 'sig-split' ORDER BY trade_type",
        )
        .unwrap();
    let rows: Vec<(String, String, String, String, Option<f64>, Option<f64>)> = stmt
        .query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let (buy, sell) = (&rows[0], &rows[1]);
    assert_eq!(buy.0, "buy");
    assert_eq!(buy.1, "v2_parser_split_buy");
    assert_eq!(buy.3, TOK_B, "buy child receives token B");
    assert_eq!(sell.0, "sell");
    assert_eq!(sell.1, "v2_parser_split_sell");
    assert_eq!(sell.2, TOK_A, "sell child sends token A");
    // Neither child fabricates a native amount
    for row in &rows {
        assert!(row.4.is_none() && row.5.is_none());
    }
}

#[tokio::test]
async fn failed_transaction_never_enters_the_queue() {
    let p = pipeline();
    let frame = notification_frame(
        "sig-failed",
        10_000_000_000,
        8_999_995_000,
        vec![],
        vec![token_balance(1, TOK_A, WHALE, 1000.0, 6)],
        json!({"InstructionError": [2, {"Custom": 6001}]}),
    );
    assert!(matches!(p.subscription.handle_text(&frame), HandleOutcome::Dropped(_)));
    assert_eq!(p.queue.depth().unwrap(), 0);
    assert_eq!(p.store.count_records(AccountKind::Whale, "sig-failed").unwrap(), 0);
}

#[tokio::test]
async fn duplicate_notifications_persist_exactly_once() {
    let p = pipeline();
    let frame = notification_frame(
        "sig-dup",
        10_000_000_000,
        8_999_995_000,
        vec![token_balance(1, TOK_A, WHALE, 0.0, 6)],
        vec![token_balance(1, TOK_A, WHALE, 1000.0, 6)],
        Value::Null,
    );

    // Delivered twice in quick succession: the second add to the processed
    // set aborts the enqueue
    assert_eq!(p.subscription.handle_text(&frame), HandleOutcome::Enqueued(1));
    assert_eq!(p.subscription.handle_text(&frame), HandleOutcome::DedupSkipped);
    assert_eq!(p.queue.depth().unwrap(), 1);

    drain_queue(&p).await;
    assert_eq!(p.store.count_records(AccountKind::Whale, "sig-dup").unwrap(), 1);

    // Replaying after processing still converges to one record via the
    // unique constraint
    p.subscription.handle_text(&frame);
    drain_queue(&p).await;
    assert_eq!(p.store.count_records(AccountKind::Whale, "sig-dup").unwrap(), 1);
}

#[tokio::test]
async fn expired_lock_allows_reprocessing() {
    let p = pipeline();

    // A crashed worker left its processing lock behind; the TTL has lapsed
    assert!(p
        .kv
        .lock_acquire("processing_lock:sig-crash", Duration::from_millis(0)));

    let frame = notification_frame(
        "sig-crash",
        10_000_000_000,
        8_999_995_000,
        vec![token_balance(1, TOK_A, WHALE, 0.0, 6)],
        vec![token_balance(1, TOK_A, WHALE, 1000.0, 6)],
        Value::Null,
    );
    p.subscription.handle_text(&frame);
    drain_queue(&p).await;

    assert_eq!(p.store.count_records(AccountKind::Whale, "sig-crash").unwrap(), 1);
    // And the finally path released the fresh lock
    assert_eq!(p.kv.live_lock_count(), 0);
}

#[tokio::test]
async fn unknown_token_price_is_imputed_from_swap_ratio() {
    let p = pipeline();

    // BUY of 10,000 TOK_A against 2 SOL at $100: the provider has no quote,
    // so the token price comes from the swap ratio
    let frame = notification_frame(
        "sig-ratio",
        10_000_000_000,
        7_999_995_000,
        vec![token_balance(1, TOK_A, WHALE, 0.0, 6)],
        vec![token_balance(1, TOK_A, WHALE, 10_000.0, 6)],
        Value::Null,
    );
    p.subscription.handle_text(&frame);
    drain_queue(&p).await;

    let conn = p.store.connection();
    let guard = conn.lock().unwrap();
    let (price, usd_buy, sell_sol, buy_sol, imputed): (f64, f64, Option<f64>, Option<f64>, i64) =
        guard
            .query_row(
                "SELECT token_out_price, usd_buy_amount, sell_sol_amount, buy_sol_amount,
                        price_imputed
                 FROM whale_swaps WHERE signature = 'sig-ratio'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .unwrap();

    // (2 SOL x $100) / 10,000 tokens = $0.02
    assert!((price - 0.02).abs() < 0.001, "price {price}");
    assert!((usd_buy - 200.0).abs() < 2.0, "usd {usd_buy}");
    assert!(sell_sol.unwrap() > 1.99);
    assert!(buy_sol.is_none());
    assert_eq!(imputed, 1);
}

#[tokio::test]
async fn tweet_candidates_flow_through_fanout() {
    // Rebuild the pipeline keeping the receivers this time
    let store = TradeStore::in_memory().expect("store");
    let queue = JobQueue::new(
        QUEUE_WHALE,
        store.connection(),
        30,
        Duration::from_millis(5000),
    );
    let dedup = DedupLayer::new(KvStore::new(), queue.clone(), PROCESSED_SET_WHALE);
    let metadata = TokenMetadataCache::new(Arc::new(NoMetadata), Arc::new(NoMetadata));
    let prices = PriceService::new(Arc::new(PinnedPrices));
    let (fanout, mut receivers) = FanoutBus::new();
    let accounts = HashMap::from([(
        WHALE.to_string(),
        TrackedAccount {
            address: WHALE.to_string(),
            kind: AccountKind::Whale,
            labels: vec!["SMART MONEY".to_string()],
            influencer: None,
        },
    )]);
    let ctx = Arc::new(WorkerContext {
        kind: AccountKind::Whale,
        min_confidence: None,
        queue: queue.clone(),
        dedup: dedup.clone(),
        store: store.clone(),
        metadata,
        prices,
        fetcher: Arc::new(NoFetch),
        fanout: Arc::new(fanout),
        metrics: IngestMetrics::new("whale-fanout-e2e").expect("metrics"),
        accounts: Arc::new(accounts),
    });

    // A 100 SOL buy (~$10k) of a fresh token scores high enough to tweet
    let raw: Value = serde_json::from_str(
        &notification_frame(
            "sig-big",
            200_000_000_000,
            99_999_995_000,
            vec![token_balance(1, TOK_A, WHALE, 0.0, 6)],
            vec![token_balance(1, TOK_A, WHALE, 1_000_000.0, 6)],
            Value::Null,
        ),
    )
    .unwrap();
    let result = raw.pointer("/params/result").unwrap().clone();

    use whaletrace::types::RawTxNotification;
    let notification = RawTxNotification {
        signature: "sig-big".into(),
        raw: result,
        account_keys: vec![WHALE.to_string()],
    };
    assert!(dedup.try_enqueue(&notification, WHALE).unwrap());

    let job = queue.claim().unwrap().unwrap();
    assert_eq!(process_job(&ctx, job).await, JobOutcome::Completed);

    assert!(matches!(
        receivers.alert_rx.try_recv(),
        Ok(FanoutEvent::AlertMatch(_))
    ));
    assert!(matches!(
        receivers.broadcast_rx.try_recv(),
        Ok(FanoutEvent::Broadcast(_))
    ));
    match receivers.tweet_rx.try_recv() {
        Ok(FanoutEvent::TweetCandidate(trade)) => {
            assert!(trade.usd_buy_amount >= 1_000.0);
            assert!(trade.hotness_score >= 6);
        }
        other => panic!("expected a tweet candidate, got {other:?}"),
    }
}
