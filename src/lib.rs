//! Real-time whale & KOL swap ingestion pipeline for Solana
//!
//! This library provides:
//! - A websocket subscription manager for the parsed-transaction feed with
//!   reconnect backoff and batched address filters
//! - A balance-delta swap classifier with token-to-token split handling
//! - An exactly-once dedup layer and a durable, rate-limited job queue
//! - Worker pools that enrich, price, score, and persist trades
//! - Fan-out channels for the alert matcher, broadcast, and tweet paths

pub mod classifier;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod engine;
pub mod fanout;
pub mod kv;
pub mod metadata;
pub mod metrics;
pub mod pricing;
pub mod queue;
pub mod rpc;
pub mod scoring;
pub mod shutdown;
pub mod store;
pub mod subscription;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use classifier::{classify, match_tracked_accounts, precheck, RejectReason, Rejection, TxView};
pub use config::{EngineConfig, PipelineConfig};
pub use dedup::DedupLayer;
pub use engine::MonitorEngine;
pub use fanout::{FanoutBus, FanoutEvent, FanoutReceivers};
pub use kv::{KvStats, KvStore};
pub use metadata::{
    HeliusAssetProvider, MarketDataProvider, MetadataProvider, TokenMetadata, TokenMetadataCache,
};
pub use metrics::IngestMetrics;
pub use pricing::{sol_amounts, swap_ratio_price, HttpPriceFeed, PriceFeed, PriceService, TokenMarket};
pub use queue::{Job, JobQueue, QueueError};
pub use rpc::{ChainRpcClient, RpcError, TxFetcher};
pub use scoring::{fifo_performance, hotness_score, PerformanceStats, ScoringInputs};
pub use shutdown::{run_with_deadline, wait_for_signal, ShutdownDeadlines};
pub use store::{StoreError, TradeLite, TradeStore};
pub use subscription::{reconnect_delay, ConnectionState, SubscriptionManager};
pub use types::{
    AccountKind, AssetSide, Classification, Confidence, Direction, InfluencerProfile, MatchSource,
    ParsedSwap, RawTxNotification, SplitSwapPair, StoredTrade, SwapAmounts, SwapperMethod,
    TokenDescriptor, TrackedAccount,
};
pub use worker::{process_job, JobOutcome, WorkerContext, WorkerPool};
