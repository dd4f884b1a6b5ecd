/// Global constants for the whaletrace ingestion pipeline
///
/// This module centralizes chain constants, dedup key prefixes, queue names,
/// and threshold values so they stay consistent across the pipeline.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::time::Duration;

// ============================================================================
// SOLANA BLOCKCHAIN CONSTANTS
// ============================================================================

/// 1 SOL = 1 billion lamports
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Convert lamports to SOL (floating point)
pub const fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Native SOL pseudo-mint used by parsed balance metadata
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111111";

/// Wrapped SOL mint, treated as equivalent to the native coin
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Solana genesis timestamp (2020-03-16T14:29:00Z), used as the creation
/// time of the native coin and its wrapped form
pub const SOLANA_GENESIS_TIMESTAMP: i64 = 1_584_368_940;

/// Native deltas below this magnitude are rent refunds / fee noise, not a
/// swap leg
pub const NATIVE_DUST_THRESHOLD_SOL: f64 = 0.002;

/// Token deltas below this magnitude are routing residue and are collapsed
/// out of multi-hop swaps
pub const INTERMEDIATE_DELTA_EPSILON: f64 = 1e-9;

/// Returns true when the mint is the native coin or its wrapped form
pub fn is_native_mint(mint: &str) -> bool {
    mint == NATIVE_MINT || mint == WSOL_MINT
}

// ============================================================================
// EXCLUDED TOKENS
// ============================================================================

/// Base assets the pipeline never alerts on (stablecoins and wrapped
/// majors); a swap whose base side is one of these is rejected.
pub static EXCLUDED_TOKENS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v", // USDC
        "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB", // USDT
        "7vfCXTUXx5WJV5JADk17DUJ4ksgau7utNKj4b963voxs", // wETH (Wormhole)
        "3NZ9JMVBmGAqocybic2c7LQCJScmgsAZ6vQqTDzcqmJh", // wBTC (Wormhole)
        "USDH1SM1ojwWUga67PGrgFWUHibbjqMvuMaDkRJTgkX",  // USDH
    ])
});

/// Placeholder symbols that mean "the parser did not actually resolve a
/// symbol" and must not be cached as real metadata
pub static INVALID_SYMBOLS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["Unknown", "Token", ""]));

// ============================================================================
// KNOWN DEX PROGRAMS
// ============================================================================

/// Known swap program IDs, used only to label the protocol of a classified
/// swap. Classification itself is balance-delta based and does not depend
/// on this table.
pub static KNOWN_SWAP_PROGRAMS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "raydium"),
        ("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", "raydium_clmm"),
        ("CPMMoo8L3F4NbTegBCKVNunggL7H1ZpdTHKxQB5qKP1C", "raydium_cpmm"),
        ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", "orca_whirlpool"),
        ("9W959DqEETiGZocYWCQPaJ6sBmUzgfxXfqGeTEdp3aQP", "orca"),
        ("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", "jupiter"),
        ("LBUZKhRxPF3XUpBCjp4YzTKgLccjZhTSDM9YuVaPwxo", "meteora_dlmm"),
        ("Eo7WjKq67rjJQSZxS6z3YkapzY3eMj6Xy8X5EQVn5UaB", "meteora"),
        ("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P", "pumpfun"),
        ("GMk6j2defJhS7F194toqmJNFNhAkbDXhYJo5oR3Rpump", "pumpswap"),
    ]
});

// ============================================================================
// DEDUP / QUEUE KEYS
// ============================================================================

/// Processed-pair set for the whale pipeline
pub const PROCESSED_SET_WHALE: &str = "processed_signatures";

/// Processed-pair set for the KOL pipeline
pub const PROCESSED_SET_KOL: &str = "processed_signatures_kol";

/// Prefix for per-signature processing locks
pub const PROCESSING_LOCK_PREFIX: &str = "processing_lock:";

/// Prefix for per-account latest-signature advisory entries
pub const LATEST_SIGNATURE_PREFIX: &str = "latest_signature:";

/// Whale job queue name
pub const QUEUE_WHALE: &str = "signature-processing";

/// KOL job queue name
pub const QUEUE_KOL: &str = "signature-processing-kol";

/// Processing-lock lifetime; a crashed worker's lock expires after this
pub const PROCESSING_LOCK_TTL: Duration = Duration::from_secs(300);

// ============================================================================
// TIMEOUTS & RETRY POLICY
// ============================================================================

/// Websocket connect attempts are abandoned after this long
pub const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Protocol-level ping cadence while the subscription socket is open
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect backoff base delay
pub const WS_RECONNECT_BASE: Duration = Duration::from_secs(5);

/// Reconnect backoff cap
pub const WS_RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Addresses per batched subscription request (upstream filter limit)
pub const SUBSCRIBE_BATCH_SIZE: usize = 50;

/// Stagger between batched subscription requests
pub const SUBSCRIBE_BATCH_STAGGER: Duration = Duration::from_millis(100);

/// getSignatureStatuses call timeout
pub const RPC_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// getTransaction call timeout
pub const RPC_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Metadata provider call timeout
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(20);

/// Price provider call timeout
pub const PRICING_TIMEOUT: Duration = Duration::from_secs(20);

/// RPC re-fetch attempts before a job is failed back to the queue
pub const RPC_MAX_ATTEMPTS: u32 = 3;

/// Queue retry backoff initial delay
pub const JOB_BACKOFF_INITIAL: Duration = Duration::from_secs(2);

/// Completed jobs retained per queue
pub const JOB_KEEP_COMPLETED: usize = 200;

/// Failed jobs retained per queue
pub const JOB_KEEP_FAILED: usize = 500;

// ============================================================================
// PRICING & SCORING
// ============================================================================

/// Fallback SOL/USD price when every source is unavailable; a warning is
/// logged whenever this is used
pub const SOL_PRICE_FALLBACK_USD: f64 = 150.0;

/// Negative metadata results suppress re-resolution for this long
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Distinct-buyer cap stored per token (whale pipeline)
pub const HOTNESS_BUYER_CAP_WHALE: usize = 5;

/// Distinct-buyer cap stored per token (KOL pipeline)
pub const HOTNESS_BUYER_CAP_KOL: usize = 3;

/// Early-buyer bonus applies while distinct buyers are below this (whale)
pub const EARLY_BUYER_LIMIT_WHALE: usize = 6;

/// Early-buyer bonus applies while distinct buyers are below this (KOL)
pub const EARLY_BUYER_LIMIT_KOL: usize = 3;

/// Repeat buys under this USD amount are throttled once the same-day limit
/// is reached
pub const SMALL_BUY_THROTTLE_USD: f64 = 140.0;

/// Same-day buys of one token by one account before the throttle applies
pub const DAILY_REPEAT_LIMIT: usize = 2;

/// BUY records below this USD value never trigger the tweet path
pub const TWEET_MIN_USD: f64 = 1_000.0;

/// BUY records below this hotness never trigger the tweet path
pub const TWEET_MIN_HOTNESS: i32 = 6;

/// Queue depth above which a backlog warning is logged
pub const QUEUE_DEPTH_WARN: usize = 500;

/// Maximum expired KV entries removed per janitor tick
pub const JANITOR_MAX_SWEEP: usize = 256;
