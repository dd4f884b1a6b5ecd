use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::constants::{is_native_mint, PRICING_TIMEOUT, SOL_PRICE_FALLBACK_USD};
use crate::types::{Direction, ParsedSwap};

/// Cached SOL price is considered current for this long
const SOL_PRICE_TTL: Duration = Duration::from_secs(30);

/// Market view of one token
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenMarket {
    pub price_usd: f64,
    pub market_cap: Option<f64>,
}

/// Price lookup seam. Production wires the HTTP feed; tests substitute
/// fixed quotes.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn current_sol_price(&self) -> anyhow::Result<Option<f64>>;
    async fn historical_sol_price(&self, timestamp: i64) -> anyhow::Result<Option<f64>>;
    async fn token_market(&self, mint: &str) -> anyhow::Result<Option<TokenMarket>>;
}

/// HTTP price feed: CoinGecko for SOL spot/historical, the market-data
/// provider for per-token price and market cap.
pub struct HttpPriceFeed {
    client: Client,
    coingecko_base: String,
    market_data_base: String,
}

impl HttpPriceFeed {
    pub fn new() -> Self {
        Self::with_base_urls(
            "https://api.coingecko.com/api/v3".to_string(),
            "https://api.dexscreener.com".to_string(),
        )
    }

    pub fn with_base_urls(coingecko_base: String, market_data_base: String) -> Self {
        let client = Client::builder()
            .timeout(PRICING_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, coingecko_base, market_data_base }
    }
}

impl Default for HttpPriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn current_sol_price(&self) -> anyhow::Result<Option<f64>> {
        let url = format!(
            "{}/simple/price?ids=solana&vs_currencies=usd",
            self.coingecko_base
        );
        let response: Value = self.client.get(&url).send().await?.json().await?;
        Ok(response.pointer("/solana/usd").and_then(Value::as_f64))
    }

    async fn historical_sol_price(&self, timestamp: i64) -> anyhow::Result<Option<f64>> {
        // One-hour bracket around the transaction time; the closest sample
        // inside the range is good enough for USD conversion.
        let url = format!(
            "{}/coins/solana/market_chart/range?vs_currency=usd&from={}&to={}",
            self.coingecko_base,
            timestamp - 1800,
            timestamp + 1800
        );
        let response: Value = self.client.get(&url).send().await?.json().await?;
        let Some(prices) = response.get("prices").and_then(Value::as_array) else {
            return Ok(None);
        };
        let target_ms = timestamp * 1000;
        let closest = prices
            .iter()
            .filter_map(|entry| {
                let ts = entry.get(0)?.as_i64()?;
                let price = entry.get(1)?.as_f64()?;
                Some((ts, price))
            })
            .min_by_key(|(ts, _)| (ts - target_ms).abs());
        Ok(closest.map(|(_, price)| price))
    }

    async fn token_market(&self, mint: &str) -> anyhow::Result<Option<TokenMarket>> {
        let url = format!("{}/latest/dex/tokens/{}", self.market_data_base, mint);
        let response: Value = self.client.get(&url).send().await?.json().await?;
        let Some(pair) = response
            .get("pairs")
            .and_then(Value::as_array)
            .and_then(|pairs| pairs.first())
        else {
            return Ok(None);
        };
        let price_usd = pair
            .get("priceUsd")
            .and_then(|price| match price {
                Value::String(raw) => raw.parse().ok(),
                other => other.as_f64(),
            })
            .unwrap_or(0.0);
        Ok(Some(TokenMarket {
            price_usd,
            market_cap: pair.get("marketCap").and_then(Value::as_f64),
        }))
    }
}

/// Token USD price from the observed swap ratio:
/// `(native_amount × native_usd) / token_amount`. This bypasses per-trade
/// DEX price queries whenever both legs were observed on-chain.
pub fn swap_ratio_price(native_amount: f64, native_usd: f64, token_amount: f64) -> Option<f64> {
    if native_amount <= 0.0 || native_usd <= 0.0 || token_amount <= 0.0 {
        return None;
    }
    Some((native_amount * native_usd) / token_amount)
}

/// The stored `solAmounts` rule: only native deltas observed on-chain are
/// persisted, as `(buy_sol_amount, sell_sol_amount)`. USD-derived values
/// never appear here.
pub fn sol_amounts(swap: &ParsedSwap) -> (Option<f64>, Option<f64>) {
    let native_base = is_native_mint(&swap.base_asset.mint);
    let native_quote = is_native_mint(&swap.quote_asset.mint);
    match swap.direction {
        Direction::Buy if native_quote => (None, swap.amounts.total_wallet_cost),
        Direction::Buy if native_base => (Some(swap.amounts.base_amount), None),
        Direction::Sell if native_quote => (swap.amounts.net_wallet_received, None),
        Direction::Sell if native_base => (None, Some(swap.amounts.base_amount)),
        _ => (None, None),
    }
}

/// Read-through SOL price cache plus historical lookups.
#[derive(Clone)]
pub struct PriceService {
    feed: Arc<dyn PriceFeed>,
    sol_cache: Arc<RwLock<Option<(f64, Instant)>>>,
}

impl PriceService {
    pub fn new(feed: Arc<dyn PriceFeed>) -> Self {
        Self { feed, sol_cache: Arc::new(RwLock::new(None)) }
    }

    /// Current SOL/USD. Falls back to a constant (with a warning) rather
    /// than blocking the pipeline when every source is down.
    pub async fn current_sol_price(&self) -> f64 {
        if let Some((price, fetched_at)) = *self.sol_cache.read() {
            if fetched_at.elapsed() < SOL_PRICE_TTL {
                return price;
            }
        }

        match self.feed.current_sol_price().await {
            Ok(Some(price)) if price > 0.0 => {
                *self.sol_cache.write() = Some((price, Instant::now()));
                price
            }
            Ok(_) => {
                warn!(
                    "SOL price unavailable or non-positive, using fallback ${}",
                    SOL_PRICE_FALLBACK_USD
                );
                SOL_PRICE_FALLBACK_USD
            }
            Err(e) => {
                warn!(
                    "SOL price fetch failed ({}), using fallback ${}",
                    e, SOL_PRICE_FALLBACK_USD
                );
                SOL_PRICE_FALLBACK_USD
            }
        }
    }

    /// SOL/USD at the transaction timestamp; falls back to the current
    /// price when history is unavailable.
    pub async fn historical_sol_price(&self, timestamp: i64) -> f64 {
        match self.feed.historical_sol_price(timestamp).await {
            Ok(Some(price)) if price > 0.0 => price,
            Ok(_) => {
                debug!("No historical SOL price at {}, using current", timestamp);
                self.current_sol_price().await
            }
            Err(e) => {
                debug!("Historical SOL price fetch failed ({}), using current", e);
                self.current_sol_price().await
            }
        }
    }

    pub async fn token_market(&self, mint: &str) -> TokenMarket {
        match self.feed.token_market(mint).await {
            Ok(Some(market)) => market,
            Ok(None) => TokenMarket::default(),
            Err(e) => {
                debug!("Token market lookup failed for {}: {}", mint, e);
                TokenMarket::default()
            }
        }
    }
}
