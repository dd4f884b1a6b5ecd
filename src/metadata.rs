use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants::{
    is_native_mint, INVALID_SYMBOLS, METADATA_TIMEOUT, NEGATIVE_CACHE_TTL,
    SOLANA_GENESIS_TIMESTAMP,
};

const NEGATIVE_CACHE_CAPACITY: usize = 10_000;

/// Resolved token identity, denormalized into stored trades
#[derive(Debug, Clone, PartialEq)]
pub struct TokenMetadata {
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub image_url: Option<String>,
    pub source: MetadataSource,
    pub is_shortened: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataSource {
    Primary,
    Fallback,
    Negative,
}

/// `xxxx...yyyy` placeholder used when no provider can name a mint
pub fn shorten_address(address: &str) -> String {
    if address.len() <= 8 {
        return address.to_string();
    }
    format!("{}...{}", &address[..4], &address[address.len() - 4..])
}

/// A symbol is usable when it is non-empty, not a known placeholder, not a
/// shortened address, and free of control characters.
pub fn is_valid_symbol(symbol: &str) -> bool {
    let trimmed = symbol.trim();
    if trimmed.is_empty() || INVALID_SYMBOLS.contains(trimmed) {
        return false;
    }
    if trimmed.contains("...") {
        return false;
    }
    !trimmed.chars().any(char::is_control)
}

/// What a provider knows about a mint
#[derive(Debug, Clone, Default)]
pub struct ProviderMetadata {
    pub symbol: String,
    pub name: String,
    pub image_url: Option<String>,
    /// Unix seconds, when the provider exposes it
    pub created_at: Option<i64>,
}

/// Metadata lookup seam. Production wires the RPC-backed asset API as
/// primary and the market-data provider as fallback; tests substitute
/// stubs.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn token_metadata(&self, mint: &str) -> anyhow::Result<Option<ProviderMetadata>>;
}

/// Primary source: Helius getAsset over JSON-RPC
pub struct HeliusAssetProvider {
    client: Client,
    endpoint: String,
}

impl HeliusAssetProvider {
    pub fn new(endpoint: String) -> Self {
        let client = Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, endpoint }
    }
}

#[async_trait]
impl MetadataProvider for HeliusAssetProvider {
    async fn token_metadata(&self, mint: &str) -> anyhow::Result<Option<ProviderMetadata>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getAsset",
            "params": {"id": mint}
        });
        let response: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        let Some(content) = response.pointer("/result/content") else {
            return Ok(None);
        };
        let symbol = content
            .pointer("/metadata/symbol")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if symbol.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProviderMetadata {
            symbol,
            name: content
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            image_url: content
                .pointer("/links/image")
                .and_then(Value::as_str)
                .map(str::to_string),
            created_at: None,
        }))
    }
}

/// Fallback source: the market-data provider's token endpoint, which also
/// exposes pair creation time.
pub struct MarketDataProvider {
    client: Client,
    base_url: String,
}

impl MarketDataProvider {
    pub fn new() -> Self {
        Self::with_base_url("https://api.dexscreener.com".to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, base_url }
    }
}

impl Default for MarketDataProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataProvider for MarketDataProvider {
    async fn token_metadata(&self, mint: &str) -> anyhow::Result<Option<ProviderMetadata>> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, mint);
        let response: Value = self.client.get(&url).send().await?.json().await?;

        let Some(pair) = response
            .get("pairs")
            .and_then(Value::as_array)
            .and_then(|pairs| pairs.first())
        else {
            return Ok(None);
        };

        let symbol = pair
            .pointer("/baseToken/symbol")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if symbol.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProviderMetadata {
            symbol,
            name: pair
                .pointer("/baseToken/name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            image_url: pair
                .pointer("/info/imageUrl")
                .and_then(Value::as_str)
                .map(str::to_string),
            // pairCreatedAt is in milliseconds
            created_at: pair
                .get("pairCreatedAt")
                .and_then(Value::as_i64)
                .map(|ms| ms / 1000),
        }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetadataCacheStats {
    pub hits: u64,
    pub primary_resolutions: u64,
    pub fallback_resolutions: u64,
    pub negative_hits: u64,
    pub negative_writes: u64,
}

/// Read-through token metadata cache with negative caching.
///
/// Resolution ladder: parsed symbol → cache → negative cache → primary
/// provider → fallback provider → negative entry + shortened placeholder.
/// Resolution never fails; the worst case is a placeholder identity.
#[derive(Clone)]
pub struct TokenMetadataCache {
    primary: Arc<dyn MetadataProvider>,
    fallback: Arc<dyn MetadataProvider>,
    cache: Arc<RwLock<HashMap<String, TokenMetadata>>>,
    creation_times: Arc<RwLock<HashMap<String, Option<i64>>>>,
    negative: Arc<Mutex<LruCache<String, DateTime<Utc>>>>,
    stats: Arc<RwLock<MetadataCacheStats>>,
}

impl TokenMetadataCache {
    pub fn new(primary: Arc<dyn MetadataProvider>, fallback: Arc<dyn MetadataProvider>) -> Self {
        let capacity = NonZeroUsize::new(NEGATIVE_CACHE_CAPACITY)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            primary,
            fallback,
            cache: Arc::new(RwLock::new(HashMap::new())),
            creation_times: Arc::new(RwLock::new(HashMap::new())),
            negative: Arc::new(Mutex::new(LruCache::new(capacity))),
            stats: Arc::new(RwLock::new(MetadataCacheStats::default())),
        }
    }

    fn placeholder(&self, mint: &str) -> TokenMetadata {
        TokenMetadata {
            address: mint.to_string(),
            symbol: shorten_address(mint),
            name: "Unknown".to_string(),
            image_url: None,
            source: MetadataSource::Negative,
            is_shortened: true,
        }
    }

    fn negative_fresh(&self, mint: &str) -> bool {
        let ttl = ChronoDuration::from_std(NEGATIVE_CACHE_TTL)
            .unwrap_or_else(|_| ChronoDuration::hours(6));
        let mut negative = self.negative.lock();
        negative
            .get(mint)
            .is_some_and(|cached_at| *cached_at + ttl > Utc::now())
    }

    fn store(&self, mint: &str, metadata: TokenMetadata) -> TokenMetadata {
        self.cache.write().insert(mint.to_string(), metadata.clone());
        metadata
    }

    /// Resolve a mint's identity, preferring a symbol the transaction parse
    /// already carried.
    pub async fn resolve(&self, mint: &str, parsed_symbol: Option<&str>) -> TokenMetadata {
        if is_native_mint(mint) {
            return TokenMetadata {
                address: mint.to_string(),
                symbol: "SOL".to_string(),
                name: "Solana".to_string(),
                image_url: None,
                source: MetadataSource::Primary,
                is_shortened: false,
            };
        }

        if let Some(symbol) = parsed_symbol.filter(|s| is_valid_symbol(s)) {
            return self.store(
                mint,
                TokenMetadata {
                    address: mint.to_string(),
                    symbol: symbol.trim().to_string(),
                    name: symbol.trim().to_string(),
                    image_url: None,
                    source: MetadataSource::Primary,
                    is_shortened: false,
                },
            );
        }

        if let Some(cached) = self.cache.read().get(mint).cloned() {
            self.stats.write().hits += 1;
            return cached;
        }

        if self.negative_fresh(mint) {
            self.stats.write().negative_hits += 1;
            return self.placeholder(mint);
        }

        match self.primary.token_metadata(mint).await {
            Ok(Some(found)) if is_valid_symbol(&found.symbol) => {
                self.stats.write().primary_resolutions += 1;
                return self.store(
                    mint,
                    TokenMetadata {
                        address: mint.to_string(),
                        symbol: found.symbol.trim().to_string(),
                        name: found.name,
                        image_url: found.image_url,
                        source: MetadataSource::Primary,
                        is_shortened: false,
                    },
                );
            }
            Ok(_) => {}
            Err(e) => debug!("Primary metadata lookup failed for {}: {}", mint, e),
        }

        match self.fallback.token_metadata(mint).await {
            Ok(Some(found)) if is_valid_symbol(&found.symbol) => {
                self.stats.write().fallback_resolutions += 1;
                if let Some(created_at) = found.created_at {
                    self.creation_times
                        .write()
                        .insert(mint.to_string(), Some(created_at));
                }
                return self.store(
                    mint,
                    TokenMetadata {
                        address: mint.to_string(),
                        symbol: found.symbol.trim().to_string(),
                        name: found.name,
                        image_url: found.image_url,
                        source: MetadataSource::Fallback,
                        is_shortened: false,
                    },
                );
            }
            Ok(_) => {}
            Err(e) => debug!("Fallback metadata lookup failed for {}: {}", mint, e),
        }

        warn!("No metadata source could resolve {}, negative-caching", mint);
        self.negative.lock().put(mint.to_string(), Utc::now());
        self.stats.write().negative_writes += 1;
        self.placeholder(mint)
    }

    /// Token creation time in unix seconds. The native coin uses the chain
    /// genesis timestamp; unresolvable tokens return None.
    pub async fn creation_time(&self, mint: &str) -> Option<i64> {
        if is_native_mint(mint) {
            return Some(SOLANA_GENESIS_TIMESTAMP);
        }
        if let Some(cached) = self.creation_times.read().get(mint) {
            return *cached;
        }
        let resolved = match self.fallback.token_metadata(mint).await {
            Ok(Some(found)) => found.created_at,
            Ok(None) => None,
            Err(e) => {
                debug!("Creation-time lookup failed for {}: {}", mint, e);
                None
            }
        };
        self.creation_times.write().insert(mint.to_string(), resolved);
        resolved
    }

    pub fn stats(&self) -> MetadataCacheStats {
        self.stats.read().clone()
    }

    #[cfg(test)]
    fn expire_negative(&self, mint: &str) {
        self.negative
            .lock()
            .put(mint.to_string(), Utc::now() - ChronoDuration::days(2));
    }
}
