use anyhow::{Context, Result};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::types::{AccountKind, Confidence};

/// Per-pipeline tuning: worker pool shape and the upstream-API rate budget.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub kind: AccountKind,
    pub num_workers: usize,
    pub worker_concurrency: usize,
    /// Jobs admitted per rate window
    pub rate_limit_max: u32,
    /// Rate window length. The env variable is named TIME_IN_SECONDS_* for
    /// compatibility with the deployed system but holds milliseconds.
    pub rate_window: Duration,
}

impl PipelineConfig {
    fn from_env(kind: AccountKind) -> Self {
        let suffix = match kind {
            AccountKind::Whale => "WHALE",
            AccountKind::Kol => "KOL",
        };
        Self {
            kind,
            num_workers: env_parse(&format!("NUM_WORKERS_{suffix}"), 1),
            worker_concurrency: env_parse(&format!("WORKER_CONCURRENCY_{suffix}"), 8),
            rate_limit_max: env_parse(&format!("RATE_LIMIT_MAX_{suffix}"), 30),
            rate_window: Duration::from_millis(env_parse(
                &format!("TIME_IN_SECONDS_{suffix}"),
                5000,
            )),
        }
    }

    /// Upper bound on in-flight jobs for this pipeline
    pub fn max_in_flight(&self) -> usize {
        self.num_workers * self.worker_concurrency
    }
}

/// Engine configuration, loaded once from the environment at startup and
/// passed by reference from then on.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Websocket feed URL (API key appended as a query parameter)
    pub wss_url: String,
    /// HTTP JSON-RPC endpoint used for transaction re-fetches and metadata
    pub rpc_url: String,
    pub helius_api_key: String,
    /// SQLite database path; `:memory:` is accepted for tests
    pub database_path: String,
    pub whale: PipelineConfig,
    pub kol: PipelineConfig,
    /// Trades classified below this confidence are not persisted
    pub min_alert_confidence: Option<Confidence>,
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let helius_api_key =
            env::var("HELIUS_API_KEY").context("HELIUS_API_KEY environment variable required")?;

        let wss_url = env::var("WSS_URL")
            .unwrap_or_else(|_| "wss://atlas-mainnet.helius-rpc.com".to_string());

        let rpc_url = env::var("RPC_URL")
            .unwrap_or_else(|_| "https://mainnet.helius-rpc.com".to_string());

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "data/whaletrace.db".to_string());

        let min_alert_confidence = match env::var("MIN_ALERT_CONFIDENCE") {
            Ok(raw) => {
                let parsed = Confidence::parse(&raw);
                if parsed.is_none() {
                    warn!("Unrecognized MIN_ALERT_CONFIDENCE '{}', ignoring", raw);
                }
                parsed
            }
            Err(_) => None,
        };

        Ok(Self {
            wss_url,
            rpc_url,
            helius_api_key,
            database_path,
            whale: PipelineConfig::from_env(AccountKind::Whale),
            kol: PipelineConfig::from_env(AccountKind::Kol),
            min_alert_confidence,
        })
    }

    /// Full websocket URL with the API key attached
    pub fn ws_endpoint(&self) -> String {
        format!("{}/?api-key={}", self.wss_url.trim_end_matches('/'), self.helius_api_key)
    }

    /// Full RPC URL with the API key attached
    pub fn rpc_endpoint(&self) -> String {
        format!("{}/?api-key={}", self.rpc_url.trim_end_matches('/'), self.helius_api_key)
    }

    pub fn pipeline(&self, kind: AccountKind) -> &PipelineConfig {
        match kind {
            AccountKind::Whale => &self.whale,
            AccountKind::Kol => &self.kol,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wss_url: "wss://atlas-mainnet.helius-rpc.com".to_string(),
            rpc_url: "https://mainnet.helius-rpc.com".to_string(),
            helius_api_key: String::new(),
            database_path: ":memory:".to_string(),
            whale: PipelineConfig {
                kind: AccountKind::Whale,
                num_workers: 1,
                worker_concurrency: 8,
                rate_limit_max: 30,
                rate_window: Duration::from_millis(5000),
            },
            kol: PipelineConfig {
                kind: AccountKind::Kol,
                num_workers: 1,
                worker_concurrency: 8,
                rate_limit_max: 30,
                rate_window: Duration::from_millis(5000),
            },
            min_alert_confidence: None,
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
