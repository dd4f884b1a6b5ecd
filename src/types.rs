use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which watch list an account belongs to. The two pipelines share every
/// mechanism but write to separate tables, queues, and dedup sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Whale,
    Kol,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Whale => "whale",
            AccountKind::Kol => "kol",
        }
    }
}

/// Public profile attached to a KOL wallet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfluencerProfile {
    pub name: String,
    pub handle: String,
    pub follower_count: u64,
    pub avatar_url: Option<String>,
}

/// A wallet on the watch list. The subscription session snapshots the full
/// set at monitor start; changes require a re-subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub address: String,
    pub kind: AccountKind,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub influencer: Option<InfluencerProfile>,
}

/// Raw transaction notification as delivered by the upstream feed. The
/// parsed-JSON payload is carried through the queue verbatim so workers
/// rarely need an RPC re-fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTxNotification {
    pub signature: String,
    pub raw: Value,
    #[serde(default)]
    pub account_keys: Vec<String>,
}

/// Trade direction from the swapper's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }
}

/// Classification confidence, ordered from weakest to strongest so the
/// configured floor can compare with `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
    Max,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "LOW",
            Confidence::Medium => "MEDIUM",
            Confidence::High => "HIGH",
            Confidence::Max => "MAX",
        }
    }

    /// Parses the MIN_ALERT_CONFIDENCE env form
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LOW" => Some(Confidence::Low),
            "MEDIUM" => Some(Confidence::Medium),
            "HIGH" => Some(Confidence::High),
            "MAX" => Some(Confidence::Max),
            _ => None,
        }
    }
}

/// How the swapper account was identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapperMethod {
    FeePayer,
    Signer,
    OwnerAnalysis,
}

impl SwapperMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapperMethod::FeePayer => "fee_payer",
            SwapperMethod::Signer => "signer",
            SwapperMethod::OwnerAnalysis => "owner_analysis",
        }
    }
}

/// Which source first matched a tracked account inside a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchSource {
    AccountKeys,
    PostTokenBalances,
    InnerInstructions,
}

/// One side of a swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSide {
    pub mint: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Amount fields of a classified swap, all in UI units except the fee.
///
/// `total_wallet_cost` / `net_wallet_received` are populated only from
/// native deltas observed on-chain, never derived from USD arithmetic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapAmounts {
    pub base_amount: f64,
    pub swap_input_amount: Option<f64>,
    pub swap_output_amount: Option<f64>,
    pub total_wallet_cost: Option<f64>,
    pub net_wallet_received: Option<f64>,
    pub fee_lamports: u64,
}

/// A direction-tagged swap from one tracked account's perspective
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSwap {
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub swapper: String,
    pub direction: Direction,
    pub base_asset: AssetSide,
    pub quote_asset: AssetSide,
    pub amounts: SwapAmounts,
    pub confidence: Confidence,
    pub protocol: String,
    pub swapper_method: SwapperMethod,
    pub classification_source: String,
}

impl ParsedSwap {
    /// True when either side of the swap is the native coin
    pub fn has_native_leg(&self) -> bool {
        crate::constants::is_native_mint(&self.base_asset.mint)
            || crate::constants::is_native_mint(&self.quote_asset.mint)
    }
}

/// A token↔token route split into its two synthetic native-quoted legs.
/// Both records share the signature, timestamp, swapper, and protocol and
/// must be persisted atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSwapPair {
    pub sell: ParsedSwap,
    pub buy: ParsedSwap,
}

/// Classifier output
#[derive(Debug, Clone)]
pub enum Classification {
    Single(ParsedSwap),
    Split(SplitSwapPair),
}

impl Classification {
    pub fn signature(&self) -> &str {
        match self {
            Classification::Single(swap) => &swap.signature,
            Classification::Split(pair) => &pair.sell.signature,
        }
    }
}

/// Denormalized token descriptor embedded in a stored trade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenDescriptor {
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub image_url: Option<String>,
    pub market_cap: Option<f64>,
    pub usd_amount: f64,
    pub created_at: Option<i64>,
}

/// One persisted trade record. A split pair produces two of these sharing
/// a signature (one `sell`, one `buy`); everything else produces one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTrade {
    pub signature: String,
    pub trade_type: Direction,
    pub classification_source: String,
    pub usd_buy_amount: f64,
    pub usd_sell_amount: f64,
    pub token_in: TokenDescriptor,
    pub token_in_amount: f64,
    pub token_in_price: f64,
    pub token_out: TokenDescriptor,
    pub token_out_amount: f64,
    pub token_out_price: f64,
    pub price_imputed: bool,
    /// Native received by the wallet; observed on-chain or null
    pub buy_sol_amount: Option<f64>,
    /// Native spent by the wallet; observed on-chain or null
    pub sell_sol_amount: Option<f64>,
    pub protocol: String,
    pub gas_fee_usd: f64,
    pub tracked_account: String,
    pub account_kind: AccountKind,
    pub account_labels: Vec<String>,
    pub influencer: Option<InfluencerProfile>,
    pub hotness_score: i32,
    pub confidence: Confidence,
    pub tx_timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WSOL_MINT;

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::Max > Confidence::High);
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert_eq!(Confidence::parse("medium"), Some(Confidence::Medium));
        assert_eq!(Confidence::parse("bogus"), None);
    }

    #[test]
    fn test_native_leg_detection() {
        let swap = ParsedSwap {
            signature: "sig".into(),
            timestamp: Utc::now(),
            swapper: "wallet".into(),
            direction: Direction::Buy,
            base_asset: AssetSide {
                mint: "TokenMint111".into(),
                symbol: "TOK".into(),
                decimals: 6,
            },
            quote_asset: AssetSide {
                mint: WSOL_MINT.into(),
                symbol: "SOL".into(),
                decimals: 9,
            },
            amounts: SwapAmounts::default(),
            confidence: Confidence::Max,
            protocol: "raydium".into(),
            swapper_method: SwapperMethod::FeePayer,
            classification_source: "v2_parser".into(),
        };
        assert!(swap.has_native_leg());
    }
}
