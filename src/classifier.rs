use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::constants::{
    is_native_mint, lamports_to_sol, EXCLUDED_TOKENS, INTERMEDIATE_DELTA_EPSILON,
    KNOWN_SWAP_PROGRAMS, NATIVE_DUST_THRESHOLD_SOL, WSOL_MINT,
};
use crate::types::{
    AssetSide, Classification, Confidence, Direction, MatchSource, ParsedSwap, SplitSwapPair,
    SwapAmounts, SwapperMethod, TrackedAccount,
};

/// Classification source tag written to persisted records
pub const SOURCE_TAG: &str = "v2_parser";

/// Why a notification was rejected. Every rejection is terminal for its
/// (signature, tracked account) pair; none is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("no_tracked_account")]
    NoTrackedAccount,
    #[error("missing_signature")]
    MissingSignature,
    #[error("missing_meta")]
    MissingMeta,
    #[error("failed_transaction")]
    FailedTransaction,
    #[error("no_swapper")]
    NoSwapper,
    #[error("non_swap")]
    NonSwap,
    #[error("ambiguous_direction")]
    AmbiguousDirection,
    #[error("excluded_token")]
    ExcludedToken,
    #[error("dust_amount")]
    DustAmount,
    #[error("below_confidence_floor")]
    BelowConfidenceFloor,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoTrackedAccount => "no_tracked_account",
            RejectReason::MissingSignature => "missing_signature",
            RejectReason::MissingMeta => "missing_meta",
            RejectReason::FailedTransaction => "failed_transaction",
            RejectReason::NoSwapper => "no_swapper",
            RejectReason::NonSwap => "non_swap",
            RejectReason::AmbiguousDirection => "ambiguous_direction",
            RejectReason::ExcludedToken => "excluded_token",
            RejectReason::DustAmount => "dust_amount",
            RejectReason::BelowConfidenceFloor => "below_confidence_floor",
        }
    }
}

/// Compact diagnostics attached to a rejection
#[derive(Debug, Clone, Default)]
pub struct RejectDebug {
    pub fee_payer: Option<String>,
    pub signer_count: usize,
    pub delta_summary: Vec<(String, f64)>,
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub reason: RejectReason,
    pub debug: RejectDebug,
}

impl Rejection {
    fn bare(reason: RejectReason) -> Self {
        Self { reason, debug: RejectDebug::default() }
    }
}

/// Accessor over the two transaction JSON nestings the pipeline sees: the
/// websocket notification payload and the RPC getTransaction result.
pub struct TxView<'a> {
    raw: &'a Value,
}

impl<'a> TxView<'a> {
    pub fn new(raw: &'a Value) -> Self {
        Self { raw }
    }

    pub fn signature(&self) -> Option<&'a str> {
        if let Some(sig) = self.raw.get("signature").and_then(Value::as_str) {
            return Some(sig);
        }
        self.message_container()?
            .get("signatures")
            .and_then(Value::as_array)
            .and_then(|sigs| sigs.first())
            .and_then(Value::as_str)
    }

    pub fn meta(&self) -> Option<&'a Value> {
        if let Some(meta) = self.raw.pointer("/transaction/meta") {
            if !meta.is_null() {
                return Some(meta);
            }
        }
        self.raw.get("meta").filter(|meta| !meta.is_null())
    }

    /// The inner `{message, signatures}` object
    fn message_container(&self) -> Option<&'a Value> {
        for path in ["/transaction/transaction", "/transaction"] {
            if let Some(container) = self.raw.pointer(path) {
                if container.get("message").is_some() {
                    return Some(container);
                }
            }
        }
        None
    }

    pub fn message(&self) -> Option<&'a Value> {
        self.message_container()?.get("message")
    }

    pub fn block_time(&self) -> Option<i64> {
        self.raw
            .get("blockTime")
            .or_else(|| self.raw.pointer("/transaction/blockTime"))
            .and_then(Value::as_i64)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.block_time()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now)
    }

    pub fn failed(&self) -> bool {
        self.meta()
            .and_then(|meta| meta.get("err"))
            .is_some_and(|err| !err.is_null())
    }

    pub fn fee_lamports(&self) -> u64 {
        self.meta()
            .and_then(|meta| meta.get("fee"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Top-level account keys. Handles both the jsonParsed object form
    /// (`{pubkey, signer, writable}`) and the raw string form.
    pub fn account_keys(&self) -> Vec<AccountKey> {
        let Some(keys) = self
            .message()
            .and_then(|message| message.get("accountKeys"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        let required_signatures = self
            .message()
            .and_then(|message| message.pointer("/header/numRequiredSignatures"))
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;

        keys.iter()
            .enumerate()
            .filter_map(|(index, key)| match key {
                Value::String(pubkey) => Some(AccountKey {
                    pubkey: pubkey.clone(),
                    signer: index < required_signatures,
                }),
                Value::Object(_) => Some(AccountKey {
                    pubkey: key.get("pubkey")?.as_str()?.to_string(),
                    signer: key.get("signer").and_then(Value::as_bool).unwrap_or(false),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn fee_payer(&self) -> Option<String> {
        self.account_keys().first().map(|key| key.pubkey.clone())
    }

    pub fn signers(&self) -> Vec<String> {
        self.account_keys()
            .into_iter()
            .filter(|key| key.signer)
            .map(|key| key.pubkey)
            .collect()
    }

    fn token_balances(&self, field: &str) -> Vec<TokenBalance> {
        let Some(balances) = self
            .meta()
            .and_then(|meta| meta.get(field))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };
        balances.iter().filter_map(TokenBalance::from_json).collect()
    }

    pub fn pre_token_balances(&self) -> Vec<TokenBalance> {
        self.token_balances("preTokenBalances")
    }

    pub fn post_token_balances(&self) -> Vec<TokenBalance> {
        self.token_balances("postTokenBalances")
    }

    fn native_balances(&self, field: &str) -> Vec<u64> {
        self.meta()
            .and_then(|meta| meta.get(field))
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default()
    }

    /// Account references inside inner instructions, resolving numeric
    /// indices against the top-level key list
    pub fn inner_instruction_accounts(&self) -> Vec<String> {
        let keys = self.account_keys();
        let Some(groups) = self
            .meta()
            .and_then(|meta| meta.get("innerInstructions"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        let mut accounts = Vec::new();
        for group in groups {
            let Some(instructions) = group.get("instructions").and_then(Value::as_array) else {
                continue;
            };
            for instruction in instructions {
                if let Some(refs) = instruction.get("accounts").and_then(Value::as_array) {
                    for reference in refs {
                        match reference {
                            Value::String(pubkey) => accounts.push(pubkey.clone()),
                            Value::Number(index) => {
                                if let Some(index) = index.as_u64() {
                                    if let Some(key) = keys.get(index as usize) {
                                        accounts.push(key.pubkey.clone());
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                // jsonParsed transfers carry account strings inside parsed.info
                if let Some(info) = instruction.pointer("/parsed/info") {
                    for field in ["source", "destination", "authority", "owner"] {
                        if let Some(pubkey) = info.get(field).and_then(Value::as_str) {
                            accounts.push(pubkey.to_string());
                        }
                    }
                }
            }
        }
        accounts
    }

    /// Protocol label from the first known swap program in the key list
    pub fn protocol(&self) -> String {
        let keys = self.account_keys();
        for (program_id, name) in KNOWN_SWAP_PROGRAMS.iter() {
            if keys.iter().any(|key| key.pubkey == *program_id) {
                return (*name).to_string();
            }
        }
        "unknown".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct AccountKey {
    pub pubkey: String,
    pub signer: bool,
}

/// One entry of pre/postTokenBalances
#[derive(Debug, Clone)]
pub struct TokenBalance {
    pub account_index: usize,
    pub mint: String,
    pub owner: Option<String>,
    pub ui_amount: f64,
    pub decimals: u8,
}

impl TokenBalance {
    fn from_json(value: &Value) -> Option<Self> {
        let ui = value.get("uiTokenAmount")?;
        let decimals = ui.get("decimals").and_then(Value::as_u64).unwrap_or(0) as u8;
        let ui_amount = ui
            .get("uiAmount")
            .and_then(Value::as_f64)
            .or_else(|| {
                ui.get("uiAmountString")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse().ok())
            })
            .or_else(|| {
                let raw: f64 = ui.get("amount")?.as_str()?.parse().ok()?;
                Some(raw / 10f64.powi(decimals as i32))
            })
            .unwrap_or(0.0);

        Some(Self {
            account_index: value.get("accountIndex").and_then(Value::as_u64).unwrap_or(0) as usize,
            mint: value.get("mint")?.as_str()?.to_string(),
            owner: value.get("owner").and_then(Value::as_str).map(str::to_string),
            ui_amount,
            decimals,
        })
    }
}

/// Step A: candidate tracked accounts from the three match sources, in
/// precedence order, recording which source matched first.
pub fn match_tracked_accounts(
    raw: &Value,
    watch: &HashMap<String, TrackedAccount>,
) -> Vec<(TrackedAccount, MatchSource)> {
    let view = TxView::new(raw);
    let mut matched: Vec<(TrackedAccount, MatchSource)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for key in view.account_keys() {
        if let Some(account) = watch.get(&key.pubkey) {
            if seen.insert(key.pubkey.clone()) {
                matched.push((account.clone(), MatchSource::AccountKeys));
            }
        }
    }

    for balance in view.post_token_balances() {
        if let Some(owner) = &balance.owner {
            if let Some(account) = watch.get(owner) {
                if seen.insert(owner.clone()) {
                    matched.push((account.clone(), MatchSource::PostTokenBalances));
                }
            }
        }
    }

    for pubkey in view.inner_instruction_accounts() {
        if let Some(account) = watch.get(&pubkey) {
            if seen.insert(pubkey.clone()) {
                matched.push((account.clone(), MatchSource::InnerInstructions));
            }
        }
    }

    matched
}

/// Pre-check run on every notification before dedup + enqueue
pub fn precheck(
    raw: &Value,
    watch: &HashMap<String, TrackedAccount>,
) -> Result<Vec<(TrackedAccount, MatchSource)>, RejectReason> {
    let view = TxView::new(raw);
    if view.signature().is_none() {
        return Err(RejectReason::MissingSignature);
    }
    if view.meta().is_none() {
        return Err(RejectReason::MissingMeta);
    }
    if view.failed() {
        return Err(RejectReason::FailedTransaction);
    }
    let matched = match_tracked_accounts(raw, watch);
    if matched.is_empty() {
        return Err(RejectReason::NoTrackedAccount);
    }
    Ok(matched)
}

/// Net balance movement of one owner across the transaction. Native SOL and
/// wrapped SOL are folded together; token deltas are per mint.
#[derive(Debug, Clone, Default)]
struct OwnerDeltas {
    /// mint -> (ui delta, decimals); native/wSOL excluded
    tokens: HashMap<String, (f64, u8)>,
    /// combined native delta in SOL, zeroed when below the dust threshold
    native: f64,
    /// native delta before dust suppression, for diagnostics
    native_raw: f64,
}

fn owner_deltas(view: &TxView, owner: &str) -> OwnerDeltas {
    let mut tokens: HashMap<String, (f64, u8)> = HashMap::new();
    let mut native = 0.0f64;

    let mut pre_by_account: HashMap<usize, &TokenBalance> = HashMap::new();
    let pre = view.pre_token_balances();
    let post = view.post_token_balances();
    for balance in &pre {
        pre_by_account.insert(balance.account_index, balance);
    }

    let mut seen_accounts: HashSet<usize> = HashSet::new();
    for balance in &post {
        if balance.owner.as_deref() != Some(owner) {
            continue;
        }
        seen_accounts.insert(balance.account_index);
        let pre_amount = pre_by_account
            .get(&balance.account_index)
            .map_or(0.0, |b| b.ui_amount);
        let delta = balance.ui_amount - pre_amount;
        if is_native_mint(&balance.mint) {
            native += delta;
        } else {
            let entry = tokens.entry(balance.mint.clone()).or_insert((0.0, balance.decimals));
            entry.0 += delta;
        }
    }
    // Token accounts that were closed in this transaction only appear in the
    // pre list; their whole balance left the owner.
    for balance in &pre {
        if balance.owner.as_deref() != Some(owner) || seen_accounts.contains(&balance.account_index)
        {
            continue;
        }
        if is_native_mint(&balance.mint) {
            native -= balance.ui_amount;
        } else {
            let entry = tokens.entry(balance.mint.clone()).or_insert((0.0, balance.decimals));
            entry.0 -= balance.ui_amount;
        }
    }

    // Lamport delta of the owner's top-level account
    let keys = view.account_keys();
    if let Some(index) = keys.iter().position(|key| key.pubkey == owner) {
        let pre_lamports = view.native_balances("preBalances");
        let post_lamports = view.native_balances("postBalances");
        if let (Some(pre), Some(post)) = (pre_lamports.get(index), post_lamports.get(index)) {
            native += lamports_to_sol(*post) - lamports_to_sol(*pre);
        }
    }

    // Collapse intermediate assets that netted to zero across the route
    tokens.retain(|_, (delta, _)| delta.abs() > INTERMEDIATE_DELTA_EPSILON);

    let native_raw = native;
    if native.abs() < NATIVE_DUST_THRESHOLD_SOL {
        native = 0.0;
    }

    OwnerDeltas { tokens, native, native_raw }
}

fn debug_record(view: &TxView, deltas: Option<&OwnerDeltas>) -> RejectDebug {
    let mut summary: Vec<(String, f64)> = Vec::new();
    if let Some(deltas) = deltas {
        for (mint, (delta, _)) in &deltas.tokens {
            summary.push((mint.clone(), *delta));
        }
        if deltas.native_raw != 0.0 {
            summary.push((WSOL_MINT.to_string(), deltas.native_raw));
        }
    }
    RejectDebug {
        fee_payer: view.fee_payer(),
        signer_count: view.signers().len(),
        delta_summary: summary,
    }
}

fn native_side() -> AssetSide {
    AssetSide { mint: WSOL_MINT.to_string(), symbol: "SOL".to_string(), decimals: 9 }
}

/// Step B: 3-tier swapper identification for the tracked account this job
/// is running on behalf of.
fn identify_swapper(view: &TxView, tracked: &str) -> Option<SwapperMethod> {
    if view.fee_payer().as_deref() == Some(tracked) {
        return Some(SwapperMethod::FeePayer);
    }
    if view.signers().iter().any(|signer| signer == tracked) {
        return Some(SwapperMethod::Signer);
    }
    // Owner analysis: the tracked account's own net deltas must form a
    // consistent two-asset swap for it to count as the swapper.
    let deltas = owner_deltas(view, tracked);
    let negatives = swap_legs(&deltas).iter().filter(|leg| leg.delta < 0.0).count();
    let positives = swap_legs(&deltas).iter().filter(|leg| leg.delta > 0.0).count();
    if negatives == 1 && positives == 1 {
        return Some(SwapperMethod::OwnerAnalysis);
    }
    None
}

#[derive(Debug, Clone)]
struct SwapLeg {
    mint: String,
    delta: f64,
    decimals: u8,
    native: bool,
}

/// The surviving swap legs: every non-zero token delta plus the native
/// delta when above dust.
fn swap_legs(deltas: &OwnerDeltas) -> Vec<SwapLeg> {
    let mut legs: Vec<SwapLeg> = deltas
        .tokens
        .iter()
        .map(|(mint, (delta, decimals))| SwapLeg {
            mint: mint.clone(),
            delta: *delta,
            decimals: *decimals,
            native: false,
        })
        .collect();
    if deltas.native != 0.0 {
        legs.push(SwapLeg {
            mint: WSOL_MINT.to_string(),
            delta: deltas.native,
            decimals: 9,
            native: true,
        });
    }
    legs.sort_by(|a, b| a.mint.cmp(&b.mint));
    legs
}

fn base_confidence(method: SwapperMethod) -> Confidence {
    match method {
        SwapperMethod::FeePayer => Confidence::Max,
        SwapperMethod::Signer => Confidence::High,
        SwapperMethod::OwnerAnalysis => Confidence::Medium,
    }
}

fn downgrade(confidence: Confidence) -> Confidence {
    match confidence {
        Confidence::Max => Confidence::High,
        Confidence::High => Confidence::Medium,
        _ => Confidence::Low,
    }
}

/// Classify one transaction from one tracked account's perspective.
///
/// Pure over its inputs: identical (raw, tracked) always yields the same
/// output. The optional confidence floor is applied last so the rejection
/// reason distinguishes "not a swap" from "below the floor".
pub fn classify(
    raw: &Value,
    tracked: &TrackedAccount,
    min_confidence: Option<Confidence>,
) -> Result<Classification, Rejection> {
    let view = TxView::new(raw);

    let Some(signature) = view.signature().map(str::to_string) else {
        return Err(Rejection::bare(RejectReason::MissingSignature));
    };
    if view.meta().is_none() {
        return Err(Rejection::bare(RejectReason::MissingMeta));
    }
    if view.failed() {
        return Err(Rejection::bare(RejectReason::FailedTransaction));
    }

    let Some(method) = identify_swapper(&view, &tracked.address) else {
        return Err(Rejection {
            reason: RejectReason::NoSwapper,
            debug: debug_record(&view, None),
        });
    };

    let deltas = owner_deltas(&view, &tracked.address);
    let legs = swap_legs(&deltas);
    let token_legs: Vec<&SwapLeg> = legs.iter().filter(|leg| !leg.native).collect();
    let native_leg = legs.iter().find(|leg| leg.native);

    if legs.is_empty() {
        // Sub-dust native movement with no token legs is rent/fee noise
        let reason = if deltas.native_raw != 0.0 {
            RejectReason::DustAmount
        } else {
            RejectReason::NonSwap
        };
        return Err(Rejection { reason, debug: debug_record(&view, Some(&deltas)) });
    }
    if token_legs.is_empty() {
        return Err(Rejection {
            reason: RejectReason::NonSwap,
            debug: debug_record(&view, Some(&deltas)),
        });
    }

    let timestamp = view.timestamp();
    let protocol = view.protocol();
    let fee_lamports = view.fee_lamports();
    let confidence = base_confidence(method);

    let classification = match token_legs.len() {
        // One token leg: a native<->token swap when the native side moved
        1 => {
            let token = token_legs[0];
            let Some(native) = native_leg else {
                return Err(Rejection {
                    reason: RejectReason::NonSwap,
                    debug: debug_record(&view, Some(&deltas)),
                });
            };
            if token.delta.signum() == native.delta.signum() {
                return Err(Rejection {
                    reason: RejectReason::AmbiguousDirection,
                    debug: debug_record(&view, Some(&deltas)),
                });
            }
            let direction = if token.delta > 0.0 { Direction::Buy } else { Direction::Sell };
            let base_amount = token.delta.abs();
            let native_amount = native.delta.abs();
            let amounts = match direction {
                Direction::Buy => SwapAmounts {
                    base_amount,
                    swap_input_amount: Some(native_amount),
                    swap_output_amount: Some(base_amount),
                    total_wallet_cost: Some(native_amount),
                    net_wallet_received: None,
                    fee_lamports,
                },
                Direction::Sell => SwapAmounts {
                    base_amount,
                    swap_input_amount: Some(base_amount),
                    swap_output_amount: Some(native_amount),
                    total_wallet_cost: None,
                    net_wallet_received: Some(native_amount),
                    fee_lamports,
                },
            };
            Classification::Single(ParsedSwap {
                signature,
                timestamp,
                swapper: tracked.address.clone(),
                direction,
                base_asset: AssetSide {
                    mint: token.mint.clone(),
                    symbol: String::new(),
                    decimals: token.decimals,
                },
                quote_asset: native_side(),
                amounts,
                confidence,
                protocol,
                swapper_method: method,
                classification_source: SOURCE_TAG.to_string(),
            })
        }
        // Two token legs: a token<->token route. A stable native leg keeps
        // it a single record with native as quote; otherwise split.
        2 => {
            let (sent, received) = match (token_legs[0].delta < 0.0, token_legs[1].delta < 0.0) {
                (true, false) => (token_legs[0], token_legs[1]),
                (false, true) => (token_legs[1], token_legs[0]),
                _ => {
                    return Err(Rejection {
                        reason: RejectReason::AmbiguousDirection,
                        debug: debug_record(&view, Some(&deltas)),
                    });
                }
            };

            if let Some(native) = native_leg {
                // Observable native movement alongside the route: record the
                // leg the native delta describes rather than synthesizing two.
                let (direction, token) = if native.delta < 0.0 {
                    (Direction::Buy, received)
                } else {
                    (Direction::Sell, sent)
                };
                let base_amount = token.delta.abs();
                let native_amount = native.delta.abs();
                let amounts = match direction {
                    Direction::Buy => SwapAmounts {
                        base_amount,
                        swap_input_amount: Some(native_amount),
                        swap_output_amount: Some(base_amount),
                        total_wallet_cost: Some(native_amount),
                        net_wallet_received: None,
                        fee_lamports,
                    },
                    Direction::Sell => SwapAmounts {
                        base_amount,
                        swap_input_amount: Some(base_amount),
                        swap_output_amount: Some(native_amount),
                        total_wallet_cost: None,
                        net_wallet_received: Some(native_amount),
                        fee_lamports,
                    },
                };
                Classification::Single(ParsedSwap {
                    signature,
                    timestamp,
                    swapper: tracked.address.clone(),
                    direction,
                    base_asset: AssetSide {
                        mint: token.mint.clone(),
                        symbol: String::new(),
                        decimals: token.decimals,
                    },
                    quote_asset: native_side(),
                    amounts,
                    confidence,
                    protocol,
                    swapper_method: method,
                    classification_source: SOURCE_TAG.to_string(),
                })
            } else {
                let pair_confidence = downgrade(confidence);
                let sell = ParsedSwap {
                    signature: signature.clone(),
                    timestamp,
                    swapper: tracked.address.clone(),
                    direction: Direction::Sell,
                    base_asset: AssetSide {
                        mint: sent.mint.clone(),
                        symbol: String::new(),
                        decimals: sent.decimals,
                    },
                    quote_asset: native_side(),
                    amounts: SwapAmounts {
                        base_amount: sent.delta.abs(),
                        swap_input_amount: Some(sent.delta.abs()),
                        swap_output_amount: None,
                        total_wallet_cost: None,
                        net_wallet_received: None,
                        fee_lamports,
                    },
                    confidence: pair_confidence,
                    protocol: protocol.clone(),
                    swapper_method: method,
                    classification_source: format!("{SOURCE_TAG}_split_sell"),
                };
                let buy = ParsedSwap {
                    signature,
                    timestamp,
                    swapper: tracked.address.clone(),
                    direction: Direction::Buy,
                    base_asset: AssetSide {
                        mint: received.mint.clone(),
                        symbol: String::new(),
                        decimals: received.decimals,
                    },
                    quote_asset: native_side(),
                    amounts: SwapAmounts {
                        base_amount: received.delta.abs(),
                        swap_input_amount: None,
                        swap_output_amount: Some(received.delta.abs()),
                        total_wallet_cost: None,
                        net_wallet_received: None,
                        fee_lamports,
                    },
                    confidence: pair_confidence,
                    protocol,
                    swapper_method: method,
                    classification_source: format!("{SOURCE_TAG}_split_buy"),
                };
                Classification::Split(SplitSwapPair { sell, buy })
            }
        }
        _ => {
            return Err(Rejection {
                reason: RejectReason::AmbiguousDirection,
                debug: debug_record(&view, Some(&deltas)),
            });
        }
    };

    // Excluded base assets never alert
    let excluded = match &classification {
        Classification::Single(swap) => EXCLUDED_TOKENS.contains(swap.base_asset.mint.as_str()),
        Classification::Split(pair) => {
            EXCLUDED_TOKENS.contains(pair.sell.base_asset.mint.as_str())
                && EXCLUDED_TOKENS.contains(pair.buy.base_asset.mint.as_str())
        }
    };
    if excluded {
        return Err(Rejection {
            reason: RejectReason::ExcludedToken,
            debug: debug_record(&view, Some(&deltas)),
        });
    }

    if let Some(floor) = min_confidence {
        let effective = match &classification {
            Classification::Single(swap) => swap.confidence,
            Classification::Split(pair) => pair.sell.confidence,
        };
        if effective < floor {
            return Err(Rejection {
                reason: RejectReason::BelowConfidenceFloor,
                debug: debug_record(&view, Some(&deltas)),
            });
        }
    }

    Ok(classification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccountKind;
    use serde_json::json;

    const SWAPPER: &str = "Whale1111111111111111111111111111111111111111";
    const OTHER: &str = "Other1111111111111111111111111111111111111111";
    const HIDDEN: &str = "Hidden111111111111111111111111111111111111111";
    const TOK_A: &str = "TokenAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const TOK_B: &str = "TokenBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

    fn tracked(address: &str) -> TrackedAccount {
        TrackedAccount {
            address: address.to_string(),
            kind: AccountKind::Whale,
            labels: vec![],
            influencer: None,
        }
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

    /// Minimal notification payload in the upstream's nesting
    #[allow(clippy::too_many_arguments)]
    fn build_tx(
        signature: &str,
        fee_payer: &str,
        pre_lamports: u64,
        post_lamports: u64,
        pre_tokens: Vec<Value>,
        post_tokens: Vec<Value>,
        err: Value,
    ) -> Value {
        json!({
            "signature": signature,
            "transaction": {
                "transaction": {
                    "message": {
                        "accountKeys": [
                            {"pubkey": fee_payer, "signer": true, "writable": true},
                            {"pubkey": OTHER, "signer": false, "writable": true},
                            {"pubkey": "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "signer": false, "writable": false}
                        ]
                    },
                    "signatures": [signature]
                },
                "meta": {
                    "err": err,
                    "fee": 5000,
                    "preBalances": [pre_lamports, 0, 0],
                    "postBalances": [post_lamports, 0, 0],
                    "preTokenBalances": pre_tokens,
                    "postTokenBalances": post_tokens,
                    "innerInstructions": []
                }
            },
            "blockTime": 1_700_000_000
        })
    }

    #[test]
    fn test_single_native_buy() {
        // Swapper spends 1 SOL and receives 1000 TOK_A
        let raw = build_tx(
            "sig-buy",
            SWAPPER,
            10_000_000_000,
            8_999_995_000,
            vec![token_balance(3, TOK_A, SWAPPER, 0.0, 6)],
            vec![token_balance(3, TOK_A, SWAPPER, 1000.0, 6)],
            Value::Null,
        );

        let result = classify(&raw, &tracked(SWAPPER), None).expect("should classify");
        let Classification::Single(swap) = result else {
            panic!("expected single swap");
        };
        assert_eq!(swap.direction, Direction::Buy);
        assert_eq!(swap.base_asset.mint, TOK_A);
        assert_eq!(swap.amounts.base_amount, 1000.0);
        assert!(swap.amounts.total_wallet_cost.unwrap() > 0.99);
        assert!(swap.amounts.net_wallet_received.is_none());
        assert_eq!(swap.confidence, Confidence::Max);
        assert_eq!(swap.swapper_method, SwapperMethod::FeePayer);
        assert_eq!(swap.classification_source, "v2_parser");
        assert_eq!(swap.protocol, "raydium");
    }

    #[test]
    fn test_single_native_sell() {
        // Swapper sends 500 TOK_A and receives ~2 SOL
        let raw = build_tx(
            "sig-sell",
            SWAPPER,
            1_000_000_000,
            2_999_995_000,
            vec![token_balance(3, TOK_A, SWAPPER, 500.0, 6)],
            vec![token_balance(3, TOK_A, SWAPPER, 0.0, 6)],
            Value::Null,
        );

        let result = classify(&raw, &tracked(SWAPPER), None).expect("should classify");
        let Classification::Single(swap) = result else {
            panic!("expected single swap");
        };
        assert_eq!(swap.direction, Direction::Sell);
        assert_eq!(swap.amounts.base_amount, 500.0);
        assert!(swap.amounts.net_wallet_received.unwrap() > 1.9);
        assert!(swap.amounts.total_wallet_cost.is_none());
    }

    #[test]
    fn test_token_to_token_splits_without_native_leg() {
        // Swapper sends 500 A, receives 1000 B; lamports only move by fee
        let raw = build_tx(
            "sig-split",
            SWAPPER,
            1_000_000_000,
            999_995_000,
            vec![
                token_balance(3, TOK_A, SWAPPER, 500.0, 6),
                token_balance(4, TOK_B, SWAPPER, 0.0, 9),
            ],
            vec![
                token_balance(3, TOK_A, SWAPPER, 0.0, 6),
                token_balance(4, TOK_B, SWAPPER, 1000.0, 9),
            ],
            Value::Null,
        );

        let result = classify(&raw, &tracked(SWAPPER), None).expect("should classify");
        let Classification::Split(pair) = result else {
            panic!("expected split pair");
        };
        assert_eq!(pair.sell.direction, Direction::Sell);
        assert_eq!(pair.sell.base_asset.mint, TOK_A);
        assert_eq!(pair.sell.amounts.base_amount, 500.0);
        assert_eq!(pair.sell.classification_source, "v2_parser_split_sell");
        assert!(pair.sell.amounts.total_wallet_cost.is_none());
        assert!(pair.sell.amounts.net_wallet_received.is_none());

        assert_eq!(pair.buy.direction, Direction::Buy);
        assert_eq!(pair.buy.base_asset.mint, TOK_B);
        assert_eq!(pair.buy.amounts.base_amount, 1000.0);
        assert_eq!(pair.buy.classification_source, "v2_parser_split_buy");

        assert_eq!(pair.sell.signature, pair.buy.signature);
        assert_eq!(pair.sell.timestamp, pair.buy.timestamp);
        assert_eq!(pair.sell.swapper, pair.buy.swapper);
        assert_eq!(pair.sell.protocol, pair.buy.protocol);
    }

    #[test]
    fn test_token_to_token_with_stable_native_leg_stays_single() {
        // Same route, but the wallet also shows a 3 SOL outflow: record the
        // native-described leg instead of splitting.
        let raw = build_tx(
            "sig-route",
            SWAPPER,
            10_000_000_000,
            6_999_995_000,
            vec![
                token_balance(3, TOK_A, SWAPPER, 500.0, 6),
                token_balance(4, TOK_B, SWAPPER, 0.0, 9),
            ],
            vec![
                token_balance(3, TOK_A, SWAPPER, 0.0, 6),
                token_balance(4, TOK_B, SWAPPER, 1000.0, 9),
            ],
            Value::Null,
        );

        let result = classify(&raw, &tracked(SWAPPER), None).expect("should classify");
        let Classification::Single(swap) = result else {
            panic!("expected single swap");
        };
        assert_eq!(swap.direction, Direction::Buy);
        assert_eq!(swap.base_asset.mint, TOK_B);
    }

    #[test]
    fn test_failed_transaction_rejected() {
        let raw = build_tx(
            "sig-failed",
            SWAPPER,
            1_000_000_000,
            999_995_000,
            vec![],
            vec![token_balance(3, TOK_A, SWAPPER, 10.0, 6)],
            json!({"InstructionError": [0, "Custom"]}),
        );
        let err = classify(&raw, &tracked(SWAPPER), None).unwrap_err();
        assert_eq!(err.reason, RejectReason::FailedTransaction);

        let watch = HashMap::from([(SWAPPER.to_string(), tracked(SWAPPER))]);
        assert_eq!(precheck(&raw, &watch).unwrap_err(), RejectReason::FailedTransaction);
    }

    #[test]
    fn test_untracked_wallet_is_not_swapper() {
        let raw = build_tx(
            "sig-none",
            OTHER,
            10_000_000_000,
            8_999_995_000,
            vec![token_balance(3, TOK_A, OTHER, 0.0, 6)],
            vec![token_balance(3, TOK_A, OTHER, 1000.0, 6)],
            Value::Null,
        );
        let err = classify(&raw, &tracked(SWAPPER), None).unwrap_err();
        assert_eq!(err.reason, RejectReason::NoSwapper);
    }

    #[test]
    fn test_owner_analysis_identifies_delegated_swap() {
        // Tracked wallet is neither fee payer nor signer, but its token
        // accounts show a clean two-asset swap.
        let raw = build_tx(
            "sig-owner",
            OTHER,
            1_000_000_000,
            999_995_000,
            vec![
                token_balance(3, TOK_A, SWAPPER, 500.0, 6),
                token_balance(4, TOK_B, SWAPPER, 0.0, 9),
            ],
            vec![
                token_balance(3, TOK_A, SWAPPER, 0.0, 6),
                token_balance(4, TOK_B, SWAPPER, 1000.0, 9),
            ],
            Value::Null,
        );

        let result = classify(&raw, &tracked(SWAPPER), None).expect("should classify");
        let Classification::Split(pair) = result else {
            panic!("expected split pair");
        };
        assert_eq!(pair.buy.swapper_method, SwapperMethod::OwnerAnalysis);
    }

    #[test]
    fn test_no_movement_is_non_swap() {
        let raw = build_tx(
            "sig-idle",
            SWAPPER,
            1_000_000_000,
            1_000_000_000,
            vec![token_balance(3, TOK_A, SWAPPER, 500.0, 6)],
            vec![token_balance(3, TOK_A, SWAPPER, 500.0, 6)],
            Value::Null,
        );
        let err = classify(&raw, &tracked(SWAPPER), None).unwrap_err();
        assert_eq!(err.reason, RejectReason::NonSwap);
    }

    #[test]
    fn test_fee_only_movement_is_dust() {
        // Only the transaction fee left the wallet
        let raw = build_tx(
            "sig-fee",
            SWAPPER,
            1_000_000_000,
            999_995_000,
            vec![token_balance(3, TOK_A, SWAPPER, 500.0, 6)],
            vec![token_balance(3, TOK_A, SWAPPER, 500.0, 6)],
            Value::Null,
        );
        let err = classify(&raw, &tracked(SWAPPER), None).unwrap_err();
        assert_eq!(err.reason, RejectReason::DustAmount);
    }

    #[test]
    fn test_excluded_base_token_rejected() {
        let usdc = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
        let raw = build_tx(
            "sig-usdc",
            SWAPPER,
            10_000_000_000,
            8_999_995_000,
            vec![token_balance(3, usdc, SWAPPER, 0.0, 6)],
            vec![token_balance(3, usdc, SWAPPER, 100.0, 6)],
            Value::Null,
        );
        let err = classify(&raw, &tracked(SWAPPER), None).unwrap_err();
        assert_eq!(err.reason, RejectReason::ExcludedToken);
    }

    #[test]
    fn test_confidence_floor() {
        let raw = build_tx(
            "sig-floor",
            SWAPPER,
            10_000_000_000,
            8_999_995_000,
            vec![token_balance(3, TOK_A, SWAPPER, 0.0, 6)],
            vec![token_balance(3, TOK_A, SWAPPER, 1000.0, 6)],
            Value::Null,
        );
        // FeePayer path classifies at MAX, so a MAX floor passes
        assert!(classify(&raw, &tracked(SWAPPER), Some(Confidence::Max)).is_ok());

        // Owner-analysis split classifies below HIGH and is floored out
        let delegated = build_tx(
            "sig-floor2",
            OTHER,
            1_000_000_000,
            999_995_000,
            vec![
                token_balance(3, TOK_A, SWAPPER, 500.0, 6),
                token_balance(4, TOK_B, SWAPPER, 0.0, 9),
            ],
            vec![
                token_balance(3, TOK_A, SWAPPER, 0.0, 6),
                token_balance(4, TOK_B, SWAPPER, 1000.0, 9),
            ],
            Value::Null,
        );
        let err = classify(&delegated, &tracked(SWAPPER), Some(Confidence::High)).unwrap_err();
        assert_eq!(err.reason, RejectReason::BelowConfidenceFloor);
    }

    #[test]
    fn test_classifier_is_pure() {
        let raw = build_tx(
            "sig-pure",
            SWAPPER,
            10_000_000_000,
            8_999_995_000,
            vec![token_balance(3, TOK_A, SWAPPER, 0.0, 6)],
            vec![token_balance(3, TOK_A, SWAPPER, 1000.0, 6)],
            Value::Null,
        );
        let first = classify(&raw, &tracked(SWAPPER), None).expect("classifies");
        let second = classify(&raw, &tracked(SWAPPER), None).expect("classifies");
        match (first, second) {
            (Classification::Single(a), Classification::Single(b)) => {
                assert_eq!(a.direction, b.direction);
                assert_eq!(a.amounts, b.amounts);
                assert_eq!(a.base_asset, b.base_asset);
            }
            _ => panic!("classification changed shape between runs"),
        }
    }

    #[test]
    fn test_match_sources_in_precedence_order() {
        let raw = build_tx(
            "sig-match",
            SWAPPER,
            1_000_000_000,
            999_995_000,
            vec![],
            vec![token_balance(3, TOK_A, HIDDEN, 10.0, 6)],
            Value::Null,
        );
        let watch = HashMap::from([
            (SWAPPER.to_string(), tracked(SWAPPER)),
            (HIDDEN.to_string(), tracked(HIDDEN)),
        ]);
        let matched = match_tracked_accounts(&raw, &watch);
        assert_eq!(matched.len(), 2);
        // SWAPPER appears in accountKeys; HIDDEN only as a token-balance owner
        let by_addr: HashMap<&str, MatchSource> = matched
            .iter()
            .map(|(account, source)| (account.address.as_str(), *source))
            .collect();
        assert_eq!(by_addr[SWAPPER], MatchSource::AccountKeys);
        assert_eq!(by_addr[HIDDEN], MatchSource::PostTokenBalances);
    }

    #[test]
    fn test_wsol_counts_as_native() {
        // Buy paid in wSOL: token account delta on the wrapped mint, no
        // meaningful lamport movement.
        let raw = build_tx(
            "sig-wsol",
            SWAPPER,
            1_000_000_000,
            999_995_000,
            vec![
                token_balance(3, WSOL_MINT, SWAPPER, 2.0, 9),
                token_balance(4, TOK_A, SWAPPER, 0.0, 6),
            ],
            vec![
                token_balance(3, WSOL_MINT, SWAPPER, 0.0, 9),
                token_balance(4, TOK_A, SWAPPER, 10_000.0, 6),
            ],
            Value::Null,
        );
        let result = classify(&raw, &tracked(SWAPPER), None).expect("should classify");
        let Classification::Single(swap) = result else {
            panic!("expected single swap");
        };
        assert_eq!(swap.direction, Direction::Buy);
        assert_eq!(swap.base_asset.mint, TOK_A);
        let cost = swap.amounts.total_wallet_cost.unwrap();
        assert!((cost - 2.0).abs() < 0.01, "cost {cost} should be ~2 SOL");
    }
}
