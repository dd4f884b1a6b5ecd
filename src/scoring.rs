use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::constants::{
    DAILY_REPEAT_LIMIT, EARLY_BUYER_LIMIT_KOL, EARLY_BUYER_LIMIT_WHALE, HOTNESS_BUYER_CAP_KOL,
    HOTNESS_BUYER_CAP_WHALE,
};
use crate::store::{StoreError, TradeLite, TradeStore};
use crate::types::{AccountKind, Direction, TrackedAccount};

/// Rolling 30-day window for the historical-performance component
const PERFORMANCE_WINDOW_SECS: i64 = 30 * 24 * 3600;

/// A sell must exit at least half the bought position for the token to
/// count as a completed trade
const COMPLETION_EXIT_FRACTION: f64 = 0.5;

/// Per-label points for the whale tag bonus
fn label_points(label: &str) -> i32 {
    match label.to_uppercase().as_str() {
        "SMART MONEY" => 3,
        "HEAVY ACCUMULATOR" => 2,
        "EARLY BUYER" => 2,
        "SNIPER" | "DORMANT" | "COORDINATED" => 1,
        "FLIPPER" => 0,
        _ => 0,
    }
}

/// 30-day FIFO trading performance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceStats {
    /// Percentage of completed trades with positive ROI
    pub win_rate: f64,
    /// Aggregate ROI percentage over matched lots
    pub roi: f64,
    pub completed: usize,
}

/// FIFO lot-matching over an account's trade history.
///
/// Buys open lots per token; sells consume the oldest lots first. A token
/// counts as completed once at least half the bought quantity has been
/// exited; its realized ROI comes from matched cost vs proceeds.
pub fn fifo_performance(trades: &[TradeLite]) -> Option<PerformanceStats> {
    struct Lot {
        amount: f64,
        unit_cost: f64,
    }
    struct Position {
        lots: Vec<Lot>,
        bought: f64,
        sold: f64,
        matched_cost: f64,
        proceeds: f64,
    }

    let mut positions: HashMap<&str, Position> = HashMap::new();
    for trade in trades {
        let position = positions
            .entry(trade.token_address.as_str())
            .or_insert_with(|| Position {
                lots: Vec::new(),
                bought: 0.0,
                sold: 0.0,
                matched_cost: 0.0,
                proceeds: 0.0,
            });
        match trade.trade_type {
            Direction::Buy => {
                if trade.token_amount > 0.0 {
                    position.bought += trade.token_amount;
                    position.lots.push(Lot {
                        amount: trade.token_amount,
                        unit_cost: trade.usd_amount / trade.token_amount,
                    });
                }
            }
            Direction::Sell => {
                let mut remaining = trade.token_amount;
                if remaining <= 0.0 {
                    continue;
                }
                let unit_price = trade.usd_amount / trade.token_amount;
                position.sold += remaining;
                while remaining > 0.0 {
                    let Some(lot) = position.lots.first_mut() else {
                        break;
                    };
                    let matched = lot.amount.min(remaining);
                    position.matched_cost += matched * lot.unit_cost;
                    position.proceeds += matched * unit_price;
                    lot.amount -= matched;
                    remaining -= matched;
                    if lot.amount <= 0.0 {
                        position.lots.remove(0);
                    }
                }
            }
        }
    }

    let mut completions = 0usize;
    let mut wins = 0usize;
    let mut total_cost = 0.0;
    let mut total_proceeds = 0.0;
    for position in positions.values() {
        if position.bought <= 0.0
            || position.sold < position.bought * COMPLETION_EXIT_FRACTION
            || position.matched_cost <= 0.0
        {
            continue;
        }
        completions += 1;
        total_cost += position.matched_cost;
        total_proceeds += position.proceeds;
        if position.proceeds > position.matched_cost {
            wins += 1;
        }
    }

    if completions == 0 {
        return None;
    }
    Some(PerformanceStats {
        win_rate: wins as f64 / completions as f64 * 100.0,
        roi: (total_proceeds - total_cost) / total_cost * 100.0,
        completed: completions,
    })
}

/// Everything the score depends on, gathered by the worker
#[derive(Debug, Clone, Default)]
pub struct ScoringInputs {
    pub kind: Option<AccountKind>,
    pub labels: Vec<String>,
    pub follower_count: Option<u64>,
    pub usd_amount: f64,
    pub market_cap: Option<f64>,
    pub is_first_buy: bool,
    pub distinct_buyers: usize,
    pub todays_prior_buys: usize,
    /// Last-15-min buy inflow over the 24 h hourly average
    pub volume_ratio: Option<f64>,
    pub performance: Option<PerformanceStats>,
}

fn tag_bonus(labels: &[String]) -> i32 {
    labels.iter().map(|label| label_points(label)).sum::<i32>().clamp(0, 3)
}

fn follower_tier(followers: u64) -> i32 {
    if followers >= 100_000 {
        3
    } else if followers >= 10_000 {
        2
    } else if followers >= 1_000 {
        1
    } else {
        0
    }
}

fn performance_tier(stats: &PerformanceStats) -> i32 {
    if stats.win_rate >= 60.0 && stats.roi >= 200.0 {
        3
    } else if stats.win_rate >= 40.0 || stats.roi >= 100.0 {
        2
    } else if stats.win_rate >= 20.0 || stats.roi >= 50.0 {
        1
    } else if stats.win_rate < 10.0 && stats.roi < 0.0 {
        -1
    } else {
        0
    }
}

fn size_tier(usd: f64) -> i32 {
    if usd > 20_000.0 {
        3
    } else if usd >= 5_000.0 {
        2
    } else if usd >= 1_000.0 {
        1
    } else if usd < 500.0 {
        -2
    } else {
        0
    }
}

fn market_cap_tier(market_cap: Option<f64>) -> i32 {
    match market_cap {
        Some(mc) if mc <= 0.0 => 0,
        Some(mc) if mc < 1_000_000.0 => 3,
        Some(mc) if mc < 5_000_000.0 => 2,
        Some(mc) if mc < 20_000_000.0 => 1,
        _ => 0,
    }
}

fn volume_spike_tier(ratio: f64, kind: AccountKind) -> i32 {
    // The blow-off branch outranks the positive tiers on the whale path
    if ratio > 5.0 && kind == AccountKind::Whale {
        -1
    } else if ratio >= 3.0 {
        2
    } else if ratio >= 2.0 {
        1
    } else {
        0
    }
}

/// Hotness score for a BUY record: component sum clamped into [0, 10].
pub fn hotness_score(inputs: &ScoringInputs) -> i32 {
    let kind = inputs.kind.unwrap_or(AccountKind::Whale);
    let mut score = 0i32;

    match kind {
        AccountKind::Whale => score += tag_bonus(&inputs.labels),
        AccountKind::Kol => {
            score += follower_tier(inputs.follower_count.unwrap_or(0));
        }
    }

    if let Some(stats) = &inputs.performance {
        score += performance_tier(stats);
    }
    score += size_tier(inputs.usd_amount);
    score += market_cap_tier(inputs.market_cap);
    if let Some(ratio) = inputs.volume_ratio {
        score += volume_spike_tier(ratio, kind);
    }

    let early_limit = match kind {
        AccountKind::Whale => EARLY_BUYER_LIMIT_WHALE,
        AccountKind::Kol => EARLY_BUYER_LIMIT_KOL,
    };
    if inputs.is_first_buy {
        score += 2;
    } else if inputs.distinct_buyers < early_limit {
        score += 1;
    }

    if inputs.todays_prior_buys >= DAILY_REPEAT_LIMIT {
        score -= 1;
    }

    score.clamp(0, 10)
}

/// Promoted-token bonus applied post-persist by the tweet path
pub fn apply_promoted_bonus(score: i32) -> i32 {
    (score + 3).clamp(0, 10)
}

/// Gather every store-backed input and score one BUY.
///
/// Also advances the hotness aggregate for the token, so call it once per
/// persisted buy.
pub fn score_buy(
    store: &TradeStore,
    account: &TrackedAccount,
    token_address: &str,
    signature: &str,
    usd_amount: f64,
    market_cap: Option<f64>,
    now: DateTime<Utc>,
) -> Result<(i32, usize), StoreError> {
    let buyer_cap = match account.kind {
        AccountKind::Whale => HOTNESS_BUYER_CAP_WHALE,
        AccountKind::Kol => HOTNESS_BUYER_CAP_KOL,
    };
    let (is_first_buy, distinct_buyers) =
        store.record_token_buy(account.kind, token_address, signature, &account.address, buyer_cap)?;

    let utc_day = now.format("%Y-%m-%d").to_string();
    let todays_prior_buys =
        store.todays_buy_count(account.kind, &account.address, token_address, &utc_day)?;

    let now_ts = now.timestamp();
    let inflow_15m = store.buy_volume(account.kind, token_address, now_ts - 900, now_ts)?;
    let day_volume = store.buy_volume(account.kind, token_address, now_ts - 86_400, now_ts)?;
    let hourly_average = day_volume / 24.0;
    let volume_ratio = if hourly_average > 0.0 {
        Some(inflow_15m / hourly_average)
    } else {
        None
    };

    let trades = store.trades_for_account_since(
        account.kind,
        &account.address,
        now_ts - PERFORMANCE_WINDOW_SECS,
    )?;
    let performance = fifo_performance(&trades);

    let inputs = ScoringInputs {
        kind: Some(account.kind),
        labels: account.labels.clone(),
        follower_count: account.influencer.as_ref().map(|profile| profile.follower_count),
        usd_amount,
        market_cap,
        is_first_buy,
        distinct_buyers,
        todays_prior_buys,
        volume_ratio,
        performance,
    };
    let score = hotness_score(&inputs);
    debug!(
        "Scored buy {} for {}: {} (first={}, buyers={}, repeats={})",
        signature, account.address, score, is_first_buy, distinct_buyers, todays_prior_buys
    );
    Ok((score, todays_prior_buys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lite(token: &str, trade_type: Direction, usd: f64, amount: f64, ts: i64) -> TradeLite {
        TradeLite {
            token_address: token.to_string(),
            trade_type,
            usd_amount: usd,
            token_amount: amount,
            tx_timestamp: ts,
        }
    }

    #[test]
    fn test_size_tiers() {
        assert_eq!(size_tier(25_000.0), 3);
        assert_eq!(size_tier(5_000.0), 2);
        assert_eq!(size_tier(1_500.0), 1);
        assert_eq!(size_tier(700.0), 0);
        assert_eq!(size_tier(100.0), -2);
    }

    #[test]
    fn test_market_cap_tiers() {
        assert_eq!(market_cap_tier(Some(500_000.0)), 3);
        assert_eq!(market_cap_tier(Some(3_000_000.0)), 2);
        assert_eq!(market_cap_tier(Some(15_000_000.0)), 1);
        assert_eq!(market_cap_tier(Some(50_000_000.0)), 0);
        assert_eq!(market_cap_tier(None), 0);
    }

    #[test]
    fn test_follower_tiers() {
        assert_eq!(follower_tier(250_000), 3);
        assert_eq!(follower_tier(50_000), 2);
        assert_eq!(follower_tier(2_000), 1);
        assert_eq!(follower_tier(500), 0);
    }

    #[test]
    fn test_tag_bonus_clamped() {
        let labels = vec![
            "SMART MONEY".to_string(),
            "HEAVY ACCUMULATOR".to_string(),
            "SNIPER".to_string(),
        ];
        assert_eq!(tag_bonus(&labels), 3);
        assert_eq!(tag_bonus(&["FLIPPER".to_string()]), 0);
        assert_eq!(tag_bonus(&[]), 0);
    }

    #[test]
    fn test_volume_spike_branches() {
        assert_eq!(volume_spike_tier(6.0, AccountKind::Whale), -1);
        assert_eq!(volume_spike_tier(6.0, AccountKind::Kol), 2);
        assert_eq!(volume_spike_tier(3.5, AccountKind::Whale), 2);
        assert_eq!(volume_spike_tier(2.2, AccountKind::Whale), 1);
        assert_eq!(volume_spike_tier(1.5, AccountKind::Whale), 0);
    }

    #[test]
    fn test_performance_tiers() {
        let strong = PerformanceStats { win_rate: 65.0, roi: 250.0, completed: 5 };
        assert_eq!(performance_tier(&strong), 3);
        let decent = PerformanceStats { win_rate: 45.0, roi: 20.0, completed: 5 };
        assert_eq!(performance_tier(&decent), 2);
        let mild = PerformanceStats { win_rate: 25.0, roi: 10.0, completed: 5 };
        assert_eq!(performance_tier(&mild), 1);
        let losing = PerformanceStats { win_rate: 5.0, roi: -40.0, completed: 5 };
        assert_eq!(performance_tier(&losing), -1);
        let flat = PerformanceStats { win_rate: 15.0, roi: 10.0, completed: 5 };
        assert_eq!(performance_tier(&flat), 0);
    }

    #[test]
    fn test_fifo_requires_half_exit() {
        // Bought 100, sold only 30: not a completed trade
        let trades = vec![
            lite("TokA", Direction::Buy, 100.0, 100.0, 1),
            lite("TokA", Direction::Sell, 60.0, 30.0, 2),
        ];
        assert!(fifo_performance(&trades).is_none());

        // Selling 50 reaches the half-exit threshold
        let trades = vec![
            lite("TokA", Direction::Buy, 100.0, 100.0, 1),
            lite("TokA", Direction::Sell, 100.0, 50.0, 2),
        ];
        let stats = fifo_performance(&trades).unwrap();
        assert_eq!(stats.completed, 1);
        // Matched cost 50 * $1 = $50, proceeds $100 -> +100% ROI, winning
        assert_eq!(stats.win_rate, 100.0);
        assert!((stats.roi - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_fifo_matches_oldest_lots_first() {
        // Two buys at different prices; the sell consumes the cheap lot
        let trades = vec![
            lite("TokA", Direction::Buy, 100.0, 100.0, 1), // $1/unit
            lite("TokA", Direction::Buy, 400.0, 100.0, 2), // $4/unit
            lite("TokA", Direction::Sell, 300.0, 100.0, 3), // $3/unit
        ];
        let stats = fifo_performance(&trades).unwrap();
        // Matched against the $1 lot: cost 100, proceeds 300 -> +200%
        assert!((stats.roi - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_fifo_losing_trades() {
        let trades = vec![
            lite("TokA", Direction::Buy, 1_000.0, 100.0, 1),
            lite("TokA", Direction::Sell, 300.0, 100.0, 2),
        ];
        let stats = fifo_performance(&trades).unwrap();
        assert_eq!(stats.win_rate, 0.0);
        assert!(stats.roi < 0.0);
    }

    #[test]
    fn test_hotness_clamps_to_range() {
        // Everything maxed out would exceed 10 unclamped
        let inputs = ScoringInputs {
            kind: Some(AccountKind::Whale),
            labels: vec!["SMART MONEY".into()],
            usd_amount: 30_000.0,
            market_cap: Some(400_000.0),
            is_first_buy: true,
            volume_ratio: Some(3.0),
            performance: Some(PerformanceStats { win_rate: 70.0, roi: 300.0, completed: 4 }),
            ..Default::default()
        };
        assert_eq!(hotness_score(&inputs), 10);

        // Small losing repeat buy bottoms out at 0
        let inputs = ScoringInputs {
            kind: Some(AccountKind::Whale),
            usd_amount: 50.0,
            todays_prior_buys: 3,
            performance: Some(PerformanceStats { win_rate: 0.0, roi: -80.0, completed: 2 }),
            ..Default::default()
        };
        assert_eq!(hotness_score(&inputs), 0);
    }

    #[test]
    fn test_kol_uses_followers_not_tags() {
        let inputs = ScoringInputs {
            kind: Some(AccountKind::Kol),
            labels: vec!["SMART MONEY".into()],
            follower_count: Some(150_000),
            usd_amount: 2_000.0,
            ..Default::default()
        };
        // follower tier 3 + size tier 1; the label is ignored on this path
        assert_eq!(hotness_score(&inputs), 4);
    }

    #[test]
    fn test_timing_bonuses() {
        let first = ScoringInputs {
            kind: Some(AccountKind::Whale),
            usd_amount: 700.0,
            is_first_buy: true,
            ..Default::default()
        };
        assert_eq!(hotness_score(&first), 2);

        let early = ScoringInputs {
            kind: Some(AccountKind::Whale),
            usd_amount: 700.0,
            distinct_buyers: 3,
            ..Default::default()
        };
        assert_eq!(hotness_score(&early), 1);

        let late = ScoringInputs {
            kind: Some(AccountKind::Whale),
            usd_amount: 700.0,
            distinct_buyers: 6,
            ..Default::default()
        };
        assert_eq!(hotness_score(&late), 0);
    }

    #[test]
    fn test_promoted_bonus_clamps() {
        assert_eq!(apply_promoted_bonus(5), 8);
        assert_eq!(apply_promoted_bonus(9), 10);
    }
}
