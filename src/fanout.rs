use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::constants::{TWEET_MIN_HOTNESS, TWEET_MIN_USD};
use crate::types::{Direction, StoredTrade};

/// Channel capacity per downstream consumer
const FANOUT_CAPACITY: usize = 1000;

/// Events delivered to downstream consumers after a successful persist.
/// Consumers are external collaborators; the pipeline only guarantees
/// best-effort, non-blocking delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutEvent {
    AlertMatch(StoredTrade),
    Broadcast(StoredTrade),
    TweetCandidate(StoredTrade),
}

/// Counters for dropped events, reported by the stats task
#[derive(Debug, Default)]
pub struct FanoutDrops {
    pub alert: u64,
    pub broadcast: u64,
    pub tweet: u64,
}

/// Non-blocking fan-out bus: one bounded channel per downstream consumer.
/// A full channel drops the event with a warning rather than stalling the
/// worker that produced it.
pub struct FanoutBus {
    alert_tx: mpsc::Sender<FanoutEvent>,
    broadcast_tx: mpsc::Sender<FanoutEvent>,
    tweet_tx: mpsc::Sender<FanoutEvent>,
    drops: parking_lot::Mutex<FanoutDrops>,
}

/// Receiver ends handed to the downstream consumers at startup
pub struct FanoutReceivers {
    pub alert_rx: mpsc::Receiver<FanoutEvent>,
    pub broadcast_rx: mpsc::Receiver<FanoutEvent>,
    pub tweet_rx: mpsc::Receiver<FanoutEvent>,
}

/// A BUY qualifies for the tweet path only above both thresholds
pub fn qualifies_for_tweet(trade: &StoredTrade) -> bool {
    trade.trade_type == Direction::Buy
        && trade.usd_buy_amount >= TWEET_MIN_USD
        && trade.hotness_score >= TWEET_MIN_HOTNESS
}

impl FanoutBus {
    pub fn new() -> (Self, FanoutReceivers) {
        let (alert_tx, alert_rx) = mpsc::channel(FANOUT_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(FANOUT_CAPACITY);
        let (tweet_tx, tweet_rx) = mpsc::channel(FANOUT_CAPACITY);
        (
            Self {
                alert_tx,
                broadcast_tx,
                tweet_tx,
                drops: parking_lot::Mutex::new(FanoutDrops::default()),
            },
            FanoutReceivers { alert_rx, broadcast_rx, tweet_rx },
        )
    }

    /// Emit the post-persist events for one stored trade
    pub fn emit(&self, trade: &StoredTrade) {
        if self
            .alert_tx
            .try_send(FanoutEvent::AlertMatch(trade.clone()))
            .is_err()
        {
            self.drops.lock().alert += 1;
            warn!("Alert-matcher channel full, dropping event for {}", trade.signature);
        }

        if self
            .broadcast_tx
            .try_send(FanoutEvent::Broadcast(trade.clone()))
            .is_err()
        {
            self.drops.lock().broadcast += 1;
            warn!("Broadcast channel full, dropping event for {}", trade.signature);
        }

        if qualifies_for_tweet(trade) {
            if self
                .tweet_tx
                .try_send(FanoutEvent::TweetCandidate(trade.clone()))
                .is_err()
            {
                self.drops.lock().tweet += 1;
                warn!("Tweet channel full, dropping candidate {}", trade.signature);
            } else {
                debug!(
                    "Tweet candidate: {} ${:.0} hotness {}",
                    trade.signature, trade.usd_buy_amount, trade.hotness_score
                );
            }
        }
    }

    pub fn dropped(&self) -> (u64, u64, u64) {
        let drops = self.drops.lock();
        (drops.alert, drops.broadcast, drops.tweet)
    }
}
