use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::classifier::{precheck, RejectReason};
use crate::constants::{
    SUBSCRIBE_BATCH_SIZE, SUBSCRIBE_BATCH_STAGGER, WS_CONNECT_TIMEOUT, WS_PING_INTERVAL,
    WS_RECONNECT_BASE, WS_RECONNECT_MAX,
};
use crate::dedup::DedupLayer;
use crate::metrics::IngestMetrics;
use crate::types::{RawTxNotification, TrackedAccount};

/// Subscription connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Subscribed,
    ReconnectWait,
}

/// Reconnect delay for the given attempt: `base × 1.5^attempt`, capped.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let base = WS_RECONNECT_BASE.as_secs_f64();
    let delay = base * 1.5f64.powi(attempt as i32);
    Duration::from_secs_f64(delay.min(WS_RECONNECT_MAX.as_secs_f64()))
}

/// `transactionSubscribe` request for one batch of tracked addresses
pub fn subscribe_request(id: u64, addresses: &[String]) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "transactionSubscribe",
        "params": [
            {"accountInclude": addresses},
            {
                "commitment": "finalized",
                "encoding": "jsonParsed",
                "transactionDetails": "full",
                "showRewards": false,
                "maxSupportedTransactionVersion": 0
            }
        ]
    })
}

/// What one inbound frame turned out to be
#[derive(Debug, PartialEq)]
pub enum HandleOutcome {
    SubscriptionAck,
    Enqueued(usize),
    Dropped(RejectReason),
    DedupSkipped,
    Ignored,
}

/// Maintains the single live websocket subscription to the upstream
/// parsed-transaction feed and hands accepted notifications to the dedup
/// layer. Connection drops and parse failures schedule a reconnect; they
/// never terminate the process.
pub struct SubscriptionManager {
    endpoint: String,
    watch_list: Arc<HashMap<String, TrackedAccount>>,
    dedup: DedupLayer,
    metrics: IngestMetrics,
    state: Arc<RwLock<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SubscriptionManager {
    pub fn new(
        endpoint: String,
        accounts: Vec<TrackedAccount>,
        dedup: DedupLayer,
        metrics: IngestMetrics,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let watch_list: HashMap<String, TrackedAccount> = accounts
            .into_iter()
            .map(|account| (account.address.clone(), account))
            .collect();
        metrics.tracked_accounts.set(watch_list.len() as i64);
        Self {
            endpoint,
            watch_list: Arc::new(watch_list),
            dedup,
            metrics,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            shutdown_rx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Process one inbound text frame. Split out from the socket loop so the
    /// dispatch logic is testable without a connection.
    pub fn handle_text(&self, text: &str) -> HandleOutcome {
        let Ok(message) = serde_json::from_str::<Value>(text) else {
            debug!("Unparseable feed frame ({} bytes)", text.len());
            return HandleOutcome::Ignored;
        };

        // A bare {result, id} is the subscription ack
        if message.get("method").is_none() {
            if message.get("id").is_some() {
                debug!(
                    "Subscription ack: id={} result={}",
                    message.get("id").unwrap_or(&serde_json::Value::Null),
                    message.get("result").unwrap_or(&serde_json::Value::Null)
                );
                return HandleOutcome::SubscriptionAck;
            }
            return HandleOutcome::Ignored;
        }

        if message.get("method").and_then(Value::as_str) != Some("transactionNotification") {
            return HandleOutcome::Ignored;
        }

        let Some(result) = message.pointer("/params/result") else {
            return HandleOutcome::Ignored;
        };
        self.metrics.notifications_received.inc();

        let matched = match precheck(result, &self.watch_list) {
            Ok(matched) => matched,
            Err(reason) => {
                self.metrics
                    .precheck_drops
                    .with_label_values(&[reason.as_str()])
                    .inc();
                return HandleOutcome::Dropped(reason);
            }
        };

        let signature = result
            .get("signature")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let notification = RawTxNotification {
            signature: signature.clone(),
            raw: result.clone(),
            account_keys: matched
                .iter()
                .map(|(account, _)| account.address.clone())
                .collect(),
        };

        let mut enqueued = 0usize;
        for (account, source) in &matched {
            match self.dedup.try_enqueue(&notification, &account.address) {
                Ok(true) => {
                    enqueued += 1;
                    self.metrics.jobs_enqueued.inc();
                    debug!(
                        "Enqueued {} for {} (matched via {:?})",
                        signature, account.address, source
                    );
                }
                Ok(false) => {
                    self.metrics.dedup_hits.inc();
                }
                Err(e) => {
                    error!("Enqueue failed for {}: {}", signature, e);
                }
            }
        }
        if enqueued == 0 {
            return HandleOutcome::DedupSkipped;
        }
        HandleOutcome::Enqueued(enqueued)
    }

    /// Run the subscription until shutdown is signalled
    pub async fn run(&mut self) {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            match self.connect_and_stream(&mut attempt).await {
                Ok(()) => {
                    // Clean shutdown path
                    break;
                }
                Err(e) => {
                    self.metrics.reconnects.inc();
                    let delay = reconnect_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "Subscription dropped ({}), reconnecting in {:?} (attempt {})",
                        e, delay, attempt
                    );
                    self.set_state(ConnectionState::ReconnectWait);

                    let mut shutdown_rx = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Subscription manager stopped");
    }

    async fn connect_and_stream(&mut self, attempt: &mut u32) -> anyhow::Result<()> {
        info!("Connecting to transaction feed");
        let connect = connect_async(self.endpoint.as_str());
        let (stream, _response) = match timeout(WS_CONNECT_TIMEOUT, connect).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(anyhow::anyhow!("connect failed: {e}")),
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "connect timed out after {:?}",
                    WS_CONNECT_TIMEOUT
                ))
            }
        };
        self.set_state(ConnectionState::Open);
        // The attempt counter resets once a connection reaches OPEN
        *attempt = 0;
        info!("Feed connection open, subscribing {} addresses", self.watch_list.len());

        let (mut write, mut read) = stream.split();

        // One request carries the whole watch list; oversized lists fall
        // back to batches with a short stagger for upstream limits.
        let addresses: Vec<String> = self.watch_list.keys().cloned().collect();
        let mut request_id = 1u64;
        for batch in addresses.chunks(SUBSCRIBE_BATCH_SIZE.max(1)) {
            let request = subscribe_request(request_id, batch);
            write.send(Message::Text(request.to_string())).await?;
            request_id += 1;
            if addresses.len() > SUBSCRIBE_BATCH_SIZE {
                tokio::time::sleep(SUBSCRIBE_BATCH_STAGGER).await;
            }
        }
        self.set_state(ConnectionState::Subscribed);

        let mut ping_timer = interval(WS_PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await.ok();
                        }
                        Some(Ok(Message::Close(close))) => {
                            return Err(anyhow::anyhow!("feed closed: {:?}", close));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(anyhow::anyhow!("feed read error: {e}"));
                        }
                        None => {
                            return Err(anyhow::anyhow!("feed stream ended"));
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return Err(anyhow::anyhow!("ping failed: {e}"));
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown requested, closing feed socket");
                    write.send(Message::Close(None)).await.ok();
                    return Ok(());
                }
            }
        }
    }
}
