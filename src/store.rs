use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{
    AccountKind, Direction, InfluencerProfile, StoredTrade, TokenDescriptor, TrackedAccount,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate record for (signature, type)")]
    Duplicate,
    #[error("database error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("store poisoned")]
    Poisoned,
    #[error("invalid stored data: {0}")]
    Corrupt(String),
}

impl StoreError {
    fn from_sqlite(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(inner, _) = &error {
            if inner.code == ErrorCode::ConstraintViolation {
                return StoreError::Duplicate;
            }
        }
        StoreError::Backend(error)
    }
}

/// Slim view of a persisted trade used by the scoring queries
#[derive(Debug, Clone)]
pub struct TradeLite {
    pub token_address: String,
    pub trade_type: Direction,
    pub usd_amount: f64,
    pub token_amount: f64,
    pub tx_timestamp: i64,
}

/// Persistence adapter over SQLite.
///
/// Both swap tables enforce `UNIQUE(signature, trade_type)`, which is what
/// caps a signature at two records (one buy + one sell) no matter how jobs
/// are retried or interleaved. Split pairs commit inside one transaction.
#[derive(Clone)]
pub struct TradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl TradeStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("cannot create data dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("../schema.sql"))?;
        info!("Trade store ready: {}", path);
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Shared connection handle for the job queues
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn table(kind: AccountKind) -> &'static str {
        match kind {
            AccountKind::Whale => "whale_swaps",
            AccountKind::Kol => "kol_swaps",
        }
    }

    fn insert_sql(kind: AccountKind) -> String {
        format!(
            "INSERT INTO {} (
                signature, trade_type, classification_source,
                usd_buy_amount, usd_sell_amount,
                token_in_address, token_in_symbol, token_in_name, token_in_image_url,
                token_in_amount, token_in_price, token_in_market_cap, token_in_created_at,
                token_out_address, token_out_symbol, token_out_name, token_out_image_url,
                token_out_amount, token_out_price, token_out_market_cap, token_out_created_at,
                price_imputed, buy_sol_amount, sell_sol_amount, protocol, gas_fee_usd,
                tracked_account, account_labels, influencer, hotness_score, confidence,
                tx_timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
                      ?29, ?30, ?31, ?32)",
            Self::table(kind)
        )
    }

    fn bind_insert(conn: &Connection, trade: &StoredTrade) -> Result<(), rusqlite::Error> {
        let labels = serde_json::to_string(&trade.account_labels).unwrap_or_else(|_| "[]".into());
        let influencer = trade
            .influencer
            .as_ref()
            .and_then(|profile| serde_json::to_string(profile).ok());
        conn.execute(
            &Self::insert_sql(trade.account_kind),
            params![
                trade.signature,
                trade.trade_type.as_str(),
                trade.classification_source,
                trade.usd_buy_amount,
                trade.usd_sell_amount,
                trade.token_in.address,
                trade.token_in.symbol,
                trade.token_in.name,
                trade.token_in.image_url,
                trade.token_in_amount,
                trade.token_in_price,
                trade.token_in.market_cap,
                trade.token_in.created_at,
                trade.token_out.address,
                trade.token_out.symbol,
                trade.token_out.name,
                trade.token_out.image_url,
                trade.token_out_amount,
                trade.token_out_price,
                trade.token_out.market_cap,
                trade.token_out.created_at,
                trade.price_imputed as i64,
                trade.buy_sol_amount,
                trade.sell_sol_amount,
                trade.protocol,
                trade.gas_fee_usd,
                trade.tracked_account,
                labels,
                influencer,
                trade.hotness_score,
                trade.confidence.as_str(),
                trade.tx_timestamp,
            ],
        )?;
        Ok(())
    }

    /// Persist one trade record
    pub fn insert_trade(&self, trade: &StoredTrade) -> Result<(), StoreError> {
        let conn = self.lock()?;
        Self::bind_insert(&conn, trade).map_err(StoreError::from_sqlite)
    }

    /// Persist a split pair atomically: both records commit or neither does.
    pub fn insert_split_pair(
        &self,
        sell: &StoredTrade,
        buy: &StoredTrade,
    ) -> Result<(), StoreError> {
        if sell.signature != buy.signature {
            return Err(StoreError::Corrupt(
                "split pair records must share a signature".into(),
            ));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StoreError::from_sqlite)?;
        Self::bind_insert(&tx, sell).map_err(StoreError::from_sqlite)?;
        Self::bind_insert(&tx, buy).map_err(StoreError::from_sqlite)?;
        tx.commit().map_err(StoreError::from_sqlite)
    }

    /// Records already persisted for a signature (0, 1, or 2)
    pub fn count_records(&self, kind: AccountKind, signature: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE signature = ?1", Self::table(kind)),
            params![signature],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Post-persist hotness patch (promoted-token bonus from the tweet path)
    pub fn patch_hotness(
        &self,
        kind: AccountKind,
        signature: &str,
        trade_type: Direction,
        hotness: i32,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET hotness_score = ?3 WHERE signature = ?1 AND trade_type = ?2",
                Self::table(kind)
            ),
            params![signature, trade_type.as_str(), hotness],
        )?;
        if updated == 0 {
            warn!("Hotness patch matched no record: {} {}", signature, trade_type.as_str());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Watch lists
    // ------------------------------------------------------------------

    pub fn load_tracked_accounts(&self, kind: AccountKind) -> Result<Vec<TrackedAccount>, StoreError> {
        let conn = self.lock()?;
        match kind {
            AccountKind::Whale => {
                let mut stmt = conn.prepare("SELECT address, labels FROM tracked_whales")?;
                let rows = stmt.query_map([], |row| {
                    let address: String = row.get(0)?;
                    let labels: String = row.get(1)?;
                    Ok((address, labels))
                })?;
                let mut accounts = Vec::new();
                for row in rows {
                    let (address, labels) = row?;
                    accounts.push(TrackedAccount {
                        address,
                        kind: AccountKind::Whale,
                        labels: serde_json::from_str(&labels).unwrap_or_default(),
                        influencer: None,
                    });
                }
                Ok(accounts)
            }
            AccountKind::Kol => {
                let mut stmt = conn.prepare(
                    "SELECT address, name, handle, follower_count, avatar_url FROM tracked_influencers",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(TrackedAccount {
                        address: row.get(0)?,
                        kind: AccountKind::Kol,
                        labels: Vec::new(),
                        influencer: Some(InfluencerProfile {
                            name: row.get(1)?,
                            handle: row.get(2)?,
                            follower_count: row.get::<_, i64>(3)? as u64,
                            avatar_url: row.get(4)?,
                        }),
                    })
                })?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
            }
        }
    }

    pub fn upsert_tracked_whale(&self, address: &str, labels: &[String]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tracked_whales (address, labels) VALUES (?1, ?2)
             ON CONFLICT(address) DO UPDATE SET labels = excluded.labels",
            params![address, serde_json::to_string(labels).unwrap_or_else(|_| "[]".into())],
        )?;
        Ok(())
    }

    pub fn upsert_tracked_influencer(
        &self,
        address: &str,
        profile: &InfluencerProfile,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tracked_influencers (address, name, handle, follower_count, avatar_url)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(address) DO UPDATE SET
                 name = excluded.name, handle = excluded.handle,
                 follower_count = excluded.follower_count, avatar_url = excluded.avatar_url",
            params![
                address,
                profile.name,
                profile.handle,
                profile.follower_count as i64,
                profile.avatar_url,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hotness aggregates & purchase records
    // ------------------------------------------------------------------

    /// Record a buy into the per-token aggregate. Returns
    /// `(is_first_buy, distinct_buyer_count)` after this buy, with the
    /// stored buyer set capped at `buyer_cap`.
    pub fn record_token_buy(
        &self,
        kind: AccountKind,
        token_address: &str,
        signature: &str,
        buyer: &str,
        buyer_cap: usize,
    ) -> Result<(bool, usize), StoreError> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT buyers FROM hotness_aggregate WHERE pipeline = ?1 AND token_address = ?2",
                params![kind.as_str(), token_address],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO hotness_aggregate (pipeline, token_address, first_buy_signature, buyers)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        kind.as_str(),
                        token_address,
                        signature,
                        serde_json::to_string(&vec![buyer]).unwrap_or_else(|_| "[]".into()),
                    ],
                )?;
                Ok((true, 1))
            }
            Some(raw) => {
                let mut buyers: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
                if !buyers.iter().any(|known| known == buyer) && buyers.len() < buyer_cap {
                    buyers.push(buyer.to_string());
                    conn.execute(
                        "UPDATE hotness_aggregate SET buyers = ?3
                         WHERE pipeline = ?1 AND token_address = ?2",
                        params![
                            kind.as_str(),
                            token_address,
                            serde_json::to_string(&buyers).unwrap_or_else(|_| "[]".into()),
                        ],
                    )?;
                }
                Ok((false, buyers.len()))
            }
        }
    }

    /// Same-day buy count for (account, token) before the current trade
    pub fn todays_buy_count(
        &self,
        kind: AccountKind,
        tracked_account: &str,
        token_address: &str,
        utc_day: &str,
    ) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM purchase_record
             WHERE pipeline = ?1 AND tracked_account = ?2 AND token_address = ?3 AND utc_day = ?4",
            params![kind.as_str(), tracked_account, token_address, utc_day],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn record_purchase(
        &self,
        kind: AccountKind,
        tracked_account: &str,
        token_address: &str,
        signature: &str,
        usd_amount: f64,
        utc_day: &str,
        daily_limit_reached: bool,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO purchase_record
                 (pipeline, token_address, tracked_account, signature, usd_amount, utc_day, daily_limit_reached)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                kind.as_str(),
                token_address,
                tracked_account,
                signature,
                usd_amount,
                utc_day,
                daily_limit_reached as i64,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scoring queries
    // ------------------------------------------------------------------

    /// Trades by one account since a timestamp, shaped for FIFO lot
    /// matching. The token of interest is the base side: received on a buy,
    /// sent on a sell.
    pub fn trades_for_account_since(
        &self,
        kind: AccountKind,
        tracked_account: &str,
        since_ts: i64,
    ) -> Result<Vec<TradeLite>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT trade_type, token_in_address, token_out_address,
                    usd_buy_amount, usd_sell_amount, token_in_amount, token_out_amount,
                    tx_timestamp
             FROM {}
             WHERE tracked_account = ?1 AND tx_timestamp >= ?2
             ORDER BY tx_timestamp ASC",
            Self::table(kind)
        ))?;
        let rows = stmt.query_map(params![tracked_account, since_ts], |row| {
            let trade_type: String = row.get(0)?;
            let token_in: String = row.get(1)?;
            let token_out: String = row.get(2)?;
            let usd_buy: f64 = row.get(3)?;
            let usd_sell: f64 = row.get(4)?;
            let amount_in: f64 = row.get(5)?;
            let amount_out: f64 = row.get(6)?;
            let tx_timestamp: i64 = row.get(7)?;
            Ok(if trade_type == "buy" {
                TradeLite {
                    token_address: token_out,
                    trade_type: Direction::Buy,
                    usd_amount: usd_buy,
                    token_amount: amount_out,
                    tx_timestamp,
                }
            } else {
                TradeLite {
                    token_address: token_in,
                    trade_type: Direction::Sell,
                    usd_amount: usd_sell,
                    token_amount: amount_in,
                    tx_timestamp,
                }
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Total USD bought of one token inside a time window
    pub fn buy_volume(
        &self,
        kind: AccountKind,
        token_address: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<f64, StoreError> {
        let conn = self.lock()?;
        let volume: f64 = conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(usd_buy_amount), 0) FROM {}
                 WHERE trade_type = 'buy' AND token_out_address = ?1
                   AND tx_timestamp >= ?2 AND tx_timestamp < ?3",
                Self::table(kind)
            ),
            params![token_address, from_ts, to_ts],
            |row| row.get(0),
        )?;
        Ok(volume)
    }
}

/// Minimal stored-trade constructor used by tests and fixtures
#[cfg(test)]
pub fn test_trade(signature: &str, trade_type: Direction, kind: AccountKind) -> StoredTrade {
    StoredTrade {
        signature: signature.to_string(),
        trade_type,
        classification_source: "v2_parser".into(),
        usd_buy_amount: 100.0,
        usd_sell_amount: 100.0,
        token_in: TokenDescriptor {
            address: "So11111111111111111111111111111111111111112".into(),
            symbol: "SOL".into(),
            name: "Solana".into(),
            ..Default::default()
        },
        token_in_amount: 1.0,
        token_in_price: 100.0,
        token_out: TokenDescriptor {
            address: "TokenAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into(),
            symbol: "TOK".into(),
            name: "Token".into(),
            ..Default::default()
        },
        token_out_amount: 1000.0,
        token_out_price: 0.1,
        price_imputed: false,
        buy_sol_amount: None,
        sell_sol_amount: Some(1.0),
        protocol: "raydium".into(),
        gas_fee_usd: 0.0005,
        tracked_account: "Whale1111111111111111111111111111111111111111".into(),
        account_kind: kind,
        account_labels: vec![],
        influencer: None,
        hotness_score: 0,
        confidence: crate::types::Confidence::Max,
        tx_timestamp: 1_700_000_000,
    }
}
