//! Raw market event persistence.
//!
//! Serves the windowed aggregates, compact recent events and trader metrics
//! the aggregator folds into snapshots. Every public read/write is
//! never-throw: failures are logged and a safe empty/zero result is returned
//! so the tick path cannot stall on storage.

use crate::models::{is_hex_address, is_hex_tx_hash, CompactEvent, EventKind, MarketEvent};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

const MAX_PRICE: f64 = 1e12;
const MAX_VOLUME: f64 = 1e15;
const MAX_TEXT_LEN: usize = 128;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS market_events (
    id TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    kind TEXT NOT NULL,
    price REAL,
    volume_mon REAL,
    trader TEXT,
    pool TEXT,
    tx_hash TEXT,
    amount_in REAL,
    amount_out REAL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_market_events_token_ts
    ON market_events(token, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_market_events_ts
    ON market_events(created_at);
"#;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowStats {
    pub total: u64,
    pub volume_mon: f64,
    pub buys: u64,
    pub sells: u64,
    pub swaps: u64,
    pub unique_traders: u64,
    pub min_price: Option<f64>,
    pub avg_price: Option<f64>,
    pub max_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraderMetrics {
    pub unique_traders: u64,
    pub avg_volume_per_trader: f64,
    pub largest_trade: f64,
    pub whale_activity: bool,
}

pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open event store at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize event store schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM market_events", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📦 Event store ready at {db_path} ({count} events)");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn store_event(&self, ev: &MarketEvent) {
        if let Err(e) = self.try_store_batch(std::slice::from_ref(ev)) {
            warn!(error = %e, token = %ev.token, "event store write failed");
        }
    }

    /// Batch insert; rows whose derived id already exists are skipped.
    pub fn store_batch(&self, events: &[MarketEvent]) -> u64 {
        match self.try_store_batch(events) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, count = events.len(), "event store batch write failed");
                0
            }
        }
    }

    fn try_store_batch(&self, events: &[MarketEvent]) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO market_events
                 (id, token, kind, price, volume_mon, trader, pool, tx_hash, amount_in, amount_out, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for ev in events {
                let Some(clean) = sanitize(ev) else {
                    continue;
                };
                let id = event_id(&clean);
                inserted += stmt.execute(params![
                    id,
                    clean.token,
                    clean.kind.as_str(),
                    clean.price,
                    clean.volume_mon,
                    clean.trader,
                    clean.pool,
                    clean.tx_hash,
                    clean.amount_in,
                    clean.amount_out,
                    clean.timestamp,
                ])? as u64;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Delete events recorded before `cutoff_ts`. Returns deleted row count.
    pub fn cleanup_older_than(&self, cutoff_ts: i64) -> u64 {
        let conn = self.conn.lock();
        match conn.execute(
            "DELETE FROM market_events WHERE created_at < ?1",
            params![cutoff_ts],
        ) {
            Ok(n) => n as u64,
            Err(e) => {
                warn!(error = %e, "event store cleanup failed");
                0
            }
        }
    }

    pub fn aggregated_stats(&self, token: &str, start_ts: i64, end_ts: i64) -> WindowStats {
        self.try_aggregated_stats(token, start_ts, end_ts)
            .unwrap_or_else(|e| {
                warn!(error = %e, token, "aggregated_stats failed");
                WindowStats::default()
            })
    }

    fn try_aggregated_stats(&self, token: &str, start_ts: i64, end_ts: i64) -> Result<WindowStats> {
        let token = token.to_ascii_lowercase();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT
                COUNT(*),
                COALESCE(SUM(volume_mon), 0),
                SUM(kind = 'Buy'),
                SUM(kind = 'Sell'),
                SUM(kind = 'Swap'),
                COUNT(DISTINCT trader),
                MIN(price), AVG(price), MAX(price)
             FROM market_events
             WHERE token = ?1 AND created_at >= ?2 AND created_at < ?3",
        )?;
        let stats = stmt.query_row(params![token, start_ts, end_ts], |row| {
            Ok(WindowStats {
                total: row.get::<_, i64>(0)? as u64,
                volume_mon: row.get(1)?,
                buys: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                sells: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
                swaps: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
                unique_traders: row.get::<_, i64>(5)? as u64,
                min_price: row.get(6)?,
                avg_price: row.get(7)?,
                max_price: row.get(8)?,
            })
        })?;
        Ok(stats)
    }

    /// Last `n` compact trade events (Buy/Sell/Swap with both price and
    /// volume present), oldest first.
    pub fn recent_events(&self, token: &str, n: usize) -> Vec<CompactEvent> {
        self.try_recent_events(token, n).unwrap_or_else(|e| {
            warn!(error = %e, token, "recent_events failed");
            Vec::new()
        })
    }

    fn try_recent_events(&self, token: &str, n: usize) -> Result<Vec<CompactEvent>> {
        let token = token.to_ascii_lowercase();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT kind, price, volume_mon FROM market_events
             WHERE token = ?1
               AND kind IN ('Buy', 'Sell', 'Swap')
               AND price IS NOT NULL AND volume_mon IS NOT NULL
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let mut rows: Vec<CompactEvent> = stmt
            .query_map(params![token, n as i64], |row| {
                let kind: String = row.get(0)?;
                Ok((kind, row.get::<_, f64>(1)?, row.get::<_, f64>(2)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(kind, price, volume_mon)| {
                EventKind::parse(&kind).map(|kind| CompactEvent {
                    kind,
                    price,
                    volume_mon,
                })
            })
            .collect();
        rows.reverse();
        Ok(rows)
    }

    /// Most recent stored price for a token, if any.
    pub fn latest_price(&self, token: &str) -> Option<f64> {
        let token = token.to_ascii_lowercase();
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT price FROM market_events
             WHERE token = ?1 AND price IS NOT NULL
             ORDER BY created_at DESC LIMIT 1",
            params![token],
            |row| row.get(0),
        )
        .ok()
    }

    pub fn trader_metrics(
        &self,
        token: &str,
        start_ts: i64,
        end_ts: i64,
        whale_threshold: f64,
    ) -> TraderMetrics {
        self.try_trader_metrics(token, start_ts, end_ts, whale_threshold)
            .unwrap_or_else(|e| {
                warn!(error = %e, token, "trader_metrics failed");
                TraderMetrics::default()
            })
    }

    fn try_trader_metrics(
        &self,
        token: &str,
        start_ts: i64,
        end_ts: i64,
        whale_threshold: f64,
    ) -> Result<TraderMetrics> {
        let token = token.to_ascii_lowercase();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(DISTINCT trader),
                    COALESCE(SUM(volume_mon), 0),
                    COALESCE(MAX(volume_mon), 0)
             FROM market_events
             WHERE token = ?1 AND created_at >= ?2 AND created_at < ?3
               AND trader IS NOT NULL AND volume_mon IS NOT NULL",
        )?;
        let (traders, volume, largest): (i64, f64, f64) =
            stmt.query_row(params![token, start_ts, end_ts], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;

        let unique_traders = traders.max(0) as u64;
        Ok(TraderMetrics {
            unique_traders,
            avg_volume_per_trader: if unique_traders > 0 {
                volume / unique_traders as f64
            } else {
                0.0
            },
            largest_trade: largest,
            whale_activity: largest >= whale_threshold,
        })
    }
}

/// Validate and normalize an incoming event, dropping malformed rows.
fn sanitize(ev: &MarketEvent) -> Option<MarketEvent> {
    let token = ev.token.trim().to_ascii_lowercase();
    if !is_hex_address(&token) {
        return None;
    }

    let clamp_price = |p: f64| p.is_finite().then(|| p.clamp(0.0, MAX_PRICE));
    let clamp_volume = |v: f64| v.is_finite().then(|| v.clamp(0.0, MAX_VOLUME));

    let trader = ev
        .trader
        .as_deref()
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| is_hex_address(t));
    let pool = ev
        .pool
        .as_deref()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| is_hex_address(p))
        .map(|p| p.chars().take(MAX_TEXT_LEN).collect());
    let tx_hash = ev
        .tx_hash
        .as_deref()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| is_hex_tx_hash(h));

    Some(MarketEvent {
        token,
        kind: ev.kind,
        price: ev.price.and_then(clamp_price),
        volume_mon: ev.volume_mon.and_then(clamp_volume),
        trader,
        pool,
        tx_hash,
        amount_in: ev.amount_in.and_then(clamp_volume),
        amount_out: ev.amount_out.and_then(clamp_volume),
        timestamp: ev.timestamp,
    })
}

/// Deterministic event id so re-ingesting a batch cannot duplicate rows.
fn event_id(ev: &MarketEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ev.token.as_bytes());
    hasher.update([ev.kind.as_u8()]);
    hasher.update(ev.timestamp.to_be_bytes());
    if let Some(tx) = &ev.tx_hash {
        hasher.update(tx.as_bytes());
    }
    if let Some(p) = ev.price {
        hasher.update(p.to_be_bytes());
    }
    if let Some(v) = ev.volume_mon {
        hasher.update(v.to_be_bytes());
    }
    if let Some(t) = &ev.trader {
        hasher.update(t.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

impl EventKind {
    fn as_u8(self) -> u8 {
        match self {
            Self::Buy => 0,
            Self::Sell => 1,
            Self::Swap => 2,
            Self::Create => 3,
            Self::Sync => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
    const TRADER_A: &str = "0x00000000000000000000000000000000000000b1";
    const TRADER_B: &str = "0x00000000000000000000000000000000000000b2";

    fn ev(kind: EventKind, price: f64, volume: f64, trader: &str, ts: i64) -> MarketEvent {
        MarketEvent {
            token: TOKEN.to_string(),
            kind,
            price: Some(price),
            volume_mon: Some(volume),
            trader: Some(trader.to_string()),
            pool: None,
            tx_hash: None,
            amount_in: None,
            amount_out: None,
            timestamp: ts,
        }
    }

    #[test]
    fn batch_dedup_is_idempotent() {
        let store = EventStore::in_memory().unwrap();
        let batch = vec![
            ev(EventKind::Buy, 1.0, 10.0, TRADER_A, 100),
            ev(EventKind::Sell, 1.1, 5.0, TRADER_B, 101),
        ];
        assert_eq!(store.store_batch(&batch), 2);
        assert_eq!(store.store_batch(&batch), 0);
        let stats = store.aggregated_stats(TOKEN, 0, 1_000);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn aggregates_window_and_mix() {
        let store = EventStore::in_memory().unwrap();
        store.store_batch(&[
            ev(EventKind::Buy, 1.0, 10.0, TRADER_A, 100),
            ev(EventKind::Buy, 1.2, 20.0, TRADER_A, 110),
            ev(EventKind::Sell, 1.1, 5.0, TRADER_B, 120),
            ev(EventKind::Swap, 1.3, 60.0, TRADER_B, 130),
            // Outside the window:
            ev(EventKind::Buy, 9.0, 999.0, TRADER_A, 5_000),
        ]);
        let stats = store.aggregated_stats(TOKEN, 0, 1_000);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.buys, 2);
        assert_eq!(stats.sells, 1);
        assert_eq!(stats.swaps, 1);
        assert_eq!(stats.unique_traders, 2);
        assert!((stats.volume_mon - 95.0).abs() < 1e-9);
        assert_eq!(stats.max_price, Some(1.3));
    }

    #[test]
    fn recent_events_chronological_and_filtered() {
        let store = EventStore::in_memory().unwrap();
        let mut create = ev(EventKind::Create, 1.0, 1.0, TRADER_A, 90);
        create.price = None; // not a compact trade event
        store.store_batch(&[
            create,
            ev(EventKind::Buy, 1.0, 10.0, TRADER_A, 100),
            ev(EventKind::Sell, 1.1, 5.0, TRADER_B, 110),
            ev(EventKind::Buy, 1.2, 7.0, TRADER_A, 120),
        ]);
        let recent = store.recent_events(TOKEN, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, EventKind::Sell);
        assert_eq!(recent[1].kind, EventKind::Buy);
        assert_eq!(recent[1].price, 1.2);
    }

    #[test]
    fn trader_metrics_and_whale_flag() {
        let store = EventStore::in_memory().unwrap();
        store.store_batch(&[
            ev(EventKind::Buy, 1.0, 10.0, TRADER_A, 100),
            ev(EventKind::Buy, 1.0, 80.0, TRADER_B, 110),
        ]);
        let m = store.trader_metrics(TOKEN, 0, 1_000, 50.0);
        assert_eq!(m.unique_traders, 2);
        assert!((m.avg_volume_per_trader - 45.0).abs() < 1e-9);
        assert_eq!(m.largest_trade, 80.0);
        assert!(m.whale_activity);

        let m = store.trader_metrics(TOKEN, 0, 1_000, 100.0);
        assert!(!m.whale_activity);
    }

    #[test]
    fn sanitizes_bad_input() {
        let store = EventStore::in_memory().unwrap();
        let mut bad_token = ev(EventKind::Buy, 1.0, 10.0, TRADER_A, 100);
        bad_token.token = "not-an-address".to_string();
        assert_eq!(store.store_batch(&[bad_token]), 0);

        let mut clamped = ev(EventKind::Buy, 1e15, 1e20, TRADER_A, 100);
        clamped.trader = Some("junk".to_string());
        assert_eq!(store.store_batch(&[clamped]), 1);
        let stats = store.aggregated_stats(TOKEN, 0, 1_000);
        assert_eq!(stats.max_price, Some(MAX_PRICE));
        assert_eq!(stats.volume_mon, MAX_VOLUME);
        // Invalid trader was dropped, not the row.
        assert_eq!(stats.unique_traders, 0);
    }

    #[test]
    fn cleanup_removes_old_rows() {
        let store = EventStore::in_memory().unwrap();
        store.store_batch(&[
            ev(EventKind::Buy, 1.0, 10.0, TRADER_A, 100),
            ev(EventKind::Buy, 1.0, 10.0, TRADER_A, 2_000),
        ]);
        assert_eq!(store.cleanup_older_than(1_000), 1);
        assert_eq!(store.aggregated_stats(TOKEN, 0, 10_000).total, 1);
    }
}
