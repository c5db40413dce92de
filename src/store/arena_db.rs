//! Authoritative off-chain state: agents, arenas, epochs, portfolios,
//! trades, decisions, leaderboard snapshots and agent memory.
//!
//! Money-bearing rows are only mutated after a successful on-chain trade,
//! and the portfolio + trade + decision finalization happens in one
//! transaction so a crash can never leave a half-committed tick.

use crate::models::{
    AgentRow, ArenaRow, DecisionStatus, EpochRow, EpochStatus, PortfolioRow, TradeAction, TradeRow,
};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    onchain_id INTEGER,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    smart_account TEXT,
    encrypted_signer_key TEXT,
    profile_json TEXT NOT NULL,
    profile_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS arenas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    onchain_id INTEGER,
    token TEXT NOT NULL UNIQUE,
    name TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS arena_registrations (
    agent_id INTEGER NOT NULL,
    arena_id INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (agent_id, arena_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS epochs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    arena_id INTEGER NOT NULL,
    onchain_epoch_id INTEGER NOT NULL,
    start_at INTEGER NOT NULL,
    end_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    rewards_distributed_at INTEGER,
    rewards_distributed_tx TEXT,
    rewards_swept_at INTEGER,
    rewards_swept_tx TEXT,
    UNIQUE (arena_id, onchain_epoch_id)
);

CREATE INDEX IF NOT EXISTS idx_epochs_arena_start
    ON epochs(arena_id, start_at DESC);

CREATE TABLE IF NOT EXISTS epoch_registrations (
    epoch_id INTEGER NOT NULL,
    agent_id INTEGER NOT NULL,
    renewed_at INTEGER NOT NULL,
    renewal_tx TEXT,
    pending_reward_wei TEXT,
    claimed INTEGER NOT NULL DEFAULT 0,
    claimed_amount_wei TEXT,
    PRIMARY KEY (epoch_id, agent_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS portfolios (
    agent_id INTEGER NOT NULL,
    arena_id INTEGER NOT NULL,
    cash_mon REAL NOT NULL DEFAULT 0,
    token_units REAL NOT NULL DEFAULT 0,
    molti_locked REAL NOT NULL DEFAULT 0,
    avg_entry_price REAL,
    initial_capital REAL NOT NULL DEFAULT 0,
    trades_this_window INTEGER NOT NULL DEFAULT 0,
    last_trade_tick INTEGER,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (agent_id, arena_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL,
    arena_id INTEGER NOT NULL,
    epoch_id INTEGER NOT NULL,
    tick INTEGER NOT NULL,
    action TEXT NOT NULL,
    size_pct REAL NOT NULL,
    price REAL NOT NULL,
    trade_value_mon REAL NOT NULL,
    avg_entry_price_before REAL,
    cash_after REAL NOT NULL,
    token_after REAL NOT NULL,
    reason TEXT NOT NULL,
    tx_hash TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (agent_id, arena_id, tick)
);

CREATE INDEX IF NOT EXISTS idx_trades_agent_arena_epoch
    ON trades(agent_id, arena_id, epoch_id);

CREATE TABLE IF NOT EXISTS agent_decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL,
    arena_id INTEGER NOT NULL,
    epoch_id INTEGER NOT NULL,
    tick INTEGER NOT NULL,
    action TEXT NOT NULL,
    size_pct REAL NOT NULL,
    confidence REAL NOT NULL,
    reason TEXT NOT NULL,
    price REAL NOT NULL,
    pnl_pct_at_decision REAL NOT NULL,
    status TEXT NOT NULL,
    tx_hash TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_agent_arena_tick
    ON agent_decisions(agent_id, arena_id, tick);

CREATE TABLE IF NOT EXISTS leaderboard_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    arena_id INTEGER NOT NULL,
    epoch_id INTEGER NOT NULL,
    tick INTEGER NOT NULL,
    rankings_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_leaderboard_arena_epoch_created
    ON leaderboard_snapshots(arena_id, epoch_id, created_at DESC);

CREATE TABLE IF NOT EXISTS agent_memory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL,
    tick INTEGER NOT NULL,
    note TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_memory_agent_created
    ON agent_memory(agent_id, created_at DESC);
"#;

/// One arena plus its active registrations, the tick engine's workset unit.
#[derive(Debug, Clone)]
pub struct ArenaWork {
    pub arena: ArenaRow,
    pub agents: Vec<AgentRow>,
}

/// Per-agent trade aggregate within one epoch, for leaderboard scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochTradeStats {
    pub agent_id: i64,
    pub volume_mon: f64,
    pub trades: u64,
}

/// A winner row still inside the claim window at sweep time.
#[derive(Debug, Clone)]
pub struct UnclaimedWinner {
    pub agent_id: i64,
    pub agent_onchain_id: Option<u64>,
    pub pending_reward_wei: String,
}

pub struct ArenaDb {
    conn: Arc<Mutex<Connection>>,
}

impl ArenaDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open arena db at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize arena db schema")?;
        info!("🏟️  Arena db ready at {db_path}");
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

    // -- agents & arenas ----------------------------------------------------

    pub fn insert_agent(
        &self,
        owner: &str,
        name: &str,
        profile_json: &str,
        profile_hash: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (owner, name, profile_json, profile_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                owner.to_ascii_lowercase(),
                name,
                profile_json,
                profile_hash,
                Utc::now().timestamp()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Link an agent to its on-chain identity once the indexer observes it.
    pub fn link_agent_onchain(
        &self,
        agent_id: i64,
        onchain_id: u64,
        smart_account: &str,
        encrypted_signer_key: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET onchain_id = ?2, smart_account = ?3, encrypted_signer_key = ?4
             WHERE id = ?1",
            params![
                agent_id,
                onchain_id as i64,
                smart_account.to_ascii_lowercase(),
                encrypted_signer_key
            ],
        )?;
        Ok(())
    }

    pub fn agent(&self, agent_id: i64) -> Result<Option<AgentRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, onchain_id, owner, name, smart_account, encrypted_signer_key, profile_json
             FROM agents WHERE id = ?1",
            params![agent_id],
            agent_from_row,
        )
        .optional()
        .context("agent lookup")
    }

    pub fn agent_by_onchain_id(&self, onchain_id: u64) -> Result<Option<AgentRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, onchain_id, owner, name, smart_account, encrypted_signer_key, profile_json
             FROM agents WHERE onchain_id = ?1",
            params![onchain_id as i64],
            agent_from_row,
        )
        .optional()
        .context("agent by onchain id")
    }

    /// Seed or refresh an arena from configuration. Tokens are unique; an
    /// arena listed before on-chain activation simply has no onchain_id yet.
    pub fn upsert_arena(&self, token: &str, name: Option<&str>) -> Result<i64> {
        let token = token.to_ascii_lowercase();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO arenas (token, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(token) DO UPDATE SET name = COALESCE(excluded.name, arenas.name)",
            params![token, name, Utc::now().timestamp()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM arenas WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn link_arena_onchain(&self, arena_id: i64, onchain_id: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE arenas SET onchain_id = ?2 WHERE id = ?1",
            params![arena_id, onchain_id as i64],
        )?;
        Ok(())
    }

    pub fn arena(&self, arena_id: i64) -> Result<Option<ArenaRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, onchain_id, token, name FROM arenas WHERE id = ?1",
            params![arena_id],
            arena_from_row,
        )
        .optional()
        .context("arena lookup")
    }

    /// Arenas already activated on-chain, in id order.
    pub fn arenas_onchain(&self) -> Result<Vec<ArenaRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, onchain_id, token, name FROM arenas
             WHERE onchain_id IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], arena_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    pub fn register_agent(&self, agent_id: i64, arena_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO arena_registrations (agent_id, arena_id, is_active, created_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(agent_id, arena_id) DO UPDATE SET is_active = 1",
            params![agent_id, arena_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn deactivate_registration(&self, agent_id: i64, arena_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE arena_registrations SET is_active = 0 WHERE agent_id = ?1 AND arena_id = ?2",
            params![agent_id, arena_id],
        )?;
        Ok(())
    }

    pub fn active_registration_count(&self, arena_id: i64) -> Result<u32> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM arena_registrations WHERE arena_id = ?1 AND is_active = 1",
            params![arena_id],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    /// Every arena with at least one active registration, each with its
    /// active agents' minimal fields.
    pub fn workset(&self) -> Result<Vec<ArenaWork>> {
        let conn = self.conn.lock();
        let mut arena_stmt = conn.prepare_cached(
            "SELECT DISTINCT a.id, a.onchain_id, a.token, a.name
             FROM arenas a
             JOIN arena_registrations r ON r.arena_id = a.id AND r.is_active = 1
             ORDER BY a.id",
        )?;
        let arenas: Vec<ArenaRow> = arena_stmt
            .query_map([], arena_from_row)?
            .collect::<std::result::Result<_, _>>()?;

        let mut agent_stmt = conn.prepare_cached(
            "SELECT g.id, g.onchain_id, g.owner, g.name, g.smart_account,
                    g.encrypted_signer_key, g.profile_json
             FROM agents g
             JOIN arena_registrations r ON r.agent_id = g.id AND r.is_active = 1
             WHERE r.arena_id = ?1
             ORDER BY g.id",
        )?;
        let mut out = Vec::with_capacity(arenas.len());
        for arena in arenas {
            let agents: Vec<AgentRow> = agent_stmt
                .query_map(params![arena.id], agent_from_row)?
                .collect::<std::result::Result<_, _>>()?;
            out.push(ArenaWork { arena, agents });
        }
        Ok(out)
    }

    // -- epochs -------------------------------------------------------------

    pub fn insert_epoch(
        &self,
        arena_id: i64,
        onchain_epoch_id: u64,
        start_at: i64,
        end_at: i64,
        status: EpochStatus,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO epochs (arena_id, onchain_epoch_id, start_at, end_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(arena_id, onchain_epoch_id) DO NOTHING",
            params![
                arena_id,
                onchain_epoch_id as i64,
                start_at,
                end_at,
                status.as_str()
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM epochs WHERE arena_id = ?1 AND onchain_epoch_id = ?2",
            params![arena_id, onchain_epoch_id as i64],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// The active epoch whose [start, end) window contains `now`.
    pub fn current_epoch(&self, arena_id: i64, now: i64) -> Result<Option<EpochRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, arena_id, onchain_epoch_id, start_at, end_at, status,
                    rewards_distributed_at, rewards_swept_at
             FROM epochs
             WHERE arena_id = ?1 AND status = 'active' AND start_at <= ?2 AND end_at > ?2
             ORDER BY start_at DESC LIMIT 1",
            params![arena_id, now],
            epoch_from_row,
        )
        .optional()
        .context("current epoch lookup")
    }

    pub fn epoch_by_onchain(
        &self,
        arena_id: i64,
        onchain_epoch_id: u64,
    ) -> Result<Option<EpochRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, arena_id, onchain_epoch_id, start_at, end_at, status,
                    rewards_distributed_at, rewards_swept_at
             FROM epochs WHERE arena_id = ?1 AND onchain_epoch_id = ?2",
            params![arena_id, onchain_epoch_id as i64],
            epoch_from_row,
        )
        .optional()
        .context("epoch by onchain id")
    }

    pub fn latest_epoch(&self, arena_id: i64) -> Result<Option<EpochRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, arena_id, onchain_epoch_id, start_at, end_at, status,
                    rewards_distributed_at, rewards_swept_at
             FROM epochs WHERE arena_id = ?1 ORDER BY start_at DESC LIMIT 1",
            params![arena_id],
            epoch_from_row,
        )
        .optional()
        .context("latest epoch")
    }

    pub fn mark_epoch_ended(&self, epoch_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE epochs SET status = 'ended' WHERE id = ?1",
            params![epoch_id],
        )?;
        Ok(())
    }

    pub fn mark_rewards_distributed(&self, epoch_id: i64, ts: i64, tx_hash: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE epochs SET rewards_distributed_at = ?2, rewards_distributed_tx = ?3
             WHERE id = ?1 AND rewards_distributed_at IS NULL",
            params![epoch_id, ts, tx_hash],
        )?;
        Ok(())
    }

    pub fn mark_rewards_swept(&self, epoch_id: i64, ts: i64, tx_hash: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE epochs SET rewards_swept_at = ?2, rewards_swept_tx = ?3
             WHERE id = ?1 AND rewards_swept_at IS NULL",
            params![epoch_id, ts, tx_hash],
        )?;
        Ok(())
    }

    /// Ended, distributed epochs past the claim window and not yet swept.
    pub fn epochs_awaiting_sweep(&self, end_before: i64) -> Result<Vec<EpochRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, arena_id, onchain_epoch_id, start_at, end_at, status,
                    rewards_distributed_at, rewards_swept_at
             FROM epochs
             WHERE status = 'ended' AND rewards_distributed_at IS NOT NULL
               AND rewards_swept_at IS NULL AND end_at < ?1",
        )?;
        let rows = stmt
            .query_map(params![end_before], epoch_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    // -- epoch registrations ------------------------------------------------

    pub fn insert_epoch_registration(
        &self,
        epoch_id: i64,
        agent_id: i64,
        renewal_tx: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO epoch_registrations (epoch_id, agent_id, renewed_at, renewal_tx)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(epoch_id, agent_id) DO NOTHING",
            params![epoch_id, agent_id, Utc::now().timestamp(), renewal_tx],
        )?;
        Ok(())
    }

    pub fn epoch_registration_exists(&self, epoch_id: i64, agent_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM epoch_registrations WHERE epoch_id = ?1 AND agent_id = ?2",
            params![epoch_id, agent_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn epoch_registration_count(&self, epoch_id: i64) -> Result<u32> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM epoch_registrations WHERE epoch_id = ?1",
            params![epoch_id],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    pub fn set_pending_reward(
        &self,
        epoch_id: i64,
        agent_id: i64,
        amount_wei: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE epoch_registrations SET pending_reward_wei = ?3
             WHERE epoch_id = ?1 AND agent_id = ?2",
            params![epoch_id, agent_id, amount_wei],
        )?;
        Ok(())
    }

    pub fn mark_reward_claimed(
        &self,
        epoch_id: i64,
        agent_id: i64,
        claimed_amount_wei: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE epoch_registrations SET claimed = 1, claimed_amount_wei = ?3
             WHERE epoch_id = ?1 AND agent_id = ?2",
            params![epoch_id, agent_id, claimed_amount_wei],
        )?;
        Ok(())
    }

    pub fn unclaimed_winners(&self, epoch_id: i64) -> Result<Vec<UnclaimedWinner>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT r.agent_id, g.onchain_id, r.pending_reward_wei
             FROM epoch_registrations r
             JOIN agents g ON g.id = r.agent_id
             WHERE r.epoch_id = ?1 AND r.pending_reward_wei IS NOT NULL AND r.claimed = 0",
        )?;
        let rows = stmt
            .query_map(params![epoch_id], |row| {
                Ok(UnclaimedWinner {
                    agent_id: row.get(0)?,
                    agent_onchain_id: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
                    pending_reward_wei: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    // -- portfolios ---------------------------------------------------------

    pub fn portfolio(&self, agent_id: i64, arena_id: i64) -> Result<Option<PortfolioRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT agent_id, arena_id, cash_mon, token_units, molti_locked, avg_entry_price,
                    initial_capital, trades_this_window, last_trade_tick
             FROM portfolios WHERE agent_id = ?1 AND arena_id = ?2",
            params![agent_id, arena_id],
            portfolio_from_row,
        )
        .optional()
        .context("portfolio lookup")
    }

    pub fn upsert_portfolio(&self, p: &PortfolioRow) -> Result<()> {
        let conn = self.conn.lock();
        upsert_portfolio_on(&conn, p)
    }

    // -- decisions ----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_decision(
        &self,
        agent_id: i64,
        arena_id: i64,
        epoch_id: i64,
        tick: u64,
        action: TradeAction,
        size_pct: f64,
        confidence: f64,
        reason: &str,
        price: f64,
        pnl_pct_at_decision: f64,
        status: DecisionStatus,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_decisions
             (agent_id, arena_id, epoch_id, tick, action, size_pct, confidence, reason,
              price, pnl_pct_at_decision, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                agent_id,
                arena_id,
                epoch_id,
                tick as i64,
                action.as_str(),
                size_pct,
                confidence,
                reason,
                price,
                pnl_pct_at_decision,
                status.as_str(),
                Utc::now().timestamp()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_decision_status(
        &self,
        decision_id: i64,
        status: DecisionStatus,
        tx_hash: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_decisions SET status = ?2, tx_hash = COALESCE(?3, tx_hash)
             WHERE id = ?1",
            params![decision_id, status.as_str(), tx_hash],
        )?;
        Ok(())
    }

    pub fn decision_status(&self, decision_id: i64) -> Result<Option<(DecisionStatus, Option<String>)>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT status, tx_hash FROM agent_decisions WHERE id = ?1",
            params![decision_id],
            |row| {
                let status: String = row.get(0)?;
                Ok((status, row.get::<_, Option<String>>(1)?))
            },
        )
        .optional()
        .context("decision lookup")
        .map(|opt| {
            opt.and_then(|(s, tx)| DecisionStatus::parse(&s).map(|status| (status, tx)))
        })
    }

    // -- trades & atomic finalization ----------------------------------------

    /// Commit the outcome of one executed decision: portfolio update, the
    /// trade row (absent for HOLD projections) and the decision finalization,
    /// all in one transaction.
    pub fn finalize_trade(
        &self,
        portfolio: &PortfolioRow,
        trade: Option<&TradeRow>,
        decision_id: i64,
        tx_hash: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        upsert_portfolio_on(&tx, portfolio)?;

        if let Some(t) = trade {
            tx.execute(
                "INSERT INTO trades
                 (agent_id, arena_id, epoch_id, tick, action, size_pct, price, trade_value_mon,
                  avg_entry_price_before, cash_after, token_after, reason, tx_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    t.agent_id,
                    t.arena_id,
                    t.epoch_id,
                    t.tick as i64,
                    t.action.as_str(),
                    t.size_pct,
                    t.price,
                    t.trade_value_mon,
                    t.avg_entry_price_before,
                    t.cash_after,
                    t.token_after,
                    t.reason,
                    t.tx_hash,
                    Utc::now().timestamp()
                ],
            )?;
        }

        tx.execute(
            "UPDATE agent_decisions SET status = 'success', tx_hash = COALESCE(?2, tx_hash)
             WHERE id = ?1",
            params![decision_id, tx_hash],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn trade_by_key(
        &self,
        agent_id: i64,
        arena_id: i64,
        tick: u64,
    ) -> Result<Option<TradeRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT agent_id, arena_id, epoch_id, tick, action, size_pct, price, trade_value_mon,
                    avg_entry_price_before, cash_after, token_after, reason, tx_hash
             FROM trades WHERE agent_id = ?1 AND arena_id = ?2 AND tick = ?3",
            params![agent_id, arena_id, tick as i64],
            trade_from_row,
        )
        .optional()
        .context("trade lookup")
    }

    /// Per-agent trade volume and count inside one epoch.
    pub fn epoch_trade_stats(&self, arena_id: i64, epoch_id: i64) -> Result<Vec<EpochTradeStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT agent_id, COALESCE(SUM(trade_value_mon), 0), COUNT(*)
             FROM trades WHERE arena_id = ?1 AND epoch_id = ?2
             GROUP BY agent_id",
        )?;
        let rows = stmt
            .query_map(params![arena_id, epoch_id], |row| {
                Ok(EpochTradeStats {
                    agent_id: row.get(0)?,
                    volume_mon: row.get(1)?,
                    trades: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    // -- leaderboard ----------------------------------------------------------

    pub fn insert_leaderboard_snapshot(
        &self,
        arena_id: i64,
        epoch_id: i64,
        tick: u64,
        rankings_json: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO leaderboard_snapshots (arena_id, epoch_id, tick, rankings_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                arena_id,
                epoch_id,
                tick as i64,
                rankings_json,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Final snapshot for an (arena, epoch): highest tick, newest first.
    pub fn latest_leaderboard(&self, arena_id: i64, epoch_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT rankings_json FROM leaderboard_snapshots
             WHERE arena_id = ?1 AND epoch_id = ?2
             ORDER BY tick DESC, created_at DESC LIMIT 1",
            params![arena_id, epoch_id],
            |row| row.get(0),
        )
        .optional()
        .context("latest leaderboard")
    }

    // -- agent memory ---------------------------------------------------------

    pub fn insert_memory_note(&self, agent_id: i64, tick: u64, note: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_memory (agent_id, tick, note, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![agent_id, tick as i64, note, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Newest-first memory notes for prompt assembly.
    pub fn recent_memory_notes(&self, agent_id: i64, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT note FROM agent_memory WHERE agent_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![agent_id, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    /// Collapse all but the newest `keep_last` notes into a single summary
    /// row so the table and the prompt stay bounded.
    pub fn compact_memory(&self, agent_id: i64, keep_last: usize) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let old: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, note FROM agent_memory WHERE agent_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT -1 OFFSET ?2",
            )?;
            let mapped = stmt
                .query_map(params![agent_id, keep_last as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<std::result::Result<_, _>>()?;
            mapped
        };
        if old.len() < 2 {
            return Ok(0);
        }

        let mut summary = String::from("earlier: ");
        for (i, (_, note)) in old.iter().rev().enumerate() {
            if i > 0 {
                summary.push_str("; ");
            }
            summary.push_str(note);
            if summary.len() > 600 {
                summary.truncate(600);
                break;
            }
        }
        for (id, _) in &old {
            tx.execute("DELETE FROM agent_memory WHERE id = ?1", params![id])?;
        }
        tx.execute(
            "INSERT INTO agent_memory (agent_id, tick, note, created_at)
             VALUES (?1, 0, ?2, ?3)",
            params![agent_id, summary, Utc::now().timestamp()],
        )?;
        tx.commit()?;
        Ok(old.len() as u64)
    }

    pub fn agents_with_memory(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT DISTINCT agent_id FROM agent_memory")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }
}

fn upsert_portfolio_on(conn: &Connection, p: &PortfolioRow) -> Result<()> {
    conn.execute(
        "INSERT INTO portfolios
         (agent_id, arena_id, cash_mon, token_units, molti_locked, avg_entry_price,
          initial_capital, trades_this_window, last_trade_tick, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(agent_id, arena_id) DO UPDATE SET
            cash_mon = excluded.cash_mon,
            token_units = excluded.token_units,
            molti_locked = excluded.molti_locked,
            avg_entry_price = excluded.avg_entry_price,
            initial_capital = excluded.initial_capital,
            trades_this_window = excluded.trades_this_window,
            last_trade_tick = excluded.last_trade_tick,
            updated_at = excluded.updated_at",
        params![
            p.agent_id,
            p.arena_id,
            p.cash_mon,
            p.token_units,
            p.molti_locked,
            p.avg_entry_price,
            p.initial_capital,
            p.trades_this_window as i64,
            p.last_trade_tick.map(|t| t as i64),
            Utc::now().timestamp()
        ],
    )?;
    Ok(())
}

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok(AgentRow {
        id: row.get(0)?,
        onchain_id: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
        owner: row.get(2)?,
        name: row.get(3)?,
        smart_account: row.get(4)?,
        encrypted_signer_key: row.get(5)?,
        profile_json: row.get(6)?,
    })
}

fn arena_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArenaRow> {
    Ok(ArenaRow {
        id: row.get(0)?,
        onchain_id: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
        token: row.get(2)?,
        name: row.get(3)?,
    })
}

fn epoch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpochRow> {
    let status: String = row.get(5)?;
    Ok(EpochRow {
        id: row.get(0)?,
        arena_id: row.get(1)?,
        onchain_epoch_id: row.get::<_, i64>(2)? as u64,
        start_at: row.get(3)?,
        end_at: row.get(4)?,
        status: EpochStatus::parse(&status),
        rewards_distributed_at: row.get(6)?,
        rewards_swept_at: row.get(7)?,
    })
}

fn portfolio_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PortfolioRow> {
    Ok(PortfolioRow {
        agent_id: row.get(0)?,
        arena_id: row.get(1)?,
        cash_mon: row.get(2)?,
        token_units: row.get(3)?,
        molti_locked: row.get(4)?,
        avg_entry_price: row.get(5)?,
        initial_capital: row.get(6)?,
        trades_this_window: row.get::<_, i64>(7)? as u32,
        last_trade_tick: row.get::<_, Option<i64>>(8)?.map(|t| t as u64),
    })
}

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
    let action: String = row.get(4)?;
    Ok(TradeRow {
        agent_id: row.get(0)?,
        arena_id: row.get(1)?,
        epoch_id: row.get(2)?,
        tick: row.get::<_, i64>(3)? as u64,
        action: TradeAction::parse(&action).unwrap_or(TradeAction::Hold),
        size_pct: row.get(5)?,
        price: row.get(6)?,
        trade_value_mon: row.get(7)?,
        avg_entry_price_before: row.get(8)?,
        cash_after: row.get(9)?,
        token_after: row.get(10)?,
        reason: row.get(11)?,
        tx_hash: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(db: &ArenaDb) -> (i64, i64, i64) {
        let agent = db
            .insert_agent("0xowner", "alpha", "{}", "0xhash")
            .unwrap();
        db.link_agent_onchain(agent, 7, "0x00000000000000000000000000000000000000c1", "enc")
            .unwrap();
        let arena = db
            .upsert_arena("0x00000000000000000000000000000000000000aa", Some("AA"))
            .unwrap();
        db.link_arena_onchain(arena, 3).unwrap();
        db.register_agent(agent, arena).unwrap();
        let epoch = db
            .insert_epoch(arena, 1, 0, 86_400, EpochStatus::Active)
            .unwrap();
        (agent, arena, epoch)
    }

    #[test]
    fn workset_includes_only_active_registrations() {
        let db = ArenaDb::in_memory().unwrap();
        let (agent, arena, _) = seed(&db);
        let ws = db.workset().unwrap();
        assert_eq!(ws.len(), 1);
        assert_eq!(ws[0].arena.id, arena);
        assert_eq!(ws[0].agents.len(), 1);
        assert_eq!(ws[0].agents[0].onchain_id, Some(7));

        db.deactivate_registration(agent, arena).unwrap();
        assert!(db.workset().unwrap().is_empty());
    }

    #[test]
    fn epoch_windows_and_uniqueness() {
        let db = ArenaDb::in_memory().unwrap();
        let (_, arena, epoch) = seed(&db);

        let current = db.current_epoch(arena, 100).unwrap().unwrap();
        assert_eq!(current.id, epoch);
        assert!(db.current_epoch(arena, 90_000).unwrap().is_none());

        // Re-inserting the same onchain epoch returns the same row.
        let again = db
            .insert_epoch(arena, 1, 0, 86_400, EpochStatus::Active)
            .unwrap();
        assert_eq!(again, epoch);

        db.mark_epoch_ended(epoch).unwrap();
        assert!(db.current_epoch(arena, 100).unwrap().is_none());
        assert_eq!(
            db.latest_epoch(arena).unwrap().unwrap().status,
            EpochStatus::Ended
        );
    }

    #[test]
    fn distribution_stamp_is_write_once() {
        let db = ArenaDb::in_memory().unwrap();
        let (_, arena, epoch) = seed(&db);
        db.mark_rewards_distributed(epoch, 111, "0xaaa").unwrap();
        db.mark_rewards_distributed(epoch, 222, "0xbbb").unwrap();
        let row = db.epoch_by_onchain(arena, 1).unwrap().unwrap();
        assert_eq!(row.rewards_distributed_at, Some(111));
    }

    #[test]
    fn trade_unique_per_agent_arena_tick() {
        let db = ArenaDb::in_memory().unwrap();
        let (agent, arena, epoch) = seed(&db);
        let portfolio = PortfolioRow {
            agent_id: agent,
            arena_id: arena,
            cash_mon: 9.0,
            token_units: 0.5,
            molti_locked: 1.0,
            avg_entry_price: Some(2.0),
            initial_capital: 10.0,
            trades_this_window: 1,
            last_trade_tick: Some(42),
        };
        let trade = TradeRow {
            agent_id: agent,
            arena_id: arena,
            epoch_id: epoch,
            tick: 42,
            action: TradeAction::Buy,
            size_pct: 0.1,
            price: 2.0,
            trade_value_mon: 1.0,
            avg_entry_price_before: None,
            cash_after: 9.0,
            token_after: 0.5,
            reason: "momentum".to_string(),
            tx_hash: Some("0xabc".to_string()),
        };
        let decision = db
            .insert_decision(
                agent,
                arena,
                epoch,
                42,
                TradeAction::Buy,
                0.1,
                0.8,
                "momentum",
                2.0,
                0.0,
                DecisionStatus::Pending,
            )
            .unwrap();

        db.finalize_trade(&portfolio, Some(&trade), decision, Some("0xabc"))
            .unwrap();

        let stored = db.trade_by_key(agent, arena, 42).unwrap().unwrap();
        assert_eq!(stored.tx_hash.as_deref(), Some("0xabc"));
        let (status, tx) = db.decision_status(decision).unwrap().unwrap();
        assert_eq!(status, DecisionStatus::Success);
        assert_eq!(tx.as_deref(), Some("0xabc"));

        // Second insert for the same (agent, arena, tick) violates the key
        // and the whole transaction rolls back.
        let err = db.finalize_trade(&portfolio, Some(&trade), decision, Some("0xdef"));
        assert!(err.is_err());

        let stats = db.epoch_trade_stats(arena, epoch).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].trades, 1);
        assert!((stats[0].volume_mon - 1.0).abs() < 1e-12);
    }

    #[test]
    fn memory_compaction_bounds_notes() {
        let db = ArenaDb::in_memory().unwrap();
        let (agent, _, _) = seed(&db);
        for t in 0..10u64 {
            db.insert_memory_note(agent, t, &format!("tick {t} hold")).unwrap();
        }
        let compacted = db.compact_memory(agent, 3).unwrap();
        assert_eq!(compacted, 7);
        let notes = db.recent_memory_notes(agent, 20).unwrap();
        assert_eq!(notes.len(), 4); // 3 kept + 1 summary
        assert!(notes.iter().any(|n| n.starts_with("earlier: ")));
    }
}
