//! Epoch lifecycle driver: create → renew → end → distribute → sweep.
//!
//! On-chain state is the source of truth; the DB mirrors it. The scheduler
//! checks once per minute. Daily mode only acts inside the first two
//! minutes after 00:00 UTC and at most once per day unless forced; demo
//! mode acts every minute with epochs anchored from the transition moment.

use crate::chain::{
    abi, AgentWallet, ChainReader, EpochPhase, OperatorGateway, TradeSubmitter,
};
use crate::epoch::rewards::{distribute_rewards_for_epoch, sweep_epoch, CLAIM_WINDOW_DAYS};
use crate::models::{AgentRow, ArenaRow, EpochRow, EpochStatus};
use crate::store::ArenaDb;
use alloy::primitives::U256;
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);
const DAILY_ACTION_WINDOW_MIN: u32 = 2;

#[derive(Debug, Clone)]
pub struct EpochConfig {
    pub duration_minutes: i64,
    pub renewal_fee_wei: U256,
    pub demo_mode: bool,
}

pub struct EpochController {
    db: Arc<ArenaDb>,
    chain: Arc<dyn ChainReader>,
    operator: Arc<dyn OperatorGateway>,
    submitter: Arc<dyn TradeSubmitter>,
    cfg: EpochConfig,
    transitioning: AtomicBool,
    last_daily_run: Mutex<Option<NaiveDate>>,
}

impl EpochController {
    pub fn new(
        db: Arc<ArenaDb>,
        chain: Arc<dyn ChainReader>,
        operator: Arc<dyn OperatorGateway>,
        submitter: Arc<dyn TradeSubmitter>,
        cfg: EpochConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            chain,
            operator,
            submitter,
            cfg,
            transitioning: AtomicBool::new(false),
            last_daily_run: Mutex::new(None),
        })
    }

    pub fn spawn_scheduler(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                demo = self.cfg.demo_mode,
                duration_min = self.cfg.duration_minutes,
                "⏱️  Epoch scheduler started"
            );
            loop {
                let now = Utc::now();
                let in_window = self.cfg.demo_mode
                    || (now.hour() == 0 && now.minute() < DAILY_ACTION_WINDOW_MIN);
                if in_window {
                    self.run_transitions(false).await;
                }
                self.run_sweeps(now.timestamp()).await;

                tokio::select! {
                    _ = tokio::time::sleep(SCHEDULER_INTERVAL) => {}
                    _ = shutdown.changed() => {
                        info!("epoch scheduler stopping");
                        return;
                    }
                }
            }
        })
    }

    /// One transition pass over all on-chain arenas. Guarded against
    /// overlap; per-arena failures are isolated.
    pub async fn run_transitions(&self, force: bool) {
        if self
            .transitioning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("epoch transition already in flight, skipping");
            return;
        }

        let today = Utc::now().date_naive();
        let should_run = force || self.cfg.demo_mode || {
            let last = self.last_daily_run.lock();
            *last != Some(today)
        };
        if should_run {
            if !self.cfg.demo_mode {
                *self.last_daily_run.lock() = Some(today);
            }
            match self.db.arenas_onchain() {
                Ok(arenas) => {
                    for arena in arenas {
                        if let Err(e) = self.transition_arena(&arena).await {
                            warn!(arena = arena.id, error = %e, "epoch transition failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to load arenas for epoch transition"),
            }
        }

        self.transitioning.store(false, Ordering::SeqCst);
    }

    async fn transition_arena(&self, arena: &ArenaRow) -> Result<()> {
        let onchain_id = arena
            .onchain_id
            .ok_or_else(|| anyhow!("arena {} missing on-chain id", arena.id))?;
        let now = Utc::now().timestamp();
        let phase: EpochPhase = self
            .chain
            .epoch_phase(onchain_id, now)
            .await
            .context("getEpochPhase")?;

        if let Some(to_end) = phase.to_end {
            self.end_and_distribute(arena, onchain_id, to_end).await?;
        }

        match phase.active {
            Some(active) => {
                // Another instance may have created it; keep the DB in sync.
                self.ensure_epoch_row(arena, onchain_id, active).await?;
            }
            None => {
                self.maybe_create_epoch(arena, onchain_id, now).await?;
            }
        }
        Ok(())
    }

    async fn end_and_distribute(
        &self,
        arena: &ArenaRow,
        onchain_id: u64,
        epoch_onchain: u64,
    ) -> Result<()> {
        let epoch = self.ensure_epoch_row(arena, onchain_id, epoch_onchain).await?;

        self.operator.end_epoch(onchain_id, epoch_onchain).await?;
        self.db.mark_epoch_ended(epoch.id)?;
        info!(arena = arena.id, epoch = epoch_onchain, "🏁 Epoch ended");

        let epoch = self
            .db
            .epoch_by_onchain(arena.id, epoch_onchain)?
            .ok_or_else(|| anyhow!("epoch row vanished"))?;
        if let Err(e) =
            distribute_rewards_for_epoch(&self.db, &self.chain, &self.operator, onchain_id, &epoch)
                .await
        {
            // Stamp stays null; the next trigger retries.
            warn!(arena = arena.id, epoch = epoch_onchain, error = %e, "reward distribution failed");
        }
        Ok(())
    }

    async fn ensure_epoch_row(
        &self,
        arena: &ArenaRow,
        onchain_id: u64,
        epoch_onchain: u64,
    ) -> Result<EpochRow> {
        if let Some(row) = self.db.epoch_by_onchain(arena.id, epoch_onchain)? {
            return Ok(row);
        }
        let info = self
            .chain
            .epoch_info(onchain_id, epoch_onchain)
            .await
            .context("epochs() read for missing row")?;
        let status = if info.ended {
            EpochStatus::Ended
        } else {
            EpochStatus::Active
        };
        let id = self
            .db
            .insert_epoch(arena.id, epoch_onchain, info.start_at, info.end_at, status)?;
        info!(
            arena = arena.id,
            epoch = epoch_onchain,
            "epoch row created from on-chain times"
        );
        self.db
            .epoch_by_onchain(arena.id, epoch_onchain)?
            .ok_or_else(|| anyhow!("epoch row {id} not readable after insert"))
    }

    async fn maybe_create_epoch(
        &self,
        arena: &ArenaRow,
        onchain_id: u64,
        now: i64,
    ) -> Result<()> {
        if let Some(latest) = self.db.latest_epoch(arena.id)? {
            if latest.status != EpochStatus::Ended {
                return Err(anyhow!(
                    "previous epoch {} not ended, refusing to create",
                    latest.onchain_epoch_id
                ));
            }
        }
        let registered = self.chain.registered_agents(onchain_id).await?;
        if registered.is_empty() {
            debug!(arena = arena.id, "no registered agents, skipping epoch creation");
            return Ok(());
        }

        let (start, end) = self.epoch_window(now);
        let outcome = self.operator.create_epoch(onchain_id, start, end).await?;
        let epoch_onchain = match outcome.epoch_id {
            Some(id) => id,
            // Event missing from the receipt: the freshly created epoch is
            // nextEpochId − 1.
            None => self
                .chain
                .next_epoch_id(onchain_id)
                .await?
                .checked_sub(1)
                .ok_or_else(|| anyhow!("nextEpochId underflow"))?,
        };

        let epoch_id = self
            .db
            .insert_epoch(arena.id, epoch_onchain, start, end, EpochStatus::Active)?;
        info!(
            arena = arena.id,
            epoch = epoch_onchain,
            start,
            end,
            tx = %format!("{:#x}", outcome.tx_hash),
            "🆕 Epoch created"
        );

        let epoch = self
            .db
            .epoch_by_onchain(arena.id, epoch_onchain)?
            .ok_or_else(|| anyhow!("epoch row {epoch_id} not readable after insert"))?;
        self.auto_renew_arena(arena, &epoch).await;
        Ok(())
    }

    fn epoch_window(&self, now: i64) -> (i64, i64) {
        if self.cfg.demo_mode {
            (now, now + self.cfg.duration_minutes * 60)
        } else {
            // Daily epochs anchor to 00:00 UTC.
            let day_start = Utc
                .timestamp_opt(now, 0)
                .single()
                .map(|dt| {
                    dt.date_naive()
                        .and_hms_opt(0, 0, 0)
                        .expect("midnight exists")
                        .and_utc()
                        .timestamp()
                })
                .unwrap_or(now);
            (day_start, day_start + 86_400)
        }
    }

    /// Renew every on-chain-registered agent that has not paid into this
    /// epoch yet. Individual failures are logged and skipped.
    pub async fn auto_renew_arena(&self, arena: &ArenaRow, epoch: &EpochRow) {
        let Some(onchain_id) = arena.onchain_id else {
            return;
        };
        let registered = match self.chain.registered_agents(onchain_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(arena = arena.id, error = %e, "registeredAgents read failed");
                return;
            }
        };

        let mut renewed = 0usize;
        for agent_onchain in registered {
            let agent = match self.db.agent_by_onchain_id(agent_onchain) {
                Ok(Some(a)) => a,
                Ok(None) => {
                    debug!(agent_onchain, "on-chain agent unknown to the db, skipping renewal");
                    continue;
                }
                Err(e) => {
                    warn!(agent_onchain, error = %e, "agent lookup failed");
                    continue;
                }
            };
            match self.renew_agent(arena, epoch, &agent).await {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(e) => {
                    let reason = abi::revert_reason(&e)
                        .unwrap_or_else(|| e.to_string());
                    warn!(agent = agent.id, arena = arena.id, %reason, "auto-renewal failed");
                }
            }
        }
        if renewed > 0 {
            info!(arena = arena.id, epoch = epoch.onchain_epoch_id, renewed, "🔄 Agents renewed");
        }
    }

    /// Renewals for agents that funded their wallet after the epoch
    /// boundary, invoked from the tick engine's catch-up step.
    pub async fn catch_up_renewals(
        &self,
        arena: &ArenaRow,
        epoch: &EpochRow,
        agents: &[AgentRow],
    ) {
        for agent in agents {
            match self.db.epoch_registration_exists(epoch.id, agent.id) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(agent = agent.id, error = %e, "registration lookup failed");
                    continue;
                }
            }
            match self.renew_agent(arena, epoch, agent).await {
                Ok(true) => {
                    info!(agent = agent.id, arena = arena.id, "catch-up renewal succeeded");
                }
                Ok(false) => {}
                Err(e) => {
                    let reason = abi::revert_reason(&e).unwrap_or_else(|| e.to_string());
                    debug!(agent = agent.id, %reason, "catch-up renewal failed");
                }
            }
        }
    }

    /// Returns Ok(true) when the agent was renewed, Ok(false) when skipped.
    async fn renew_agent(
        &self,
        arena: &ArenaRow,
        epoch: &EpochRow,
        agent: &AgentRow,
    ) -> Result<bool> {
        if self.db.epoch_registration_exists(epoch.id, agent.id)? {
            return Ok(false);
        }
        let (Some(agent_onchain), Some(arena_onchain)) = (agent.onchain_id, arena.onchain_id)
        else {
            return Ok(false);
        };
        let (Some(smart_account), Some(key)) = (
            agent.smart_account.as_deref(),
            agent.encrypted_signer_key.as_deref(),
        ) else {
            return Ok(false);
        };
        let wallet = AgentWallet {
            smart_account: smart_account.parse().context("smart account parse")?,
            encrypted_signer_key: key.to_string(),
        };

        // Recovery path: a renewal that landed on-chain but missed its DB
        // row (crash between submit and insert) is backfilled, not re-paid.
        if self
            .chain
            .is_epoch_registered(arena_onchain, epoch.onchain_epoch_id, agent_onchain)
            .await?
        {
            self.db.insert_epoch_registration(epoch.id, agent.id, None)?;
            return Ok(true);
        }

        let balance = self.chain.molti_balance(wallet.smart_account).await?;
        if balance < self.cfg.renewal_fee_wei {
            debug!(
                agent = agent.id,
                balance = %balance,
                fee = %self.cfg.renewal_fee_wei,
                "insufficient MOLTI for renewal"
            );
            return Ok(false);
        }

        let allowance = self.chain.molti_allowance(wallet.smart_account).await?;
        if allowance < self.cfg.renewal_fee_wei {
            let tx = self
                .submitter
                .approve_arena_spend(&wallet)
                .await
                .context("arena allowance approval")?;
            debug!(agent = agent.id, tx = %format!("{tx:#x}"), "arena allowance approved");
        }

        self.submitter
            .simulate_auto_renew(&wallet, agent_onchain, arena_onchain, epoch.onchain_epoch_id)
            .await?;

        let tx = self
            .submitter
            .auto_renew(&wallet, agent_onchain, arena_onchain, epoch.onchain_epoch_id)
            .await?;
        self.db
            .insert_epoch_registration(epoch.id, agent.id, Some(&format!("{tx:#x}")))?;
        Ok(true)
    }

    /// Sweep distributed epochs whose claim window has closed.
    async fn run_sweeps(&self, now: i64) {
        let cutoff = now - CLAIM_WINDOW_DAYS * 86_400;
        let epochs = match self.db.epochs_awaiting_sweep(cutoff) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "sweep candidate query failed");
                return;
            }
        };
        for epoch in epochs {
            let arena = match self.db.arena(epoch.arena_id) {
                Ok(Some(a)) => a,
                _ => continue,
            };
            let Some(onchain_id) = arena.onchain_id else {
                continue;
            };
            if let Err(e) =
                sweep_epoch(&self.db, &self.chain, &self.operator, onchain_id, &epoch).await
            {
                warn!(arena = arena.id, epoch = epoch.onchain_epoch_id, error = %e, "sweep failed");
            }
        }
    }
}
