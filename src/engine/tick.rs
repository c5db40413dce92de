//! The per-tick decision-and-execution pipeline.
//!
//! One self-rescheduling loop: load the workset, catch up renewals, prepare
//! per-(agent, arena) contexts from authoritative on-chain reads, plan once
//! per agent across all its arenas, guardrail and execute each decision,
//! reconcile portfolios, and refresh leaderboard snapshots. A failure at any
//! per-decision stage never aborts the tick.

use crate::chain::abi::{from_wei18, mul_pct_wei, revert_reason, WAD};
use crate::chain::{AgentWallet, ChainReader, ExecuteTradeParams, TradeSubmitter};
use crate::engine::guardrails::apply_guardrails;
use crate::engine::leaderboard::{compute_rankings, AgentStanding};
use crate::engine::paper_ledger::execute_paper_trade;
use crate::epoch::EpochController;
use crate::llm::{ArenaPromptBlock, DecisionRequest, ModelGateway, PortfolioView};
use crate::market::MarketAggregator;
use crate::memory;
use crate::models::{
    AgentProfile, AgentRow, ArenaRow, DecisionStatus, MarketSnapshot, PortfolioRow, TradeAction,
    TradeDecision, TradeRow,
};
use crate::store::{ArenaDb, ArenaWork};
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_seconds: u64,
    /// Native balance floor below which trades are skipped (default 1 MON).
    pub gas_threshold_wei: U256,
    /// Concurrency budget across agents, sized for the bundler rate limit.
    pub agent_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 60,
            gas_threshold_wei: U256::from(WAD),
            agent_concurrency: 4,
        }
    }
}

/// Everything one decision needs, fixed at context-preparation time.
#[derive(Debug, Clone)]
struct TickCtx {
    agent_id: i64,
    agent_name: String,
    agent_onchain_id: u64,
    arena_id: i64,
    arena_onchain_id: u64,
    epoch_id: i64,
    epoch_onchain_id: u64,
    profile: AgentProfile,
    snapshot: MarketSnapshot,
    /// Reconciled against the chain: cash/token/locked are authoritative.
    portfolio: PortfolioRow,
    wallet: AgentWallet,
    wallet_molti_wei: U256,
}

pub struct TickEngine {
    db: Arc<ArenaDb>,
    aggregator: Arc<MarketAggregator>,
    chain: Arc<dyn ChainReader>,
    submitter: Arc<dyn TradeSubmitter>,
    gateway: Arc<ModelGateway>,
    epochs: Arc<EpochController>,
    cfg: EngineConfig,
}

impl TickEngine {
    pub fn new(
        db: Arc<ArenaDb>,
        aggregator: Arc<MarketAggregator>,
        chain: Arc<dyn ChainReader>,
        submitter: Arc<dyn TradeSubmitter>,
        gateway: Arc<ModelGateway>,
        epochs: Arc<EpochController>,
        cfg: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            aggregator,
            chain,
            submitter,
            gateway,
            epochs,
            cfg,
        })
    }

    /// Self-rescheduling engine loop; ticks never overlap, a long tick
    /// delays the next one.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                tick_seconds = self.cfg.tick_seconds,
                concurrency = self.cfg.agent_concurrency,
                "⚙️  Tick engine started"
            );
            loop {
                let started = std::time::Instant::now();
                self.run_tick().await;
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "tick complete");

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(self.cfg.tick_seconds)) => {}
                    _ = shutdown.changed() => {
                        info!("tick engine stopping");
                        return;
                    }
                }
            }
        })
    }

    pub async fn run_tick(&self) {
        let now = Utc::now().timestamp();

        // 1. Workset: arenas with at least one active registration.
        let workset = match self.db.workset() {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "workset load failed, skipping tick");
                return;
            }
        };
        if workset.is_empty() {
            return;
        }

        // 2. Catch-up renewals for agents funded after the epoch boundary.
        for work in &workset {
            self.catch_up_renewals(work, now).await;
        }

        // 3–4. Context preparation, grouped by agent, arenas in id order.
        let mut per_agent: BTreeMap<i64, Vec<TickCtx>> = BTreeMap::new();
        for work in &workset {
            for agent in &work.agents {
                if let Some(ctx) = self.prepare_context(&work.arena, agent, now).await {
                    per_agent.entry(ctx.agent_id).or_default().push(ctx);
                }
            }
        }
        for ctxs in per_agent.values_mut() {
            ctxs.sort_by_key(|c| c.arena_id);
        }

        // 5–7. One planner call per agent, then sequential per-arena
        // execution; distinct agents fan out under the concurrency budget.
        futures_util::stream::iter(per_agent.into_iter())
            .for_each_concurrent(self.cfg.agent_concurrency.max(1), |(agent_id, ctxs)| async move {
                self.process_agent(agent_id, ctxs).await;
            })
            .await;

        // 8. Leaderboard snapshots per arena.
        for work in &workset {
            if let Err(e) = self.snapshot_leaderboard(work, now) {
                warn!(arena = work.arena.id, error = %e, "leaderboard snapshot failed");
            }
        }
    }

    async fn catch_up_renewals(&self, work: &ArenaWork, now: i64) {
        if work.arena.onchain_id.is_none() {
            return;
        }
        let epoch = match self.db.current_epoch(work.arena.id, now) {
            Ok(Some(e)) => e,
            Ok(None) => return,
            Err(e) => {
                warn!(arena = work.arena.id, error = %e, "current epoch lookup failed");
                return;
            }
        };
        let renewed = self.db.epoch_registration_count(epoch.id).unwrap_or(0);
        if (renewed as usize) < work.agents.len() {
            self.epochs
                .catch_up_renewals(&work.arena, &epoch, &work.agents)
                .await;
        }
    }

    /// Build one (agent, arena) context, or skip silently per the gating
    /// rules. The concurrent balance + contract-portfolio reads are
    /// authoritative for cash/token/locked.
    async fn prepare_context(
        &self,
        arena: &ArenaRow,
        agent: &AgentRow,
        now: i64,
    ) -> Option<TickCtx> {
        let signer_key = agent.encrypted_signer_key.as_deref()?;
        let agent_onchain_id = agent.onchain_id?;
        let arena_onchain_id = arena.onchain_id?;
        let smart_account: Address = agent.smart_account.as_deref()?.parse().ok()?;

        let profile = match AgentProfile::validate(&agent.profile_json) {
            Ok(p) => p,
            Err(e) => {
                warn!(agent = agent.id, error = %e, "invalid profile, skipping this tick");
                return None;
            }
        };

        let portfolio = self.db.portfolio(agent.id, arena.id).ok().flatten()?;
        let epoch = self.db.current_epoch(arena.id, now).ok().flatten()?;
        if !self
            .db
            .epoch_registration_exists(epoch.id, agent.id)
            .unwrap_or(false)
        {
            return None;
        }
        let snapshot = self.aggregator.latest_snapshot(&arena.token)?;

        let (balance, onchain) = tokio::join!(
            self.chain.molti_balance(smart_account),
            self.chain.portfolio(agent_onchain_id, arena_onchain_id)
        );
        let (balance, onchain) = match (balance, onchain) {
            (Ok(b), Ok(p)) => (b, p),
            (b, p) => {
                let err = b.err().or(p.err()).expect("one side failed");
                debug!(agent = agent.id, arena = arena.id, error = %err, "on-chain read failed, skipping");
                return None;
            }
        };

        let mut portfolio = portfolio;
        portfolio.cash_mon = from_wei18(balance);
        portfolio.token_units = from_wei18(onchain.token_units);
        portfolio.molti_locked = from_wei18(onchain.molti_locked);

        Some(TickCtx {
            agent_id: agent.id,
            agent_name: agent.name.clone(),
            agent_onchain_id,
            arena_id: arena.id,
            arena_onchain_id,
            epoch_id: epoch.id,
            epoch_onchain_id: epoch.onchain_epoch_id,
            profile,
            snapshot,
            portfolio,
            wallet: AgentWallet {
                smart_account,
                encrypted_signer_key: signer_key.to_string(),
            },
            wallet_molti_wei: balance,
        })
    }

    /// 5–7 for one agent: single batched planner call, then sequential
    /// per-arena execution and the memory notification.
    async fn process_agent(&self, agent_id: i64, ctxs: Vec<TickCtx>) {
        if ctxs.is_empty() {
            return;
        }
        let blocks: Vec<ArenaPromptBlock> = ctxs
            .iter()
            .map(|c| ArenaPromptBlock {
                label: c.snapshot.token.clone(),
                snapshot: c.snapshot.clone(),
                portfolio: PortfolioView {
                    cash_mon: c.portfolio.cash_mon,
                    token_units: c.portfolio.token_units,
                    initial_capital: c.portfolio.initial_capital,
                    avg_entry_price: c.portfolio.avg_entry_price,
                    trades_this_window: c.portfolio.trades_this_window,
                    last_trade_tick: c.portfolio.last_trade_tick,
                },
                filters_effective: !c.profile.filters.disabled(),
            })
            .collect();

        let request = DecisionRequest {
            agent_name: ctxs[0].agent_name.clone(),
            profile: ctxs[0].profile.clone(),
            memory: memory::memory_for_prompt(&self.db, agent_id),
            arenas: blocks,
        };
        let decisions = self.gateway.decide_trades_for_all_arenas(&request).await;

        let last_tick = ctxs.last().map(|c| c.snapshot.tick).unwrap_or(0);
        let mut notes: Vec<String> = Vec::with_capacity(ctxs.len());
        for (ctx, proposal) in ctxs.iter().zip(decisions) {
            match self.execute_decision(ctx, &proposal).await {
                Ok(note) => notes.push(note),
                Err(e) => {
                    warn!(
                        agent = ctx.agent_id,
                        arena = ctx.arena_id,
                        tick = ctx.snapshot.tick,
                        error = %e,
                        "decision execution failed"
                    );
                }
            }
        }

        if let Err(e) = memory::record_tick_note(&self.db, agent_id, last_tick, &notes) {
            warn!(agent = agent_id, error = %e, "memory update failed");
        }
    }

    /// Steps a–h for one (context, decision) pair.
    async fn execute_decision(&self, ctx: &TickCtx, proposal: &TradeDecision) -> Result<String> {
        let snapshot = &ctx.snapshot;
        let final_decision = apply_guardrails(snapshot, &ctx.portfolio, &ctx.profile, proposal);

        // b. Gas floor before anything that costs a user operation.
        if final_decision.action != TradeAction::Hold {
            let native = match self.chain.native_balance(ctx.wallet.smart_account).await {
                Ok(n) => n,
                Err(e) => {
                    // Dropped without persistence: no decision row this tick.
                    warn!(agent = ctx.agent_id, error = %e, "native balance read failed, dropping decision");
                    return Ok(format!("{} dropped (rpc)", snapshot.token));
                }
            };
            if native < self.cfg.gas_threshold_wei {
                self.db.insert_decision(
                    ctx.agent_id,
                    ctx.arena_id,
                    ctx.epoch_id,
                    snapshot.tick,
                    final_decision.action,
                    final_decision.size_pct,
                    final_decision.confidence,
                    &final_decision.reason,
                    snapshot.price,
                    ctx.portfolio.pnl_pct(snapshot.price),
                    DecisionStatus::SkippedNoGas,
                )?;
                return Ok(format!("t{} {} skipped: no gas", snapshot.tick, short(&snapshot.token)));
            }
        }

        // c. Initial audit row.
        let status = if final_decision.action == TradeAction::Hold {
            DecisionStatus::Success
        } else {
            DecisionStatus::Pending
        };
        let decision_id = self.db.insert_decision(
            ctx.agent_id,
            ctx.arena_id,
            ctx.epoch_id,
            snapshot.tick,
            final_decision.action,
            final_decision.size_pct,
            final_decision.confidence,
            &final_decision.reason,
            snapshot.price,
            ctx.portfolio.pnl_pct(snapshot.price),
            status,
        )?;

        // d. HOLD stops here.
        if final_decision.action == TradeAction::Hold {
            return Ok(format!(
                "t{} {} hold: {}",
                snapshot.tick,
                short(&snapshot.token),
                final_decision.reason
            ));
        }

        // e. BUY sizing in wei off the authoritative wallet balance.
        let buy_amount_wei = if final_decision.action == TradeAction::Buy {
            let amount = mul_pct_wei(ctx.wallet_molti_wei, final_decision.size_pct);
            if amount.is_zero() {
                self.db
                    .update_decision_status(decision_id, DecisionStatus::Failed, None)?;
                return Ok(format!(
                    "t{} {} failed: zero buy amount",
                    snapshot.tick,
                    short(&snapshot.token)
                ));
            }
            amount
        } else {
            U256::ZERO
        };

        // f. On-chain execution through the agent's smart account.
        let params = ExecuteTradeParams {
            agent_id: ctx.agent_onchain_id,
            arena_id: ctx.arena_onchain_id,
            epoch_id: ctx.epoch_onchain_id,
            action: final_decision.action,
            size_pct: final_decision.size_pct,
            buy_amount_wei,
            price: snapshot.price,
            tick: snapshot.tick,
        };
        let tx_hash = match self.submitter.execute_trade(&ctx.wallet, params).await {
            Ok(hash) => hash,
            Err(e) => {
                let reason = revert_reason(&e).unwrap_or_else(|| e.to_string());
                warn!(agent = ctx.agent_id, arena = ctx.arena_id, %reason, "executeTrade failed");
                self.db
                    .update_decision_status(decision_id, DecisionStatus::Failed, None)?;
                return Ok(format!(
                    "t{} {} {} failed",
                    snapshot.tick,
                    short(&snapshot.token),
                    final_decision.action.as_str()
                ));
            }
        };
        let tx_hex = format!("{tx_hash:#x}");

        // g. Paper projection for bookkeeping, then overwrite the money
        // fields with the post-receipt on-chain truth.
        let outcome = execute_paper_trade(
            snapshot.tick,
            &ctx.portfolio,
            snapshot.price,
            &final_decision,
        );
        let mut next = outcome.next;
        let (balance, onchain) = tokio::join!(
            self.chain.molti_balance(ctx.wallet.smart_account),
            self.chain.portfolio(ctx.agent_onchain_id, ctx.arena_onchain_id)
        );
        match (balance, onchain) {
            (Ok(b), Ok(p)) => {
                next.cash_mon = from_wei18(b);
                next.token_units = from_wei18(p.token_units);
                next.molti_locked = from_wei18(p.molti_locked);
            }
            (b, p) => {
                let err = b.err().or(p.err()).expect("one side failed");
                warn!(
                    agent = ctx.agent_id,
                    error = %err,
                    "post-trade reconciliation read failed, keeping paper projection"
                );
            }
        }

        // h. Atomic finalization: portfolio + trade + decision.
        let trade = outcome.fill.map(|fill| TradeRow {
            agent_id: ctx.agent_id,
            arena_id: ctx.arena_id,
            epoch_id: ctx.epoch_id,
            tick: snapshot.tick,
            action: fill.action,
            size_pct: fill.size_pct,
            price: fill.price,
            trade_value_mon: fill.trade_value_mon,
            avg_entry_price_before: fill.avg_entry_price_before,
            cash_after: next.cash_mon,
            token_after: next.token_units,
            reason: final_decision.reason.clone(),
            tx_hash: Some(tx_hex.clone()),
        });
        self.db
            .finalize_trade(&next, trade.as_ref(), decision_id, Some(&tx_hex))
            .context("trade finalization")?;

        info!(
            agent = ctx.agent_id,
            arena = ctx.arena_id,
            tick = snapshot.tick,
            action = final_decision.action.as_str(),
            size_pct = final_decision.size_pct,
            price = snapshot.price,
            tx = %tx_hex,
            "✅ Trade committed"
        );
        Ok(format!(
            "t{} {} {} {:.0}% @{:.4} ok",
            snapshot.tick,
            short(&snapshot.token),
            final_decision.action.as_str(),
            final_decision.size_pct * 100.0,
            snapshot.price
        ))
    }

    /// Step 8: rank the epoch-registered, active agents of one arena.
    fn snapshot_leaderboard(&self, work: &ArenaWork, now: i64) -> Result<()> {
        let Some(epoch) = self.db.current_epoch(work.arena.id, now)? else {
            return Ok(());
        };
        let Some(snapshot) = self.aggregator.latest_snapshot(&work.arena.token) else {
            return Ok(());
        };

        let stats: std::collections::HashMap<i64, (f64, u64)> = self
            .db
            .epoch_trade_stats(work.arena.id, epoch.id)?
            .into_iter()
            .map(|s| (s.agent_id, (s.volume_mon, s.trades)))
            .collect();

        let mut standings = Vec::with_capacity(work.agents.len());
        for agent in &work.agents {
            if !self.db.epoch_registration_exists(epoch.id, agent.id)? {
                continue;
            }
            let Some(p) = self.db.portfolio(agent.id, work.arena.id)? else {
                continue;
            };
            let (volume_mon, trades) = stats.get(&agent.id).copied().unwrap_or((0.0, 0));
            standings.push(AgentStanding {
                agent_id: agent.id,
                equity: p.equity(snapshot.price),
                initial_capital: p.initial_capital,
                cash_mon: p.cash_mon,
                token_units: p.token_units,
                molti_locked: p.molti_locked,
                volume_mon,
                trades,
            });
        }
        if standings.is_empty() {
            return Ok(());
        }

        let rankings = compute_rankings(&standings);
        let json = serde_json::to_string(&rankings).context("rankings encode")?;
        self.db
            .insert_leaderboard_snapshot(work.arena.id, epoch.id, snapshot.tick, &json)?;
        Ok(())
    }
}

fn short(token: &str) -> &str {
    token.get(..10).unwrap_or(token)
}
