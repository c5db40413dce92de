//! Epoch lifecycle against counting mocks: transitions are idempotent
//! (end/create fire at most once), distribution batches exactly once and
//! sums to the pool, and sweeps reconcile claims before calling the chain.

use alloy::primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use moltiarena_backend::chain::{
    AgentWallet, ChainReader, CreateEpochOutcome, EpochInfo, EpochPhase, ExecuteTradeParams,
    OnChainPortfolio, OperatorGateway, TradeSubmitter,
};
use moltiarena_backend::engine::{compute_rankings, AgentStanding};
use moltiarena_backend::epoch::rewards::{distribute_rewards_for_epoch, sweep_epoch};
use moltiarena_backend::epoch::{EpochConfig, EpochController};
use moltiarena_backend::models::EpochStatus;
use moltiarena_backend::store::ArenaDb;
use parking_lot::Mutex;
use std::sync::Arc;

const WAD: u128 = 1_000_000_000_000_000_000;
const SMART_ACCOUNT: &str = "0x00000000000000000000000000000000000000c1";

#[derive(Debug, Default)]
struct Counters {
    end_epoch: u32,
    create_epoch: u32,
    reward_batches: u32,
    sweeps: u32,
    last_batch: Option<(Vec<u64>, Vec<U256>)>,
    last_sweep_ids: Option<Vec<u64>>,
}

struct LifecycleState {
    phase: EpochPhase,
    reward_pool: U256,
    /// Pending rewards still claimable on-chain, per agent id.
    pending: std::collections::HashMap<u64, U256>,
    counters: Counters,
}

struct MockChain {
    state: Arc<Mutex<LifecycleState>>,
}

#[async_trait]
impl ChainReader for MockChain {
    async fn molti_balance(&self, _owner: Address) -> Result<U256> {
        Ok(U256::from(200u64) * U256::from(WAD))
    }
    async fn native_balance(&self, _owner: Address) -> Result<U256> {
        Ok(U256::from(WAD))
    }
    async fn molti_allowance(&self, _owner: Address) -> Result<U256> {
        Ok(U256::MAX)
    }
    async fn portfolio(&self, _agent_id: u64, _arena_id: u64) -> Result<OnChainPortfolio> {
        Ok(OnChainPortfolio::default())
    }
    async fn epoch_phase(&self, _arena_id: u64, _now_sec: i64) -> Result<EpochPhase> {
        Ok(self.state.lock().phase)
    }
    async fn next_epoch_id(&self, _arena_id: u64) -> Result<u64> {
        Ok(3)
    }
    async fn epoch_info(&self, _arena_id: u64, _epoch_id: u64) -> Result<EpochInfo> {
        Ok(EpochInfo {
            start_at: 0,
            end_at: 86_400,
            ended: false,
            reward_pool: self.state.lock().reward_pool,
        })
    }
    async fn registered_agents(&self, _arena_id: u64) -> Result<Vec<u64>> {
        Ok(vec![7])
    }
    async fn is_epoch_registered(
        &self,
        _arena_id: u64,
        _epoch_id: u64,
        _agent_id: u64,
    ) -> Result<bool> {
        // Renewal landed on-chain; the controller backfills the DB row.
        Ok(true)
    }
    async fn pending_reward(&self, _arena_id: u64, _epoch_id: u64, agent_id: u64) -> Result<U256> {
        Ok(self
            .state
            .lock()
            .pending
            .get(&agent_id)
            .copied()
            .unwrap_or(U256::ZERO))
    }
}

struct MockOperator {
    state: Arc<Mutex<LifecycleState>>,
}

#[async_trait]
impl OperatorGateway for MockOperator {
    async fn create_epoch(
        &self,
        _arena_id: u64,
        _start_sec: i64,
        _end_sec: i64,
    ) -> Result<CreateEpochOutcome> {
        let mut s = self.state.lock();
        s.counters.create_epoch += 1;
        s.phase = EpochPhase {
            to_end: None,
            active: Some(2),
        };
        Ok(CreateEpochOutcome {
            epoch_id: Some(2),
            tx_hash: B256::repeat_byte(0x11),
        })
    }
    async fn end_epoch(&self, _arena_id: u64, _epoch_id: u64) -> Result<()> {
        let mut s = self.state.lock();
        s.counters.end_epoch += 1;
        s.phase.to_end = None;
        Ok(())
    }
    async fn set_pending_rewards_batch(
        &self,
        _arena_id: u64,
        _epoch_id: u64,
        agent_ids: Vec<u64>,
        amounts: Vec<U256>,
    ) -> Result<B256> {
        let mut s = self.state.lock();
        s.counters.reward_batches += 1;
        for (id, amount) in agent_ids.iter().zip(&amounts) {
            s.pending.insert(*id, *amount);
        }
        s.counters.last_batch = Some((agent_ids, amounts));
        Ok(B256::repeat_byte(0x22))
    }
    async fn sweep_unclaimed(
        &self,
        _arena_id: u64,
        _epoch_id: u64,
        agent_ids: Vec<u64>,
    ) -> Result<B256> {
        let mut s = self.state.lock();
        s.counters.sweeps += 1;
        s.counters.last_sweep_ids = Some(agent_ids);
        Ok(B256::repeat_byte(0x33))
    }
}

struct NoopSubmitter;

#[async_trait]
impl TradeSubmitter for NoopSubmitter {
    async fn execute_trade(&self, _: &AgentWallet, _: ExecuteTradeParams) -> Result<B256> {
        Ok(B256::ZERO)
    }
    async fn approve_arena_spend(&self, _: &AgentWallet) -> Result<B256> {
        Ok(B256::ZERO)
    }
    async fn auto_renew(&self, _: &AgentWallet, _: u64, _: u64, _: u64) -> Result<B256> {
        Ok(B256::ZERO)
    }
    async fn simulate_auto_renew(&self, _: &AgentWallet, _: u64, _: u64, _: u64) -> Result<()> {
        Ok(())
    }
}

fn seed_db(db: &ArenaDb, agents: usize) -> (i64, Vec<i64>) {
    let arena_id = db
        .upsert_arena("0x00000000000000000000000000000000000000aa", Some("AA"))
        .unwrap();
    db.link_arena_onchain(arena_id, 3).unwrap();
    let mut agent_ids = Vec::new();
    for i in 0..agents {
        let id = db
            .insert_agent("0xowner", &format!("agent-{i}"), "{}", "0xh")
            .unwrap();
        db.link_agent_onchain(id, 7 + i as u64, SMART_ACCOUNT, "0xkey").unwrap();
        db.register_agent(id, arena_id).unwrap();
        agent_ids.push(id);
    }
    (arena_id, agent_ids)
}

fn controller(
    db: Arc<ArenaDb>,
    state: Arc<Mutex<LifecycleState>>,
) -> (Arc<EpochController>, Arc<dyn ChainReader>, Arc<dyn OperatorGateway>) {
    let chain: Arc<dyn ChainReader> = Arc::new(MockChain {
        state: state.clone(),
    });
    let operator: Arc<dyn OperatorGateway> = Arc::new(MockOperator { state });
    let ctl = EpochController::new(
        db,
        chain.clone(),
        operator.clone(),
        Arc::new(NoopSubmitter),
        EpochConfig {
            duration_minutes: 60, // demo mode: acts on every pass
            renewal_fee_wei: U256::from(100u64) * U256::from(WAD),
            demo_mode: true,
        },
    );
    (ctl, chain, operator)
}

fn lifecycle_state(phase: EpochPhase, pool: u64) -> Arc<Mutex<LifecycleState>> {
    Arc::new(Mutex::new(LifecycleState {
        phase,
        reward_pool: U256::from(pool),
        pending: Default::default(),
        counters: Counters::default(),
    }))
}

fn snapshot_rankings(db: &ArenaDb, arena_id: i64, epoch_id: i64, agent_ids: &[i64]) {
    let standings: Vec<AgentStanding> = agent_ids
        .iter()
        .enumerate()
        .map(|(i, id)| AgentStanding {
            agent_id: *id,
            equity: 100.0 + i as f64,
            initial_capital: 100.0,
            cash_mon: 100.0,
            token_units: 0.0,
            molti_locked: 0.0,
            volume_mon: (agent_ids.len() - i) as f64,
            trades: 1,
        })
        .collect();
    let rankings = compute_rankings(&standings);
    db.insert_leaderboard_snapshot(
        arena_id,
        epoch_id,
        99,
        &serde_json::to_string(&rankings).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn transitions_end_create_and_renew_once() {
    let db = Arc::new(ArenaDb::in_memory().unwrap());
    let (arena_id, agent_ids) = seed_db(&db, 1);
    // Epoch 1 exists in the DB and must be ended per on-chain phase.
    let old_epoch = db
        .insert_epoch(arena_id, 1, 0, 86_400, EpochStatus::Active)
        .unwrap();
    snapshot_rankings(&db, arena_id, old_epoch, &agent_ids);

    let state = lifecycle_state(
        EpochPhase {
            to_end: Some(1),
            active: None,
        },
        1_000,
    );
    let (ctl, _, _) = controller(db.clone(), state.clone());

    ctl.run_transitions(true).await;
    {
        let s = state.lock();
        assert_eq!(s.counters.end_epoch, 1);
        assert_eq!(s.counters.create_epoch, 1);
        assert_eq!(s.counters.reward_batches, 1);
    }
    // DB mirrors the chain: epoch 1 ended + distributed, epoch 2 active.
    let ended = db.epoch_by_onchain(arena_id, 1).unwrap().unwrap();
    assert_eq!(ended.status, EpochStatus::Ended);
    assert!(ended.rewards_distributed_at.is_some());
    let current = db.epoch_by_onchain(arena_id, 2).unwrap().unwrap();
    assert_eq!(current.status, EpochStatus::Active);
    // The on-chain renewal was backfilled into the DB.
    assert!(db
        .epoch_registration_exists(current.id, agent_ids[0])
        .unwrap());

    // Second pass in the same minute: nothing new happens.
    ctl.run_transitions(true).await;
    let s = state.lock();
    assert_eq!(s.counters.end_epoch, 1);
    assert_eq!(s.counters.create_epoch, 1);
    assert_eq!(s.counters.reward_batches, 1);
}

#[tokio::test]
async fn distribution_is_idempotent_and_sums_to_pool() {
    let db = Arc::new(ArenaDb::in_memory().unwrap());
    let (arena_id, agent_ids) = seed_db(&db, 10);
    let epoch_id = db
        .insert_epoch(arena_id, 1, 0, 86_400, EpochStatus::Ended)
        .unwrap();
    for id in &agent_ids {
        db.insert_epoch_registration(epoch_id, *id, None).unwrap();
    }
    snapshot_rankings(&db, arena_id, epoch_id, &agent_ids);

    let state = lifecycle_state(EpochPhase::default(), 1_000);
    let (_, chain, operator) = controller(db.clone(), state.clone());
    let epoch = db.epoch_by_onchain(arena_id, 1).unwrap().unwrap();

    distribute_rewards_for_epoch(&db, &chain, &operator, 3, &epoch)
        .await
        .unwrap();

    // Top ⌈0.30 · 10⌉ = 3 winners, linear weights, remainder to rank 1.
    {
        let s = state.lock();
        assert_eq!(s.counters.reward_batches, 1);
        let (ids, amounts) = s.counters.last_batch.clone().unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(
            amounts,
            vec![U256::from(501u64), U256::from(333u64), U256::from(166u64)]
        );
    }

    // Second call sees the stamp and does nothing.
    let epoch = db.epoch_by_onchain(arena_id, 1).unwrap().unwrap();
    assert!(epoch.rewards_distributed_at.is_some());
    distribute_rewards_for_epoch(&db, &chain, &operator, 3, &epoch)
        .await
        .unwrap();
    assert_eq!(state.lock().counters.reward_batches, 1);

    // Winner rows carry the exact amounts.
    let winners = db.unclaimed_winners(epoch.id).unwrap();
    assert_eq!(winners.len(), 3);
    let sum: u64 = winners
        .iter()
        .map(|w| w.pending_reward_wei.parse::<u64>().unwrap())
        .sum();
    assert_eq!(sum, 1_000);
}

#[tokio::test]
async fn sweep_reconciles_claims_then_sweeps_open_rewards() {
    let db = Arc::new(ArenaDb::in_memory().unwrap());
    let (arena_id, agent_ids) = seed_db(&db, 10);
    let epoch_id = db
        .insert_epoch(arena_id, 1, 0, 86_400, EpochStatus::Ended)
        .unwrap();
    for id in &agent_ids {
        db.insert_epoch_registration(epoch_id, *id, None).unwrap();
    }
    snapshot_rankings(&db, arena_id, epoch_id, &agent_ids);

    let state = lifecycle_state(EpochPhase::default(), 1_000);
    let (_, chain, operator) = controller(db.clone(), state.clone());
    let epoch = db.epoch_by_onchain(arena_id, 1).unwrap().unwrap();
    distribute_rewards_for_epoch(&db, &chain, &operator, 3, &epoch)
        .await
        .unwrap();

    // Rank 1 (on-chain agent 7) claims before the window closes.
    state.lock().pending.insert(7, U256::ZERO);

    let epoch = db.epoch_by_onchain(arena_id, 1).unwrap().unwrap();
    sweep_epoch(&db, &chain, &operator, 3, &epoch).await.unwrap();
    {
        let s = state.lock();
        assert_eq!(s.counters.sweeps, 1);
        let swept = s.counters.last_sweep_ids.clone().unwrap();
        assert_eq!(swept.len(), 2);
        assert!(!swept.contains(&7));
    }

    // Idempotent: the stamp blocks a second sweep.
    let epoch = db.epoch_by_onchain(arena_id, 1).unwrap().unwrap();
    assert!(epoch.rewards_swept_at.is_some());
    sweep_epoch(&db, &chain, &operator, 3, &epoch).await.unwrap();
    assert_eq!(state.lock().counters.sweeps, 1);
}
