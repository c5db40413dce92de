//! Chain access: typed reads, operator transactions and bundler user
//! operations, passed into components as explicit dependencies.

pub mod abi;
pub mod bundler;
pub mod operator;
pub mod rpc;

use crate::models::TradeAction;
use alloy::primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;

pub use bundler::{BundlerClient, KeyVault, StaticKeyVault, WalletServiceVault};
pub use operator::OperatorWallet;
pub use rpc::{ArenaReader, RpcClient};

/// Authoritative contract-side portfolio for one (agent, arena).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OnChainPortfolio {
    pub molti_locked: U256,
    pub token_units: U256,
}

/// Result of `getEpochPhase(now)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochPhase {
    pub to_end: Option<u64>,
    pub active: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochInfo {
    pub start_at: i64,
    pub end_at: i64,
    pub ended: bool,
    pub reward_pool: U256,
}

/// The agent-side credentials a user operation needs.
#[derive(Debug, Clone)]
pub struct AgentWallet {
    pub smart_account: Address,
    pub encrypted_signer_key: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteTradeParams {
    pub agent_id: u64,
    pub arena_id: u64,
    pub epoch_id: u64,
    pub action: TradeAction,
    pub size_pct: f64,
    pub buy_amount_wei: U256,
    pub price: f64,
    pub tick: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateEpochOutcome {
    /// From the `EpochCreated` event when the receipt carried one.
    pub epoch_id: Option<u64>,
    pub tx_hash: B256,
}

/// Read-only contract and balance views. Short deadlines; safe to drop on
/// timeout.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn molti_balance(&self, owner: Address) -> Result<U256>;
    async fn native_balance(&self, owner: Address) -> Result<U256>;
    async fn molti_allowance(&self, owner: Address) -> Result<U256>;
    async fn portfolio(&self, agent_id: u64, arena_id: u64) -> Result<OnChainPortfolio>;
    async fn epoch_phase(&self, arena_id: u64, now_sec: i64) -> Result<EpochPhase>;
    async fn next_epoch_id(&self, arena_id: u64) -> Result<u64>;
    async fn epoch_info(&self, arena_id: u64, epoch_id: u64) -> Result<EpochInfo>;
    async fn registered_agents(&self, arena_id: u64) -> Result<Vec<u64>>;
    async fn is_epoch_registered(&self, arena_id: u64, epoch_id: u64, agent_id: u64)
        -> Result<bool>;
    async fn pending_reward(&self, arena_id: u64, epoch_id: u64, agent_id: u64) -> Result<U256>;
}

/// Agent-side writes through the bundler.
#[async_trait]
pub trait TradeSubmitter: Send + Sync {
    async fn execute_trade(&self, wallet: &AgentWallet, params: ExecuteTradeParams)
        -> Result<B256>;
    /// Infinite approval of the arena contract for the agent's MOLTI.
    async fn approve_arena_spend(&self, wallet: &AgentWallet) -> Result<B256>;
    async fn auto_renew(
        &self,
        wallet: &AgentWallet,
        agent_id: u64,
        arena_id: u64,
        epoch_id: u64,
    ) -> Result<B256>;
    async fn simulate_auto_renew(
        &self,
        wallet: &AgentWallet,
        agent_id: u64,
        arena_id: u64,
        epoch_id: u64,
    ) -> Result<()>;
}

/// Operator-signed arena lifecycle transactions.
#[async_trait]
pub trait OperatorGateway: Send + Sync {
    async fn create_epoch(
        &self,
        arena_id: u64,
        start_sec: i64,
        end_sec: i64,
    ) -> Result<CreateEpochOutcome>;
    /// `EpochAlreadyEnded` reverts are treated as success.
    async fn end_epoch(&self, arena_id: u64, epoch_id: u64) -> Result<()>;
    async fn set_pending_rewards_batch(
        &self,
        arena_id: u64,
        epoch_id: u64,
        agent_ids: Vec<u64>,
        amounts: Vec<U256>,
    ) -> Result<B256>;
    async fn sweep_unclaimed(
        &self,
        arena_id: u64,
        epoch_id: u64,
        agent_ids: Vec<u64>,
    ) -> Result<B256>;
}
